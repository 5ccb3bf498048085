use crate::citation::{CitationGrammar, CitationMatch, NumRef, SentenceText};
use crate::index::StatuteIndex;
use crate::tree::{Document, NodeId};
use crate::trie::NameTrie;
use anyhow::{Result, bail};
use std::collections::HashMap;
use tracing::warn;

/// 解決済みの参照．位置は平坦化した文テキスト中の文字位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
  pub start: usize,
  pub end: usize,
  /// 解決に失敗した場合はNoneのまま残り，挿入段階で診断して捨てる
  pub law: Option<String>,
  pub article: Option<String>,
  pub paragraph: Option<String>,
  pub item: Option<String>,
}

/// 直前に解決した参照から引き継ぐ(法令, 条, 項, 号)
/// 文書内の文をまたいで持ち越される
#[derive(Debug, Clone, Default)]
struct CarryOver {
  law: Option<String>,
  article: Option<String>,
  paragraph: Option<String>,
  item: Option<String>,
}

/// 文の祖先から求める自身の位置
#[derive(Debug, Clone, Default)]
struct SelfContext {
  article: Option<String>,
  paragraph: Option<String>,
  item: Option<String>,
}

// 一つの文を処理する間だけ有効な文脈
struct SentenceScope<'d> {
  doc: &'d Document,
  sentence: NodeId,
  self_ctx: SelfContext,
  is_unstable: bool,
}

/// 一つの文書を処理する解決器
/// 索引と文法は共有し，略称表と引き継ぎ状態は文書ごとに持つ
pub struct Resolver<'a> {
  index: &'a StatuteIndex,
  grammar: &'a CitationGrammar,
  alias_trie: NameTrie,
  carry: CarryOver,
  self_law: String,
}

impl<'a> Resolver<'a> {
  pub fn new(index: &'a StatuteIndex, grammar: &'a CitationGrammar, self_law: String) -> Self {
    Self {
      index,
      grammar,
      alias_trie: NameTrie::new(),
      carry: CarryOver::default(),
      self_law,
    }
  }

  /// 文の中の参照を解決する．返り値はstart順で互いに重ならない
  pub fn resolve_sentence(&mut self, doc: &Document, sentence: NodeId) -> Vec<LinkRecord> {
    let scope = SentenceScope {
      doc,
      sentence,
      self_ctx: self_context(doc, sentence),
      is_unstable: is_unstable(doc, sentence),
    };
    let s = SentenceText::new(flatten_text(doc, sentence));

    let mut link_list: Vec<LinkRecord> = Vec::new();
    let mut link_end_dict: HashMap<usize, Option<String>> = HashMap::new();
    let mut offset = 0;
    while offset < s.char_len() {
      // 「」で括られた部分はスキップ
      if let Some(len) = self.grammar.match_quoted(&s, offset) {
        offset += len;
        continue;
      }

      let alias_match = self.grammar.match_alias(&s, offset);

      // 法令名辞書からの検索
      let (name_len, ids) = self.index.longest_match(s.chars(), offset);
      if name_len > 0 {
        let mut ids = ids.to_vec();
        let start_pos = offset;
        offset += name_len;
        let end_pos = offset;
        let name = s.substring(start_pos, end_pos);

        // カッコ書きによる法令番号指定があれば候補を絞り込む
        let mut check_span = None;
        if s.char_at(offset) == Some('（') {
          let (check_len, check_ids) = self.index.longest_match(s.chars(), offset + 1);
          if check_len > 0 {
            check_span = Some((offset + 1, offset + 1 + check_len));
            ids.retain(|id| check_ids.contains(id));
          }
        }

        if ids.len() != 1 {
          warn!("法令名不整合または法令不確定: {name} {ids:?}");
          continue;
        }
        let law_id = ids.remove(0);

        self.carry = CarryOver {
          law: Some(law_id.clone()),
          ..CarryOver::default()
        };
        if !link_end_dict.contains_key(&end_pos) {
          link_end_dict.insert(end_pos, Some(law_id.clone()));
          link_list.push(law_only_record(start_pos, end_pos, &law_id));
        }
        if let Some((check_start, check_end)) = check_span
          && !link_end_dict.contains_key(&check_end)
        {
          link_end_dict.insert(check_end, Some(law_id.clone()));
          link_list.push(law_only_record(check_start, check_end, &law_id));
        }

        if let Some(alias) = &alias_match
          && alias.word == name
        {
          self.alias_trie.insert(&alias.alias, &law_id);
        }
        continue;
      }

      // 略称表からの検索
      let (alias_len, alias_ids) = self.alias_trie.longest_match(s.chars(), offset);
      if alias_len > 0 {
        let law_id = alias_ids[0].clone();
        let start_pos = offset;
        offset += alias_len;
        let end_pos = offset;

        self.carry = CarryOver {
          law: Some(law_id.clone()),
          ..CarryOver::default()
        };
        if !link_end_dict.contains_key(&end_pos) {
          link_end_dict.insert(end_pos, Some(law_id.clone()));
          link_list.push(law_only_record(start_pos, end_pos, &law_id));
        }
        continue;
      }

      // 同法・同施行規則，条・項・号の指定
      match self.grammar.parse_at(&s, offset) {
        Ok(Some(citation)) => {
          match self.apply_citation(&scope, &citation, offset, &mut link_end_dict, &mut link_list)
          {
            Ok(()) => {
              offset += citation.total_len;
              continue;
            }
            Err(e) => {
              if !scope.is_unstable {
                let snippet = s.substring(offset, (offset + 100).min(s.char_len()));
                warn!("条・項・号の解決に失敗しました ({e}): {snippet}");
              }
            }
          }
        }
        Ok(None) => {}
        Err(e) => {
          if !scope.is_unstable {
            let snippet = s.substring(offset, (offset + 100).min(s.char_len()));
            warn!("引用句の解析に失敗しました ({e}): {snippet}");
          }
        }
      }

      offset += 1;
    }

    link_list.sort_by_key(|link| link.start);
    link_list
  }

  /// 引用句のマッチを(法令, 条, 項, 号)に束縛する
  /// 途中で失敗した場合も引き継ぎ状態の書き換えは巻き戻さない
  fn apply_citation(
    &mut self,
    scope: &SentenceScope,
    citation: &CitationMatch,
    offset: usize,
    link_end_dict: &mut HashMap<usize, Option<String>>,
    link_list: &mut Vec<LinkRecord>,
  ) -> Result<()> {
    let mut specify_level = 0;
    let mut is_relative = false;

    // 法令の確定．「附則」単独は法令の切り替えではない
    let law = if !citation.law_text.is_empty() && citation.law_text != "附則" {
      specify_level = 1;
      self.carry.article = None;
      self.carry.law.clone()
    } else if let Some(law) = link_end_dict.get(&offset) {
      // 直前で終わった法令名に続く条項指定
      specify_level = 1;
      self.carry.article = None;
      self.carry.paragraph = None;
      law.clone()
    } else {
      Some(self.self_law.clone())
    };

    let article = if let Some(num_ref) = &citation.article {
      specify_level = 2;
      let article = match num_ref {
        NumRef::Absolute(num) => Some(num.clone()),
        NumRef::Each => Some(String::from("1")),
        NumRef::Relative(k) => {
          is_relative = true;
          Some(relative_num(scope.doc, scope.sentence, "Article", *k)?)
        }
        NumRef::Same => self.carry.article.clone(),
      };
      self.carry.paragraph = None;
      article
    } else {
      scope.self_ctx.article.clone()
    };

    let mut paragraph = if let Some(num_ref) = &citation.paragraph {
      specify_level = 3;
      match num_ref {
        NumRef::Absolute(num) => Some(num.clone()),
        NumRef::Each => Some(String::from("1")),
        NumRef::Relative(k) => {
          is_relative = true;
          Some(relative_num(scope.doc, scope.sentence, "Paragraph", *k)?)
        }
        NumRef::Same => self.carry.paragraph.clone(),
      }
    } else {
      scope.self_ctx.paragraph.clone()
    };

    let item = if let Some(num_ref) = &citation.item {
      // 項の指定なしに号が指定されたら第一項とみなす
      if specify_level == 2 {
        paragraph = Some(String::from("1"));
      }
      specify_level = 4;
      match num_ref {
        NumRef::Absolute(num) => Some(num.clone()),
        NumRef::Each => Some(String::from("1")),
        NumRef::Relative(k) => {
          is_relative = true;
          Some(relative_num(scope.doc, scope.sentence, "Item", *k)?)
        }
        NumRef::Same => bail!("「同号」は解決できません"),
      }
    } else {
      None
    };

    let article = if specify_level < 2 { None } else { article };
    let paragraph = if specify_level < 3 { None } else { paragraph };

    // 不安定な部分木では相対指定に基づくリンクを出力しない
    if !(scope.is_unstable && is_relative) {
      link_end_dict.insert(citation.link_end, law.clone());
      link_list.push(LinkRecord {
        start: citation.link_start,
        end: citation.link_end,
        law: law.clone(),
        article: article.clone(),
        paragraph: paragraph.clone(),
        item: item.clone(),
      });
    }

    self.carry = CarryOver {
      law,
      article,
      paragraph,
      item,
    };
    Ok(())
  }
}

fn law_only_record(start: usize, end: usize, law_id: &str) -> LinkRecord {
  LinkRecord {
    start,
    end,
    law: Some(law_id.to_string()),
    article: None,
    paragraph: None,
    item: None,
  }
}

/// 平坦化した文テキスト
/// 子要素の後続テキストのみを繋ぐ
// TODO Ruby要素の中のテキストにも対応する
fn flatten_text(doc: &Document, sentence: NodeId) -> String {
  let el = doc.get(sentence);
  let mut text = el.text.clone().unwrap_or_default();
  for &child in el.children.iter() {
    if let Some(tail) = &doc.get(child).tail {
      text.push_str(tail);
    }
  }
  text
}

fn self_context(doc: &Document, sentence: NodeId) -> SelfContext {
  let mut ctx = SelfContext::default();
  let mut current = sentence;
  while let Some(parent) = doc.parent(current) {
    let el = doc.get(parent);
    if let Some(num) = el.attr("Num") {
      match el.name.as_str() {
        "Article" => ctx.article = Some(num.to_string()),
        "Paragraph" => ctx.paragraph = Some(num.to_string()),
        "Item" => ctx.item = Some(num.to_string()),
        _ => {}
      }
    }
    current = parent;
  }
  ctx
}

/// 附則・別表などの配下では構造番号が文書順に並ぶ保証が無い
fn is_unstable(doc: &Document, sentence: NodeId) -> bool {
  let mut current = sentence;
  while let Some(parent) = doc.parent(current) {
    let name = doc.get(parent).name.as_str();
    if name == "SupplProvision" || name.starts_with("Appdx") || name.starts_with("Table") {
      return true;
    }
    current = parent;
  }
  false
}

/// 前条・次項のような相対指定の解決
/// 最も近い祖先から種別の一致する要素を探し，文書順の並びの中で相対位置のNumを引く
fn relative_num(doc: &Document, sentence: NodeId, tag: &str, relative: i64) -> Result<String> {
  let mut current = sentence;
  let self_el = loop {
    let Some(parent) = doc.parent(current) else {
      bail!("祖先に{tag}がありません");
    };
    if doc.get(parent).name == tag {
      if doc.parent(parent).is_none() {
        bail!("祖先に{tag}がありません");
      }
      break parent;
    }
    current = parent;
  };

  let elements = doc.descendants_by_name(doc.root(), tag);
  let self_index = elements
    .iter()
    .position(|&el| el == self_el)
    .map(|i| i as i64)
    .unwrap_or(-1);
  let target = self_index + relative;
  if self_index < 0 || target < 0 || target >= elements.len() as i64 {
    bail!("相対位置が範囲外です: {tag} {self_index} {relative:+}");
  }
  match doc.get(elements[target as usize]).attr("Num") {
    Some(num) => Ok(num.to_string()),
    None => bail!("{tag}にNum属性がありません"),
  }
}

#[cfg(test)]
const LAW_LIST_CSV: &str = "\
法令名,法令番号,法令ID,未施行
民法,明治二十九年法律第八十九号,129AC0000000089,
民事訴訟法,平成八年法律第百九号,408AC0000000109,
";

#[cfg(test)]
const SHORT_NAMES_CSV: &str = "法令名,法令番号,略称1\n";

#[cfg(test)]
fn test_index() -> StatuteIndex {
  StatuteIndex::from_csv(LAW_LIST_CSV, SHORT_NAMES_CSV).unwrap()
}

#[cfg(test)]
fn doc_with_sentence(sentence: &str) -> Document {
  let xml = format!(
    r#"<Law><LawBody><MainProvision><Article Num="4"><Paragraph Num="1"><Sentence>別の条</Sentence></Paragraph></Article><Article Num="5"><Paragraph Num="1"><Sentence>{sentence}</Sentence></Paragraph></Article></MainProvision></LawBody></Law>"#
  );
  Document::parse_str(&xml).unwrap()
}

#[cfg(test)]
fn resolve_last_sentence(doc: &Document, resolver: &mut Resolver) -> Vec<LinkRecord> {
  let sentences = doc.descendants_by_name(doc.root(), "Sentence");
  resolver.resolve_sentence(doc, *sentences.last().unwrap())
}

#[test]
fn check_name_and_article() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民法第九十条の規定による。");
  let links = resolve_last_sentence(&doc, &mut resolver);
  assert_eq!(links.len(), 2);
  assert_eq!((links[0].start, links[0].end), (0, 2));
  assert_eq!(links[0].law.as_deref(), Some("129AC0000000089"));
  assert_eq!(links[0].article, None);
  assert_eq!((links[1].start, links[1].end), (2, 6));
  assert_eq!(links[1].law.as_deref(), Some("129AC0000000089"));
  assert_eq!(links[1].article.as_deref(), Some("90"));
  assert_eq!(links[1].paragraph, None);
}

#[test]
fn check_paragraph_and_item() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民法第九十条第一項第二号に掲げる。");
  let links = resolve_last_sentence(&doc, &mut resolver);
  assert_eq!(links.len(), 2);
  let link = &links[1];
  assert_eq!(link.article.as_deref(), Some("90"));
  assert_eq!(link.paragraph.as_deref(), Some("1"));
  assert_eq!(link.item.as_deref(), Some("2"));
}

#[test]
fn check_sub_article_number() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民法第九十条の二の規定");
  let links = resolve_last_sentence(&doc, &mut resolver);
  assert_eq!(links[1].article.as_deref(), Some("90_2"));
}

#[test]
fn check_bracketed_law_number() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民法（明治二十九年法律第八十九号）第一条の規定");
  let links = resolve_last_sentence(&doc, &mut resolver);
  assert_eq!(links.len(), 3);
  // 法令名と法令番号のそれぞれにリンクが張られる
  assert_eq!((links[0].start, links[0].end), (0, 2));
  assert_eq!((links[1].start, links[1].end), (3, 16));
  assert_eq!(links[1].law.as_deref(), Some("129AC0000000089"));
  // 括弧の後の条指定は直前の法令に束縛される
  assert_eq!((links[2].start, links[2].end), (17, 20));
  assert_eq!(links[2].law.as_deref(), Some("129AC0000000089"));
  assert_eq!(links[2].article.as_deref(), Some("1"));
}

#[test]
fn check_relative_article() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("前条第二項の規定を準用する。");
  let links = resolve_last_sentence(&doc, &mut resolver);
  assert_eq!(links.len(), 1);
  assert_eq!(links[0].law.as_deref(), Some("SELF"));
  assert_eq!(links[0].article.as_deref(), Some("4"));
  assert_eq!(links[0].paragraph.as_deref(), Some("2"));
}

#[test]
fn check_alias_resolution() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民法（以下「民」という。）を適用し，民第三条による。");
  let links = resolve_last_sentence(&doc, &mut resolver);
  // 民法，略称の民，第三条の三つ
  assert_eq!(links.len(), 3);
  assert_eq!(links[0].law.as_deref(), Some("129AC0000000089"));
  let alias_link = &links[1];
  assert_eq!(alias_link.law.as_deref(), Some("129AC0000000089"));
  assert_eq!(alias_link.end - alias_link.start, 1);
  assert_eq!(links[2].article.as_deref(), Some("3"));
  assert_eq!(links[2].law.as_deref(), Some("129AC0000000089"));
}

#[test]
fn check_same_law_carry_over() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民事訴訟法第五条の規定により，同法第七条を準用する。");
  let links = resolve_last_sentence(&doc, &mut resolver);
  assert_eq!(links.len(), 3);
  let same_law = &links[2];
  assert_eq!(same_law.law.as_deref(), Some("408AC0000000109"));
  assert_eq!(same_law.article.as_deref(), Some("7"));
}

#[test]
fn check_quoted_segment_skipped() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("「民法第一条」とあるのは第二条とする。");
  let links = resolve_last_sentence(&doc, &mut resolver);
  // かぎ括弧の中は検索しない
  assert_eq!(links.len(), 1);
  assert_eq!(links[0].article.as_deref(), Some("2"));
}

#[test]
fn check_unstable_suppresses_relative() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let xml = r#"<Law><LawBody><MainProvision><Article Num="1"><Paragraph Num="1"><Sentence>本則</Sentence></Paragraph></Article></MainProvision><SupplProvision><Article Num="2"><Paragraph Num="1"><Sentence>前条第二項及び民法第三条</Sentence></Paragraph></Article></SupplProvision></LawBody></Law>"#;
  let doc = Document::parse_str(xml).unwrap();
  let links = resolve_last_sentence(&doc, &mut resolver);
  // 相対指定は抑止され，絶対指定と法令名は通常通り
  assert!(links.iter().all(|l| l.article.as_deref() != Some("1")));
  assert_eq!(links.len(), 2);
  assert_eq!(links[0].law.as_deref(), Some("129AC0000000089"));
  assert_eq!(links[1].article.as_deref(), Some("3"));
}

#[test]
fn check_carry_over_reset_on_new_article() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民法第九十条第二項の規定及び同条第三項の規定");
  let links = resolve_last_sentence(&doc, &mut resolver);
  assert_eq!(links.len(), 3);
  // 同条は直前の条を引き継ぐ
  assert_eq!(links[2].article.as_deref(), Some("90"));
  assert_eq!(links[2].paragraph.as_deref(), Some("3"));
}

#[test]
fn check_item_without_paragraph() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc = doc_with_sentence("民法第九十条第二号の規定");
  let links = resolve_last_sentence(&doc, &mut resolver);
  let link = &links[1];
  assert_eq!(link.article.as_deref(), Some("90"));
  // 号だけの指定は第一項の号とみなす
  assert_eq!(link.paragraph.as_deref(), Some("1"));
  assert_eq!(link.item.as_deref(), Some("2"));
}

#[test]
fn check_non_overlap_sorted() {
  let index = test_index();
  let grammar = CitationGrammar::new();
  let mut resolver = Resolver::new(&index, &grammar, String::from("SELF"));
  let doc =
    doc_with_sentence("民法第一条、第二条及び第三条並びに民事訴訟法第四条の規定");
  let links = resolve_last_sentence(&doc, &mut resolver);
  for pair in links.windows(2) {
    assert!(pair[0].end <= pair[1].start);
  }
}
