use crate::kanji;
use anyhow::{Result, bail};
use regex::{Captures, Regex};

/// 文字単位の位置で扱うための文テキスト
/// 正規表現はバイト位置を返すので相互変換表を持っておく
#[derive(Debug, Clone)]
pub struct SentenceText {
  text: String,
  chars: Vec<char>,
  byte_to_char: Vec<usize>,
  char_to_byte: Vec<usize>,
}

impl SentenceText {
  pub fn new(text: String) -> Self {
    let chars = text.chars().collect::<Vec<_>>();
    // 各バイト位置に対する char インデックス
    let mut byte_to_char = vec![0; text.len() + 1];
    let mut char_to_byte = Vec::with_capacity(chars.len() + 1);
    let mut char_index = 0;
    for (byte_index, _) in text.char_indices() {
      byte_to_char[byte_index] = char_index;
      char_to_byte.push(byte_index);
      char_index += 1;
    }
    byte_to_char[text.len()] = char_index;
    char_to_byte.push(text.len());
    Self {
      text,
      chars,
      byte_to_char,
      char_to_byte,
    }
  }

  pub fn char_len(&self) -> usize {
    self.chars.len()
  }

  pub fn chars(&self) -> &[char] {
    &self.chars
  }

  pub fn char_at(&self, index: usize) -> Option<char> {
    self.chars.get(index).copied()
  }

  /// offset文字目以降のスライス
  pub fn tail(&self, char_offset: usize) -> &str {
    &self.text[self.char_to_byte[char_offset]..]
  }

  pub fn substring(&self, start: usize, end: usize) -> String {
    self.chars[start..end].iter().collect()
  }

  fn char_of_byte(&self, byte_index: usize) -> usize {
    self.byte_to_char[byte_index]
  }
}

/// 条・項・号の指定ひとつ分
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumRef {
  /// 第N条のM → "N_M"
  Absolute(String),
  /// 前条は-1，次二条は+2
  Relative(i64),
  /// 各条・各項・各号は先頭を指す
  Each,
  /// 同条・同項など．繰り越しに委ねる
  Same,
}

/// 引用句のマッチ結果．位置はすべて文字単位
#[derive(Debug, Clone)]
pub struct CitationMatch {
  /// 先頭の接続詞を含むマッチ全体の文字数
  pub total_len: usize,
  /// リンク対象部分の文中での開始・終了位置
  pub link_start: usize,
  pub link_end: usize,
  /// 「同法」「附則」などの法令指定部分．無ければ空
  pub law_text: String,
  pub article: Option<NumRef>,
  pub paragraph: Option<NumRef>,
  pub item: Option<NumRef>,
}

#[derive(Debug, Clone)]
pub struct AliasMatch {
  pub word: String,
  pub alias: String,
}

const JPNUM: &str = "[一二三四五六七八九十百千]";

// 3重括弧まで対応
const BRACKETS: &str = "(（[^（）]*）)|(（[^（）]*（[^（）]*）[^（）]*）)|(（[^（）]*（[^（）]*（[^（）]*）[^（）]*）[^（）]*）)";

fn jpnum_text(tag: &str, unit: char) -> String {
  format!(
    "((?P<{tag}Abs>第{JPNUM}+{unit}([のノ]{JPNUM}+)*)|((([前次](?P<{tag}Rel>{JPNUM}*))|同|(前?各)){unit}中?))"
  )
}

pub struct CitationGrammar {
  law_pattern: Regex,
  square_brackets_pattern: Regex,
  alias_pattern: Regex,
}

impl Default for CitationGrammar {
  fn default() -> Self {
    Self::new()
  }
}

impl CitationGrammar {
  pub fn new() -> Self {
    let continue_words =
      format!("(、|(及び)|(並びに)|(乃至)|(若しくは)|(又は)|(および)|(ならびに)|{BRACKETS})");
    let law_pattern = format!(
      "^{continue_words}*(?P<LinkText>(?P<Law>(同((法)|(令)|(省令)|(規則)|(施行規則)))?(附則)?)(次の)?(?P<Article>({article_from}(から{article_to})?)?)(まで)?(次の)?(?P<Paragraph>({paragraph_from}(から{paragraph_to})?)?)(まで)?(次の)?(?P<Item>({item_from}(から{item_to})?)?)(まで)?)",
      article_from = jpnum_text("ArticleFrom", '条'),
      article_to = jpnum_text("ArticleTo", '条'),
      paragraph_from = jpnum_text("ParagraphFrom", '項'),
      paragraph_to = jpnum_text("ParagraphTo", '項'),
      item_from = jpnum_text("ItemFrom", '号'),
      item_to = jpnum_text("ItemTo", '号'),
    );
    Self {
      law_pattern: Regex::new(&law_pattern).unwrap(),
      square_brackets_pattern: Regex::new("^「[^「」]*」").unwrap(),
      alias_pattern: Regex::new(&format!(
        "^(?P<word>(([^、（）])|{BRACKETS})*)（[^（）]*「(?P<alias>[^（）「」]*)」という"
      ))
      .unwrap(),
    }
  }

  /// offsetから始まる「…」のかぎ括弧部分の文字数を返す
  pub fn match_quoted(&self, s: &SentenceText, offset: usize) -> Option<usize> {
    self
      .square_brackets_pattern
      .find(s.tail(offset))
      .map(|m| m.as_str().chars().count())
  }

  /// offsetから始まる「〇〇法（…「略称」という」の形を検出する
  pub fn match_alias(&self, s: &SentenceText, offset: usize) -> Option<AliasMatch> {
    let caps = self.alias_pattern.captures(s.tail(offset))?;
    Some(AliasMatch {
      word: caps["word"].to_string(),
      alias: caps["alias"].to_string(),
    })
  }

  /// offsetから引用句の解析を試みる
  /// 法令・条・項・号のいずれも現れなければOk(None)
  /// 数値の解読に失敗したらErr（呼び出し側で診断する）
  pub fn parse_at(&self, s: &SentenceText, offset: usize) -> Result<Option<CitationMatch>> {
    let base = s.char_to_byte[offset];
    let Some(caps) = self.law_pattern.captures(s.tail(offset)) else {
      return Ok(None);
    };
    let law_text = caps.name("Law").map(|m| m.as_str()).unwrap_or("");
    let article = parse_slot(&caps, "Article", "ArticleFromAbs", "ArticleFromRel", '条')?;
    let paragraph = parse_slot(
      &caps,
      "Paragraph",
      "ParagraphFromAbs",
      "ParagraphFromRel",
      '項',
    )?;
    let item = parse_slot(&caps, "Item", "ItemFromAbs", "ItemFromRel", '号')?;
    if law_text.is_empty() && article.is_none() && paragraph.is_none() && item.is_none() {
      return Ok(None);
    }
    let whole = caps.get(0).unwrap();
    let link = caps.name("LinkText").unwrap();
    Ok(Some(CitationMatch {
      total_len: s.char_of_byte(base + whole.end()) - offset,
      link_start: s.char_of_byte(base + link.start()),
      link_end: s.char_of_byte(base + link.end()),
      law_text: law_text.to_string(),
      article,
      paragraph,
      item,
    }))
  }
}

// 条・項・号ひとつ分のグループを解釈する
// 判定順は絶対指定，各〇，前，次，それ以外（同〇）の順
fn parse_slot(
  caps: &Captures,
  slot: &str,
  abs_group: &str,
  rel_group: &str,
  unit: char,
) -> Result<Option<NumRef>> {
  let slot_text = caps.name(slot).map(|m| m.as_str()).unwrap_or("");
  if slot_text.is_empty() {
    return Ok(None);
  }
  let rel_num = match caps.name(rel_group).map(|m| m.as_str()) {
    Some(n) if !n.is_empty() => kanji::decode(n)? as i64,
    _ => 1,
  };
  let each = format!("各{unit}");
  let num_ref = if let Some(abs) = caps.name(abs_group) {
    NumRef::Absolute(canonical_number(abs.as_str(), unit)?)
  } else if slot_text.contains(&each) {
    NumRef::Each
  } else if slot_text.contains('前') {
    NumRef::Relative(-rel_num)
  } else if slot_text.contains('次') {
    NumRef::Relative(rel_num)
  } else {
    NumRef::Same
  };
  Ok(Some(num_ref))
}

/// 「第九十条の二」のような絶対指定を"90_2"の形に正規化する
fn canonical_number(span: &str, unit: char) -> Result<String> {
  let Some(body) = span.strip_prefix('第') else {
    bail!("絶対指定の形式が不正です: {span}");
  };
  let mut parts = Vec::new();
  for (i, segment) in body.split(['の', 'ノ']).enumerate() {
    let segment = if i == 0 {
      match segment.strip_suffix(unit) {
        Some(s) => s,
        None => bail!("絶対指定の形式が不正です: {span}"),
      }
    } else {
      segment
    };
    parts.push(kanji::decode(segment)?.to_string());
  }
  Ok(parts.join("_"))
}

#[test]
fn check_absolute_article() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("第九十条の規定"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Absolute(String::from("90"))));
  assert_eq!(m.paragraph, None);
  assert_eq!(m.item, None);
  assert_eq!((m.link_start, m.link_end), (0, 4));
  assert_eq!(m.total_len, 4);
}

#[test]
fn check_sub_article() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("第九十条の二"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Absolute(String::from("90_2"))));

  let s = SentenceText::new(String::from("第十条の二の三"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Absolute(String::from("10_2_3"))));
}

#[test]
fn check_full_citation() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("第九十条第一項第二号に掲げる"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Absolute(String::from("90"))));
  assert_eq!(m.paragraph, Some(NumRef::Absolute(String::from("1"))));
  assert_eq!(m.item, Some(NumRef::Absolute(String::from("2"))));
  assert_eq!((m.link_start, m.link_end), (0, 10));
}

#[test]
fn check_range_uses_from() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("第三条の二から第五条まで第二項第一号"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Absolute(String::from("3_2"))));
  assert_eq!(m.paragraph, Some(NumRef::Absolute(String::from("2"))));
  assert_eq!(m.item, Some(NumRef::Absolute(String::from("1"))));
  assert_eq!(m.link_end, 18);
}

#[test]
fn check_relative_and_same() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("前条第二項"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Relative(-1)));
  assert_eq!(m.paragraph, Some(NumRef::Absolute(String::from("2"))));

  let s = SentenceText::new(String::from("前二条の規定"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Relative(-2)));

  let s = SentenceText::new(String::from("次条において"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Relative(1)));

  let s = SentenceText::new(String::from("同条第三項"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.article, Some(NumRef::Same));
  assert_eq!(m.paragraph, Some(NumRef::Absolute(String::from("3"))));

  let s = SentenceText::new(String::from("前各号に掲げる"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.item, Some(NumRef::Each));
}

#[test]
fn check_same_law() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("同法第五条"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.law_text, "同法");
  assert_eq!(m.article, Some(NumRef::Absolute(String::from("5"))));

  let s = SentenceText::new(String::from("同施行規則第二条"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.law_text, "同施行規則");
}

#[test]
fn check_connector_run() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("及び同法第三条"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!(m.total_len, 7);
  assert_eq!((m.link_start, m.link_end), (2, 7));

  // 括弧書きも接続詞として読み飛ばす
  let s = SentenceText::new(String::from("（ただし書を含む）第四条"));
  let m = grammar.parse_at(&s, 0).unwrap().unwrap();
  assert_eq!((m.link_start, m.link_end), (9, 12));
}

#[test]
fn check_no_citation() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("この場合において"));
  assert!(grammar.parse_at(&s, 0).unwrap().is_none());
  let s = SentenceText::new(String::from("、ただし"));
  assert!(grammar.parse_at(&s, 0).unwrap().is_none());
}

#[test]
fn check_quoted_and_alias() {
  let grammar = CitationGrammar::new();
  let s = SentenceText::new(String::from("「第二条の規定」とあるのは"));
  assert_eq!(grammar.match_quoted(&s, 0), Some(8));

  let s = SentenceText::new(String::from(
    "民法（明治二十九年法律第八十九号。以下「民」という。）の規定",
  ));
  let alias = grammar.match_alias(&s, 0).unwrap();
  assert_eq!(alias.word, "民法");
  assert_eq!(alias.alias, "民");
}
