use crate::resolver::LinkRecord;
use crate::tree::{Document, Element, NodeId};
use anyhow::{Result, bail};
use tracing::warn;

/// リンク要素のローカル名
pub const LINK_TAG: &str = "A";

/// 解決済みリンクを文要素に挿入する
/// 平坦化したテキストが文字単位で変わらないことが不変条件
/// 既に挿入済みのリンク要素はそのテキストも平坦化テキストの一部として数える
pub fn splice_sentence(doc: &mut Document, sentence: NodeId, links: &[LinkRecord]) -> Result<()> {
  for link in links {
    let Some(law) = &link.law else {
      warn!("リンク先不明: {link:?}");
      continue;
    };

    // 文の先頭テキスト内で完結する場合
    let leading = chars_of(&doc.get(sentence).text);
    if link.start < leading.len() {
      if link.end > leading.len() {
        bail!("リンクの範囲が先頭テキストに収まりません: {link:?}");
      }
      let mut a_tag = link_element(link, law);
      a_tag.text = Some(collect(&leading[link.start..link.end]));
      a_tag.tail = Some(collect(&leading[link.end..]));
      doc.get_mut(sentence).text = Some(collect(&leading[..link.start]));
      let a_id = doc.new_node(a_tag);
      doc.insert_child(sentence, 0, a_id);
      continue;
    }

    // 子要素の後続テキストを順に調べる
    let mut offset = leading.len();
    let children = doc.get(sentence).children.clone();
    let mut inserted = false;
    for (i, &child) in children.iter().enumerate() {
      let child_el = doc.get(child);
      let mut segment = Vec::new();
      let mut child_offset = 0;
      if child_el.name == LINK_TAG
        && let Some(text) = &child_el.text
      {
        segment.extend(text.chars());
        child_offset = segment.len();
      }
      segment.extend(chars_of(&child_el.tail));

      let Some(rel_start) = link.start.checked_sub(offset) else {
        bail!("リンクの位置が逆行しています: {link:?}");
      };
      if rel_start < segment.len() {
        let rel_end = link.end - offset;
        if rel_end > segment.len() || rel_start < child_offset {
          bail!("リンクの範囲が単一のテキスト区間に収まりません: {link:?}");
        }
        let mut a_tag = link_element(link, law);
        a_tag.text = Some(collect(&segment[rel_start..rel_end]));
        a_tag.tail = Some(collect(&segment[rel_end..]));
        doc.get_mut(child).tail = Some(collect(&segment[child_offset..rel_start]));
        let a_id = doc.new_node(a_tag);
        doc.insert_child(sentence, i + 1, a_id);
        inserted = true;
        break;
      }

      offset += segment.len();
    }
    if !inserted {
      bail!("リンクの位置が文のテキストの外にあります: {link:?}");
    }
  }
  Ok(())
}

fn link_element(link: &LinkRecord, law: &str) -> Element {
  let mut attrs = vec![(String::from("law"), law.to_string())];
  if let Some(article) = &link.article {
    attrs.push((String::from("article"), article.clone()));
  }
  if let Some(paragraph) = &link.paragraph {
    attrs.push((String::from("paragraph"), paragraph.clone()));
  }
  if let Some(item) = &link.item {
    attrs.push((String::from("item"), item.clone()));
  }
  Element {
    name: String::from(LINK_TAG),
    attrs,
    ..Element::default()
  }
}

fn chars_of(text: &Option<String>) -> Vec<char> {
  text.as_deref().unwrap_or_default().chars().collect()
}

fn collect(chars: &[char]) -> String {
  chars.iter().collect()
}

/// 文の平坦化テキスト．テスト用
#[cfg(test)]
fn flattened(doc: &Document, sentence: NodeId) -> String {
  let el = doc.get(sentence);
  let mut text = el.text.clone().unwrap_or_default();
  for &child in el.children.iter() {
    let child_el = doc.get(child);
    if let Some(t) = &child_el.text {
      text.push_str(t);
    }
    if let Some(t) = &child_el.tail {
      text.push_str(t);
    }
  }
  text
}

#[cfg(test)]
fn record(start: usize, end: usize, law: &str, article: Option<&str>) -> LinkRecord {
  LinkRecord {
    start,
    end,
    law: Some(law.to_string()),
    article: article.map(String::from),
    paragraph: None,
    item: None,
  }
}

#[test]
fn check_splice_into_leading_text() {
  let mut doc = Document::parse_str("<Sentence>民法第九十条の規定</Sentence>").unwrap();
  let sentence = doc.root();
  let links = vec![
    record(0, 2, "L1", None),
    record(2, 6, "L1", Some("90")),
  ];
  splice_sentence(&mut doc, sentence, &links).unwrap();
  assert_eq!(flattened(&doc, sentence), "民法第九十条の規定");
  let out = doc.to_xml_string().unwrap();
  assert!(out.contains(r#"<A law="L1">民法</A>"#));
  assert!(out.contains(r#"<A law="L1" article="90">第九十条</A>の規定"#));
}

#[test]
fn check_splice_into_child_tail() {
  let mut doc =
    Document::parse_str("<Sentence>冒頭<Line/>続きの第二条まで</Sentence>").unwrap();
  let sentence = doc.root();
  // 平坦化テキストは「冒頭続きの第二条まで」
  let links = vec![record(5, 8, "SELF", Some("2"))];
  splice_sentence(&mut doc, sentence, &links).unwrap();
  assert_eq!(flattened(&doc, sentence), "冒頭続きの第二条まで");
  let out = doc.to_xml_string().unwrap();
  assert!(out.contains(r#"続きの<A law="SELF" article="2">第二条</A>まで"#));
}

#[test]
fn check_splice_unresolved_law_skipped() {
  let mut doc = Document::parse_str("<Sentence>同法第三条</Sentence>").unwrap();
  let sentence = doc.root();
  let links = vec![LinkRecord {
    start: 0,
    end: 5,
    law: None,
    article: Some(String::from("3")),
    paragraph: None,
    item: None,
  }];
  splice_sentence(&mut doc, sentence, &links).unwrap();
  assert_eq!(doc.get(sentence).children.len(), 0);
  assert_eq!(flattened(&doc, sentence), "同法第三条");
}

#[test]
fn check_splice_out_of_range_is_error() {
  let mut doc = Document::parse_str("<Sentence>短い文</Sentence>").unwrap();
  let sentence = doc.root();
  let links = vec![record(1, 10, "L1", None)];
  assert!(splice_sentence(&mut doc, sentence, &links).is_err());
}

#[test]
fn check_splice_preserves_existing_links() {
  let mut doc = Document::parse_str("<Sentence>甲乙丙丁戊</Sentence>").unwrap();
  let sentence = doc.root();
  // 順に二つのリンクを挿入する．二つ目は一つ目のリンクの後続テキストに入る
  let links = vec![record(0, 2, "L1", None), record(3, 4, "L2", None)];
  splice_sentence(&mut doc, sentence, &links).unwrap();
  assert_eq!(flattened(&doc, sentence), "甲乙丙丁戊");
  let out = doc.to_xml_string().unwrap();
  assert!(out.contains(r#"<A law="L1">甲乙</A>丙<A law="L2">丁</A>戊"#));
}
