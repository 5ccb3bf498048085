use anyhow::{Context, Result, anyhow, bail};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

pub type NodeId = usize;

/// 混合コンテンツを保持する要素
/// textは開始タグ直後のテキスト，tailは自身の終了タグ直後のテキスト
#[derive(Debug, Clone, Default)]
pub struct Element {
  pub name: String,
  pub attrs: Vec<(String, String)>,
  pub text: Option<String>,
  pub tail: Option<String>,
  pub children: Vec<NodeId>,
  pub parent: Option<NodeId>,
}

impl Element {
  pub fn attr(&self, name: &str) -> Option<&str> {
    self
      .attrs
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }
}

/// 要素をアリーナに並べたXML文書
/// 親参照が必要になるため所有ポインタではなくインデックスで持つ
#[derive(Debug, Clone)]
pub struct Document {
  nodes: Vec<Element>,
  root: NodeId,
}

impl Document {
  pub fn parse_str(xml: &str) -> Result<Self> {
    let mut reader = Reader::from_str(xml);
    let mut nodes: Vec<Element> = Vec::new();
    let mut stack: Vec<NodeId> = Vec::new();
    let mut root: Option<NodeId> = None;
    loop {
      match reader.read_event()? {
        Event::Start(e) => {
          let id = push_element(&mut nodes, &stack, &mut root, &e)?;
          stack.push(id);
        }
        Event::Empty(e) => {
          push_element(&mut nodes, &stack, &mut root, &e)?;
        }
        Event::End(_) => {
          stack.pop();
        }
        Event::Text(e) => {
          let text = e.decode()?.into_owned();
          append_text(&mut nodes, &stack, &text);
        }
        Event::CData(e) => {
          let text = String::from_utf8(e.into_inner().into_owned())?;
          append_text(&mut nodes, &stack, &text);
        }
        Event::GeneralRef(e) => {
          let resolved = resolve_reference(std::str::from_utf8(&e)?)?;
          append_text(&mut nodes, &stack, &resolved);
        }
        Event::Eof => break,
        // 宣言・コメント・処理命令等は保持しない
        _ => {}
      }
    }
    let root = root.ok_or_else(|| anyhow!("ルート要素がありません"))?;
    Ok(Self { nodes, root })
  }

  pub fn root(&self) -> NodeId {
    self.root
  }

  pub fn get(&self, id: NodeId) -> &Element {
    &self.nodes[id]
  }

  pub fn get_mut(&mut self, id: NodeId) -> &mut Element {
    &mut self.nodes[id]
  }

  /// 新しい要素をアリーナに確保する．親との接続はinsert_childで行う
  pub fn new_node(&mut self, element: Element) -> NodeId {
    self.nodes.push(element);
    self.nodes.len() - 1
  }

  pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
    self.nodes[child].parent = Some(parent);
    self.nodes[parent].children.insert(index, child);
  }

  pub fn parent(&self, id: NodeId) -> Option<NodeId> {
    self.nodes[id].parent
  }

  /// 自身を含む部分木の要素を文書順に列挙する
  pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
    let mut result = Vec::new();
    let mut work = vec![id];
    while let Some(id) = work.pop() {
      result.push(id);
      for &child in self.nodes[id].children.iter().rev() {
        work.push(child);
      }
    }
    result
  }

  pub fn descendants_by_name(&self, id: NodeId, name: &str) -> Vec<NodeId> {
    self
      .descendants(id)
      .into_iter()
      .filter(|&id| self.nodes[id].name == name)
      .collect()
  }

  /// XML宣言付きで直列化する
  pub fn to_xml_string(&self) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    self.write_element(&mut writer, self.root)?;
    let buf = writer.into_inner().into_inner();
    String::from_utf8(buf).context("直列化結果がUTF-8ではありません")
  }

  fn write_element(&self, writer: &mut Writer<Cursor<Vec<u8>>>, id: NodeId) -> Result<()> {
    let el = &self.nodes[id];
    let mut start = BytesStart::new(el.name.as_str());
    for (k, v) in el.attrs.iter() {
      start.push_attribute((k.as_str(), v.as_str()));
    }
    if el.text.is_none() && el.children.is_empty() {
      writer.write_event(Event::Empty(start))?;
    } else {
      writer.write_event(Event::Start(start))?;
      if let Some(text) = &el.text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
      }
      for &child in el.children.iter() {
        self.write_element(writer, child)?;
      }
      writer.write_event(Event::End(BytesEnd::new(el.name.as_str())))?;
    }
    if let Some(tail) = &el.tail {
      writer.write_event(Event::Text(BytesText::new(tail)))?;
    }
    Ok(())
  }
}

fn push_element(
  nodes: &mut Vec<Element>,
  stack: &[NodeId],
  root: &mut Option<NodeId>,
  start: &BytesStart,
) -> Result<NodeId> {
  let name = std::str::from_utf8(start.name().as_ref())?.to_string();
  let mut attrs = Vec::new();
  for attr in start.attributes() {
    let attr = attr?;
    let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
    let value = attr.unescape_value()?.into_owned();
    attrs.push((key, value));
  }
  let parent = stack.last().copied();
  let id = nodes.len();
  nodes.push(Element {
    name,
    attrs,
    parent,
    ..Default::default()
  });
  match parent {
    Some(parent) => nodes[parent].children.push(id),
    None => {
      if root.is_some() {
        bail!("ルート要素が複数あります");
      }
      *root = Some(id);
    }
  }
  Ok(id)
}

// 開いている要素に子が無ければtextへ，あれば最後の子のtailへ追記する
fn append_text(nodes: &mut [Element], stack: &[NodeId], text: &str) {
  let Some(&current) = stack.last() else {
    return;
  };
  let slot = match nodes[current].children.last() {
    Some(&last) => &mut nodes[last].tail,
    None => &mut nodes[current].text,
  };
  match slot {
    Some(s) => s.push_str(text),
    None => *slot = Some(text.to_string()),
  }
}

fn resolve_reference(name: &str) -> Result<String> {
  let s = match name {
    "amp" => "&",
    "lt" => "<",
    "gt" => ">",
    "apos" => "'",
    "quot" => "\"",
    _ => {
      if let Some(code) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        let code = u32::from_str_radix(code, 16)?;
        return Ok(char::from_u32(code).map(String::from).unwrap_or_default());
      }
      if let Some(code) = name.strip_prefix('#') {
        let code: u32 = code.parse()?;
        return Ok(char::from_u32(code).map(String::from).unwrap_or_default());
      }
      bail!("未対応の実体参照です: &{name};");
    }
  };
  Ok(s.to_string())
}

#[test]
fn check_parse_mixed_content() {
  let doc = Document::parse_str(
    r#"<Law><Article Num="1"><Sentence>前文<Ruby>漢<Rt>かん</Rt></Ruby>後文</Sentence></Article></Law>"#,
  )
  .unwrap();
  let sentences = doc.descendants_by_name(doc.root(), "Sentence");
  assert_eq!(sentences.len(), 1);
  let sentence = doc.get(sentences[0]);
  assert_eq!(sentence.text.as_deref(), Some("前文"));
  assert_eq!(sentence.children.len(), 1);
  let ruby = doc.get(sentence.children[0]);
  assert_eq!(ruby.name, "Ruby");
  assert_eq!(ruby.tail.as_deref(), Some("後文"));
  let article = doc.descendants_by_name(doc.root(), "Article")[0];
  assert_eq!(doc.get(article).attr("Num"), Some("1"));
  assert_eq!(doc.parent(sentences[0]), Some(article));
}

#[test]
fn check_roundtrip_serialization() {
  let xml = r#"<Law Era="Meiji"><LawBody><Sentence>本文<A law="x">民法</A>続き</Sentence><Empty/></LawBody></Law>"#;
  let doc = Document::parse_str(xml).unwrap();
  let out = doc.to_xml_string().unwrap();
  assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
  assert!(out.contains(r#"<A law="x">民法</A>続き"#));
  assert!(out.contains("<Empty/>"));
}

#[test]
fn check_descendants_document_order() {
  let doc =
    Document::parse_str(r#"<R><A><B/><C/></A><D><B/></D></R>"#).unwrap();
  let names = doc
    .descendants(doc.root())
    .into_iter()
    .map(|id| doc.get(id).name.clone())
    .collect::<Vec<_>>();
  assert_eq!(names, ["R", "A", "B", "C", "D", "B"]);
}
