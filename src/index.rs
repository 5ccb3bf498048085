use crate::trie::NameTrie;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// 全法令の名称・法令番号・公式略称を引けるようにした索引
/// 読み込み後は不変で，スレッド間で共有できる
#[derive(Debug, Clone)]
pub struct StatuteIndex {
  trie: NameTrie,
}

#[derive(Debug, Deserialize)]
struct LawListRow {
  #[serde(rename = "法令名")]
  law_name: String,
  #[serde(rename = "法令番号")]
  law_number: String,
  #[serde(rename = "法令ID")]
  law_id: String,
  #[serde(rename = "未施行")]
  not_yet_in_force: String,
}

impl StatuteIndex {
  pub fn load(law_list_path: &Path, short_names_path: &Path) -> Result<Self> {
    let law_list = std::fs::read_to_string(law_list_path)
      .with_context(|| format!("法令一覧を読み込めません: {}", law_list_path.display()))?;
    let short_names = std::fs::read_to_string(short_names_path)
      .with_context(|| format!("略称一覧を読み込めません: {}", short_names_path.display()))?;
    Self::from_csv(&law_list, &short_names)
  }

  pub fn from_csv(law_list: &str, short_names: &str) -> Result<Self> {
    let title_brackets = title_brackets_pattern();
    let mut trie = NameTrie::new();

    // 法令一覧．未施行の行は対象外
    let law_list = law_list.strip_prefix('\u{feff}').unwrap_or(law_list);
    let mut reader = csv::Reader::from_reader(law_list.as_bytes());
    for row in reader.deserialize() {
      let row: LawListRow = row.context("法令一覧の行を読み込めません")?;
      if !row.not_yet_in_force.is_empty() {
        continue;
      }
      let law_name = fix_law_name(&row.law_name, &title_brackets);
      trie.insert(&law_name, &row.law_id);
      trie.insert(&row.law_number, &row.law_id);
    }

    // 略称一覧．法令番号から法令IDを確定し，法令名で整合を確認してから登録する
    let short_names = short_names.strip_prefix('\u{feff}').unwrap_or(short_names);
    let mut reader = csv::Reader::from_reader(short_names.as_bytes());
    for row in reader.records() {
      let row = row.context("略称一覧の行を読み込めません")?;
      let Some(law_number) = row.get(1) else {
        continue;
      };
      let number_chars = law_number.chars().collect::<Vec<_>>();
      let (matched_len, law_ids) = trie.longest_match(&number_chars, 0);
      if matched_len != number_chars.len() || law_ids.len() != 1 {
        warn!("法令番号を一意に解決できません: {law_number} {law_ids:?}");
        continue;
      }
      let law_id = law_ids[0].clone();

      let law_name = fix_law_name(row.get(0).unwrap_or(""), &title_brackets);
      let name_chars = law_name.chars().collect::<Vec<_>>();
      let (matched_len, law_ids_check) = trie.longest_match(&name_chars, 0);
      if matched_len != name_chars.len() || !law_ids_check.contains(&law_id) {
        warn!("法令名が法令番号と整合しません: {law_name} {law_ids_check:?}");
        continue;
      }

      for short_name in row.iter().skip(2) {
        if !short_name.is_empty() {
          trie.insert(short_name, &law_id);
        }
      }
    }

    Ok(Self { trie })
  }

  pub fn longest_match(&self, text: &[char], offset: usize) -> (usize, &[String]) {
    self.trie.longest_match(text, offset)
  }
}

fn title_brackets_pattern() -> Regex {
  Regex::new("^.*年.*第.*号（(?P<name>.*)）").unwrap()
}

/// 法令名の正規化
/// 末尾の「　抄」を除き，「〇〇年〇〇第〇号（名称）」の形は名称部分に置き換える
/// ただし刑法だけは法令番号付きの名称が正式なのでそのままにする
fn fix_law_name(law_name: &str, title_brackets: &Regex) -> String {
  let law_name = law_name.replace("　抄", "");
  if let Some(caps) = title_brackets.captures(&law_name) {
    let inner = &caps["name"];
    if inner != "刑法" {
      return inner.to_string();
    }
  }
  law_name
}

#[test]
fn check_fix_law_name() {
  let re = title_brackets_pattern();
  assert_eq!(fix_law_name("民法　抄", &re), "民法");
  assert_eq!(
    fix_law_name("昭和二十二年法律第五十四号（独占禁止法）", &re),
    "独占禁止法"
  );
  assert_eq!(
    fix_law_name("明治四十年法律第四十五号（刑法）", &re),
    "明治四十年法律第四十五号（刑法）"
  );
  assert_eq!(fix_law_name("民事訴訟法", &re), "民事訴訟法");
}

#[cfg(test)]
const LAW_LIST_CSV: &str = "\
法令名,法令番号,法令ID,未施行
民法,明治二十九年法律第八十九号,129AC0000000089,
民事訴訟法,平成八年法律第百九号,408AC0000000109,
未来の法律,令和十年法律第一号,510AC0000000001,○
";

#[cfg(test)]
const SHORT_NAMES_CSV: &str = "\
法令名,法令番号,略称1,略称2
民事訴訟法,平成八年法律第百九号,民訴法,民訴
民法,存在しない番号,誤り,
";

#[test]
fn check_from_csv() {
  let index = StatuteIndex::from_csv(LAW_LIST_CSV, SHORT_NAMES_CSV).unwrap();

  let text = "民法第一条".chars().collect::<Vec<_>>();
  let (len, ids) = index.longest_match(&text, 0);
  assert_eq!(len, 2);
  assert_eq!(ids, ["129AC0000000089"]);

  // 法令番号でも引ける
  let text = "明治二十九年法律第八十九号".chars().collect::<Vec<_>>();
  let (len, ids) = index.longest_match(&text, 0);
  assert_eq!(len, text.len());
  assert_eq!(ids, ["129AC0000000089"]);

  // 略称は番号の確認が通った行だけ登録される
  let text = "民訴法の規定".chars().collect::<Vec<_>>();
  let (len, ids) = index.longest_match(&text, 0);
  assert_eq!(len, 3);
  assert_eq!(ids, ["408AC0000000109"]);
  let text = "誤り".chars().collect::<Vec<_>>();
  assert_eq!(index.longest_match(&text, 0).0, 0);

  // 未施行の行は登録されない
  let text = "未来の法律".chars().collect::<Vec<_>>();
  assert_eq!(index.longest_match(&text, 0).0, 0);
}

#[test]
fn check_bom_stripped() {
  let with_bom = format!("\u{feff}{LAW_LIST_CSV}");
  let index = StatuteIndex::from_csv(&with_bom, SHORT_NAMES_CSV).unwrap();
  let text = "民法".chars().collect::<Vec<_>>();
  assert_eq!(index.longest_match(&text, 0).0, 2);
}
