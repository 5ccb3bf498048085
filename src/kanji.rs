use anyhow::{Result, bail};

fn digit_value(c: char) -> Option<u32> {
  match c {
    '〇' => Some(0),
    '一' => Some(1),
    '二' => Some(2),
    '三' => Some(3),
    '四' => Some(4),
    '五' => Some(5),
    '六' => Some(6),
    '七' => Some(7),
    '八' => Some(8),
    '九' => Some(9),
    _ => None,
  }
}

fn marker_value(c: char) -> Option<u32> {
  match c {
    '十' => Some(10),
    '百' => Some(100),
    '千' => Some(1000),
    '万' => Some(10000),
    _ => None,
  }
}

/// 漢数字を整数に変換する
/// 位取りは万・千・百・十のみで，各位は一桁
/// 「十」のように数字の無い位はその位が1つあるものとして扱う
/// 対応する最大値は99999
pub fn decode(s: &str) -> Result<u32> {
  if s.is_empty() {
    bail!("空の漢数字です");
  }
  let mut total: u32 = 0;
  let mut digit: Option<u32> = None;
  // 直前に出現した位．位が昇順・同順で現れたらエラーにする
  let mut marker_floor = u32::MAX;
  for c in s.chars() {
    if let Some(d) = digit_value(c) {
      if digit.is_some() {
        bail!("数字が連続しています: {s}");
      }
      digit = Some(d);
    } else if let Some(m) = marker_value(c) {
      if m >= marker_floor {
        bail!("位の並びが不正です: {s}");
      }
      marker_floor = m;
      total += digit.take().unwrap_or(1) * m;
    } else {
      bail!("漢数字以外の文字を含んでいます: {c}");
    }
  }
  total += digit.unwrap_or(0);
  Ok(total)
}

/// decodeの逆変換．テスト用
#[cfg(test)]
pub fn encode(mut n: u32) -> String {
  assert!(n <= 99999);
  if n == 0 {
    return String::from("〇");
  }
  let digits = ['〇', '一', '二', '三', '四', '五', '六', '七', '八', '九'];
  let mut s = String::new();
  for (base, marker) in [(10000, "万"), (1000, "千"), (100, "百"), (10, "十")] {
    let d = n / base;
    if d > 0 {
      if d > 1 || base == 10000 {
        s.push(digits[d as usize]);
      }
      s.push_str(marker);
      n %= base;
    }
  }
  if n > 0 {
    s.push(digits[n as usize]);
  }
  s
}

#[test]
fn check_decode() {
  assert_eq!(decode("〇").unwrap(), 0);
  assert_eq!(decode("一").unwrap(), 1);
  assert_eq!(decode("十").unwrap(), 10);
  assert_eq!(decode("十二").unwrap(), 12);
  assert_eq!(decode("二十").unwrap(), 20);
  assert_eq!(decode("八十九").unwrap(), 89);
  assert_eq!(decode("九十").unwrap(), 90);
  assert_eq!(decode("百").unwrap(), 100);
  assert_eq!(decode("二百三十六").unwrap(), 236);
  assert_eq!(decode("千九百四十六").unwrap(), 1946);
  assert_eq!(decode("二万三千").unwrap(), 23000);
  assert_eq!(decode("九万九千九百九十九").unwrap(), 99999);
}

#[test]
fn check_decode_error() {
  assert!(decode("").is_err());
  assert!(decode("第一").is_err());
  assert!(decode("一二").is_err());
  assert!(decode("十百").is_err());
  assert!(decode("条").is_err());
}

#[test]
fn check_roundtrip() {
  for n in 0..=99999 {
    assert_eq!(decode(&encode(n)).unwrap(), n, "n = {n}");
  }
}
