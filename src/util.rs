// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub fn to_hex(data: &[u8]) -> String {
  const HEXDIGITS: &[u8; 16] = b"0123456789abcdef";
  let mut result = String::with_capacity(data.len() * 2);
  for &b in data {
    result.push(HEXDIGITS[(b >> 4) as usize] as char);
    result.push(HEXDIGITS[(b & 0xf) as usize] as char);
  }
  result
}

pub fn from_hex_digit(sym: u8) -> Option<u8> {
  match sym {
    b'0'..=b'9' => Some(sym - b'0'),
    b'a'..=b'f' => Some(sym - b'a' + 10),
    b'A'..=b'F' => Some(sym - b'A' + 10),
    _ => None,
  }
}

pub fn from_hex(s: &str) -> Option<Vec<u8>> {
  if s.len() % 2 != 0 {
    return None;
  }
  let bytes = s.as_bytes();
  let mut result = Vec::with_capacity(s.len() / 2);
  for pair in bytes.chunks(2) {
    let d0 = from_hex_digit(pair[0])?;
    let d1 = from_hex_digit(pair[1])?;
    result.push(d0 * 16 + d1);
  }
  Some(result)
}

#[cfg(feature = "simd")]
pub fn is_valid_utf8(data: &[u8]) -> bool {
  simdutf8::basic::from_utf8(data).is_ok()
}

#[cfg(not(feature = "simd"))]
pub fn is_valid_utf8(data: &[u8]) -> bool {
  std::str::from_utf8(data).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hex_round_trip() {
    assert_eq!(to_hex(&[0x00, 0x7f, 0xff]), "007fff");
    assert_eq!(from_hex("007fff").unwrap(), vec![0x00, 0x7f, 0xff]);
    assert_eq!(from_hex("0"), None);
    assert_eq!(from_hex("zz"), None);
  }

  #[test]
  fn utf8_validation() {
    assert!(is_valid_utf8("проверка".as_bytes()));
    assert!(!is_valid_utf8(&[0xc3, 0x28]));
    assert!(!is_valid_utf8(&[0xed, 0xa0, 0x80])); // surrogate half
  }
}
