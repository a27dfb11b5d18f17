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

use std::collections::HashMap;

use super::is_sp;
use crate::util::from_hex_digit;

#[derive(Clone, Copy, PartialEq)]
enum QueryState {
  Key,
  KeyPercent1,
  KeyPercent2,
  Value,
  ValuePercent1,
  ValuePercent2,
}

/// Parser for `application/x-www-form-urlencoded` data: `key=value&...`,
/// percent-decoding and `+`→space in both keys and values.
///
/// Duplicate keys: the last one wins. Malformed percent escapes pass through
/// literally. Empty keys and values are allowed.
pub struct QueryParser {
  state: QueryState,
  key: Vec<u8>,
  value: Vec<u8>,
  percent1: u8,
  parsed: HashMap<String, String>,
}

impl Default for QueryParser {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryParser {
  pub fn new() -> Self {
    Self {
      state: QueryState::Key,
      key: Vec::new(),
      value: Vec::new(),
      percent1: 0,
      parsed: HashMap::new(),
    }
  }

  /// Parses one complete urlencoded string, folding pairs into the result.
  pub fn parse(&mut self, data: &str) {
    for &byte in data.as_bytes() {
      self.consume(byte);
    }
    self.flush_pair();
  }

  pub fn finish(self) -> HashMap<String, String> {
    self.parsed
  }

  fn persist_pair(&mut self) {
    let key = String::from_utf8_lossy(&self.key).into_owned();
    let value = String::from_utf8_lossy(&self.value).into_owned();
    self.key.clear();
    self.value.clear();
    self.parsed.insert(key, value);
  }

  fn flush_pair(&mut self) {
    match self.state {
      QueryState::Key if self.key.is_empty() => {}
      QueryState::Key | QueryState::Value => self.persist_pair(),
      QueryState::KeyPercent1 => {
        self.key.push(b'%');
        self.persist_pair();
      }
      QueryState::KeyPercent2 => {
        self.key.push(b'%');
        self.key.push(self.percent1);
        self.persist_pair();
      }
      QueryState::ValuePercent1 => {
        self.value.push(b'%');
        self.persist_pair();
      }
      QueryState::ValuePercent2 => {
        self.value.push(b'%');
        self.value.push(self.percent1);
        self.persist_pair();
      }
    }
    self.state = QueryState::Key;
  }

  fn consume(&mut self, input: u8) {
    self.state = match self.state {
      QueryState::Key => match input {
        b'&' => {
          if !self.key.is_empty() {
            self.persist_pair();
          }
          QueryState::Key
        }
        b'%' => QueryState::KeyPercent1,
        b'=' => QueryState::Value,
        b'+' => {
          self.key.push(b' ');
          QueryState::Key
        }
        _ => {
          self.key.push(input);
          QueryState::Key
        }
      },
      QueryState::KeyPercent1 => {
        if input == b'=' {
          self.key.push(b'%');
          QueryState::Value
        } else if from_hex_digit(input).is_some() {
          self.percent1 = input;
          QueryState::KeyPercent2
        } else {
          self.key.push(b'%');
          self.key.push(input);
          QueryState::Key
        }
      }
      QueryState::KeyPercent2 => {
        if input == b'=' {
          self.key.push(b'%');
          self.key.push(self.percent1);
          QueryState::Value
        } else if let Some(digit) = from_hex_digit(input) {
          self
            .key
            .push(from_hex_digit(self.percent1).unwrap() * 16 + digit);
          QueryState::Key
        } else {
          self.key.push(b'%');
          self.key.push(self.percent1);
          self.key.push(input);
          QueryState::Key
        }
      }
      QueryState::Value => match input {
        b'&' => {
          self.persist_pair();
          QueryState::Key
        }
        b'%' => QueryState::ValuePercent1,
        b'+' => {
          self.value.push(b' ');
          QueryState::Value
        }
        _ => {
          self.value.push(input);
          QueryState::Value
        }
      },
      QueryState::ValuePercent1 => {
        if input == b'&' {
          self.value.push(b'%');
          self.persist_pair();
          QueryState::Key
        } else if from_hex_digit(input).is_some() {
          self.percent1 = input;
          QueryState::ValuePercent2
        } else {
          self.value.push(b'%');
          self.value.push(input);
          QueryState::Value
        }
      }
      QueryState::ValuePercent2 => {
        if input == b'&' {
          self.value.push(b'%');
          self.value.push(self.percent1);
          self.persist_pair();
          QueryState::Key
        } else if let Some(digit) = from_hex_digit(input) {
          self
            .value
            .push(from_hex_digit(self.percent1).unwrap() * 16 + digit);
          QueryState::Value
        } else {
          self.value.push(b'%');
          self.value.push(self.percent1);
          self.value.push(input);
          QueryState::Value
        }
      }
    };
  }
}

pub fn parse_query_string(data: &str) -> HashMap<String, String> {
  let mut parser = QueryParser::new();
  parser.parse(data);
  parser.finish()
}

#[derive(Clone, Copy, PartialEq)]
enum CookieState {
  KeyWsBefore,
  Key,
  ValueWsBefore,
  Value,
}

/// Cookie-header parser: tokens split on `;`, whitespace trimmed, split on
/// the first `=`. A token without `=` is stored as a key with an empty
/// value, so several standalone values survive in the map.
pub struct CookieParser {
  state: CookieState,
  key: Vec<u8>,
  value: Vec<u8>,
  parsed: HashMap<String, String>,
}

impl Default for CookieParser {
  fn default() -> Self {
    Self::new()
  }
}

impl CookieParser {
  pub fn new() -> Self {
    Self {
      state: CookieState::KeyWsBefore,
      key: Vec::new(),
      value: Vec::new(),
      parsed: HashMap::new(),
    }
  }

  pub fn parse(&mut self, data: &str) {
    for &byte in data.as_bytes() {
      self.consume(byte);
    }
    self.flush_pair();
  }

  pub fn finish(self) -> HashMap<String, String> {
    self.parsed
  }

  fn persist_pair(&mut self) {
    while matches!(self.key.last(), Some(b' ') | Some(b'\t')) {
      self.key.pop();
    }
    while matches!(self.value.last(), Some(b' ') | Some(b'\t')) {
      self.value.pop();
    }
    let key = String::from_utf8_lossy(&self.key).into_owned();
    let value = String::from_utf8_lossy(&self.value).into_owned();
    self.key.clear();
    self.value.clear();
    self.parsed.insert(key, value);
  }

  fn flush_pair(&mut self) {
    if self.state != CookieState::KeyWsBefore {
      self.persist_pair();
    }
    self.state = CookieState::KeyWsBefore;
  }

  fn consume(&mut self, input: u8) {
    self.state = match self.state {
      CookieState::KeyWsBefore => {
        if is_sp(input) || input == b';' {
          CookieState::KeyWsBefore
        } else if input == b'=' {
          CookieState::ValueWsBefore
        } else {
          self.key.push(input);
          CookieState::Key
        }
      }
      CookieState::Key => {
        if input == b';' {
          self.persist_pair();
          CookieState::KeyWsBefore
        } else if input == b'=' {
          CookieState::ValueWsBefore
        } else {
          self.key.push(input);
          CookieState::Key
        }
      }
      CookieState::ValueWsBefore => {
        if is_sp(input) {
          CookieState::ValueWsBefore
        } else if input == b';' {
          self.persist_pair();
          CookieState::KeyWsBefore
        } else {
          self.value.push(input);
          CookieState::Value
        }
      }
      CookieState::Value => {
        if input == b';' {
          self.persist_pair();
          CookieState::KeyWsBefore
        } else {
          self.value.push(input);
          CookieState::Value
        }
      }
    };
  }
}

pub fn parse_cookie_string(data: &str) -> HashMap<String, String> {
  let mut parser = CookieParser::new();
  parser.parse(data);
  parser.finish()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn simple_pairs() {
    let p = parse_query_string("simple=test&oh=mygod&it=works");
    assert_eq!(p["simple"], "test");
    assert_eq!(p["oh"], "mygod");
    assert_eq!(p["it"], "works");
    assert!(!p.contains_key("session"));
  }

  #[test]
  fn empty_keys_and_values() {
    let p = parse_query_string("simple=&=mygod");
    assert_eq!(p["simple"], "");
    assert_eq!(p[""], "mygod");
    let p = parse_query_string("test=mega=giga&=&&&");
    assert_eq!(p["test"], "mega=giga");
    assert_eq!(p[""], "");
  }

  #[test]
  fn duplicate_key_last_wins() {
    let p = parse_query_string("x=y&x=z");
    assert_eq!(p["x"], "z");
  }

  #[test]
  fn percent_decoding_and_plus() {
    let p = parse_query_string(
      "Fran%C3%A7ois=%D1%82%D0%B5%D1%81%D1%82+123+%D0%BD%D0%B0%D1%84%D0%B8%D0%B3",
    );
    assert_eq!(p["François"], "тест 123 нафиг");
  }

  #[test]
  fn malformed_escapes_pass_through() {
    let p = parse_query_string("end_on_%=bruh%");
    assert_eq!(p["end_on_%"], "bruh%");
    let p = parse_query_string("end_on_%f=bruh%a");
    assert_eq!(p["end_on_%f"], "bruh%a");
    let p = parse_query_string("end_on_%fz=bruh%az&valid%41=ok%41");
    assert_eq!(p["end_on_%fz"], "bruh%az");
    assert_eq!(p["validA"], "okA");
    let p = parse_query_string("end_on_%");
    assert_eq!(p["end_on_%"], "");
  }

  #[test]
  fn keys_without_values() {
    let p = parse_query_string("hren&mega");
    assert_eq!(p["hren"], "");
    assert_eq!(p["mega"], "");
  }

  #[test]
  fn cookie_basics() {
    let p = parse_cookie_string("simple=test;oh=my=god;it=works");
    assert_eq!(p["simple"], "test");
    assert_eq!(p["oh"], "my=god");
    let p = parse_cookie_string("_session=lqJlEC9ypWiEX3OB;another=value;=");
    assert_eq!(p["_session"], "lqJlEC9ypWiEX3OB");
    assert_eq!(p["another"], "value");
    assert_eq!(p[""], "");
  }

  #[test]
  fn cookie_whitespace_trimmed() {
    let p = parse_cookie_string(
      "  _session  =  lqJlEC9ypWiEX3OB  ; another = value  ;keyonly =  ;=valueonly",
    );
    assert_eq!(p["_session"], "lqJlEC9ypWiEX3OB");
    assert_eq!(p["another"], "value");
    assert_eq!(p["keyonly"], "");
    assert_eq!(p[""], "valueonly");
    let p = parse_cookie_string(" test =  last value with spaces   ");
    assert_eq!(p["test"], "last value with spaces");
  }

  #[test]
  fn cookie_standalone_tokens_become_keys() {
    let p = parse_cookie_string(" a = b ;hren,123; last key with spaces ");
    assert_eq!(p["hren,123"], "");
    assert_eq!(p["last key with spaces"], "");
  }
}
