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

use super::{
  is_ctl, is_sp, is_token_char, parse_authorization_basic, parse_content_type_value,
  Header, RequestHeader,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::util::from_hex_digit;

// Total request line + headers, a security limit.
const MAX_TOTAL_LENGTH: usize = 8192;

#[derive(Clone, Copy, PartialEq)]
enum State {
  MethodStart,
  Method,
  Uri,
  UriPercent1,
  UriPercent2,
  UriQuery,
  UriFragment,
  VersionH,
  VersionHt,
  VersionHtt,
  VersionHttp,
  VersionSlash,
  VersionMajorStart,
  VersionMajor,
  VersionMinorStart,
  VersionMinor,
  StatusLineLf,
  HeaderLineStart,
  HeaderLws,
  HeaderName,
  SpaceBeforeValue,
  HeaderValue,
  SpaceBeforeValueCommaSeparated,
  HeaderValueCommaSeparated,
  HeaderLf,
  FoldLf,
  FinalLf,
  Good,
}

/// Incremental HTTP/1.1 request-line and header parser.
///
/// Feed bytes until `is_good()`; the parser consumes nothing past the final
/// CRLF. The URI path is percent-decoded during the parse, the query string
/// is kept raw.
pub struct RequestParser {
  state: State,
  pub req: RequestHeader,
  name: String,
  lowcase_name: String,
  value: Vec<u8>,
  path: Vec<u8>,
  query: Vec<u8>,
  percent1: u8,
  total_length: usize,
}

impl Default for RequestParser {
  fn default() -> Self {
    Self::new()
  }
}

impl RequestParser {
  pub fn new() -> Self {
    Self {
      state: State::MethodStart,
      req: RequestHeader::default(),
      name: String::new(),
      lowcase_name: String::new(),
      value: Vec::new(),
      path: Vec::new(),
      query: Vec::new(),
      percent1: 0,
      total_length: 0,
    }
  }

  pub fn is_good(&self) -> bool {
    self.state == State::Good
  }

  pub fn parse(&mut self, buf: &mut Buffer) -> Result<()> {
    while !self.is_good() && !buf.is_empty() {
      let consumed = {
        let data = buf.read_slice();
        self.parse_bytes(data)?
      };
      buf.did_read(consumed);
    }
    Ok(())
  }

  /// Consumes bytes until the header completes; returns how many were used.
  pub fn parse_bytes(&mut self, data: &[u8]) -> Result<usize> {
    for (i, &byte) in data.iter().enumerate() {
      if self.is_good() {
        return Ok(i);
      }
      self.consume(byte)?;
    }
    Ok(data.len())
  }

  fn consume(&mut self, input: u8) -> Result<()> {
    self.total_length += 1;
    if self.total_length > MAX_TOTAL_LENGTH {
      return Err(Error::HttpLimit("header too long"));
    }
    self.state = match self.state {
      State::MethodStart => {
        if !is_token_char(input) {
          return Err(Error::InvalidHttp("invalid character at method start"));
        }
        self.req.method.push(input as char);
        State::Method
      }
      State::Method => {
        if input == b' ' {
          State::Uri
        } else if is_token_char(input) {
          self.req.method.push(input as char);
          State::Method
        } else {
          return Err(Error::InvalidHttp("invalid character in method"));
        }
      }
      State::Uri => match input {
        b' ' => self.finish_uri(),
        b'%' => State::UriPercent1,
        b'+' => {
          self.path.push(b' ');
          State::Uri
        }
        b'?' => State::UriQuery,
        b'#' => State::UriFragment,
        _ if is_ctl(input) => {
          return Err(Error::InvalidHttp("control character in uri"));
        }
        _ => {
          self.path.push(input);
          State::Uri
        }
      },
      State::UriPercent1 => match from_hex_digit(input) {
        Some(digit) => {
          self.percent1 = digit;
          State::UriPercent2
        }
        None => return Err(Error::InvalidHttp("invalid percent-encoding in path")),
      },
      State::UriPercent2 => match from_hex_digit(input) {
        Some(digit) => {
          self.path.push(self.percent1 * 16 + digit);
          State::Uri
        }
        None => return Err(Error::InvalidHttp("invalid percent-encoding in path")),
      },
      State::UriQuery => match input {
        b' ' => self.finish_uri(),
        b'#' => State::UriFragment,
        _ if is_ctl(input) => {
          return Err(Error::InvalidHttp("control character in query"));
        }
        _ => {
          self.query.push(input);
          State::UriQuery
        }
      },
      State::UriFragment => match input {
        b' ' => self.finish_uri(),
        _ if is_ctl(input) => {
          return Err(Error::InvalidHttp("control character in fragment"));
        }
        _ => State::UriFragment, // fragments are parsed and dropped
      },
      State::VersionH => self.expect(input, b'H', State::VersionHt)?,
      State::VersionHt => self.expect(input, b'T', State::VersionHtt)?,
      State::VersionHtt => self.expect(input, b'T', State::VersionHttp)?,
      State::VersionHttp => self.expect(input, b'P', State::VersionSlash)?,
      State::VersionSlash => self.expect(input, b'/', State::VersionMajorStart)?,
      State::VersionMajorStart => {
        if !input.is_ascii_digit() {
          return Err(Error::InvalidHttp("http version major must be a digit"));
        }
        self.req.http_version_major = input - b'0';
        State::VersionMajor
      }
      State::VersionMajor => {
        if input == b'.' {
          State::VersionMinorStart
        } else if input.is_ascii_digit() {
          self.req.http_version_major =
            self.req.http_version_major.wrapping_mul(10) + (input - b'0');
          State::VersionMajor
        } else {
          return Err(Error::InvalidHttp("http version major must be a digit"));
        }
      }
      State::VersionMinorStart => {
        if !input.is_ascii_digit() {
          return Err(Error::InvalidHttp("http version minor must be a digit"));
        }
        self.req.http_version_minor = input - b'0';
        State::VersionMinor
      }
      State::VersionMinor => {
        if input == b'\r' {
          self.req.keep_alive =
            self.req.http_version_major == 1 && self.req.http_version_minor == 1;
          State::StatusLineLf
        } else if input.is_ascii_digit() {
          self.req.http_version_minor =
            self.req.http_version_minor.wrapping_mul(10) + (input - b'0');
          State::VersionMinor
        } else {
          return Err(Error::InvalidHttp("http version minor must be a digit"));
        }
      }
      State::StatusLineLf => self.expect(input, b'\n', State::HeaderLineStart)?,
      State::HeaderLineStart => {
        if input == b'\r' {
          State::FinalLf
        } else if is_sp(input) {
          // non-standard obs-fold continuation line
          State::HeaderLws
        } else if is_token_char(input) {
          self.name.push(input as char);
          self.lowcase_name.push(input.to_ascii_lowercase() as char);
          State::HeaderName
        } else {
          return Err(Error::InvalidHttp("invalid character at header line start"));
        }
      }
      State::HeaderLws => {
        if input == b'\r' {
          self.fold_into_previous();
          State::FoldLf
        } else if is_sp(input) {
          State::HeaderLws
        } else if is_ctl(input) {
          return Err(Error::InvalidHttp("control character in folded header"));
        } else {
          self.value.push(input);
          State::HeaderLws
        }
      }
      State::FoldLf => self.expect(input, b'\n', State::HeaderLineStart)?,
      State::HeaderName => {
        if input == b':' {
          if self.lowcase_name == "connection" || self.lowcase_name == "transfer-encoding"
          {
            State::SpaceBeforeValueCommaSeparated
          } else {
            State::SpaceBeforeValue
          }
        } else if is_token_char(input) {
          self.name.push(input as char);
          self.lowcase_name.push(input.to_ascii_lowercase() as char);
          State::HeaderName
        } else {
          return Err(Error::InvalidHttp("invalid character in header name"));
        }
      }
      State::SpaceBeforeValue | State::HeaderValue => {
        if is_sp(input) && self.state == State::SpaceBeforeValue {
          State::SpaceBeforeValue
        } else if input == b'\r' {
          self.process_ready_header()?;
          State::HeaderLf
        } else if is_ctl(input) {
          return Err(Error::InvalidHttp("control character in header value"));
        } else {
          self.value.push(input);
          State::HeaderValue
        }
      }
      State::SpaceBeforeValueCommaSeparated | State::HeaderValueCommaSeparated => {
        if is_sp(input) && self.state == State::SpaceBeforeValueCommaSeparated {
          State::SpaceBeforeValueCommaSeparated
        } else if input == b'\r' {
          self.process_ready_header()?;
          State::HeaderLf
        } else if input == b',' {
          // keep the name for the remaining tokens of the list
          let name = self.lowcase_name.clone();
          self.process_ready_header()?;
          self.name = name.clone();
          self.lowcase_name = name;
          State::SpaceBeforeValueCommaSeparated
        } else if is_ctl(input) {
          return Err(Error::InvalidHttp("control character in header value"));
        } else {
          self.value.push(input);
          State::HeaderValueCommaSeparated
        }
      }
      State::HeaderLf => self.expect(input, b'\n', State::HeaderLineStart)?,
      State::FinalLf => self.expect(input, b'\n', State::Good)?,
      State::Good => State::Good,
    };
    Ok(())
  }

  fn expect(&self, input: u8, wanted: u8, next: State) -> Result<State> {
    if input == wanted {
      Ok(next)
    } else {
      Err(Error::InvalidHttp("unexpected character"))
    }
  }

  fn finish_uri(&mut self) -> State {
    self.req.path = String::from_utf8_lossy(&self.path).into_owned();
    self.req.query_string = String::from_utf8_lossy(&self.query).into_owned();
    State::VersionH
  }

  fn take_value(&mut self) -> String {
    while matches!(self.value.last(), Some(b' ') | Some(b'\t')) {
      self.value.pop();
    }
    let value = String::from_utf8_lossy(&self.value).into_owned();
    self.value.clear();
    value
  }

  fn fold_into_previous(&mut self) {
    let folded = self.take_value();
    if !folded.is_empty() {
      if let Some(last) = self.req.headers.last_mut() {
        last.value.push(' ');
        last.value.push_str(&folded);
      }
    }
  }

  fn process_ready_header(&mut self) -> Result<()> {
    let value = self.take_value();
    let name = std::mem::take(&mut self.name);
    let lowcase_name = std::mem::take(&mut self.lowcase_name);
    // compared by length first, so these chains are cheap
    match lowcase_name.as_str() {
      "content-length" => {
        let length: u64 = value
          .trim()
          .parse()
          .map_err(|_| Error::InvalidHttp("content length is not a number"))?;
        self.req.content_length = Some(length);
      }
      "transfer-encoding" => {
        let token = value.to_ascii_lowercase();
        if token == "chunked" {
          self.req.transfer_encoding_chunked = true;
        } else if !token.is_empty() {
          self.req.transfer_encodings.push(token);
        }
      }
      "host" => self.req.host = value,
      "origin" => self.req.origin = value,
      "content-type" => {
        let (mime, suffix) = parse_content_type_value(&value);
        self.req.content_type_mime = mime;
        self.req.content_type_suffix = suffix;
      }
      "connection" => match value.to_ascii_lowercase().as_str() {
        "close" => self.req.keep_alive = false,
        "keep-alive" => self.req.keep_alive = true,
        "upgrade" => self.req.connection_upgrade = true,
        _ => return Err(Error::InvalidHttp("invalid connection header value")),
      },
      "authorization" => {
        if let Some(auth) = parse_authorization_basic(&value) {
          self.req.basic_authorization = auth;
        }
      }
      "upgrade" => {
        if value.eq_ignore_ascii_case("websocket") {
          self.req.upgrade_websocket = true;
        } else {
          return Err(Error::InvalidHttp("invalid upgrade header value"));
        }
      }
      "sec-websocket-key" => self.req.sec_websocket_key = value,
      "sec-websocket-version" => self.req.sec_websocket_version = value,
      _ => self.req.headers.push(Header { name, value }),
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse_ok(raw: &str) -> RequestHeader {
    let mut parser = RequestParser::new();
    let used = parser.parse_bytes(raw.as_bytes()).unwrap();
    assert!(parser.is_good());
    assert_eq!(used, raw.len());
    parser.req
  }

  #[test]
  fn simple_get() {
    let req = parse_ok("GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(req.method, "GET");
    assert_eq!(req.path, "/hello");
    assert_eq!(req.host, "x");
    assert!(req.keep_alive);
    assert_eq!(req.content_length, None);
  }

  #[test]
  fn byte_at_a_time_equals_whole() {
    let raw = "POST /a%20b+c?q=1&x=%2F HTTP/1.1\r\nHost: h\r\nX-One: alpha\r\nContent-Length: 3\r\n\r\n";
    let whole = parse_ok(raw);
    let mut parser = RequestParser::new();
    for &b in raw.as_bytes() {
      parser.parse_bytes(&[b]).unwrap();
    }
    assert!(parser.is_good());
    let one = parser.req;
    assert_eq!(one.method, whole.method);
    assert_eq!(one.path, whole.path);
    assert_eq!(one.query_string, whole.query_string);
    assert_eq!(one.headers, whole.headers);
    assert_eq!(one.content_length, whole.content_length);
  }

  #[test]
  fn path_is_decoded_query_stays_raw() {
    let req = parse_ok("GET /a%20b+c?x=%2F&y=+ HTTP/1.1\r\n\r\n");
    assert_eq!(req.path, "/a b c");
    assert_eq!(req.query_string, "x=%2F&y=+");
  }

  #[test]
  fn utf8_path_decodes_cleanly() {
    let req = parse_ok("GET /Fran%C3%A7ois HTTP/1.1\r\n\r\n");
    assert_eq!(req.path, "/François");
  }

  #[test]
  fn fragment_is_dropped() {
    let req = parse_ok("GET /page?q=1#section HTTP/1.1\r\n\r\n");
    assert_eq!(req.path, "/page");
    assert_eq!(req.query_string, "q=1");
  }

  #[test]
  fn http_1_0_defaults_to_close() {
    let req = parse_ok("GET / HTTP/1.0\r\n\r\n");
    assert!(!req.keep_alive);
    let req = parse_ok("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    assert!(req.keep_alive);
    let req = parse_ok("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(!req.keep_alive);
  }

  #[test]
  fn connection_header_splits_on_commas() {
    let req = parse_ok(
      "GET /chat HTTP/1.1\r\nHost: h\r\nConnection: keep-alive, Upgrade\r\nUpgrade: WebSocket\r\nSec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 13\r\n\r\n",
    );
    assert!(req.keep_alive);
    assert!(req.connection_upgrade);
    assert!(req.upgrade_websocket);
    assert!(req.is_websocket_upgrade());
  }

  #[test]
  fn typed_fields_extracted() {
    let req = parse_ok(
      "POST /api HTTP/1.1\r\nHost: example.com\r\nOrigin: http://o\r\nContent-Type: Application/JSON; charset=utf-8\r\nAuthorization: Basic dXNlcjpwYXNz\r\nX-Custom: kept\r\nContent-Length: 0\r\n\r\n",
    );
    assert_eq!(req.host, "example.com");
    assert_eq!(req.origin, "http://o");
    assert_eq!(req.content_type_mime, "application/json");
    assert_eq!(req.content_type_suffix, "charset=utf-8");
    assert_eq!(req.basic_authorization, "dXNlcjpwYXNz");
    assert_eq!(req.headers.len(), 1);
    assert_eq!(req.headers[0].name, "X-Custom");
    assert_eq!(req.headers[0].value, "kept");
  }

  #[test]
  fn obs_fold_appends_to_previous_header() {
    let req =
      parse_ok("GET / HTTP/1.1\r\nX-Long: first\r\n  second part\r\nHost: h\r\n\r\n");
    assert_eq!(req.headers[0].value, "first second part");
    assert_eq!(req.host, "h");
  }

  #[test]
  fn round_trip_through_to_string() {
    let raw = "GET /x?a=1 HTTP/1.1\r\nhost: h\r\nX-K: v\r\n\r\n";
    let req = parse_ok(raw);
    let again = parse_ok(&req.to_string());
    assert_eq!(again.method, req.method);
    assert_eq!(again.path, req.path);
    assert_eq!(again.query_string, req.query_string);
    assert_eq!(again.host, req.host);
    assert_eq!(again.keep_alive, req.keep_alive);
    assert_eq!(again.headers, req.headers);
  }

  #[test]
  fn header_length_limit_enforced() {
    let mut raw = String::from("GET / HTTP/1.1\r\n");
    for i in 0..200 {
      raw.push_str(&format!("X-Header-{i}: {}\r\n", "v".repeat(64)));
    }
    raw.push_str("\r\n");
    let mut parser = RequestParser::new();
    assert!(matches!(
      parser.parse_bytes(raw.as_bytes()),
      Err(Error::HttpLimit(_))
    ));
  }

  #[test]
  fn malformed_inputs_rejected() {
    for raw in [
      "GET /\x01 HTTP/1.1\r\n\r\n",
      "GET / HTTX/1.1\r\n\r\n",
      "GET / HTTP/x.1\r\n\r\n",
      "GET / HTTP/1.1\r\nBad Header: v\r\n\r\n",
      "GET / HTTP/1.1\r\nContent-Length: abc\r\n\r\n",
      "GET / HTTP/1.1\r\nConnection: banana\r\n\r\n",
      "GET /%zz HTTP/1.1\r\n\r\n",
    ] {
      let mut parser = RequestParser::new();
      assert!(parser.parse_bytes(raw.as_bytes()).is_err(), "{raw:?}");
    }
  }
}
