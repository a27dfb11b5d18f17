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
  is_ctl, is_sp, is_token_char, parse_content_type_value, Header, ResponseHeader,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};

const MAX_TOTAL_LENGTH: usize = 8192;

#[derive(Clone, Copy, PartialEq)]
enum State {
  VersionH,
  VersionHt,
  VersionHtt,
  VersionHttp,
  VersionSlash,
  VersionMajorStart,
  VersionMajor,
  VersionMinorStart,
  VersionMinor,
  StatusCode1,
  StatusCode2,
  StatusCode3,
  StatusCodeSpace,
  StatusText,
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

/// Incremental HTTP/1.1 status-line and header parser; the response-side
/// twin of [`super::RequestParser`].
pub struct ResponseParser {
  state: State,
  pub req: ResponseHeader,
  name: String,
  lowcase_name: String,
  value: Vec<u8>,
  status_text: Vec<u8>,
  total_length: usize,
}

impl Default for ResponseParser {
  fn default() -> Self {
    Self::new()
  }
}

impl ResponseParser {
  pub fn new() -> Self {
    Self {
      state: State::VersionH,
      req: ResponseHeader {
        status: 0,
        ..ResponseHeader::default()
      },
      name: String::new(),
      lowcase_name: String::new(),
      value: Vec::new(),
      status_text: Vec::new(),
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
        if input == b' ' {
          self.req.keep_alive =
            self.req.http_version_major == 1 && self.req.http_version_minor == 1;
          State::StatusCode1
        } else if input.is_ascii_digit() {
          self.req.http_version_minor =
            self.req.http_version_minor.wrapping_mul(10) + (input - b'0');
          State::VersionMinor
        } else {
          return Err(Error::InvalidHttp("http version minor must be a digit"));
        }
      }
      State::StatusCode1 => self.status_digit(input, State::StatusCode2)?,
      State::StatusCode2 => self.status_digit(input, State::StatusCode3)?,
      State::StatusCode3 => self.status_digit(input, State::StatusCodeSpace)?,
      State::StatusCodeSpace => {
        if input == b' ' {
          State::StatusText
        } else if input == b'\r' {
          // a bare status line without text is tolerated
          State::StatusLineLf
        } else {
          return Err(Error::InvalidHttp("space expected after status code"));
        }
      }
      State::StatusText => {
        if input == b'\r' {
          self.req.status_text = String::from_utf8_lossy(&self.status_text).into_owned();
          State::StatusLineLf
        } else if is_ctl(input) {
          return Err(Error::InvalidHttp("control character in status text"));
        } else {
          self.status_text.push(input);
          State::StatusText
        }
      }
      State::StatusLineLf => self.expect(input, b'\n', State::HeaderLineStart)?,
      State::HeaderLineStart => {
        if input == b'\r' {
          State::FinalLf
        } else if is_sp(input) {
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

  fn status_digit(&mut self, input: u8, next: State) -> Result<State> {
    if !input.is_ascii_digit() {
      return Err(Error::InvalidHttp("status code must be three digits"));
    }
    self.req.status = self.req.status * 10 + u16::from(input - b'0');
    Ok(next)
  }

  fn expect(&self, input: u8, wanted: u8, next: State) -> Result<State> {
    if input == wanted {
      Ok(next)
    } else {
      Err(Error::InvalidHttp("unexpected character"))
    }
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
      "upgrade" => {
        if value.eq_ignore_ascii_case("websocket") {
          self.req.upgrade_websocket = true;
        } else {
          return Err(Error::InvalidHttp("invalid upgrade header value"));
        }
      }
      "sec-websocket-accept" => self.req.sec_websocket_accept = value,
      "date" => self.req.date = value,
      _ => self.req.headers.push(Header { name, value }),
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse_ok(raw: &str) -> ResponseHeader {
    let mut parser = ResponseParser::new();
    let used = parser.parse_bytes(raw.as_bytes()).unwrap();
    assert!(parser.is_good());
    assert_eq!(used, raw.len());
    parser.req
  }

  #[test]
  fn simple_response() {
    let resp = parse_ok(
      "HTTP/1.1 200 OK\r\nDate: Mon, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 5\r\n\r\n",
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.status_text, "OK");
    assert_eq!(resp.date, "Mon, 01 Jan 2024 00:00:00 GMT");
    assert_eq!(resp.content_length, Some(5));
    assert!(resp.keep_alive);
  }

  #[test]
  fn upgrade_response() {
    let resp = parse_ok(
      "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
    );
    assert!(resp.is_websocket_upgrade());
    assert_eq!(resp.sec_websocket_accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
  }

  #[test]
  fn status_with_multiword_text() {
    let resp = parse_ok("HTTP/1.0 404 Not Found Here\r\n\r\n");
    assert_eq!(resp.status, 404);
    assert_eq!(resp.status_text, "Not Found Here");
    assert!(!resp.keep_alive);
  }

  #[test]
  fn byte_at_a_time_equals_whole() {
    let raw = "HTTP/1.1 503 Busy\r\nRetry-After: 2\r\nConnection: close\r\n\r\n";
    let whole = parse_ok(raw);
    let mut parser = ResponseParser::new();
    for &b in raw.as_bytes() {
      parser.parse_bytes(&[b]).unwrap();
    }
    assert!(parser.is_good());
    assert_eq!(parser.req.status, whole.status);
    assert_eq!(parser.req.keep_alive, whole.keep_alive);
    assert_eq!(parser.req.headers, whole.headers);
  }

  #[test]
  fn malformed_inputs_rejected() {
    for raw in [
      "XTTP/1.1 200 OK\r\n\r\n",
      "HTTP/1.1 2x0 OK\r\n\r\n",
      "HTTP/1.1 200 OK\r\nConnection: banana\r\n\r\n",
    ] {
      let mut parser = ResponseParser::new();
      assert!(parser.parse_bytes(raw.as_bytes()).is_err(), "{raw:?}");
    }
  }
}
