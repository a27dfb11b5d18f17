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

//! HTTP/1.1 message types, incremental parsers and the per-connection state
//! machines for both server and client sides.

pub mod body;
pub mod client;
pub mod connection;
pub mod query;
pub mod request;
pub mod response;
pub mod server;

pub use body::BodyParser;
pub use client::ClientConnection;
pub use connection::Connection;
pub use query::{parse_cookie_string, parse_query_string, CookieParser, QueryParser};
pub use request::RequestParser;
pub use response::ResponseParser;
pub use server::{ClientId, Server};

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::ws::handshake;

/// A verbatim header not covered by a typed field, order preserved.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Header {
  pub name: String,
  pub value: String,
}

pub(crate) fn is_sp(c: u8) -> bool {
  c == b' ' || c == b'\t'
}

pub(crate) fn is_ctl(c: u8) -> bool {
  c <= 31 || c == 127
}

pub(crate) fn is_tspecial(c: u8) -> bool {
  matches!(
    c,
    b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'['
      | b']' | b'?' | b'=' | b'{' | b'}' | b' ' | b'\t'
  )
}

pub(crate) fn is_token_char(c: u8) -> bool {
  c.is_ascii() && !is_ctl(c) && !is_tspecial(c)
}

/// Splits `value` into lowercased mime and the parameter part after `;`.
pub(crate) fn parse_content_type_value(value: &str) -> (String, String) {
  let (mime, rest) = match value.find([';', ' ', '\t']) {
    Some(pos) => (&value[..pos], &value[pos..]),
    None => (value, ""),
  };
  let suffix = rest
    .trim_start_matches([' ', '\t'])
    .trim_start_matches(';')
    .trim_start_matches([' ', '\t']);
  (mime.to_ascii_lowercase(), suffix.to_string())
}

/// Extracts credentials from `Basic <base64>`; None for other schemes.
pub(crate) fn parse_authorization_basic(value: &str) -> Option<String> {
  let rest = value
    .get(..6)
    .filter(|scheme| scheme.eq_ignore_ascii_case("basic "))
    .map(|_| &value[6..])?;
  Some(rest.trim_start_matches([' ', '\t']).to_string())
}

pub fn status_to_string(status: u16) -> &'static str {
  match status {
    101 => "Switching Protocols",
    200 => "OK",
    400 => "Bad request",
    401 => "Unauthorized",
    403 => "Forbidden",
    404 => "Not found",
    422 => "Unprocessable Entity",
    500 => "Internal Error",
    501 => "Not implemented",
    502 => "Service temporarily overloaded",
    503 => "Gateway timeout",
    _ => "Unknown",
  }
}

/// Fields shared by requests and responses.
#[derive(Clone, Debug)]
pub struct RequestHeader {
  pub http_version_major: u8,
  pub http_version_minor: u8,
  pub headers: Vec<Header>,
  pub keep_alive: bool,
  pub content_length: Option<u64>,
  pub transfer_encoding_chunked: bool,
  /// Encodings other than chunked, lowercased.
  pub transfer_encodings: Vec<String>,
  pub connection_upgrade: bool,
  pub upgrade_websocket: bool,
  pub content_type_mime: String,
  pub content_type_suffix: String,

  pub method: String,
  /// URL-decoded on parse, written verbatim on send.
  pub path: String,
  /// Kept raw; decoding would lose the separators.
  pub query_string: String,
  pub basic_authorization: String,
  pub host: String,
  pub origin: String,
  pub sec_websocket_key: String,
  pub sec_websocket_version: String,
}

impl Default for RequestHeader {
  fn default() -> Self {
    Self {
      http_version_major: 1,
      http_version_minor: 1,
      headers: Vec::new(),
      keep_alive: true,
      content_length: None,
      transfer_encoding_chunked: false,
      transfer_encodings: Vec::new(),
      connection_upgrade: false,
      upgrade_websocket: false,
      content_type_mime: String::new(),
      content_type_suffix: String::new(),
      method: String::new(),
      path: String::new(),
      query_string: String::new(),
      basic_authorization: String::new(),
      host: String::new(),
      origin: String::new(),
      sec_websocket_key: String::new(),
      sec_websocket_version: String::new(),
    }
  }
}

impl RequestHeader {
  pub fn new(method: &str, uri: &str) -> Self {
    let mut header = Self::default();
    header.method = method.to_string();
    header.set_uri(uri);
    header
  }

  pub fn set_content_type(&mut self, content_type: &str) {
    let (mime, suffix) = parse_content_type_value(content_type);
    self.content_type_mime = mime;
    self.content_type_suffix = suffix;
  }

  pub fn is_websocket_upgrade(&self) -> bool {
    self.method == "GET"
      && self.connection_upgrade
      && self.upgrade_websocket
      && !self.sec_websocket_key.is_empty()
      && self.sec_websocket_version == "13"
  }

  pub fn set_uri(&mut self, uri: &str) {
    match uri.split_once('?') {
      Some((path, query)) => {
        self.path = path.to_string();
        self.query_string = query.to_string();
      }
      None => {
        self.path = uri.to_string();
        self.query_string.clear();
      }
    }
  }

  pub fn uri(&self) -> String {
    if self.query_string.is_empty() {
      self.path.clone()
    } else {
      format!("{}?{}", self.path, self.query_string)
    }
  }

  pub fn to_string(&self) -> String {
    let mut out = String::with_capacity(128);
    let _ = write!(out, "{} {}", self.method, self.path);
    if !self.query_string.is_empty() {
      let _ = write!(out, "?{}", self.query_string);
    }
    let _ = write!(
      out,
      " HTTP/{}.{}\r\n",
      self.http_version_major, self.http_version_minor
    );
    if !self.host.is_empty() {
      let _ = write!(out, "host: {}\r\n", self.host);
    }
    if !self.origin.is_empty() {
      let _ = write!(out, "origin: {}\r\n", self.origin);
    }
    if !self.basic_authorization.is_empty() {
      let _ = write!(out, "authorization: basic {}\r\n", self.basic_authorization);
    }
    write_common_headers(
      &mut out,
      self.http_version_major,
      self.http_version_minor,
      self.keep_alive,
      self.connection_upgrade && self.upgrade_websocket,
      self.content_length,
      self.transfer_encoding_chunked,
      &self.transfer_encodings,
      &self.content_type_mime,
      &self.content_type_suffix,
      &self.headers,
    );
    if !self.sec_websocket_key.is_empty() {
      let _ = write!(out, "sec-websocket-key: {}\r\n", self.sec_websocket_key);
    }
    if !self.sec_websocket_version.is_empty() {
      let _ = write!(
        out,
        "sec-websocket-version: {}\r\n",
        self.sec_websocket_version
      );
    }
    out.push_str("\r\n");
    out
  }
}

#[derive(Clone, Debug)]
pub struct ResponseHeader {
  pub http_version_major: u8,
  pub http_version_minor: u8,
  pub headers: Vec<Header>,
  pub keep_alive: bool,
  pub content_length: Option<u64>,
  pub transfer_encoding_chunked: bool,
  pub transfer_encodings: Vec<String>,
  pub connection_upgrade: bool,
  pub upgrade_websocket: bool,
  pub content_type_mime: String,
  pub content_type_suffix: String,

  pub status: u16,
  pub status_text: String,
  pub sec_websocket_accept: String,
  pub date: String,
}

impl Default for ResponseHeader {
  fn default() -> Self {
    Self {
      http_version_major: 1,
      http_version_minor: 1,
      headers: Vec::new(),
      keep_alive: true,
      content_length: None,
      transfer_encoding_chunked: false,
      transfer_encodings: Vec::new(),
      connection_upgrade: false,
      upgrade_websocket: false,
      content_type_mime: String::new(),
      content_type_suffix: String::new(),
      status: 0,
      status_text: String::new(),
      sec_websocket_accept: String::new(),
      date: String::new(),
    }
  }
}

impl ResponseHeader {
  pub fn set_content_type(&mut self, content_type: &str) {
    let (mime, suffix) = parse_content_type_value(content_type);
    self.content_type_mime = mime;
    self.content_type_suffix = suffix;
  }

  pub fn is_websocket_upgrade(&self) -> bool {
    self.status == 101 && self.connection_upgrade && self.upgrade_websocket
      && !self.sec_websocket_accept.is_empty()
  }

  pub fn generate_sec_websocket_accept(sec_websocket_key: &str) -> String {
    handshake::generate_accept(sec_websocket_key)
  }

  pub fn add_headers_nocache(&mut self) {
    self.headers.push(Header {
      name: "cache-control".into(),
      value: "no-cache, no-store, must-revalidate".into(),
    });
    self.headers.push(Header {
      name: "expires".into(),
      value: "0".into(),
    });
  }

  pub fn to_string(&self) -> String {
    let mut out = String::with_capacity(128);
    let text = if self.status_text.is_empty() {
      status_to_string(self.status)
    } else {
      &self.status_text
    };
    let _ = write!(
      out,
      "HTTP/{}.{} {} {}\r\n",
      self.http_version_major, self.http_version_minor, self.status, text
    );
    if !self.date.is_empty() {
      let _ = write!(out, "date: {}\r\n", self.date);
    }
    write_common_headers(
      &mut out,
      self.http_version_major,
      self.http_version_minor,
      self.keep_alive,
      self.connection_upgrade && self.upgrade_websocket,
      self.content_length,
      self.transfer_encoding_chunked,
      &self.transfer_encodings,
      &self.content_type_mime,
      &self.content_type_suffix,
      &self.headers,
    );
    if !self.sec_websocket_accept.is_empty() {
      let _ = write!(out, "sec-websocket-accept: {}\r\n", self.sec_websocket_accept);
    }
    out.push_str("\r\n");
    out
  }
}

#[allow(clippy::too_many_arguments)]
fn write_common_headers(
  out: &mut String,
  version_major: u8,
  version_minor: u8,
  keep_alive: bool,
  websocket_upgrade: bool,
  content_length: Option<u64>,
  chunked: bool,
  transfer_encodings: &[String],
  content_type_mime: &str,
  content_type_suffix: &str,
  headers: &[Header],
) {
  if !content_type_mime.is_empty() {
    let _ = write!(out, "content-type: {content_type_mime}");
    if !content_type_suffix.is_empty() {
      let _ = write!(out, "; {content_type_suffix}");
    }
    out.push_str("\r\n");
  }
  if let Some(length) = content_length {
    let _ = write!(out, "content-length: {length}\r\n");
  }
  if websocket_upgrade {
    out.push_str("connection: upgrade\r\nupgrade: websocket\r\n");
  } else if version_major == 1 && version_minor == 0 && keep_alive {
    out.push_str("connection: keep-alive\r\n");
  } else if version_major == 1 && version_minor == 1 && !keep_alive {
    out.push_str("connection: close\r\n");
  }
  if !transfer_encodings.is_empty() || chunked {
    out.push_str("transfer-encoding:");
    let mut first = true;
    for encoding in transfer_encodings {
      let _ = write!(out, "{} {encoding}", if first { "" } else { "," });
      first = false;
    }
    if chunked {
      let _ = write!(out, "{} chunked", if first { "" } else { "," });
    }
    out.push_str("\r\n");
  }
  for header in headers {
    let _ = write!(out, "{}: {}\r\n", header.name, header.value);
  }
}

/// A parsed request with its complete body.
#[derive(Clone, Debug, Default)]
pub struct Request {
  pub header: RequestHeader,
  pub body: Vec<u8>,
}

impl Request {
  pub fn new(host: &str, method: &str, uri: &str) -> Self {
    let mut header = RequestHeader::new(method, uri);
    header.host = host.to_string();
    Self {
      header,
      body: Vec::new(),
    }
  }

  pub fn set_body(&mut self, body: Vec<u8>) {
    self.header.content_length = Some(body.len() as u64);
    self.body = body;
  }

  /// Form parameters: the query string for GET, the urlencoded body for the
  /// other methods.
  pub fn parse_query_params(&self) -> HashMap<String, String> {
    let mut parser = QueryParser::new();
    parser.parse(&self.header.query_string);
    if self.header.method != "GET"
      && self.header.content_type_mime == "application/x-www-form-urlencoded"
    {
      if let Ok(body) = std::str::from_utf8(&self.body) {
        parser.parse(body);
      }
    }
    parser.finish()
  }

  pub fn parse_cookies(&self) -> HashMap<String, String> {
    let mut parser = CookieParser::new();
    for header in &self.header.headers {
      if header.name.eq_ignore_ascii_case("cookie") {
        parser.parse(&header.value);
      }
    }
    parser.finish()
  }
}

/// A response with its complete body.
#[derive(Clone, Debug, Default)]
pub struct Response {
  pub header: ResponseHeader,
  pub body: Vec<u8>,
}

impl Response {
  pub fn set_body(&mut self, body: Vec<u8>) {
    self.header.content_length = Some(body.len() as u64);
    self.body = body;
  }

  pub fn simple(status: u16, content_type: &str, body: Vec<u8>) -> Self {
    let mut response = Response::default();
    response.header.add_headers_nocache();
    response.header.status = status;
    response.header.set_content_type(content_type);
    response.set_body(body);
    response
  }

  pub fn text(status: u16, body: impl Into<String>) -> Self {
    Self::simple(
      status,
      "text/plain; charset=utf-8",
      body.into().into_bytes(),
    )
  }

  pub fn html(status: u16, body: impl Into<String>) -> Self {
    let html = format!("<html><body>{}</body></html>", body.into());
    Self::simple(status, "text/html; charset=utf-8", html.into_bytes())
  }

  pub fn status_page(status: u16) -> Self {
    Self::html(status, format!("{} {}", status, status_to_string(status)))
  }
}
