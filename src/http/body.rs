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

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::util::from_hex_digit;

// Security limits.
const MAX_CHUNK_HEADER_LENGTH: usize = 256;
const MAX_TRAILERS_LENGTH: usize = 4096;
const MAX_CHUNK_SIZE_DIGITS: usize = 2 * std::mem::size_of::<usize>();

#[derive(Clone, Copy, PartialEq)]
enum State {
  ContentLengthBody,
  ChunkSizeStart,
  ChunkSize,
  ChunkExtension,
  ChunkSizeLf,
  ChunkBody,
  ChunkBodyCr,
  ChunkBodyLf,
  TrailerLineStart,
  Trailer,
  TrailerLf,
  FinalLf,
  Good,
}

/// Incremental HTTP body parser for content-length and chunked framing.
///
/// With neither framing the body is empty and the parser starts complete.
/// Chunk extensions are skipped; trailers are parsed and discarded.
pub struct BodyParser {
  state: State,
  pub body: Vec<u8>,
  remaining: u64,
  chunk_size_digits: usize,
  chunk_header_length: usize,
  trailers_length: usize,
}

impl Default for BodyParser {
  fn default() -> Self {
    Self::new(None, false).unwrap()
  }
}

impl BodyParser {
  pub fn new(content_length: Option<u64>, chunked: bool) -> Result<Self> {
    if content_length.is_some() && chunked {
      return Err(Error::BothBodyEncodings);
    }
    let (state, remaining) = if chunked {
      (State::ChunkSizeStart, 0)
    } else {
      match content_length {
        Some(0) | None => (State::Good, 0),
        Some(length) => (State::ContentLengthBody, length),
      }
    };
    Ok(Self {
      state,
      body: Vec::new(),
      remaining,
      chunk_size_digits: 0,
      chunk_header_length: 0,
      trailers_length: 0,
    })
  }

  pub fn is_good(&self) -> bool {
    self.state == State::Good
  }

  pub fn take_body(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.body)
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
    let mut pos = 0;
    while pos < data.len() && !self.is_good() {
      match self.state {
        State::ContentLengthBody | State::ChunkBody => {
          let take = (data.len() - pos).min(self.remaining as usize);
          self.body.extend_from_slice(&data[pos..pos + take]);
          self.remaining -= take as u64;
          pos += take;
          if self.remaining == 0 {
            self.state = if self.state == State::ContentLengthBody {
              State::Good
            } else {
              State::ChunkBodyCr
            };
          }
        }
        _ => {
          self.consume(data[pos])?;
          pos += 1;
        }
      }
    }
    Ok(pos)
  }

  fn consume(&mut self, input: u8) -> Result<()> {
    self.state = match self.state {
      State::ChunkSizeStart => {
        self.bump_chunk_header()?;
        if input == b' ' {
          State::ChunkSizeStart
        } else if from_hex_digit(input).is_some() {
          self.push_chunk_digit(input)?;
          State::ChunkSize
        } else {
          return Err(Error::InvalidHttp("chunk size must start with a hex digit"));
        }
      }
      State::ChunkSize => {
        self.bump_chunk_header()?;
        if input == b' ' || input == b';' {
          State::ChunkExtension
        } else if input == b'\r' {
          State::ChunkSizeLf
        } else if from_hex_digit(input).is_some() {
          self.push_chunk_digit(input)?;
          State::ChunkSize
        } else {
          return Err(Error::InvalidHttp("chunk size must be a hex number"));
        }
      }
      State::ChunkExtension => {
        self.bump_chunk_header()?;
        // the real grammar is involved; skipping to CR matches what peers send
        if input == b'\r' {
          State::ChunkSizeLf
        } else {
          State::ChunkExtension
        }
      }
      State::ChunkSizeLf => {
        self.expect_lf(input)?;
        self.chunk_size_digits = 0;
        self.chunk_header_length = 0;
        if self.remaining == 0 {
          State::TrailerLineStart
        } else {
          State::ChunkBody
        }
      }
      State::ChunkBodyCr => {
        if input != b'\r' {
          return Err(Error::InvalidHttp("CR expected after chunk body"));
        }
        State::ChunkBodyLf
      }
      State::ChunkBodyLf => {
        self.expect_lf(input)?;
        State::ChunkSizeStart
      }
      State::TrailerLineStart => {
        self.bump_trailers()?;
        if input == b'\r' {
          State::FinalLf
        } else if !is_trailer_char(input) {
          return Err(Error::InvalidHttp("invalid character at trailer line start"));
        } else {
          State::Trailer
        }
      }
      State::Trailer => {
        self.bump_trailers()?;
        if input == b'\r' {
          State::TrailerLf
        } else {
          State::Trailer // trailers are parsed but dropped
        }
      }
      State::TrailerLf => {
        self.expect_lf(input)?;
        State::TrailerLineStart
      }
      State::FinalLf => {
        self.expect_lf(input)?;
        State::Good
      }
      State::ContentLengthBody | State::ChunkBody | State::Good => unreachable!(),
    };
    Ok(())
  }

  fn push_chunk_digit(&mut self, input: u8) -> Result<()> {
    if self.chunk_size_digits >= MAX_CHUNK_SIZE_DIGITS {
      return Err(Error::HttpLimit("chunk size too big"));
    }
    self.chunk_size_digits += 1;
    self.remaining = (self.remaining << 4) | u64::from(from_hex_digit(input).unwrap());
    Ok(())
  }

  fn bump_chunk_header(&mut self) -> Result<()> {
    self.chunk_header_length += 1;
    if self.chunk_header_length > MAX_CHUNK_HEADER_LENGTH {
      return Err(Error::HttpLimit("chunk header too long"));
    }
    Ok(())
  }

  fn bump_trailers(&mut self) -> Result<()> {
    self.trailers_length += 1;
    if self.trailers_length > MAX_TRAILERS_LENGTH {
      return Err(Error::HttpLimit("trailers too long"));
    }
    Ok(())
  }

  fn expect_lf(&self, input: u8) -> Result<()> {
    if input != b'\n' {
      return Err(Error::InvalidHttp("newline expected"));
    }
    Ok(())
  }
}

fn is_trailer_char(c: u8) -> bool {
  c.is_ascii() && !super::is_ctl(c)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse_all(parser: &mut BodyParser, data: &[u8]) -> Result<usize> {
    parser.parse_bytes(data)
  }

  #[test]
  fn no_framing_means_empty_body() {
    let parser = BodyParser::new(None, false).unwrap();
    assert!(parser.is_good());
    assert!(parser.body.is_empty());
  }

  #[test]
  fn zero_content_length_is_complete() {
    let parser = BodyParser::new(Some(0), false).unwrap();
    assert!(parser.is_good());
  }

  #[test]
  fn both_encodings_rejected() {
    assert!(matches!(
      BodyParser::new(Some(3), true),
      Err(Error::BothBodyEncodings)
    ));
  }

  #[test]
  fn content_length_body() {
    let mut parser = BodyParser::new(Some(5), false).unwrap();
    let used = parse_all(&mut parser, b"helloEXTRA").unwrap();
    assert_eq!(used, 5);
    assert!(parser.is_good());
    assert_eq!(parser.take_body(), b"hello");
  }

  #[test]
  fn chunked_echo_scenario() {
    let mut parser = BodyParser::new(None, true).unwrap();
    parse_all(&mut parser, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").unwrap();
    assert!(parser.is_good());
    assert_eq!(parser.take_body(), b"hello world");
  }

  #[test]
  fn chunked_without_trailers_terminates() {
    let mut parser = BodyParser::new(None, true).unwrap();
    parse_all(&mut parser, b"0\r\n\r\n").unwrap();
    assert!(parser.is_good());
    assert!(parser.body.is_empty());
  }

  #[test]
  fn chunked_with_extension_and_trailers() {
    let mut parser = BodyParser::new(None, true).unwrap();
    parse_all(
      &mut parser,
      b"4;name=value\r\nabcd\r\n0\r\nX-Trailer: ignored\r\n\r\n",
    )
    .unwrap();
    assert!(parser.is_good());
    assert_eq!(parser.take_body(), b"abcd");
  }

  #[test]
  fn byte_at_a_time_equals_whole() {
    let wire = b"3\r\nabc\r\nA\r\n0123456789\r\n0\r\n\r\n";
    let mut whole = BodyParser::new(None, true).unwrap();
    parse_all(&mut whole, wire).unwrap();
    let mut piecewise = BodyParser::new(None, true).unwrap();
    for &b in wire.iter() {
      piecewise.parse_bytes(&[b]).unwrap();
    }
    assert!(whole.is_good() && piecewise.is_good());
    assert_eq!(whole.take_body(), piecewise.take_body());
  }

  #[test]
  fn chunk_size_digit_limit() {
    let mut parser = BodyParser::new(None, true).unwrap();
    let raw = format!("{}\r\n", "f".repeat(MAX_CHUNK_SIZE_DIGITS + 1));
    assert!(matches!(
      parser.parse_bytes(raw.as_bytes()),
      Err(Error::HttpLimit(_))
    ));
  }

  #[test]
  fn chunk_header_length_limit() {
    let mut parser = BodyParser::new(None, true).unwrap();
    let raw = format!("5;{}\r\n", "x".repeat(MAX_CHUNK_HEADER_LENGTH + 1));
    assert!(matches!(
      parser.parse_bytes(raw.as_bytes()),
      Err(Error::HttpLimit(_))
    ));
  }

  #[test]
  fn trailer_length_limit() {
    let mut parser = BodyParser::new(None, true).unwrap();
    let mut raw = String::from("0\r\n");
    for i in 0..600 {
      raw.push_str(&format!("X-{i}: {}\r\n", "v".repeat(8)));
    }
    raw.push_str("\r\n");
    assert!(matches!(
      parser.parse_bytes(raw.as_bytes()),
      Err(Error::HttpLimit(_))
    ));
  }

  #[test]
  fn bad_chunk_size_rejected() {
    let mut parser = BodyParser::new(None, true).unwrap();
    assert!(parser.parse_bytes(b"zz\r\n").is_err());
  }
}
