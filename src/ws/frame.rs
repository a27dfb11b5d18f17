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

use super::mask::unmask_offset;
use super::{OpCode, MAX_CONTROL_BODY};
use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Largest frame header: 2 bytes + 8 extended length + 4 masking key.
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
  pub fin: bool,
  pub opcode: OpCode,
  pub payload_len: u64,
  pub masking_key: Option<[u8; 4]>,
}

#[derive(Clone, Copy, PartialEq)]
enum HeaderState {
  Byte0,
  Byte1,
  Length,
  MaskingKey,
  Good,
}

/// Incremental parser for one frame header.
pub struct FrameHeaderParser {
  state: HeaderState,
  fin: bool,
  opcode: OpCode,
  payload_len: u64,
  masked: bool,
  key: [u8; 4],
  remaining_field_bytes: usize,
}

impl Default for FrameHeaderParser {
  fn default() -> Self {
    Self::new()
  }
}

impl FrameHeaderParser {
  pub fn new() -> Self {
    Self {
      state: HeaderState::Byte0,
      fin: false,
      opcode: OpCode::Continuation,
      payload_len: 0,
      masked: false,
      key: [0; 4],
      remaining_field_bytes: 0,
    }
  }

  pub fn is_good(&self) -> bool {
    self.state == HeaderState::Good
  }

  pub fn header(&self) -> FrameHeader {
    FrameHeader {
      fin: self.fin,
      opcode: self.opcode,
      payload_len: self.payload_len,
      masking_key: if self.masked { Some(self.key) } else { None },
    }
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
    self.state = match self.state {
      HeaderState::Byte0 => {
        if input & 0x70 != 0 {
          return Err(Error::ReservedBitsNotZero);
        }
        self.fin = input & 0x80 != 0;
        self.opcode = OpCode::try_from(input & 0x0f)?;
        if self.opcode.is_control() && !self.fin {
          return Err(Error::ControlFrameFragmented);
        }
        HeaderState::Byte1
      }
      HeaderState::Byte1 => {
        self.masked = input & 0x80 != 0;
        match input & 0x7f {
          126 => {
            self.payload_len = 0;
            self.remaining_field_bytes = 2;
            HeaderState::Length
          }
          127 => {
            self.payload_len = 0;
            self.remaining_field_bytes = 8;
            HeaderState::Length
          }
          len => {
            self.payload_len = u64::from(len);
            self.after_length()?
          }
        }
      }
      HeaderState::Length => {
        self.payload_len = (self.payload_len << 8) | u64::from(input);
        self.remaining_field_bytes -= 1;
        if self.remaining_field_bytes > 0 {
          HeaderState::Length
        } else {
          self.after_length()?
        }
      }
      HeaderState::MaskingKey => {
        self.key[4 - self.remaining_field_bytes] = input;
        self.remaining_field_bytes -= 1;
        if self.remaining_field_bytes > 0 {
          HeaderState::MaskingKey
        } else {
          HeaderState::Good
        }
      }
      HeaderState::Good => HeaderState::Good,
    };
    Ok(())
  }

  fn after_length(&mut self) -> Result<HeaderState> {
    if self.opcode.is_control() && self.payload_len > MAX_CONTROL_BODY as u64 {
      return Err(Error::ControlFrameTooLarge);
    }
    if self.masked {
      self.remaining_field_bytes = 4;
      Ok(HeaderState::MaskingKey)
    } else {
      Ok(HeaderState::Good)
    }
  }
}

/// Streams one frame's payload, unmasking in place as bytes arrive.
pub struct FrameBodyParser {
  body: Vec<u8>,
  remaining: u64,
  masking_key: Option<[u8; 4]>,
  masking_offset: usize,
}

impl Default for FrameBodyParser {
  fn default() -> Self {
    Self {
      body: Vec::new(),
      remaining: 0,
      masking_key: None,
      masking_offset: 0,
    }
  }
}

impl FrameBodyParser {
  pub fn new(header: &FrameHeader) -> Self {
    let mut body = Vec::new();
    // common single-fragment messages benefit from one allocation
    if header.fin && header.payload_len < 1024 * 1024 {
      body.reserve(header.payload_len as usize);
    }
    Self {
      body,
      remaining: header.payload_len,
      masking_key: header.masking_key,
      masking_offset: 0,
    }
  }

  pub fn is_good(&self) -> bool {
    self.remaining == 0
  }

  pub fn parse(&mut self, buf: &mut Buffer) {
    while !self.is_good() && !buf.is_empty() {
      let consumed = {
        let data = buf.read_slice();
        self.parse_bytes(data)
      };
      buf.did_read(consumed);
    }
  }

  pub fn parse_bytes(&mut self, data: &[u8]) -> usize {
    let take = data.len().min(self.remaining as usize);
    let start = self.body.len();
    self.body.extend_from_slice(&data[..take]);
    if let Some(key) = self.masking_key {
      unmask_offset(&mut self.body[start..], key, self.masking_offset);
      self.masking_offset += take;
    }
    self.remaining -= take as u64;
    take
  }

  /// Takes the decoded payload, leaving the parser drained.
  pub fn take_body(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.body)
  }
}

/// Serializes a frame header into `out`, returning its length (2 to 14
/// bytes). Extended lengths are big-endian; the key is appended when given.
pub fn write_frame_header(
  out: &mut [u8; MAX_FRAME_HEADER_SIZE],
  fin: bool,
  opcode: OpCode,
  payload_len: u64,
  masking_key: Option<[u8; 4]>,
) -> usize {
  let mask_bit = if masking_key.is_some() { 0x80 } else { 0 };
  out[0] = (u8::from(fin) << 7) | opcode as u8;
  let mut pos;
  if payload_len < 126 {
    out[1] = mask_bit | payload_len as u8;
    pos = 2;
  } else if payload_len < 65536 {
    out[1] = mask_bit | 126;
    out[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
    pos = 4;
  } else {
    out[1] = mask_bit | 127;
    out[2..10].copy_from_slice(&payload_len.to_be_bytes());
    pos = 10;
  }
  if let Some(key) = masking_key {
    out[pos..pos + 4].copy_from_slice(&key);
    pos += 4;
  }
  pos
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse_header(bytes: &[u8]) -> Result<(FrameHeader, usize)> {
    let mut parser = FrameHeaderParser::new();
    let used = parser.parse_bytes(bytes)?;
    assert!(parser.is_good());
    Ok((parser.header(), used))
  }

  #[test]
  fn text_frame_with_mask() {
    // "ping" masked with 0x12345678
    let wire = [0x81, 0x84, 0x12, 0x34, 0x56, 0x78, 0x62, 0x51, 0x3a, 0x1c];
    let (header, used) = parse_header(&wire).unwrap();
    assert_eq!(used, 6);
    assert_eq!(header.opcode, OpCode::Text);
    assert!(header.fin);
    assert_eq!(header.payload_len, 4);
    assert_eq!(header.masking_key, Some([0x12, 0x34, 0x56, 0x78]));

    let mut body = FrameBodyParser::new(&header);
    body.parse_bytes(&wire[used..]);
    assert!(body.is_good());
    assert_eq!(body.take_body(), b"ping");
  }

  #[test]
  fn length_encodings_round_trip() {
    for len in [0u64, 1, 125, 126, 127, 65535, 65536, 1 << 20] {
      let mut out = [0u8; MAX_FRAME_HEADER_SIZE];
      let n = write_frame_header(&mut out, true, OpCode::Binary, len, None);
      match len {
        0..=125 => assert_eq!(n, 2),
        126..=65535 => assert_eq!(n, 4),
        _ => assert_eq!(n, 10),
      }
      let mut parser = FrameHeaderParser::new();
      let used = parser.parse_bytes(&out[..n]).unwrap();
      assert_eq!(used, n);
      assert!(parser.is_good());
      assert_eq!(parser.header().payload_len, len);
    }
  }

  #[test]
  fn one_byte_at_a_time_matches_whole() {
    let wire = {
      let mut out = [0u8; MAX_FRAME_HEADER_SIZE];
      let n = write_frame_header(
        &mut out,
        false,
        OpCode::Text,
        70000,
        Some([9, 8, 7, 6]),
      );
      out[..n].to_vec()
    };
    let whole = parse_header(&wire).unwrap().0;
    let mut parser = FrameHeaderParser::new();
    for &b in &wire {
      parser.parse_bytes(&[b]).unwrap();
    }
    assert!(parser.is_good());
    assert_eq!(parser.header(), whole);
  }

  #[test]
  fn reserved_bits_rejected() {
    let mut parser = FrameHeaderParser::new();
    assert!(matches!(
      parser.parse_bytes(&[0xc1]),
      Err(Error::ReservedBitsNotZero)
    ));
  }

  #[test]
  fn unknown_opcode_rejected() {
    let mut parser = FrameHeaderParser::new();
    assert!(matches!(
      parser.parse_bytes(&[0x83]),
      Err(Error::InvalidOpCode(3))
    ));
  }

  #[test]
  fn fragmented_control_frame_rejected() {
    let mut parser = FrameHeaderParser::new();
    assert!(matches!(
      parser.parse_bytes(&[0x09]),
      Err(Error::ControlFrameFragmented)
    ));
  }

  #[test]
  fn oversized_control_body_rejected() {
    let mut parser = FrameHeaderParser::new();
    assert!(parser.parse_bytes(&[0x89, 126]).is_err());
  }
}
