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

//! WebSocket (RFC 6455, version 13) wire layer: frame parsers, the frame
//! header serializer, masking, and the handshake key computation.

pub mod frame;
pub mod handshake;
pub mod mask;

pub use frame::{write_frame_header, FrameHeader, FrameBodyParser, FrameHeaderParser};
pub use mask::{unmask, unmask_offset};

use crate::error::Error;

/// Close code sent when a received frame violates the protocol.
pub const CLOSE_STATUS_PROTOCOL_ERROR: u16 = 1002;
/// Close code sent when an assembled text message is not valid UTF-8.
pub const CLOSE_STATUS_NOT_UTF8: u16 = 1007;
/// Stands in for "the close body carried no code" (never on the wire).
pub const CLOSE_STATUS_NO_CODE: u16 = 1005;

/// Control frame bodies are capped at 125 bytes by the protocol.
pub const MAX_CONTROL_BODY: usize = 125;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpCode {
  Continuation = 0,
  Text = 1,
  Binary = 2,
  Close = 8,
  Ping = 9,
  Pong = 10,
}

impl OpCode {
  pub fn is_control(self) -> bool {
    matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
  }
}

impl TryFrom<u8> for OpCode {
  type Error = Error;

  fn try_from(value: u8) -> Result<Self, Error> {
    match value {
      0 => Ok(OpCode::Continuation),
      1 => Ok(OpCode::Text),
      2 => Ok(OpCode::Binary),
      8 => Ok(OpCode::Close),
      9 => Ok(OpCode::Ping),
      10 => Ok(OpCode::Pong),
      other => Err(Error::InvalidOpCode(other)),
    }
  }
}

/// A complete, defragmented message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WebMessage {
  pub opcode: OpCode,
  pub body: Vec<u8>,
  /// Meaningful for close messages only.
  pub close_code: u16,
}

impl WebMessage {
  pub fn text(body: impl Into<String>) -> Self {
    Self {
      opcode: OpCode::Text,
      body: body.into().into_bytes(),
      close_code: 0,
    }
  }

  pub fn binary(body: impl Into<Vec<u8>>) -> Self {
    Self {
      opcode: OpCode::Binary,
      body: body.into(),
      close_code: 0,
    }
  }

  pub fn close(close_code: u16, reason: &str) -> Self {
    Self {
      opcode: OpCode::Close,
      body: reason.as_bytes().to_vec(),
      close_code,
    }
  }

  pub fn pong(body: Vec<u8>) -> Self {
    Self {
      opcode: OpCode::Pong,
      body,
      close_code: 0,
    }
  }

  pub(crate) fn ping() -> Self {
    Self {
      opcode: OpCode::Ping,
      body: Vec::new(),
      close_code: 0,
    }
  }

  pub fn is_text(&self) -> bool {
    self.opcode == OpCode::Text
  }

  pub fn is_binary(&self) -> bool {
    self.opcode == OpCode::Binary
  }

  /// The text payload; meaningful after the FSM validated UTF-8.
  pub fn as_text(&self) -> Option<&str> {
    std::str::from_utf8(&self.body).ok()
  }
}

/// Builds the on-wire close frame body: big-endian code then reason.
///
/// Codes below 1000 are clamped (RFC 6455 is silent on them) and the whole
/// body is truncated rather than rejected; reasons are frequently built from
/// arbitrary error text and callers should not need protocol internals.
pub(crate) fn close_frame_body(close_code: u16, reason: &[u8]) -> Vec<u8> {
  if reason.is_empty() && close_code == CLOSE_STATUS_NO_CODE {
    return Vec::new();
  }
  let code = close_code.max(1000);
  let mut body = Vec::with_capacity(2 + reason.len());
  body.extend_from_slice(&code.to_be_bytes());
  body.extend_from_slice(reason);
  body.truncate(MAX_CONTROL_BODY);
  body
}
