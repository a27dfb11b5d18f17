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

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by parsers, sockets and servers.
///
/// The error *category* is the contract; message text is informational only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Malformed HTTP request or response bytes.
  #[error("invalid HTTP message: {0}")]
  InvalidHttp(&'static str),
  /// A security limit on header/trailer/chunk-header size was exceeded.
  #[error("HTTP limit exceeded: {0}")]
  HttpLimit(&'static str),
  #[error("body cannot have both Content-Length and chunked encoding")]
  BothBodyEncodings,
  #[error("reserved bits are not zero")]
  ReservedBitsNotZero,
  #[error("invalid WebSocket opcode: {0}")]
  InvalidOpCode(u8),
  #[error("continuation frame without a started message")]
  UnexpectedContinuationFrame,
  #[error("new data frame while a fragmented message is open")]
  UnfinishedFragmentedMessage,
  #[error("control frame must not be fragmented")]
  ControlFrameFragmented,
  #[error("control frame body exceeds 125 bytes")]
  ControlFrameTooLarge,
  #[error("invalid UTF-8 in text message")]
  InvalidUtf8,
  #[error("unexpected WebSocket upgrade response")]
  UnexpectedUpgrade,
  #[error("missing or wrong Sec-WebSocket-Accept value")]
  InvalidUpgradeAccept,
  #[error("connect attempt failed")]
  ConnectFailed,
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl Error {
  /// True for errors caused by peer-supplied bytes, as opposed to local I/O.
  pub fn is_protocol(&self) -> bool {
    !matches!(self, Error::Io(_) | Error::ConnectFailed)
  }
}

impl From<fmt::Error> for Error {
  fn from(_: fmt::Error) -> Self {
    Error::InvalidHttp("formatting failed")
  }
}
