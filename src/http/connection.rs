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

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::{BodyParser, Request, RequestParser, Response, ResponseHeader};
use crate::address::Address;
use crate::buffer::Buffer;
use crate::buffered::BufferedTcpSocket;
use crate::error::{Error, Result};
use crate::runloop::{make_handler, Handler, Timer};
use crate::tcp::TcpAcceptor;
use crate::util::is_valid_utf8;
use crate::ws::frame::MAX_FRAME_HEADER_SIZE;
use crate::ws::{
  close_frame_body, write_frame_header, FrameBodyParser, FrameHeaderParser, OpCode,
  WebMessage, CLOSE_STATUS_NOT_UTF8, CLOSE_STATUS_NO_CODE, CLOSE_STATUS_PROTOCOL_ERROR,
  MAX_CONTROL_BODY,
};

const READ_BUFFER_SIZE: usize = 8192;
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
  RequestHeader,
  RequestBody,
  RequestReady,
  ResponseHeader,
  ResponseBody,
  WebMessageHeader,
  WebMessageBody,
  WebMessageReady,
  Shutdown,
}

struct Inner {
  read_buffer: Buffer,
  request_parser: RequestParser,
  body_parser: BodyParser,
  frame_parser: FrameHeaderParser,
  frame_body: FrameBodyParser,
  message: Option<WebMessage>,
  sock: BufferedTcpSocket,
  ping_timer: Timer,
  state: State,
  /// Body bytes still owed in content-length mode; None while chunked.
  remaining_content_length: Option<u64>,
  // facts about the request in flight, kept for framing the response
  req_keep_alive: bool,
  req_version: (u8, u8),
  req_websocket_key: String,
  req_is_upgrade: bool,
  close_sent: bool,
  peer_address: Address,
  r_handler: Handler,
  d_handler: Handler,
}

/// Server side of one HTTP/1.1 connection, including the WebSocket state
/// machine after an upgrade.
///
/// The read handler fires whenever `read_next_request` /
/// `read_next_message` may return something new; the disconnect handler
/// fires exactly once when the peer goes away. Pull messages in a loop:
///
/// ```no_run
/// # use crabnet::http::{Connection, Response};
/// # fn handle(conn: &mut Connection) {
/// while let Some(request) = conn.read_next_request() {
///   conn.write_response(Response::text(200, request.header.path));
/// }
/// # }
/// ```
pub struct Connection {
  inner: Rc<RefCell<Inner>>,
}

impl Clone for Connection {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl Connection {
  pub fn new(r_handler: impl FnMut() + 'static, d_handler: impl FnMut() + 'static) -> Self {
    let inner = Rc::new_cyclic(|weak: &Weak<RefCell<Inner>>| {
      let sock_weak = weak.clone();
      let ping_weak = weak.clone();
      RefCell::new(Inner {
        read_buffer: Buffer::new(READ_BUFFER_SIZE),
        request_parser: RequestParser::new(),
        body_parser: BodyParser::default(),
        frame_parser: FrameHeaderParser::new(),
        frame_body: FrameBodyParser::default(),
        message: None,
        sock: BufferedTcpSocket::new(move || Self::on_sock(&sock_weak)),
        ping_timer: Timer::new(move || Self::on_ping(&ping_weak)),
        state: State::RequestHeader,
        remaining_content_length: None,
        req_keep_alive: true,
        req_version: (1, 1),
        req_websocket_key: String::new(),
        req_is_upgrade: false,
        close_sent: false,
        peer_address: Address::default(),
        r_handler: make_handler(r_handler),
        d_handler: make_handler(d_handler),
      })
    });
    Self { inner }
  }

  pub fn set_handlers(
    &mut self,
    r_handler: impl FnMut() + 'static,
    d_handler: impl FnMut() + 'static,
  ) {
    let mut inner = self.inner.borrow_mut();
    inner.r_handler = make_handler(r_handler);
    inner.d_handler = make_handler(d_handler);
  }

  fn on_sock(weak: &Weak<RefCell<Inner>>) {
    let Some(inner) = weak.upgrade() else {
      return;
    };
    let handler = {
      let mut inner = inner.borrow_mut();
      if !inner.sock.is_open() {
        inner.reset_closed();
        inner.d_handler.clone()
      } else if inner.state == State::ResponseBody {
        // body streaming: notify the writer on every write-progress edge
        inner.r_handler.clone()
      } else {
        match inner.advance() {
          Ok(true) => inner.r_handler.clone(),
          Ok(false) => return,
          Err(err) => {
            log::debug!("http connection protocol error: {err}");
            if inner.is_websocket() && err.is_protocol() {
              // tell the peer before shutting down
              let _ =
                inner.write_ws(WebMessage::close(CLOSE_STATUS_PROTOCOL_ERROR, ""));
            } else {
              inner.protocol_error();
            }
            inner.r_handler.clone()
          }
        }
      }
    };
    (&mut *handler.borrow_mut())();
  }

  fn on_ping(weak: &Weak<RefCell<Inner>>) {
    let Some(inner) = weak.upgrade() else {
      return;
    };
    let mut inner = inner.borrow_mut();
    if !inner.sock.is_open() || !inner.is_websocket() {
      return;
    }
    if inner.sock.total_buffered() != 0 {
      // backpressure: flushing the buffer is enough, no new frame
      inner.sock.write(&[]);
      inner.ping_timer.once(PING_INTERVAL);
    } else {
      let _ = inner.write_ws(WebMessage::ping());
    }
  }

  pub fn accept(&mut self, acceptor: &mut TcpAcceptor) {
    self.close();
    let mut inner = self.inner.borrow_mut();
    inner.peer_address = inner.sock.accept(acceptor);
    inner.request_parser = RequestParser::new();
    inner.state = State::RequestHeader;
  }

  /// After `close` no handler invocations happen.
  pub fn close(&mut self) {
    let mut inner = self.inner.borrow_mut();
    inner.sock.close();
    inner.reset_closed();
  }

  pub fn is_open(&self) -> bool {
    self.inner.borrow().sock.is_open()
  }

  pub fn peer_addr(&self) -> Address {
    self.inner.borrow().peer_address
  }

  pub fn is_websocket(&self) -> bool {
    self.inner.borrow().is_websocket()
  }

  /// True when a direct write would make progress (used for body streaming).
  pub fn can_write(&self) -> bool {
    self.inner.borrow().sock.can_write()
  }

  /// Returns the next complete request, if one is ready. The connection then
  /// expects exactly one response (or an upgrade, or a deferred write).
  pub fn read_next_request(&mut self) -> Option<Request> {
    let mut inner = self.inner.borrow_mut();
    if inner.state != State::RequestReady {
      return None;
    }
    let mut header = std::mem::take(&mut inner.request_parser.req);
    let body = inner.body_parser.take_body();
    header.transfer_encoding_chunked = false; // the body is already unframed
    inner.req_keep_alive = header.keep_alive;
    inner.req_version = (header.http_version_major, header.http_version_minor);
    inner.req_websocket_key = header.sec_websocket_key.clone();
    inner.req_is_upgrade = header.is_websocket_upgrade();
    inner.state = State::ResponseHeader;
    Some(Request { header, body })
  }

  /// Returns the next complete WebSocket message. Ping/pong are handled
  /// internally; a returned close message has already been mirrored.
  pub fn read_next_message(&mut self) -> Option<WebMessage> {
    let mut inner = self.inner.borrow_mut();
    if inner.state != State::WebMessageReady {
      return None;
    }
    let message = inner.message.take()?;
    if message.opcode == OpCode::Close {
      if !inner.close_sent {
        let _ = inner.write_ws(WebMessage::close(message.close_code, ""));
      }
      inner.state = State::Shutdown;
    } else {
      inner.next_frame();
      if let Err(err) = inner.advance() {
        log::debug!("http connection protocol error: {err}");
        inner.protocol_error();
      }
    }
    Some(message)
  }

  /// Writes a complete response. Panics unless a request is pending and the
  /// response declares content-length or chunked encoding.
  pub fn write_response(&mut self, mut response: Response) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() {
      return; // this NOP simplifies state machines of connection users
    }
    let chunked = response.header.transfer_encoding_chunked;
    assert!(
      chunked || response.header.content_length.is_some(),
      "response needs either content-length or chunked encoding"
    );
    assert!(
      !response.header.is_websocket_upgrade(),
      "use web_socket_upgrade() to upgrade"
    );
    inner.write_header(&mut response.header);
    if chunked {
      inner.write_chunk(&response.body);
      inner.write_last_chunk();
    } else {
      inner.write_body(&response.body);
    }
  }

  /// Writes the header now; the body follows via `write_chunk` /
  /// `write_last_chunk` (long responses, streaming).
  pub fn write_response_header(&mut self, mut header: ResponseHeader) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() {
      return;
    }
    assert!(
      header.transfer_encoding_chunked || header.content_length.is_some(),
      "response needs either content-length or chunked encoding"
    );
    inner.write_header(&mut header);
  }

  /// Writes one body piece. In chunked mode an empty piece is ignored (the
  /// terminator is `write_last_chunk`); in content-length mode writing more
  /// than declared is a programmer error.
  pub fn write_chunk(&mut self, data: &[u8]) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() {
      return;
    }
    assert!(inner.state == State::ResponseBody, "no response body expected");
    if inner.remaining_content_length.is_some() {
      inner.write_body(data);
    } else {
      inner.write_chunk(data);
    }
  }

  /// Finishes a chunked body.
  pub fn write_last_chunk(&mut self) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() {
      return;
    }
    assert!(inner.state == State::ResponseBody, "no response body expected");
    assert!(
      inner.remaining_content_length.is_none(),
      "write_last_chunk is for chunked encoding only"
    );
    inner.write_last_chunk();
  }

  /// Promotes the pending request to a WebSocket connection, answering 101
  /// with the computed `Sec-WebSocket-Accept`. Panics if the request was not
  /// an upgrade request.
  pub fn web_socket_upgrade(&mut self) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() {
      return;
    }
    assert!(
      inner.state == State::ResponseHeader,
      "connection is not expecting a response"
    );
    assert!(
      inner.req_is_upgrade,
      "attempt to upgrade a non-upgradable connection"
    );
    let mut response = ResponseHeader {
      status: 101,
      connection_upgrade: true,
      upgrade_websocket: true,
      ..ResponseHeader::default()
    };
    response.sec_websocket_accept =
      ResponseHeader::generate_sec_websocket_accept(&inner.req_websocket_key);
    let bytes = response.to_string();
    inner.sock.write(bytes.as_bytes());
    inner.frame_parser = FrameHeaderParser::new();
    inner.message = None;
    inner.state = State::WebMessageHeader;
    inner.ping_timer.once(PING_INTERVAL);
    // frames the client sent right behind its upgrade request are already
    // buffered; parse them now
    if inner.advance().is_err() {
      inner.protocol_error();
    }
  }

  /// Sends a message on an upgraded connection. Control bodies are truncated
  /// to 125 bytes; sending a close initiates shutdown without waiting for
  /// the peer's close.
  pub fn write_message(&mut self, message: WebMessage) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() {
      return;
    }
    assert!(inner.is_websocket(), "connection was not upgraded");
    let _ = inner.write_ws(message);
  }
}

impl Inner {
  fn is_websocket(&self) -> bool {
    matches!(
      self.state,
      State::WebMessageHeader | State::WebMessageBody | State::WebMessageReady
    )
  }

  fn reset_closed(&mut self) {
    self.ping_timer.cancel();
    self.read_buffer.clear();
    self.message = None;
    self.close_sent = false;
    self.remaining_content_length = None;
    self.state = State::RequestHeader;
    self.peer_address = Address::default();
  }

  fn protocol_error(&mut self) {
    self.ping_timer.cancel();
    self.read_buffer.clear();
    self.sock.write_shutdown();
    self.state = State::Shutdown;
  }

  fn next_frame(&mut self) {
    self.frame_parser = FrameHeaderParser::new();
    self.state = State::WebMessageHeader;
  }

  fn fill(&mut self) -> bool {
    if self.read_buffer.is_empty() {
      self.read_buffer.read_from(&mut self.sock);
    }
    !self.read_buffer.is_empty()
  }

  fn advance(&mut self) -> Result<bool> {
    // do not process new input while output is waiting to be sent
    if self.sock.total_buffered() != 0 {
      return Ok(false);
    }
    loop {
      match self.state {
        State::RequestHeader => {
          if !self.fill() {
            return Ok(false);
          }
          self.request_parser.parse(&mut self.read_buffer)?;
          if !self.request_parser.is_good() {
            continue;
          }
          let req = &self.request_parser.req;
          self.body_parser =
            BodyParser::new(req.content_length, req.transfer_encoding_chunked)?;
          self.state = State::RequestBody;
        }
        State::RequestBody => {
          if !self.body_parser.is_good() {
            if !self.fill() {
              return Ok(false);
            }
            self.body_parser.parse(&mut self.read_buffer)?;
            if !self.body_parser.is_good() {
              continue;
            }
          }
          self.state = State::RequestReady;
          return Ok(true);
        }
        State::WebMessageHeader => {
          if !self.fill() {
            return Ok(false);
          }
          self.frame_parser.parse(&mut self.read_buffer)?;
          if !self.frame_parser.is_good() {
            continue;
          }
          self.frame_body = FrameBodyParser::new(&self.frame_parser.header());
          self.state = State::WebMessageBody;
        }
        State::WebMessageBody => {
          if !self.frame_body.is_good() {
            if !self.fill() {
              return Ok(false);
            }
            self.frame_body.parse(&mut self.read_buffer);
            if !self.frame_body.is_good() {
              continue;
            }
          }
          if let Some(ready) = self.finish_frame()? {
            return Ok(ready);
          }
        }
        _ => return Ok(false), // waiting for a write, or shut down
      }
    }
  }

  fn finish_frame(&mut self) -> Result<Option<bool>> {
    let header = self.frame_parser.header();
    let body = self.frame_body.take_body();
    match header.opcode {
      // control frames are allowed between fragments of another message
      OpCode::Ping => {
        self.write_ws(WebMessage::pong(body))?;
        self.next_frame();
        Ok(None)
      }
      OpCode::Pong => {
        self.next_frame();
        Ok(None)
      }
      OpCode::Close => {
        let mut message = WebMessage {
          opcode: OpCode::Close,
          body: Vec::new(),
          close_code: CLOSE_STATUS_NO_CODE,
        };
        if body.len() >= 2 {
          message.close_code = u16::from_be_bytes([body[0], body[1]]);
          message.body = body[2..].to_vec();
          if !is_valid_utf8(&message.body) {
            message.body.clear(); // no way to tell the user about this one
          }
        }
        self.message = Some(message);
        self.state = State::WebMessageReady;
        Ok(Some(true))
      }
      OpCode::Continuation | OpCode::Text | OpCode::Binary => {
        if self.message.is_none() {
          if header.opcode == OpCode::Continuation {
            return Err(Error::UnexpectedContinuationFrame);
          }
          self.message = Some(WebMessage {
            opcode: header.opcode,
            body,
            close_code: 0,
          });
        } else if header.opcode == OpCode::Continuation {
          self.message.as_mut().unwrap().body.extend_from_slice(&body);
        } else {
          return Err(Error::UnfinishedFragmentedMessage);
        }
        if !header.fin {
          self.next_frame();
          return Ok(None);
        }
        let message = self.message.as_ref().unwrap();
        if message.is_text() && !is_valid_utf8(&message.body) {
          self.message = None;
          self.next_frame();
          self.write_ws(WebMessage::close(CLOSE_STATUS_NOT_UTF8, ""))?;
          return Ok(Some(false));
        }
        self.state = State::WebMessageReady;
        Ok(Some(true))
      }
    }
  }

  /// Serializes and sends one frame, server-side (unmasked).
  fn write_ws(&mut self, mut message: WebMessage) -> Result<()> {
    if message.opcode == OpCode::Close {
      message.body = close_frame_body(message.close_code, &message.body);
    } else if message.opcode.is_control() {
      message.body.truncate(MAX_CONTROL_BODY);
    }
    let mut header = [0u8; MAX_FRAME_HEADER_SIZE];
    let n = write_frame_header(
      &mut header,
      true,
      message.opcode,
      message.body.len() as u64,
      None,
    );
    self.sock.buffer(&header[..n]);
    self.sock.write(&message.body);
    if message.opcode == OpCode::Close {
      self.close_sent = true;
      self.ping_timer.cancel();
      self.read_buffer.clear();
      self.sock.write_shutdown();
      self.state = State::Shutdown;
    } else {
      self.ping_timer.once(PING_INTERVAL);
    }
    Ok(())
  }

  fn write_header(&mut self, header: &mut ResponseHeader) {
    assert!(
      self.state == State::ResponseHeader,
      "connection is not expecting a response"
    );
    header.http_version_major = self.req_version.0;
    header.http_version_minor = self.req_version.1;
    header.keep_alive = self.req_keep_alive;
    self.remaining_content_length = if header.transfer_encoding_chunked {
      None
    } else {
      header.content_length
    };
    let bytes = header.to_string();
    self.sock.buffer(bytes.as_bytes());
    self.state = State::ResponseBody;
  }

  fn write_body(&mut self, data: &[u8]) {
    let remaining = self
      .remaining_content_length
      .expect("content-length accounting lost");
    assert!(
      data.len() as u64 <= remaining,
      "response body overshoots content-length"
    );
    self.remaining_content_length = Some(remaining - data.len() as u64);
    self.sock.write(data);
    if self.remaining_content_length == Some(0) {
      self.finish_response();
    }
  }

  fn write_chunk(&mut self, data: &[u8]) {
    if data.is_empty() {
      return; // an empty chunk would terminate the body
    }
    let size_line = format!("{:x}\r\n", data.len());
    self.sock.buffer(size_line.as_bytes());
    self.sock.buffer(data);
    self.sock.write(b"\r\n");
  }

  fn write_last_chunk(&mut self) {
    self.sock.write(b"0\r\n\r\n");
    self.finish_response();
  }

  fn finish_response(&mut self) {
    self.remaining_content_length = None;
    if !self.req_keep_alive {
      // we promised Connection: close in the response header
      self.read_buffer.clear();
      self.sock.write_shutdown();
      self.state = State::Shutdown;
      return;
    }
    self.request_parser = RequestParser::new();
    self.state = State::RequestHeader;
    // a pipelining peer may already have the next request buffered; parse it
    // now, the readiness edge for those bytes is long gone
    if self.advance().is_err() {
      self.protocol_error();
    }
  }
}
