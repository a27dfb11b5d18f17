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

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{BodyParser, Request, RequestHeader, Response, ResponseParser};
use crate::address::Address;
use crate::buffer::Buffer;
use crate::buffered::BufferedTcpSocket;
use crate::dns::DnsResolver;
use crate::error::{Error, Result};
use crate::runloop::{make_handler, Handler};
use crate::tcp::TcpSocketSettings;
use crate::util::is_valid_utf8;
use crate::ws::frame::MAX_FRAME_HEADER_SIZE;
use crate::ws::handshake;
use crate::ws::{
  close_frame_body, unmask, write_frame_header, FrameBodyParser, FrameHeaderParser,
  OpCode, WebMessage, CLOSE_STATUS_NOT_UTF8, CLOSE_STATUS_NO_CODE,
  CLOSE_STATUS_PROTOCOL_ERROR, MAX_CONTROL_BODY,
};

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
  ResolvingHost,
  WaitingWriteRequest,
  ResponseHeader,
  ResponseBody,
  ResponseReady,
  WebUpgradeResponseHeader,
  WebMessageHeader,
  WebMessageBody,
  WebMessageReady,
  Shutdown,
}

struct Inner {
  read_buffer: Buffer,
  response_parser: ResponseParser,
  body_parser: BodyParser,
  frame_parser: FrameHeaderParser,
  frame_body: FrameBodyParser,
  message: Option<WebMessage>,
  sock: BufferedTcpSocket,
  dns: DnsResolver,
  waiting_request: Option<Request>,
  sec_websocket_key: String,
  // per-connection, reseeded from system entropy; masks need not be
  // cryptographic, only unpredictable to intermediaries
  masking_rng: SmallRng,
  host: String,
  state: State,
  close_sent: bool,
  peer_address: Address,
  r_handler: Handler,
  d_handler: Handler,
}

/// Client side of one HTTP/1.1 connection, with DNS resolution and the
/// WebSocket upgrade handshake.
///
/// `connect` starts resolution; a request written while resolving is queued
/// and sent once the TCP connect completes. The read handler fires whenever
/// `read_next_response` / `read_next_message` may return something new.
pub struct ClientConnection {
  inner: Rc<RefCell<Inner>>,
}

impl ClientConnection {
  pub fn new(r_handler: impl FnMut() + 'static, d_handler: impl FnMut() + 'static) -> Self {
    let inner = Rc::new_cyclic(|weak: &Weak<RefCell<Inner>>| {
      let sock_weak = weak.clone();
      let dns_weak = weak.clone();
      RefCell::new(Inner {
        read_buffer: Buffer::new(READ_BUFFER_SIZE),
        response_parser: ResponseParser::new(),
        body_parser: BodyParser::default(),
        frame_parser: FrameHeaderParser::new(),
        frame_body: FrameBodyParser::default(),
        message: None,
        sock: BufferedTcpSocket::new(move || Self::on_sock(&sock_weak)),
        dns: DnsResolver::new(move |names| Self::on_resolved(&dns_weak, names)),
        waiting_request: None,
        sec_websocket_key: String::new(),
        masking_rng: SmallRng::from_entropy(),
        host: String::new(),
        state: State::ResolvingHost,
        close_sent: false,
        peer_address: Address::default(),
        r_handler: make_handler(r_handler),
        d_handler: make_handler(d_handler),
      })
    });
    Self { inner }
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
      } else {
        match inner.advance() {
          Ok(true) => inner.r_handler.clone(),
          Ok(false) => return,
          Err(err) => {
            log::debug!("http client protocol error: {err}");
            if inner.is_websocket() && err.is_protocol() {
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

  fn on_resolved(weak: &Weak<RefCell<Inner>>, names: Vec<Address>) {
    let Some(inner) = weak.upgrade() else {
      return;
    };
    let handler = {
      let mut inner = inner.borrow_mut();
      if names.is_empty() {
        inner.reset_closed();
        inner.d_handler.clone()
      } else {
        // a random pick keeps a single down host from starving the client
        let pick = inner.masking_rng.gen_range(0..names.len());
        let address = names[pick];
        match inner.sock.connect(&address, &TcpSocketSettings::default()) {
          Ok(()) => {
            inner.peer_address = address;
            inner.state = State::WaitingWriteRequest;
            if let Some(request) = inner.waiting_request.take() {
              if let Err(err) = inner.write_request(request) {
                log::debug!("queued request write failed: {err}");
                inner.protocol_error();
              }
            }
            return;
          }
          Err(_) => {
            inner.reset_closed();
            inner.d_handler.clone()
          }
        }
      }
    };
    (&mut *handler.borrow_mut())();
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

  /// Starts resolving and connecting. Only the plain `http` scheme is
  /// supported; TLS is an external concern.
  pub fn connect(&mut self, host: &str, port: u16, scheme: &str) -> Result<()> {
    self.close();
    if scheme != "http" {
      return Err(Error::ConnectFailed);
    }
    let mut inner = self.inner.borrow_mut();
    inner.host = host.to_string();
    inner.state = State::ResolvingHost;
    inner.dns.resolve(host, port);
    Ok(())
  }

  /// Connects to an already-resolved address, skipping DNS.
  pub fn connect_to(&mut self, address: &Address) -> Result<()> {
    self.close();
    let mut inner = self.inner.borrow_mut();
    inner.sock.connect(address, &TcpSocketSettings::default())?;
    inner.host = address.ip().to_string();
    inner.peer_address = *address;
    inner.state = State::WaitingWriteRequest;
    Ok(())
  }

  /// After `close` no handler invocations happen.
  pub fn close(&mut self) {
    let mut inner = self.inner.borrow_mut();
    inner.dns.cancel();
    inner.sock.close();
    inner.reset_closed();
  }

  pub fn is_open(&self) -> bool {
    let inner = self.inner.borrow();
    inner.sock.is_open() || inner.dns.is_resolving()
  }

  pub fn peer_addr(&self) -> Address {
    self.inner.borrow().peer_address
  }

  /// Sends a request, or queues it while the host is still resolving.
  pub fn write_request(&mut self, request: Request) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() && !inner.dns.is_resolving() {
      return; // this NOP simplifies state machines of connection users
    }
    if inner.state == State::ResolvingHost {
      assert!(
        inner.waiting_request.is_none(),
        "a request is already queued for this connection"
      );
      inner.waiting_request = Some(request);
      return;
    }
    if let Err(err) = inner.write_request(request) {
      log::debug!("request write failed: {err}");
      inner.protocol_error();
    }
  }

  /// Starts a WebSocket upgrade: GET with a fresh random
  /// `Sec-WebSocket-Key`; the 101 response is verified against it.
  pub fn web_socket_upgrade(&mut self, header: RequestHeader) {
    let key = {
      let mut inner = self.inner.borrow_mut();
      handshake::generate_key(&mut inner.masking_rng)
    };
    let mut header = header;
    header.http_version_major = 1;
    header.http_version_minor = 1;
    header.method = "GET".into();
    header.connection_upgrade = true;
    header.upgrade_websocket = true;
    header.sec_websocket_version = "13".into();
    header.sec_websocket_key = key;
    self.write_request(Request {
      header,
      body: Vec::new(),
    });
  }

  pub fn read_next_response(&mut self) -> Option<Response> {
    let mut inner = self.inner.borrow_mut();
    if inner.state != State::ResponseReady {
      return None;
    }
    let header = std::mem::take(&mut inner.response_parser.req);
    let body = inner.body_parser.take_body();
    inner.state = State::WaitingWriteRequest;
    Some(Response { header, body })
  }

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
        log::debug!("http client protocol error: {err}");
        inner.protocol_error();
      }
    }
    Some(message)
  }

  /// Sends a message on an upgraded connection, masked with a fresh random
  /// key per frame.
  pub fn write_message(&mut self, message: WebMessage) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() {
      return;
    }
    assert!(
      matches!(
        inner.state,
        State::WebMessageHeader
          | State::WebMessageBody
          | State::WebMessageReady
          | State::WebUpgradeResponseHeader
      ),
      "connection was not upgraded"
    );
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
    self.read_buffer.clear();
    self.waiting_request = None;
    self.message = None;
    self.close_sent = false;
    self.sec_websocket_key.clear();
    self.host.clear();
    self.peer_address = Address::default();
    self.state = State::ResolvingHost;
  }

  fn protocol_error(&mut self) {
    self.read_buffer.clear();
    self.sock.write_shutdown();
    self.state = State::Shutdown;
  }

  fn next_frame(&mut self) {
    self.frame_parser = FrameHeaderParser::new();
    self.state = State::WebMessageHeader;
  }

  fn write_request(&mut self, mut request: Request) -> Result<()> {
    assert!(
      self.state == State::WaitingWriteRequest,
      "connection is not ready for a request"
    );
    assert!(
      !request.header.method.is_empty() && !request.header.path.is_empty(),
      "request needs a method and a path"
    );
    assert!(
      !request.header.transfer_encoding_chunked,
      "the whole body is sent at once, chunked makes no sense here"
    );
    if request.header.host.is_empty() {
      request.header.host = self.host.clone();
    }
    let header_bytes = request.header.to_string();
    self.sock.buffer(header_bytes.as_bytes());
    self.sock.write(&request.body);
    self.response_parser = ResponseParser::new();
    if request.header.is_websocket_upgrade() {
      self.sec_websocket_key = request.header.sec_websocket_key.clone();
      self.state = State::WebUpgradeResponseHeader;
    } else {
      self.state = State::ResponseHeader;
    }
    Ok(())
  }

  fn fill(&mut self) -> bool {
    if self.read_buffer.is_empty() {
      self.read_buffer.read_from(&mut self.sock);
    }
    !self.read_buffer.is_empty()
  }

  fn advance(&mut self) -> Result<bool> {
    if self.sock.total_buffered() != 0 {
      return Ok(false);
    }
    loop {
      match self.state {
        State::ResponseHeader => {
          if !self.fill() {
            return Ok(false);
          }
          self.response_parser.parse(&mut self.read_buffer)?;
          if !self.response_parser.is_good() {
            continue;
          }
          let resp = &self.response_parser.req;
          if resp.is_websocket_upgrade() {
            return Err(Error::UnexpectedUpgrade);
          }
          self.body_parser =
            BodyParser::new(resp.content_length, resp.transfer_encoding_chunked)?;
          self.state = State::ResponseBody;
        }
        State::ResponseBody => {
          if !self.body_parser.is_good() {
            if !self.fill() {
              return Ok(false);
            }
            self.body_parser.parse(&mut self.read_buffer)?;
            if !self.body_parser.is_good() {
              continue;
            }
          }
          self.state = State::ResponseReady;
          return Ok(true);
        }
        State::WebUpgradeResponseHeader => {
          if !self.fill() {
            return Ok(false);
          }
          self.response_parser.parse(&mut self.read_buffer)?;
          if !self.response_parser.is_good() {
            continue;
          }
          let resp = &self.response_parser.req;
          if !resp.is_websocket_upgrade() {
            return Err(Error::InvalidUpgradeAccept);
          }
          if resp.content_length.is_some() || resp.transfer_encoding_chunked {
            return Err(Error::InvalidUpgradeAccept);
          }
          if resp.sec_websocket_accept
            != handshake::generate_accept(&self.sec_websocket_key)
          {
            return Err(Error::InvalidUpgradeAccept);
          }
          self.frame_parser = FrameHeaderParser::new();
          self.message = None;
          self.state = State::WebMessageHeader;
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
        _ => return Ok(false),
      }
    }
  }

  fn finish_frame(&mut self) -> Result<Option<bool>> {
    let header = self.frame_parser.header();
    let body = self.frame_body.take_body();
    match header.opcode {
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
            message.body.clear();
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

  /// Serializes and sends one frame, client-side (masked).
  fn write_ws(&mut self, mut message: WebMessage) -> Result<()> {
    if message.opcode == OpCode::Close {
      message.body = close_frame_body(message.close_code, &message.body);
    } else if message.opcode.is_control() {
      message.body.truncate(MAX_CONTROL_BODY);
    }
    let masking_key: [u8; 4] = self.masking_rng.gen::<u32>().to_be_bytes();
    unmask(&mut message.body, masking_key);
    let mut header = [0u8; MAX_FRAME_HEADER_SIZE];
    let n = write_frame_header(
      &mut header,
      true,
      message.opcode,
      message.body.len() as u64,
      Some(masking_key),
    );
    self.sock.buffer(&header[..n]);
    self.sock.write(&message.body);
    if message.opcode == OpCode::Close {
      // we will not wait for the peer's close; client logic must not depend
      // on it
      self.close_sent = true;
      self.read_buffer.clear();
      self.sock.write_shutdown();
      self.state = State::Shutdown;
    }
    Ok(())
  }
}
