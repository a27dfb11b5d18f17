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

//! End-to-end tests against a live HTTP/WebSocket server on localhost,
//! driven from plain blocking sockets so only the server side uses the
//! crate.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

use crabnet::http::{Response, Server};
use crabnet::ws::OpCode;
use crabnet::{Address, RunLoop, RunLoopHandle, TcpAcceptorSettings};

struct TestServer {
  port: u16,
  handle: RunLoopHandle,
  thread: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
  fn start() -> Self {
    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
      let run_loop = RunLoop::new();
      let address = Address::parse("127.0.0.1:0").unwrap();
      let server = Server::new(&address, TcpAcceptorSettings::default()).unwrap();
      let echo = server.clone();
      server.set_request_handler(move |who, request| {
        if request.header.is_websocket_upgrade() {
          echo.web_socket_upgrade(who);
          return None;
        }
        Some(Response::text(
          200,
          format!("{} {}", request.header.method, request.header.path),
        ))
      });
      let echo = server.clone();
      server.set_message_handler(move |who, message| {
        echo.write_message(who, message);
      });
      let port = server.local_addr().unwrap().port();
      tx.send((port, run_loop.handle())).unwrap();
      run_loop.run();
    });
    let (port, handle) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    Self {
      port,
      handle,
      thread: Some(thread),
    }
  }

  fn connect(&self) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
    stream
      .set_read_timeout(Some(Duration::from_secs(5)))
      .unwrap();
    stream
  }
}

impl Drop for TestServer {
  fn drop(&mut self) {
    self.handle.cancel();
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}

/// Reads one HTTP response: header text plus a content-length body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
  let mut raw = Vec::new();
  let mut byte = [0u8; 1];
  while !raw.ends_with(b"\r\n\r\n") {
    stream.read_exact(&mut byte).unwrap();
    raw.push(byte[0]);
  }
  let header = String::from_utf8(raw).unwrap();
  let mut body = Vec::new();
  for line in header.split("\r\n") {
    if let Some(value) = line
      .to_ascii_lowercase()
      .strip_prefix("content-length:")
      .map(|v| v.trim().to_string())
    {
      let length: usize = value.parse().unwrap();
      body.resize(length, 0);
      stream.read_exact(&mut body).unwrap();
      break;
    }
  }
  (header, body)
}

#[test]
fn get_and_keep_alive() {
  let server = TestServer::start();
  let mut stream = server.connect();
  stream
    .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
    .unwrap();
  let (header, body) = read_response(&mut stream);
  assert!(header.starts_with("HTTP/1.1 200 OK\r\n"), "{header}");
  assert!(header.to_ascii_lowercase().contains("date:"));
  assert_eq!(body, b"GET /hello");

  // keep-alive: a second request on the same connection
  stream
    .write_all(b"GET /again HTTP/1.1\r\nHost: x\r\n\r\n")
    .unwrap();
  let (header, body) = read_response(&mut stream);
  assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
  assert_eq!(body, b"GET /again");
}

#[test]
fn pipelined_requests_both_answered() {
  let server = TestServer::start();
  let mut stream = server.connect();
  stream
    .write_all(
      b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n",
    )
    .unwrap();
  let (_, body) = read_response(&mut stream);
  assert_eq!(body, b"GET /first");
  let (_, body) = read_response(&mut stream);
  assert_eq!(body, b"GET /second");
}

#[test]
fn connection_close_gets_fin() {
  let server = TestServer::start();
  let mut stream = server.connect();
  stream
    .write_all(b"GET /bye HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
    .unwrap();
  let (header, body) = read_response(&mut stream);
  assert!(header.to_ascii_lowercase().contains("connection: close"));
  assert_eq!(body, b"GET /bye");
  // the server half-closes; read drains to EOF
  let mut rest = Vec::new();
  stream.read_to_end(&mut rest).unwrap();
  assert!(rest.is_empty());
}

#[test]
fn bad_request_is_dropped() {
  let server = TestServer::start();
  let mut stream = server.connect();
  stream.write_all(b"NOT A REQUEST\x01\r\n\r\n").unwrap();
  // protocol error: inbound cleared, FIN sent, no response bytes
  let mut rest = Vec::new();
  stream.read_to_end(&mut rest).unwrap();
  assert!(rest.is_empty());
}

fn read_frame(stream: &mut TcpStream) -> (bool, u8, Vec<u8>) {
  let mut head = [0u8; 2];
  stream.read_exact(&mut head).unwrap();
  let fin = head[0] & 0x80 != 0;
  let opcode = head[0] & 0x0f;
  assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");
  let len = match head[1] & 0x7f {
    126 => {
      let mut ext = [0u8; 2];
      stream.read_exact(&mut ext).unwrap();
      u16::from_be_bytes(ext) as usize
    }
    127 => {
      let mut ext = [0u8; 8];
      stream.read_exact(&mut ext).unwrap();
      u64::from_be_bytes(ext) as usize
    }
    n => n as usize,
  };
  let mut payload = vec![0u8; len];
  stream.read_exact(&mut payload).unwrap();
  (fin, opcode, payload)
}

fn write_masked_frame(stream: &mut TcpStream, opcode: u8, mask: [u8; 4], payload: &[u8]) {
  assert!(payload.len() < 126);
  let mut wire = vec![0x80 | opcode, 0x80 | payload.len() as u8];
  wire.extend_from_slice(&mask);
  wire.extend(
    payload
      .iter()
      .enumerate()
      .map(|(i, &b)| b ^ mask[i & 3]),
  );
  stream.write_all(&wire).unwrap();
}

#[test]
fn websocket_handshake_and_text_echo() {
  let server = TestServer::start();
  let mut stream = server.connect();
  stream
    .write_all(
      b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .unwrap();
  let (header, _) = read_response(&mut stream);
  assert!(header.starts_with("HTTP/1.1 101 "), "{header}");
  assert!(
    header.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
    "{header}"
  );

  // the literal scenario frame: text "ping" masked with 0x12345678
  stream
    .write_all(&[0x81, 0x84, 0x12, 0x34, 0x56, 0x78, 0x62, 0x51, 0x3a, 0x1c])
    .unwrap();
  let (fin, opcode, payload) = read_frame(&mut stream);
  assert!(fin);
  assert_eq!(opcode, OpCode::Text as u8);
  assert_eq!(payload, b"ping");
}

#[test]
fn websocket_fragments_ping_and_close() {
  let server = TestServer::start();
  let mut stream = server.connect();
  stream
    .write_all(
      b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: AAAAAAAAAAAAAAAAAAAAAA==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .unwrap();
  let (header, _) = read_response(&mut stream);
  assert!(header.starts_with("HTTP/1.1 101 "));

  let mask = [9u8, 9, 9, 9];
  // fragmented text: "hel" + continuation "lo", with a ping in between
  {
    let mut wire = vec![0x01, 0x83]; // text, no FIN, masked len 3
    wire.extend_from_slice(&mask);
    wire.extend(b"hel".iter().enumerate().map(|(i, &b)| b ^ mask[i & 3]));
    stream.write_all(&wire).unwrap();
  }
  write_masked_frame(&mut stream, 9, mask, b"pp"); // interleaved ping
  {
    let mut wire = vec![0x80, 0x82]; // continuation, FIN, masked len 2
    wire.extend_from_slice(&mask);
    wire.extend(b"lo".iter().enumerate().map(|(i, &b)| b ^ mask[i & 3]));
    stream.write_all(&wire).unwrap();
  }

  // the pong for the interleaved ping arrives first
  let (fin, opcode, payload) = read_frame(&mut stream);
  assert!(fin);
  assert_eq!(opcode, OpCode::Pong as u8);
  assert_eq!(payload, b"pp");
  // then the reassembled message, echoed as one frame
  let (fin, opcode, payload) = read_frame(&mut stream);
  assert!(fin);
  assert_eq!(opcode, OpCode::Text as u8);
  assert_eq!(payload, b"hello");

  // close handshake: 1000 + "done", mirrored back, then FIN
  let mut body = 1000u16.to_be_bytes().to_vec();
  body.extend_from_slice(b"done");
  write_masked_frame(&mut stream, 8, mask, &body);
  let (fin, opcode, payload) = read_frame(&mut stream);
  assert!(fin);
  assert_eq!(opcode, OpCode::Close as u8);
  assert_eq!(&payload[..2], &1000u16.to_be_bytes());
  let mut rest = Vec::new();
  stream.read_to_end(&mut rest).unwrap();
  assert!(rest.is_empty());
}

#[test]
fn websocket_invalid_utf8_text_gets_1007() {
  let server = TestServer::start();
  let mut stream = server.connect();
  stream
    .write_all(
      b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: AAAAAAAAAAAAAAAAAAAAAA==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .unwrap();
  let (header, _) = read_response(&mut stream);
  assert!(header.starts_with("HTTP/1.1 101 "));

  let mask = [1u8, 2, 3, 4];
  write_masked_frame(&mut stream, 1, mask, &[0xc3, 0x28]); // bad UTF-8 text
  let (_, opcode, payload) = read_frame(&mut stream);
  assert_eq!(opcode, OpCode::Close as u8);
  assert_eq!(&payload[..2], &1007u16.to_be_bytes());
}

#[test]
fn long_poll_deferred_response() {
  let (tx, rx) = mpsc::channel();
  let thread = std::thread::spawn(move || {
    let run_loop = RunLoop::new();
    let address = Address::parse("127.0.0.1:0").unwrap();
    let server = Server::new(&address, TcpAcceptorSettings::default()).unwrap();
    let deferred = server.clone();
    server.set_request_handler(move |who, _request| {
      // answer half a second later, from a timer, not from the handler
      let writer = deferred.clone();
      let timer = std::rc::Rc::new(std::cell::RefCell::new(None));
      let slot = timer.clone();
      let mut t = crabnet::Timer::new(move || {
        writer.write(who, Response::text(200, "late"));
        slot.borrow_mut().take();
      });
      t.once(Duration::from_millis(100));
      *timer.borrow_mut() = Some(t);
      None
    });
    let port = server.local_addr().unwrap().port();
    tx.send((port, run_loop.handle())).unwrap();
    run_loop.run();
  });
  let (port, handle) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
  stream
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();
  stream
    .write_all(b"GET /poll HTTP/1.1\r\nHost: x\r\n\r\n")
    .unwrap();
  let (header, body) = read_response(&mut stream);
  assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
  assert_eq!(body, b"late");
  handle.cancel();
  thread.join().unwrap();
}
