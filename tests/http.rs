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

//! Wire-level parser scenarios, fed both whole and one byte at a time.

use crabnet::http::{BodyParser, RequestParser, ResponseParser};
use crabnet::ws::frame::MAX_FRAME_HEADER_SIZE;
use crabnet::ws::{
  unmask_offset, write_frame_header, FrameBodyParser, FrameHeaderParser, OpCode,
};

#[test]
fn simple_get_scenario() {
  let wire = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";
  let mut parser = RequestParser::new();
  let used = parser.parse_bytes(wire).unwrap();
  assert!(parser.is_good());
  assert_eq!(used, wire.len());
  assert_eq!(parser.req.method, "GET");
  assert_eq!(parser.req.path, "/hello");
  assert_eq!(parser.req.host, "x");
  assert!(parser.req.keep_alive);

  let body =
    BodyParser::new(parser.req.content_length, parser.req.transfer_encoding_chunked)
      .unwrap();
  assert!(body.is_good());
  assert!(body.body.is_empty());
}

#[test]
fn chunked_echo_scenario() {
  let wire = b"POST /e HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
  let mut parser = RequestParser::new();
  let used = parser.parse_bytes(wire).unwrap();
  assert!(parser.is_good());
  assert!(parser.req.transfer_encoding_chunked);

  let mut body =
    BodyParser::new(parser.req.content_length, parser.req.transfer_encoding_chunked)
      .unwrap();
  body.parse_bytes(&wire[used..]).unwrap();
  assert!(body.is_good());
  assert_eq!(body.take_body(), b"hello world");
}

#[test]
fn request_parsers_agree_on_any_split() {
  let wire: &[u8] = b"POST /submit?a=b HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\nX-Tag: yes\r\n\r\nhello world";
  let (whole_req, whole_body) = {
    let mut parser = RequestParser::new();
    let used = parser.parse_bytes(wire).unwrap();
    let mut body =
      BodyParser::new(parser.req.content_length, parser.req.transfer_encoding_chunked)
        .unwrap();
    body.parse_bytes(&wire[used..]).unwrap();
    assert!(body.is_good());
    (parser.req, body.take_body())
  };
  for split in 0..wire.len() {
    let mut parser = RequestParser::new();
    let mut body: Option<BodyParser> = None;
    let mut collected = Vec::new();
    for part in [&wire[..split], &wire[split..]] {
      let mut part = part;
      while !part.is_empty() {
        match &mut body {
          None => {
            let used = parser.parse_bytes(part).unwrap();
            part = &part[used..];
            if parser.is_good() {
              body = Some(
                BodyParser::new(
                  parser.req.content_length,
                  parser.req.transfer_encoding_chunked,
                )
                .unwrap(),
              );
            }
          }
          Some(body_parser) => {
            let used = body_parser.parse_bytes(part).unwrap();
            part = &part[used..];
            collected.extend_from_slice(&body_parser.take_body());
          }
        }
      }
    }
    assert!(parser.is_good(), "split {split}");
    assert_eq!(parser.req.method, whole_req.method);
    assert_eq!(parser.req.path, whole_req.path);
    assert_eq!(parser.req.query_string, whole_req.query_string);
    assert_eq!(parser.req.headers, whole_req.headers);
    assert_eq!(collected, whole_body, "split {split}");
  }
}

#[test]
fn response_with_chunked_body() {
  let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
  let mut parser = ResponseParser::new();
  let used = parser.parse_bytes(wire).unwrap();
  assert!(parser.is_good());
  assert_eq!(parser.req.status, 200);
  let mut body =
    BodyParser::new(parser.req.content_length, parser.req.transfer_encoding_chunked)
      .unwrap();
  body.parse_bytes(&wire[used..]).unwrap();
  assert!(body.is_good());
  assert_eq!(body.take_body(), b"Wikipedia");
}

#[test]
fn websocket_text_echo_wire_bytes() {
  // "ping" masked with 0x12345678, the literal scenario bytes
  let wire = [0x81, 0x84, 0x12, 0x34, 0x56, 0x78, 0x62, 0x51, 0x3a, 0x1c];
  let mut header = FrameHeaderParser::new();
  let used = header.parse_bytes(&wire).unwrap();
  assert!(header.is_good());
  let parsed = header.header();
  assert!(parsed.fin);
  assert_eq!(parsed.opcode, OpCode::Text);
  assert_eq!(parsed.payload_len, 4);
  let mut body = FrameBodyParser::new(&parsed);
  body.parse_bytes(&wire[used..]);
  assert!(body.is_good());
  assert_eq!(body.take_body(), b"ping");
}

#[test]
fn websocket_round_trip_any_mask_and_split() {
  let payloads: [&[u8]; 4] = [b"", b"x", "проверка".as_bytes(), &[0xde; 300]];
  let masks = [[0u8, 0, 0, 0], [0x12, 0x34, 0x56, 0x78], [0xff; 4]];
  for payload in payloads {
    for opcode in [OpCode::Text, OpCode::Binary] {
      if opcode == OpCode::Text && std::str::from_utf8(payload).is_err() {
        continue;
      }
      for mask in masks {
        let mut masked = payload.to_vec();
        unmask_offset(&mut masked, mask, 0);
        let mut header_bytes = [0u8; MAX_FRAME_HEADER_SIZE];
        let n = write_frame_header(
          &mut header_bytes,
          true,
          opcode,
          payload.len() as u64,
          Some(mask),
        );
        let mut wire = header_bytes[..n].to_vec();
        wire.extend_from_slice(&masked);

        // parse in three pieces at every offset near the mask boundary
        for split in 0..=payload.len().min(4) {
          let mut header = FrameHeaderParser::new();
          let used = header.parse_bytes(&wire).unwrap();
          assert!(header.is_good());
          let parsed = header.header();
          assert_eq!(parsed.masking_key, Some(mask));
          let mut body = FrameBodyParser::new(&parsed);
          let rest = &wire[used..];
          body.parse_bytes(&rest[..split]);
          body.parse_bytes(&rest[split..]);
          assert!(body.is_good());
          assert_eq!(body.take_body(), payload);
        }
      }
    }
  }
}

#[test]
fn websocket_length_boundaries() {
  for len in [125usize, 126, 127, 65535, 65536] {
    let payload = vec![0xabu8; len];
    let mut header_bytes = [0u8; MAX_FRAME_HEADER_SIZE];
    let n = write_frame_header(
      &mut header_bytes,
      true,
      OpCode::Binary,
      len as u64,
      None,
    );
    // 126 switches to the 16-bit length, 65536 to the 64-bit one
    match len {
      125 => assert_eq!(n, 2),
      126 | 127 | 65535 => assert_eq!(n, 4),
      _ => assert_eq!(n, 10),
    }
    let mut header = FrameHeaderParser::new();
    header.parse_bytes(&header_bytes[..n]).unwrap();
    assert!(header.is_good());
    assert_eq!(header.header().payload_len, len as u64);
    let mut body = FrameBodyParser::new(&header.header());
    body.parse_bytes(&payload);
    assert!(body.is_good());
    assert_eq!(body.take_body().len(), len);
  }
}
