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

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key(rng: &mut impl RngCore) -> String {
  let mut bytes = [0u8; 16];
  rng.fill_bytes(&mut bytes);
  STANDARD.encode(bytes)
}

/// `Sec-WebSocket-Accept` = base64(SHA-1(key || GUID)).
pub fn generate_accept(sec_websocket_key: &str) -> String {
  let mut sha1 = Sha1::new();
  sha1.update(sec_websocket_key.as_bytes());
  sha1.update(WEBSOCKET_GUID);
  STANDARD.encode(sha1.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rfc6455_accept_vector() {
    assert_eq!(
      generate_accept("dGhlIHNhbXBsZSBub25jZQ=="),
      "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
  }

  #[test]
  fn generated_keys_decode_to_16_bytes() {
    let mut rng = rand::thread_rng();
    let key = generate_key(&mut rng);
    let decoded = STANDARD.decode(key).unwrap();
    assert_eq!(decoded.len(), 16);
  }
}
