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

//! WebSocket echo server; serves a trivial page that connects back to it.

use crabnet::http::{Response, Server};
use crabnet::{Address, RunLoop, TcpAcceptorSettings};

const PAGE: &str = r#"<html><body><script>
let ws = new WebSocket("ws://" + location.host + "/ws");
ws.onmessage = (ev) => document.body.append(ev.data + " ");
ws.onopen = () => ws.send("hello crab");
</script></body></html>"#;

fn main() -> anyhow::Result<()> {
  let port: u16 = std::env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(8080);
  let run_loop = RunLoop::new();
  let settings = TcpAcceptorSettings {
    reuse_addr: true,
    ..TcpAcceptorSettings::default()
  };
  let server = Server::new(&Address::new("0.0.0.0", port).unwrap(), settings)?;
  let upgrader = server.clone();
  server.set_request_handler(move |who, request| {
    if request.header.is_websocket_upgrade() {
      upgrader.web_socket_upgrade(who);
      return None;
    }
    Some(Response::simple(200, "text/html; charset=utf-8", PAGE.into()))
  });
  let echo = server.clone();
  server.set_message_handler(move |who, message| {
    echo.write_message(who, message);
  });
  server.set_disconnect_handler(|who| {
    println!("client {who:?} disconnected");
  });
  println!("open http://127.0.0.1:{port}/ in a browser");
  run_loop.run();
  Ok(())
}
