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

//! Minimal HTTP server; try `curl http://127.0.0.1:8080/hello`.

use crabnet::http::{Response, Server};
use crabnet::{Address, RunLoop, TcpAcceptorSettings};

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
  server.set_request_handler(|_who, request| {
    Some(Response::html(
      200,
      format!("Hello, crab. Path was {}", request.header.path),
    ))
  });
  println!("listening on http://127.0.0.1:{port}/");
  run_loop.run();
  Ok(())
}
