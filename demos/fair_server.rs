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

//! Responds to batches of framed requests from `fair_client` instances in a
//! fair manner: round-robin across clients, bounded memory for everything.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crabnet::fair::{FairServer, FairServerSettings};
use crabnet::{Address, RunLoop, TcpAcceptorSettings, Timer};

fn main() -> anyhow::Result<()> {
  let port: u16 = std::env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(7000);
  let run_loop = RunLoop::new();
  let settings = FairServerSettings {
    worker_count: 2,
    acceptor: TcpAcceptorSettings {
      reuse_addr: true,
      reuse_port: true,
      ..TcpAcceptorSettings::default()
    },
    ..FairServerSettings::default()
  };
  let server = Rc::new(FairServer::new(
    &Address::new("0.0.0.0", port).unwrap(),
    settings,
    Arc::new(|request: &[u8]| request.to_vec()),
  )?);

  // once-a-second throughput print, crab-style
  let stats_server = server.clone();
  let last_sent = Cell::new(0u64);
  let stat_timer = Rc::new(RefCell::new(Timer::new(|| {})));
  let rearm = stat_timer.clone();
  stat_timer.borrow_mut().set_handler(move || {
    let stats = stats_server.stats();
    println!(
      "responses sent (during last second)={} clients={} req_mem={} resp_mem={}",
      stats.responses_sent - last_sent.get(),
      stats.connected_clients,
      stats.current_requests_memory,
      stats.current_responses_memory,
    );
    last_sent.set(stats.responses_sent);
    rearm.borrow_mut().once(Duration::from_secs(1));
  });
  stat_timer.borrow_mut().once(Duration::from_secs(1));

  println!("fair server listening on port {port}");
  run_loop.run();
  Ok(())
}
