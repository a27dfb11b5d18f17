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

//! Keeps a number of framed requests in transit to `fair_server` and prints
//! per-second throughput. Run several instances to watch the fair
//! scheduling.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crabnet::fair::FRAME_HEADER_SIZE;
use crabnet::{
  Address, Buffer, BufferedTcpSocket, RunLoop, TcpSocketSettings, Timer,
};

const BODY: &[u8] = b"x";

struct App {
  address: Address,
  max_requests: usize,
  socket: BufferedTcpSocket,
  socket_buffer: Buffer,
  reconnect_timer: Timer,
  stat_timer: Timer,
  requests_in_transit: usize,
  requests_received: u64,
}

impl App {
  fn new(address: Address, max_requests: usize) -> Rc<RefCell<App>> {
    let app = Rc::new_cyclic(|weak: &Weak<RefCell<App>>| {
      let sock_weak = weak.clone();
      let retry_weak = weak.clone();
      let stat_weak = weak.clone();
      RefCell::new(App {
        address,
        max_requests,
        socket: BufferedTcpSocket::new(move || Self::on_socket(&sock_weak)),
        socket_buffer: Buffer::new(65536),
        reconnect_timer: Timer::new(move || Self::connect(&retry_weak)),
        stat_timer: Timer::new(move || Self::print_stats(&stat_weak)),
        requests_in_transit: 0,
        requests_received: 0,
      })
    });
    Self::connect(&Rc::downgrade(&app));
    app.borrow_mut().stat_timer.once(Duration::from_secs(1));
    app
  }

  fn connect(weak: &Weak<RefCell<App>>) {
    let Some(app) = weak.upgrade() else { return };
    let mut app = app.borrow_mut();
    let address = app.address;
    app.requests_in_transit = 0;
    if app.socket.connect(&address, &TcpSocketSettings::default()).is_err() {
      app.reconnect_timer.once(Duration::from_secs(1));
      return;
    }
    println!("connection attempt started...");
    app.send_more_requests();
  }

  fn on_socket(weak: &Weak<RefCell<App>>) {
    let Some(rc) = weak.upgrade() else { return };
    let mut app = rc.borrow_mut();
    if !app.socket.is_open() {
      println!("server disconnected");
      app.socket_buffer.clear();
      app.reconnect_timer.once(Duration::from_secs(1));
      return;
    }
    loop {
      let app = &mut *app;
      app.socket_buffer.read_from(&mut app.socket);
      let reply_size = FRAME_HEADER_SIZE + BODY.len();
      let count = app.socket_buffer.size() / reply_size;
      if count == 0 {
        break;
      }
      app.socket_buffer.did_read(count * reply_size);
      app.requests_in_transit -= count;
      app.requests_received += count as u64;
    }
    app.send_more_requests();
  }

  fn send_more_requests(&mut self) {
    if self.requests_in_transit >= self.max_requests / 2 {
      return;
    }
    let count = self.max_requests - self.requests_in_transit;
    let mut wire = Vec::with_capacity(count * (FRAME_HEADER_SIZE + BODY.len()));
    for _ in 0..count {
      let mut header = [0u8; FRAME_HEADER_SIZE];
      header[0..4].copy_from_slice(&(BODY.len() as u32).to_le_bytes());
      wire.extend_from_slice(&header);
      wire.extend_from_slice(BODY);
    }
    self.socket.write(&wire);
    self.requests_in_transit += count;
  }

  fn print_stats(weak: &Weak<RefCell<App>>) {
    let Some(app) = weak.upgrade() else { return };
    let mut app = app.borrow_mut();
    println!(
      "responses received (during last second)={} in transit={}",
      app.requests_received, app.requests_in_transit
    );
    app.requests_received = 0;
    app.stat_timer.once(Duration::from_secs(1));
  }
}

fn main() -> anyhow::Result<()> {
  let requests: usize = std::env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(20000);
  let instances: usize = std::env::args()
    .nth(2)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(1);
  println!("keeping {requests} requests in transit, {instances} instance(s)");
  let run_loop = RunLoop::new();
  let address = Address::new("127.0.0.1", 7000).unwrap();
  let apps: Vec<_> = (0..instances).map(|_| App::new(address, requests)).collect();
  run_loop.run();
  drop(apps);
  Ok(())
}
