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

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use super::FRAME_HEADER_SIZE;
use crate::buffer::{Buffer, WriteStream as _};
use crate::runloop::WatcherHandle;

/// Application request handler, run on worker threads: request body in,
/// response body out.
pub type FairHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// One unit of work. Ownership travels network thread → pool queue → worker
/// → output queue → network thread. The `(client_index, client_id)` pair is
/// the back-reference; the id is validated on receipt, never the pointer.
pub(crate) struct WorkItem {
  pub output: Arc<OutputQueue>,
  pub client_index: u32,
  pub client_id: u64,
  pub request: Buffer,
  pub response: Buffer,
}

/// Per-network-loop queue the workers push finished items into, plus the
/// watcher that wakes that loop.
pub(crate) struct OutputQueue {
  pub responses: Mutex<VecDeque<WorkItem>>,
  pub wake: WatcherHandle,
}

struct Shared {
  state: Mutex<PoolState>,
  cond: Condvar,
}

#[derive(Default)]
struct PoolState {
  items: VecDeque<WorkItem>,
  quit: bool,
}

/// Hands work to the pool; held by the network side.
#[derive(Clone)]
pub(crate) struct WorkSender {
  shared: Arc<Shared>,
}

impl WorkSender {
  pub fn add_work(&self, item: WorkItem) {
    let mut state = self.shared.state.lock().unwrap();
    state.items.push_back(item);
    self.shared.cond.notify_one();
  }
}

/// Fixed-size pool of worker threads sharing one FIFO. Dropping the pool
/// asks the threads to quit and joins them.
pub(crate) struct WorkerPool {
  shared: Arc<Shared>,
  threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub fn new(count: usize, handler: FairHandler) -> Self {
    let shared = Arc::new(Shared {
      state: Mutex::new(PoolState::default()),
      cond: Condvar::new(),
    });
    let threads = (0..count.max(1))
      .map(|i| {
        let shared = shared.clone();
        let handler = handler.clone();
        std::thread::Builder::new()
          .name(format!("crabnet-worker-{i}"))
          .spawn(move || worker_fun(&shared, &handler))
          .expect("failed to start worker thread")
      })
      .collect();
    Self { shared, threads }
  }

  pub fn sender(&self) -> WorkSender {
    WorkSender {
      shared: self.shared.clone(),
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    {
      let mut state = self.shared.state.lock().unwrap();
      state.quit = true;
      self.shared.cond.notify_all();
    }
    for thread in self.threads.drain(..) {
      let _ = thread.join();
    }
  }
}

fn worker_fun(shared: &Shared, handler: &FairHandler) {
  loop {
    let mut item = {
      let mut state = shared.state.lock().unwrap();
      loop {
        if state.quit {
          return;
        }
        if let Some(item) = state.items.pop_front() {
          break item;
        }
        state = shared.cond.wait(state).unwrap();
      }
    };
    let body = handler(item.request.read_slice());
    // response frame: length, then zeroed padding; never leak stale memory
    item.response.clear_with_capacity(FRAME_HEADER_SIZE + body.len());
    item.response.write_some(&(body.len() as u32).to_le_bytes());
    item.response.write_some(&[0u8; FRAME_HEADER_SIZE - 4]);
    item.response.write_some(&body);
    let output = item.output.clone();
    output.responses.lock().unwrap().push_back(item);
    output.wake.call();
  }
}
