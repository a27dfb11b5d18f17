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

//! Worker-thread name resolution.
//!
//! A single process-wide thread services lookups FIFO and posts results back
//! to the requesting loop through a [`Watcher`]. No caching.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::ToSocketAddrs;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::address::Address;
use crate::runloop::{Watcher, WatcherHandle};

struct DnsJob {
  host: String,
  port: u16,
  result: Arc<Mutex<Option<Vec<Address>>>>,
  wake: WatcherHandle,
}

#[derive(Default)]
struct DnsQueue {
  jobs: VecDeque<DnsJob>,
}

struct DnsWorker {
  queue: Mutex<DnsQueue>,
  cond: Condvar,
}

static WORKER: OnceLock<Arc<DnsWorker>> = OnceLock::new();

fn worker() -> &'static Arc<DnsWorker> {
  WORKER.get_or_init(|| {
    let worker = Arc::new(DnsWorker {
      queue: Mutex::new(DnsQueue::default()),
      cond: Condvar::new(),
    });
    let thread_worker = worker.clone();
    std::thread::Builder::new()
      .name("crabnet-dns".into())
      .spawn(move || loop {
        let job = {
          let mut queue = thread_worker.queue.lock().unwrap();
          loop {
            if let Some(job) = queue.jobs.pop_front() {
              break job;
            }
            queue = thread_worker.cond.wait(queue).unwrap();
          }
        };
        let names = sync_resolve(&job.host, job.port);
        *job.result.lock().unwrap() = Some(names);
        job.wake.call();
      })
      .expect("failed to start DNS worker thread");
    worker
  })
}

/// Resolves synchronously on the calling thread.
pub fn sync_resolve(host: &str, port: u16) -> Vec<Address> {
  match (host, port).to_socket_addrs() {
    Ok(addrs) => addrs.map(Address::from).collect(),
    Err(_) => Vec::new(),
  }
}

struct ResolverInner {
  watcher: Option<Watcher>,
  result: Arc<Mutex<Option<Vec<Address>>>>,
  resolving: bool,
}

type DnsHandler = Rc<RefCell<Box<dyn FnMut(Vec<Address>)>>>;

/// Asynchronous resolver bound to the current loop. `resolve` calls the
/// handler exactly once with the address list (empty on failure) unless
/// cancelled first.
pub struct DnsResolver {
  inner: Rc<RefCell<ResolverInner>>,
  handler: DnsHandler,
}

impl DnsResolver {
  pub fn new(handler: impl FnMut(Vec<Address>) + 'static) -> Self {
    let inner = Rc::new(RefCell::new(ResolverInner {
      watcher: None,
      result: Arc::new(Mutex::new(None)),
      resolving: false,
    }));
    let handler: DnsHandler = Rc::new(RefCell::new(Box::new(handler)));
    let weak = Rc::downgrade(&inner);
    let cb_handler = handler.clone();
    inner.borrow_mut().watcher = Some(Watcher::new(move || {
      Self::on_ready(&weak, &cb_handler);
    }));
    Self { inner, handler }
  }

  fn on_ready(weak: &Weak<RefCell<ResolverInner>>, handler: &DnsHandler) {
    let Some(inner) = weak.upgrade() else {
      return;
    };
    let names = {
      let mut inner = inner.borrow_mut();
      if !inner.resolving {
        return; // cancelled between completion and delivery
      }
      let Some(names) = inner.result.lock().unwrap().take() else {
        return;
      };
      inner.resolving = false;
      names
    };
    (&mut *handler.borrow_mut())(names)
  }

  pub fn is_resolving(&self) -> bool {
    self.inner.borrow().resolving
  }

  pub fn resolve(&mut self, host: &str, port: u16) {
    self.cancel();
    let mut inner = self.inner.borrow_mut();
    inner.resolving = true;
    let wake = inner.watcher.as_ref().unwrap().handle();
    let worker = worker();
    worker.queue.lock().unwrap().jobs.push_back(DnsJob {
      host: host.to_string(),
      port,
      result: inner.result.clone(),
      wake,
    });
    worker.cond.notify_one();
  }

  /// After `cancel` no handler call happens until the next `resolve`.
  pub fn cancel(&mut self) {
    let mut inner = self.inner.borrow_mut();
    if !inner.resolving {
      return;
    }
    inner.resolving = false;
    // A fresh result slot makes any in-flight worker answer land in a slot
    // nobody reads.
    inner.result = Arc::new(Mutex::new(None));
    inner.watcher.as_mut().unwrap().cancel();
  }

  pub fn set_handler(&mut self, handler: impl FnMut(Vec<Address>) + 'static) {
    *self.handler.borrow_mut() = Box::new(handler);
  }
}
