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

//! A bounded, fair request server.
//!
//! Framed binary requests from many TCP connections are admitted under
//! global memory caps, dispatched to a worker thread pool, and answered in
//! per-client FIFO order. Three intrusive queues (request memory, body
//! reading, response memory) are drained round-robin with strict
//! head-of-line FIFO, so a flood from one client cannot starve the rest.

mod queue;
mod worker;

pub use worker::FairHandler;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};

use queue::{FairQueue, QueueNode};
use worker::{OutputQueue, WorkItem, WorkSender, WorkerPool};

use crate::address::Address;
use crate::buffer::Buffer;
use crate::error::Result;
use crate::runloop::Watcher;
use crate::tcp::{TcpAcceptor, TcpAcceptorSettings, TcpSocket};

/// Wire frame: 4 bytes little-endian body length, 12 opaque bytes (zeroed on
/// responses). Shared by requests and responses.
pub const FRAME_HEADER_SIZE: usize = 16;

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Clone, Debug)]
pub struct FairServerSettings {
  /// Client slot count; further connections wait in the accept backlog.
  pub max_clients: usize,
  /// Queued requests + queued responses + in-flight per client before its
  /// header reading pauses.
  pub max_pending_requests_per_client: usize,
  /// Sum of staged and queued request bodies.
  pub max_requests_memory: usize,
  /// Sum of queued response bodies plus per-dispatch reservations. A soft
  /// cap: a response larger than its reservation overshoots transiently.
  pub max_responses_memory: usize,
  pub max_request_length: usize,
  /// Reserved per dispatched request until the actual response arrives.
  pub max_response_length: usize,
  pub worker_count: usize,
  pub acceptor: TcpAcceptorSettings,
}

impl Default for FairServerSettings {
  fn default() -> Self {
    Self {
      max_clients: 128 * 1024,
      max_pending_requests_per_client: 16,
      max_requests_memory: 256 * 1024 * 1024,
      max_responses_memory: 1024 * 1024 * 1024,
      max_request_length: 1024 * 1024,
      max_response_length: 1024 * 1024,
      worker_count: 2,
      acceptor: TcpAcceptorSettings::default(),
    }
  }
}

/// Point-in-time counters, mostly for tests and monitoring.
#[derive(Clone, Copy, Debug, Default)]
pub struct FairStats {
  pub current_requests_memory: usize,
  pub current_responses_memory: usize,
  pub requests_received: u64,
  pub responses_sent: u64,
  pub connected_clients: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ClientState {
  ReadingHeader,
  WaitingMemoryForBody,
  ReadingBody,
}

struct Client {
  /// Bumped on every slot reuse; zero while disconnected. Stale worker
  /// replies are recognized by a mismatch.
  client_id: u64,
  socket: TcpSocket,
  read_buffer: Buffer,
  state: ClientState,
  /// Parsed header length awaiting request-memory admission.
  pending_len: Option<usize>,
  request_body: Buffer,
  requests: VecDeque<Buffer>,
  responses: VecDeque<Buffer>,
  requests_in_work: usize,
  request_memory_node: QueueNode,
  read_body_node: QueueNode,
  response_memory_node: QueueNode,
  total_read: u64,
  total_written: u64,
}

impl Client {
  fn new(socket: TcpSocket) -> Self {
    Self {
      client_id: 0,
      socket,
      read_buffer: Buffer::new(READ_BUFFER_SIZE),
      state: ClientState::ReadingHeader,
      pending_len: None,
      request_body: Buffer::new(0),
      requests: VecDeque::new(),
      responses: VecDeque::new(),
      requests_in_work: 0,
      request_memory_node: QueueNode::default(),
      read_body_node: QueueNode::default(),
      response_memory_node: QueueNode::default(),
      total_read: 0,
      total_written: 0,
    }
  }
}

fn request_memory_node(c: &mut Client) -> &mut QueueNode {
  &mut c.request_memory_node
}

fn read_body_node(c: &mut Client) -> &mut QueueNode {
  &mut c.read_body_node
}

fn response_memory_node(c: &mut Client) -> &mut QueueNode {
  &mut c.response_memory_node
}

struct Net {
  settings: FairServerSettings,
  acceptor: Option<TcpAcceptor>,
  // owns the wakeup whose handle lives in `output`
  _watcher: Option<Watcher>,
  output: Option<Arc<OutputQueue>>,
  sender: Option<WorkSender>,
  clients: Vec<Client>,
  free: Vec<u32>,
  clients_accepted: u64,
  request_memory_queue: FairQueue<Client>,
  read_body_queue: FairQueue<Client>,
  response_memory_queue: FairQueue<Client>,
  requests_memory: usize,
  responses_memory: usize,
  requests_received: u64,
  responses_sent: u64,
  /// Swapped with the output queue under its mutex; keeps workers unblocked
  /// and allocation-free on the hot path.
  taken: VecDeque<WorkItem>,
  self_weak: Weak<RefCell<Net>>,
}

/// The fair server. Owns the acceptor, the client pool and the worker
/// threads; all caps are constructor parameters.
pub struct FairServer {
  net: Rc<RefCell<Net>>,
  _workers: WorkerPool,
}

impl FairServer {
  pub fn new(
    address: &Address,
    settings: FairServerSettings,
    handler: FairHandler,
  ) -> Result<Self> {
    let net = Rc::new(RefCell::new(Net {
      settings: settings.clone(),
      acceptor: None,
      _watcher: None,
      output: None,
      sender: None,
      clients: Vec::new(),
      free: Vec::new(),
      clients_accepted: 0,
      request_memory_queue: FairQueue::new(request_memory_node),
      read_body_queue: FairQueue::new(read_body_node),
      response_memory_queue: FairQueue::new(response_memory_node),
      requests_memory: 0,
      responses_memory: 0,
      requests_received: 0,
      responses_sent: 0,
      taken: VecDeque::new(),
      self_weak: Weak::new(),
    }));
    net.borrow_mut().self_weak = Rc::downgrade(&net);

    let accept_weak = Rc::downgrade(&net);
    let acceptor = TcpAcceptor::new(
      address,
      move || {
        if let Some(net) = accept_weak.upgrade() {
          net.borrow_mut().accept_all();
        }
      },
      settings.acceptor.clone(),
    )?;
    let ready_weak = Rc::downgrade(&net);
    let watcher = Watcher::new(move || {
      if let Some(net) = ready_weak.upgrade() {
        net.borrow_mut().on_worker_ready();
      }
    });
    let output = Arc::new(OutputQueue {
      responses: Mutex::new(VecDeque::new()),
      wake: watcher.handle(),
    });
    let workers = WorkerPool::new(settings.worker_count, handler);
    {
      let mut net_mut = net.borrow_mut();
      net_mut.acceptor = Some(acceptor);
      net_mut._watcher = Some(watcher);
      net_mut.output = Some(output);
      net_mut.sender = Some(workers.sender());
    }
    Ok(Self {
      net,
      _workers: workers,
    })
  }

  pub fn local_addr(&self) -> Option<Address> {
    self.net.borrow().acceptor.as_ref()?.local_addr()
  }

  pub fn stats(&self) -> FairStats {
    let net = self.net.borrow();
    FairStats {
      current_requests_memory: net.requests_memory,
      current_responses_memory: net.responses_memory,
      requests_received: net.requests_received,
      responses_sent: net.responses_sent,
      connected_clients: net
        .clients
        .iter()
        .filter(|c| c.client_id != 0)
        .count(),
    }
  }

  fn on_client_event(weak: &Weak<RefCell<Net>>, index: u32) {
    if let Some(net) = weak.upgrade() {
      net.borrow_mut().on_client_event(index);
    }
  }
}

impl Net {
  fn accept_all(&mut self) {
    while self.accept_single() {}
  }

  fn accept_single(&mut self) -> bool {
    if !self.acceptor.as_mut().unwrap().can_accept() {
      return false;
    }
    if self.free.is_empty() {
      if self.clients.len() >= self.settings.max_clients {
        return false;
      }
      // slots are allocated once and recycled; addresses of the pool entries
      // are never handed out, only indices
      let index = self.clients.len() as u32;
      let weak = self.self_weak.clone();
      let socket = TcpSocket::new(move || FairServer::on_client_event(&weak, index));
      self.clients.push(Client::new(socket));
      self.free.push(index);
    }
    let index = self.free.pop().unwrap();
    self.clients_accepted += 1;
    let acceptor = self.acceptor.as_mut().unwrap();
    let client = &mut self.clients[index as usize];
    client.client_id = self.clients_accepted;
    let addr = client.socket.accept(acceptor);
    log::debug!("fair client {} accepted from {addr}", self.clients_accepted);
    true
  }

  fn on_client_event(&mut self, index: u32) {
    if !self.clients[index as usize].socket.is_open() {
      self.disconnect(index);
      return;
    }
    self.send_responses(index);
    match self.clients[index as usize].state {
      ClientState::ReadingHeader => self.read_header(index),
      ClientState::ReadingBody => self.read_body(index),
      ClientState::WaitingMemoryForBody => {}
    }
    self.read_requests_fair();
    self.run_workers_fair();
  }

  fn over_local_limit(&self, index: u32) -> bool {
    let client = &self.clients[index as usize];
    client.responses.len() + client.requests.len() + client.requests_in_work
      >= self.settings.max_pending_requests_per_client
  }

  fn read_header(&mut self, index: u32) {
    if self.clients[index as usize].state != ClientState::ReadingHeader {
      return;
    }
    if self.over_local_limit(index) {
      return; // resumes when one of this client's responses drains
    }
    {
      let client = &mut self.clients[index as usize];
      if client.read_buffer.size() < FRAME_HEADER_SIZE {
        client.total_read += client.read_buffer.read_from(&mut client.socket) as u64;
        if client.read_buffer.size() < FRAME_HEADER_SIZE {
          return; // no complete header yet
        }
      }
    }
    let mut header = [0u8; FRAME_HEADER_SIZE];
    self.clients[index as usize].read_buffer.read(&mut header);
    let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    if len > self.settings.max_request_length {
      log::debug!("fair client sent oversized request ({len} bytes), disconnecting");
      self.disconnect(index);
      return;
    }
    self.clients[index as usize].pending_len = Some(len);
    if !self.request_memory_queue.is_empty()
      || self.requests_memory + len > self.settings.max_requests_memory
    {
      self.clients[index as usize].state = ClientState::WaitingMemoryForBody;
      self.request_memory_queue.push_back(&mut self.clients, index);
      return;
    }
    self.start_reading_body(index);
  }

  fn start_reading_body(&mut self, index: u32) {
    let len = self.clients[index as usize].pending_len.take().unwrap();
    self.requests_memory += len;
    let client = &mut self.clients[index as usize];
    client.request_body.clear_with_capacity(len);
    client.request_body.read_from(&mut client.read_buffer);
    client.state = ClientState::ReadingBody;
    self.read_body_queue.push_back(&mut self.clients, index);
  }

  fn read_body(&mut self, index: u32) {
    // a queue entry can race with a direct socket edge that already finished
    // this body; only the state says whether there is one to read
    if self.clients[index as usize].state != ClientState::ReadingBody {
      return;
    }
    {
      let client = &mut self.clients[index as usize];
      client.total_read += client.request_body.read_from(&mut client.socket) as u64;
      if !client.request_body.full() {
        return; // the socket ran dry; the next readiness edge resumes us
      }
    }
    self.requests_received += 1;
    let client = &mut self.clients[index as usize];
    let body = std::mem::replace(&mut client.request_body, Buffer::new(0));
    client.requests.push_back(body);
    client.state = ClientState::ReadingHeader;
    // every ready request goes through the response-memory queue, so
    // dispatch to the workers stays round-robin across clients
    self.response_memory_queue.push_back(&mut self.clients, index);
    self.read_header(index);
  }

  /// Admits waiting clients strictly FIFO: a head that does not fit blocks
  /// the queue, fairness over utilization.
  fn read_requests_fair(&mut self) {
    loop {
      let Some(head) = self.request_memory_queue.front() else {
        break;
      };
      let len = self.clients[head as usize].pending_len.unwrap();
      if self.requests_memory + len > self.settings.max_requests_memory {
        break;
      }
      self.request_memory_queue.unlink(&mut self.clients, head);
      self.start_reading_body(head);
    }
    while let Some(index) = self.read_body_queue.pop_front(&mut self.clients) {
      self.read_body(index);
    }
  }

  fn run_workers_fair(&mut self) {
    loop {
      let Some(head) = self.response_memory_queue.front() else {
        break;
      };
      if self.responses_memory + self.settings.max_response_length
        > self.settings.max_responses_memory
      {
        break; // head-of-line waits; skipping it would break fairness
      }
      self.response_memory_queue.unlink(&mut self.clients, head);
      self.run_worker(head);
      if !self.clients[head as usize].requests.is_empty() {
        self.response_memory_queue.push_back(&mut self.clients, head);
      }
    }
  }

  fn run_worker(&mut self, index: u32) {
    self.responses_memory += self.settings.max_response_length; // reservation
    let client = &mut self.clients[index as usize];
    let request = client.requests.pop_front().unwrap();
    client.requests_in_work += 1;
    let item = WorkItem {
      output: self.output.clone().unwrap(),
      client_index: index,
      client_id: client.client_id,
      request,
      response: Buffer::new(0),
    };
    self.sender.as_ref().unwrap().add_work(item);
  }

  fn on_worker_ready(&mut self) {
    {
      // swap containers; never allocate or park workers under their lock
      let output = self.output.clone().unwrap();
      let mut responses = output.responses.lock().unwrap();
      std::mem::swap(&mut *responses, &mut self.taken);
    }
    while let Some(item) = self.taken.pop_front() {
      self.responses_memory -= self.settings.max_response_length;
      self.requests_memory -= item.request.capacity();
      let index = item.client_index;
      if self.clients[index as usize].client_id != item.client_id {
        continue; // the client disconnected; drop the stale reply
      }
      self.responses_memory += item.response.capacity();
      self.responses_sent += 1;
      let client = &mut self.clients[index as usize];
      client.requests_in_work -= 1;
      client.responses.push_back(item.response);
      self.send_responses(index);
    }
    self.read_requests_fair();
    self.run_workers_fair();
  }

  fn send_responses(&mut self, index: u32) {
    loop {
      let finished = {
        let client = &mut self.clients[index as usize];
        let Some(front) = client.responses.front_mut() else {
          break;
        };
        client.total_written += front.write_to(&mut client.socket) as u64;
        if !front.is_empty() {
          break; // kernel buffer full, the write edge resumes us
        }
        client.responses.pop_front().unwrap()
      };
      self.responses_memory -= finished.capacity();
      self.run_workers_fair(); // response memory was just freed
      self.read_header(index); // the local limit may have cleared too
    }
  }

  fn disconnect(&mut self, index: u32) {
    let (total_read, total_written) = {
      let client = &self.clients[index as usize];
      (client.total_read, client.total_written)
    };
    {
      let client = &mut self.clients[index as usize];
      client.pending_len = None;
      self.requests_memory -= client.request_body.capacity();
      client.request_body = Buffer::new(0);
      for request in client.requests.drain(..) {
        self.requests_memory -= request.capacity();
      }
      for response in client.responses.drain(..) {
        self.responses_memory -= response.capacity();
      }
      // in-flight work is not cancelled; its replies are dropped on arrival
      // by the client_id check, which also releases their reservations
      client.requests_in_work = 0;
      client.client_id = 0;
      client.socket.close();
      client.read_buffer.clear();
      client.state = ClientState::ReadingHeader;
      client.total_read = 0;
      client.total_written = 0;
    }
    self.request_memory_queue.unlink(&mut self.clients, index);
    self.read_body_queue.unlink(&mut self.clients, index);
    self.response_memory_queue.unlink(&mut self.clients, index);
    self.free.push(index);
    log::debug!(
      "fair client slot {index} disconnected, read={total_read} written={total_written}"
    );
  }
}
