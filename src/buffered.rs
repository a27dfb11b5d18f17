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

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::address::Address;
use crate::buffer::{ReadStream, WriteStream};
use crate::error::Result;
use crate::runloop::{make_handler, Handler, Timer};
use crate::tcp::{TcpAcceptor, TcpSocket, TcpSocketSettings};

// Writes below this size are appended to the previous pending chunk instead
// of starting a new one.
const COALESCE_LIMIT: usize = 1024;

// How long to wait for the peer's FIN after ours before forcing a close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
  sock: TcpSocket,
  shutdown_timer: Timer,
  chunks: VecDeque<BytesMut>,
  total_buffered: usize,
  shutdown_asked: bool,
  rwd_handler: Handler,
}

/// A TCP socket that queues bytes which did not fit into the kernel buffer
/// and drives a graceful two-phase shutdown.
///
/// `write_shutdown` sends FIN once the queue drains, then lingers for a few
/// seconds draining and discarding inbound data (at most one buffer per
/// readiness edge, so a peer withholding its FIN cannot keep the connection
/// alive), and finally force-closes.
pub struct BufferedTcpSocket {
  inner: Rc<RefCell<Inner>>,
}

impl BufferedTcpSocket {
  pub fn new(handler: impl FnMut() + 'static) -> Self {
    let inner = Rc::new_cyclic(|weak: &Weak<RefCell<Inner>>| {
      let sock_weak = weak.clone();
      let timer_weak = weak.clone();
      RefCell::new(Inner {
        sock: TcpSocket::new(move || Self::on_sock(&sock_weak)),
        shutdown_timer: Timer::new(move || Self::on_shutdown_timer(&timer_weak)),
        chunks: VecDeque::new(),
        total_buffered: 0,
        shutdown_asked: false,
        rwd_handler: make_handler(handler),
      })
    });
    Self { inner }
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.inner.borrow_mut().rwd_handler = make_handler(handler);
  }

  fn on_sock(weak: &Weak<RefCell<Inner>>) {
    let Some(inner) = weak.upgrade() else {
      return;
    };
    let handler = {
      let mut inner = inner.borrow_mut();
      if inner.sock.is_open() {
        inner.flush();
        if inner.shutdown_asked && inner.chunks.is_empty() {
          // FIN is out; consume and discard a little of the inbound stream.
          // Not a loop: the peer could send gigabytes instead of its FIN.
          let mut sink = [0u8; 4096];
          inner.sock.read_some(&mut sink);
        }
      } else {
        inner.reset();
      }
      inner.rwd_handler.clone()
    };
    (&mut *handler.borrow_mut())();
  }

  fn on_shutdown_timer(weak: &Weak<RefCell<Inner>>) {
    let Some(inner) = weak.upgrade() else {
      return;
    };
    let handler = {
      let mut inner = inner.borrow_mut();
      inner.sock.close();
      inner.reset();
      inner.rwd_handler.clone()
    };
    (&mut *handler.borrow_mut())();
  }

  pub fn connect(&mut self, address: &Address, settings: &TcpSocketSettings) -> Result<()> {
    self.close();
    self.inner.borrow_mut().sock.connect(address, settings)
  }

  pub fn accept(&mut self, acceptor: &mut TcpAcceptor) -> Address {
    self.close();
    self.inner.borrow_mut().sock.accept(acceptor)
  }

  /// After `close` no handler invocations happen.
  pub fn close(&mut self) {
    let mut inner = self.inner.borrow_mut();
    inner.sock.close();
    inner.reset();
  }

  pub fn is_open(&self) -> bool {
    self.inner.borrow().sock.is_open()
  }

  pub fn read_some(&mut self, buf: &mut [u8]) -> usize {
    let mut inner = self.inner.borrow_mut();
    if inner.shutdown_asked {
      return 0;
    }
    inner.sock.read_some(buf)
  }

  /// Direct-to-socket write, usable only while nothing is queued.
  pub fn write_some(&mut self, buf: &[u8]) -> usize {
    let mut inner = self.inner.borrow_mut();
    if inner.shutdown_asked || !inner.chunks.is_empty() {
      return 0;
    }
    inner.sock.write_some(buf)
  }

  /// Writes what fits into the socket now and queues the rest.
  pub fn write(&mut self, data: &[u8]) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() || inner.shutdown_asked {
      return;
    }
    let mut data = data;
    if inner.chunks.is_empty() {
      let n = inner.sock.write_some(data);
      data = &data[n..];
    }
    inner.buffer(data);
    inner.flush();
  }

  /// Queues bytes without attempting a write; a later `write` or readiness
  /// edge flushes them. Lets several pieces coalesce into one syscall.
  pub fn buffer(&mut self, data: &[u8]) {
    self.inner.borrow_mut().buffer(data);
  }

  /// Flushes the queue; on drain sends FIN and starts the linger timer.
  pub fn write_shutdown(&mut self) {
    let mut inner = self.inner.borrow_mut();
    if !inner.sock.is_open() || inner.shutdown_asked {
      return;
    }
    inner.shutdown_asked = true;
    if inner.chunks.is_empty() {
      inner.sock.write_shutdown();
      inner.shutdown_timer.once(SHUTDOWN_TIMEOUT);
    }
  }

  /// True iff no bytes are queued and the socket is write-ready.
  pub fn can_write(&self) -> bool {
    let inner = self.inner.borrow();
    inner.total_buffered == 0 && inner.sock.can_write()
  }

  pub fn total_buffered(&self) -> usize {
    self.inner.borrow().total_buffered
  }

  pub fn peer_addr(&self) -> Option<Address> {
    self.inner.borrow().sock.peer_addr()
  }

  pub fn local_addr(&self) -> Option<Address> {
    self.inner.borrow().sock.local_addr()
  }
}

impl Inner {
  fn reset(&mut self) {
    self.shutdown_timer.cancel();
    self.chunks.clear();
    self.total_buffered = 0;
    self.shutdown_asked = false;
  }

  fn buffer(&mut self, data: &[u8]) {
    if !self.sock.is_open() || self.shutdown_asked || data.is_empty() {
      return;
    }
    self.total_buffered += data.len();
    match self.chunks.back_mut() {
      Some(last) if last.len() < COALESCE_LIMIT && data.len() < COALESCE_LIMIT => {
        last.extend_from_slice(data);
      }
      _ => self.chunks.push_back(BytesMut::from(data)),
    }
  }

  fn flush(&mut self) {
    let was_empty = self.chunks.is_empty();
    while let Some(front) = self.chunks.front_mut() {
      let n = self.sock.write_some(front.as_ref());
      if n == 0 {
        break;
      }
      self.total_buffered -= n;
      front.advance(n);
      if !front.is_empty() {
        break;
      }
      self.chunks.pop_front();
    }
    if self.shutdown_asked && self.chunks.is_empty() && !was_empty {
      self.sock.write_shutdown();
      self.shutdown_timer.once(SHUTDOWN_TIMEOUT);
    }
  }
}

impl ReadStream for BufferedTcpSocket {
  fn read_some(&mut self, buf: &mut [u8]) -> usize {
    BufferedTcpSocket::read_some(self, buf)
  }
}

impl WriteStream for BufferedTcpSocket {
  fn write_some(&mut self, buf: &[u8]) -> usize {
    BufferedTcpSocket::write_some(self, buf)
  }
}
