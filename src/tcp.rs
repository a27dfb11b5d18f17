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

use std::io::{Read, Write};
use std::net::Shutdown;
use std::rc::Rc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::address::Address;
use crate::buffer::{ReadStream, WriteStream};
use crate::error::Result;
use crate::runloop::{make_handler, CallableId, LoopCore, Timer};

#[derive(Clone, Debug)]
pub struct TcpSocketSettings {
  pub tcp_nodelay: bool,
  /// 0 leaves the system default.
  pub sndbuf_size: usize,
  /// 0 leaves the system default.
  pub rcvbuf_size: usize,
}

impl Default for TcpSocketSettings {
  fn default() -> Self {
    Self {
      tcp_nodelay: true,
      sndbuf_size: 0,
      rcvbuf_size: 0,
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct TcpAcceptorSettings {
  /// Applied to the listener and to every accepted socket.
  pub socket: TcpSocketSettings,
  pub reuse_addr: bool,
  pub reuse_port: bool,
}

fn apply_socket_settings(
  sock: &SockRef<'_>,
  settings: &TcpSocketSettings,
) -> std::io::Result<()> {
  if settings.tcp_nodelay {
    sock.set_nodelay(true)?;
  }
  if settings.sndbuf_size != 0 {
    sock.set_send_buffer_size(settings.sndbuf_size)?;
  }
  if settings.rcvbuf_size != 0 {
    sock.set_recv_buffer_size(settings.rcvbuf_size)?;
  }
  Ok(())
}

/// Non-blocking TCP socket driven by the current thread's [`crate::RunLoop`].
///
/// The handler runs when reading or writing may make progress, or once after
/// the peer closed the socket; check `is_open()` first in the handler.
/// `read_some`/`write_some` returning 0 means "would block": the handler
/// fires again on the next readiness edge.
pub struct TcpSocket {
  core: Rc<LoopCore>,
  cell: CallableId,
  stream: Option<mio::net::TcpStream>,
}

impl TcpSocket {
  pub fn new(handler: impl FnMut() + 'static) -> Self {
    let core = LoopCore::current();
    let cell = core.alloc_callable(make_handler(handler));
    Self {
      core,
      cell,
      stream: None,
    }
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.core.set_handler(self.cell, make_handler(handler));
  }

  /// Connecting, connected, or closed with the close event not yet delivered.
  pub fn is_open(&self) -> bool {
    self.stream.is_some() || self.core.is_scheduled(self.cell)
  }

  /// After `close` no handler invocations happen for this socket.
  pub fn close(&mut self) {
    self.core.cancel_scheduled(self.cell);
    self.core.set_can_read(self.cell, false);
    self.core.set_can_write(self.cell, false);
    if let Some(mut stream) = self.stream.take() {
      self.core.deregister_source(&mut stream);
    }
  }

  fn close_with_event(&mut self) {
    self.close();
    self.core.schedule(self.cell);
  }

  /// Starts a non-blocking connect. `Err` means synchronous failure; on
  /// success the handler fires when the socket becomes writable (handshake
  /// complete) or readable.
  ///
  /// Buffer sizes must be set before `connect` because SO_RCVBUF feeds the
  /// window negotiation, hence settings are taken here.
  pub fn connect(&mut self, address: &Address, settings: &TcpSocketSettings) -> Result<()> {
    self.close();
    let addr = address.socket_addr();
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if settings.sndbuf_size != 0 {
      socket.set_send_buffer_size(settings.sndbuf_size)?;
    }
    if settings.rcvbuf_size != 0 {
      socket.set_recv_buffer_size(settings.rcvbuf_size)?;
    }
    socket.set_nonblocking(true)?;
    let connected = match socket.connect(&addr.into()) {
      Ok(()) => true,
      Err(err) if in_progress(&err) => false,
      Err(err) => return Err(err.into()),
    };
    if settings.tcp_nodelay {
      socket.set_nodelay(true)?;
    }
    let mut stream = mio::net::TcpStream::from_std(socket.into());
    self.core.register_source(&mut stream, self.cell)?;
    self.stream = Some(stream);
    if connected {
      // Local connects can complete immediately with no edge to follow.
      self.core.set_can_read(self.cell, true);
      self.core.set_can_write(self.cell, true);
      self.core.schedule(self.cell);
    }
    Ok(())
  }

  /// Takes the acceptor's pre-accepted socket.
  ///
  /// Panics unless `acceptor.can_accept()` returned true.
  pub fn accept(&mut self, acceptor: &mut TcpAcceptor) -> Address {
    let (mut stream, addr) = acceptor
      .accepted
      .take()
      .expect("TcpSocket::accept without can_accept()");
    self.close();
    if self.core.register_source(&mut stream, self.cell).is_err() {
      // Registration is the only step that can fail here; make it appear as
      // a socket that disconnected immediately.
      self.core.set_can_read(self.cell, true);
      self.core.schedule(self.cell);
      return addr;
    }
    self.core.set_can_read(self.cell, true);
    self.core.set_can_write(self.cell, true);
    self.stream = Some(stream);
    addr
  }

  /// Reads up to `buf.len()` bytes; 0 means the socket would block (a new
  /// edge will fire the handler) or has closed (`is_open()` tells which).
  pub fn read_some(&mut self, buf: &mut [u8]) -> usize {
    if buf.is_empty() || !self.core.can_read(self.cell) {
      return 0;
    }
    let Some(stream) = self.stream.as_mut() else {
      return 0;
    };
    loop {
      match stream.read(buf) {
        Ok(0) => {
          // peer FIN
          self.close_with_event();
          return 0;
        }
        Ok(n) => return n,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
          self.core.set_can_read(self.cell, false);
          return 0;
        }
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
        Err(_) => {
          self.close_with_event();
          return 0;
        }
      }
    }
  }

  /// Writes up to `buf.len()` bytes; 0 means the outgoing buffer is full.
  pub fn write_some(&mut self, buf: &[u8]) -> usize {
    if buf.is_empty() || !self.core.can_write(self.cell) {
      return 0;
    }
    let Some(stream) = self.stream.as_mut() else {
      return 0;
    };
    loop {
      match stream.write(buf) {
        Ok(n) if n > 0 => return n,
        Ok(_) => {
          self.core.set_can_write(self.cell, false);
          return 0;
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
          self.core.set_can_write(self.cell, false);
          return 0;
        }
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
        Err(_) => {
          self.close_with_event();
          return 0;
        }
      }
    }
  }

  /// True when `write_some` would make progress. There is no `can_read`;
  /// calling `read_some` is the check.
  pub fn can_write(&self) -> bool {
    self.stream.is_some() && self.core.can_write(self.cell)
  }

  /// Sends FIN once all written data is out. Reads keep working; the close
  /// policy for drained-but-not-closing peers lives in the buffered writer.
  pub fn write_shutdown(&mut self) {
    if let Some(stream) = &self.stream {
      let _ = stream.shutdown(Shutdown::Write);
    }
  }

  pub fn local_addr(&self) -> Option<Address> {
    Some(self.stream.as_ref()?.local_addr().ok()?.into())
  }

  pub fn peer_addr(&self) -> Option<Address> {
    Some(self.stream.as_ref()?.peer_addr().ok()?.into())
  }
}

impl Drop for TcpSocket {
  fn drop(&mut self) {
    self.close();
    self.core.free_callable(self.cell);
  }
}

impl ReadStream for TcpSocket {
  fn read_some(&mut self, buf: &mut [u8]) -> usize {
    TcpSocket::read_some(self, buf)
  }
}

impl WriteStream for TcpSocket {
  fn write_some(&mut self, buf: &[u8]) -> usize {
    TcpSocket::write_some(self, buf)
  }
}

fn in_progress(err: &std::io::Error) -> bool {
  if err.kind() == std::io::ErrorKind::WouldBlock {
    return true;
  }
  #[cfg(unix)]
  {
    err.raw_os_error() == Some(libc::EINPROGRESS)
  }
  #[cfg(not(unix))]
  {
    false
  }
}

#[cfg(unix)]
fn leaves_backlog_entry(err: &std::io::Error) -> bool {
  // Hitting these limits leaves the connection in the backlog without a new
  // readiness edge, so accept must be retried on a timer.
  matches!(
    err.raw_os_error(),
    Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
  )
}

#[cfg(not(unix))]
fn leaves_backlog_entry(_err: &std::io::Error) -> bool {
  false
}

#[cfg(unix)]
fn removes_backlog_entry(err: &std::io::Error) -> bool {
  matches!(
    err.raw_os_error(),
    Some(libc::ECONNABORTED) | Some(libc::EPERM) | Some(libc::EINTR)
  )
}

#[cfg(not(unix))]
fn removes_backlog_entry(err: &std::io::Error) -> bool {
  err.kind() == std::io::ErrorKind::ConnectionAborted
    || err.kind() == std::io::ErrorKind::Interrupted
}

/// Listening socket. One connection is pre-accepted per readiness check so
/// that [`TcpSocket::accept`] itself never fails.
pub struct TcpAcceptor {
  core: Rc<LoopCore>,
  cell: CallableId,
  listener: mio::net::TcpListener,
  accepted: Option<(mio::net::TcpStream, Address)>,
  settings: TcpAcceptorSettings,
  limit_timer: Timer,
}

impl TcpAcceptor {
  pub fn new(
    address: &Address,
    handler: impl FnMut() + 'static,
    settings: TcpAcceptorSettings,
  ) -> Result<Self> {
    let addr = address.socket_addr();
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if settings.reuse_addr {
      socket.set_reuse_address(true)?;
    }
    #[cfg(unix)]
    if settings.reuse_port {
      socket.set_reuse_port(true)?;
    }
    apply_socket_settings(&SockRef::from(&socket), &settings.socket)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    // A short backlog causes RST to clients when many rush in at once.
    socket.listen(1024)?;
    let mut listener = mio::net::TcpListener::from_std(socket.into());

    let core = LoopCore::current();
    let cell = core.alloc_callable(make_handler(handler));
    core.register_source_readable(&mut listener, cell)?;
    let retry_core = core.clone();
    let limit_timer = Timer::new(move || retry_core.schedule(cell));
    Ok(Self {
      core,
      cell,
      listener,
      accepted: None,
      settings,
      limit_timer,
    })
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.core.set_handler(self.cell, make_handler(handler));
  }

  pub fn local_addr(&self) -> Option<Address> {
    Some(self.listener.local_addr().ok()?.into())
  }

  /// Pre-accepts one connection. Very fast when there is nothing to accept.
  pub fn can_accept(&mut self) -> bool {
    if self.accepted.is_some() {
      return true;
    }
    if !self.core.can_read(self.cell) {
      return false;
    }
    loop {
      match self.listener.accept() {
        Ok((stream, addr)) => {
          if apply_socket_settings(&SockRef::from(&stream), &self.settings.socket).is_err() {
            continue; // client may already be gone, accept the next one
          }
          self.accepted = Some((stream, addr.into()));
          return true;
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
          self.core.set_can_read(self.cell, false);
          return false;
        }
        Err(err) if removes_backlog_entry(&err) => continue,
        Err(err) => {
          if leaves_backlog_entry(&err) {
            log::warn!(
              "accept() hit system limits ({err}); raise system limits or lower user-code caps, retrying in 1s"
            );
          } else {
            log::warn!("accept() returned unexpected error ({err}), retrying in 1s");
          }
          self.limit_timer.once(Duration::from_secs(1));
          return false;
        }
      }
    }
  }

}

impl Drop for TcpAcceptor {
  fn drop(&mut self) {
    self.core.cancel_scheduled(self.cell);
    self.core.deregister_source(&mut self.listener);
    self.core.free_callable(self.cell);
  }
}
