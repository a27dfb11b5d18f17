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

use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::str::FromStr;

use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockRef, Socket, Type};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::runloop::{make_handler, CallableId, LoopCore};

// https://stackoverflow.com/questions/42609561/udp-maximum-packet-size
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Clone, Debug, Default)]
pub struct UdpSocketSettings {
  /// Network interface name or IPv4 address of the interface; empty selects
  /// the default adapter.
  ///
  /// On Linux and macOS, INADDR_ANY for multicast means "default adapter",
  /// not "all adapters"; receiving on several adapters takes one socket per
  /// adapter.
  pub adapter: String,
  /// 0 leaves the system default.
  pub sndbuf_size: usize,
  /// 0 leaves the system default.
  pub rcvbuf_size: usize,
}

fn adapter_interface(adapter: &str) -> Result<InterfaceIndexOrAddress> {
  if adapter.is_empty() {
    return Ok(InterfaceIndexOrAddress::Address(Ipv4Addr::UNSPECIFIED));
  }
  #[cfg(unix)]
  {
    if let Ok(name) = std::ffi::CString::new(adapter) {
      let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
      if index != 0 {
        return Ok(InterfaceIndexOrAddress::Index(index));
      }
    }
  }
  match Ipv4Addr::from_str(adapter) {
    Ok(addr) => Ok(InterfaceIndexOrAddress::Address(addr)),
    Err(_) => Err(Error::Io(std::io::Error::new(
      std::io::ErrorKind::InvalidInput,
      "multicast adapter must be an interface name or an interface IPv4 address",
    ))),
  }
}

#[cfg(target_os = "linux")]
fn set_multicast_if(socket: &Socket, interface: &InterfaceIndexOrAddress) -> Result<()> {
  use std::os::fd::AsRawFd;
  let mreqn = match interface {
    InterfaceIndexOrAddress::Index(index) => libc::ip_mreqn {
      imr_multiaddr: libc::in_addr { s_addr: 0 },
      imr_address: libc::in_addr { s_addr: 0 },
      imr_ifindex: *index as libc::c_int,
    },
    InterfaceIndexOrAddress::Address(addr) => libc::ip_mreqn {
      imr_multiaddr: libc::in_addr { s_addr: 0 },
      imr_address: libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
      },
      imr_ifindex: 0,
    },
  };
  let ret = unsafe {
    libc::setsockopt(
      socket.as_raw_fd(),
      libc::IPPROTO_IP,
      libc::IP_MULTICAST_IF,
      &mreqn as *const libc::ip_mreqn as *const libc::c_void,
      std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
    )
  };
  if ret < 0 {
    return Err(std::io::Error::last_os_error().into());
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_multicast_if(socket: &Socket, interface: &InterfaceIndexOrAddress) -> Result<()> {
  match interface {
    InterfaceIndexOrAddress::Address(addr) => {
      socket.set_multicast_if_v4(addr)?;
      Ok(())
    }
    InterfaceIndexOrAddress::Index(_) => Err(Error::Io(std::io::Error::new(
      std::io::ErrorKind::Unsupported,
      "selecting the outgoing adapter by name needs ip_mreqn",
    ))),
  }
}

fn would_block(err: &std::io::Error) -> bool {
  err.kind() == std::io::ErrorKind::WouldBlock
}

/// Outgoing-datagram endpoint connected to a single peer (or multicast
/// group); good for clients talking to one server.
pub struct UdpTransmitter {
  core: Rc<LoopCore>,
  cell: CallableId,
  socket: mio::net::UdpSocket,
}

impl UdpTransmitter {
  /// If `address` is a multicast group, datagrams go out on the specified or
  /// default adapter.
  pub fn new(address: &Address, handler: impl FnMut() + 'static, adapter: &str) -> Result<Self> {
    let addr = address.socket_addr();
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if address.is_multicast() {
      socket.set_broadcast(true)?;
      // Unlike unicast, the outgoing adapter is not picked by the routing
      // table; it must be selected explicitly.
      set_multicast_if(&socket, &adapter_interface(adapter)?)?;
    }
    socket.connect(&addr.into())?;
    let mut socket = mio::net::UdpSocket::from_std(socket.into());
    let core = LoopCore::current();
    let cell = core.alloc_callable(make_handler(handler));
    core.register_source(&mut socket, cell)?;
    // Datagram sockets are writable right away; no edge precedes first use.
    core.set_can_read(cell, true);
    core.set_can_write(cell, true);
    core.schedule(cell);
    Ok(Self { core, cell, socket })
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.core.set_handler(self.cell, make_handler(handler));
  }

  pub fn can_write(&self) -> bool {
    self.core.can_write(self.cell)
  }

  /// Returns false when the outgoing buffer is full. Datagrams of zero size
  /// are valid, hence no byte count.
  pub fn write_datagram(&mut self, data: &[u8]) -> bool {
    if !self.core.can_write(self.cell) {
      return false;
    }
    match self.socket.send(data) {
      Ok(_) => true,
      Err(err) if would_block(&err) => {
        self.core.set_can_write(self.cell, false);
        false
      }
      // ICMP-reported errors (nobody listening, path MTU) land here; they
      // tend to clear on their own and are not surfaced.
      Err(_) => true,
    }
  }

  /// Reads a reply. `None` means the incoming buffer is empty. Truncation is
  /// not an error: the result then equals `data.len()` and a sane protocol
  /// detects it at its own level.
  pub fn read_datagram(&mut self, data: &mut [u8]) -> Option<usize> {
    if !self.core.can_read(self.cell) {
      return None;
    }
    match self.socket.recv(data) {
      Ok(n) => Some(n),
      Err(err) if would_block(&err) => {
        self.core.set_can_read(self.cell, false);
        None
      }
      Err(_) => None,
    }
  }

  pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
    SockRef::from(&self.socket).set_multicast_ttl_v4(ttl)?;
    Ok(())
  }
}

impl Drop for UdpTransmitter {
  fn drop(&mut self) {
    self.core.cancel_scheduled(self.cell);
    self.core.deregister_source(&mut self.socket);
    self.core.free_callable(self.cell);
  }
}

/// Incoming-datagram endpoint. `address` must be a local adapter address
/// (e.g. 0.0.0.0) or a multicast group to join.
pub struct UdpReceiver {
  core: Rc<LoopCore>,
  cell: CallableId,
  socket: mio::net::UdpSocket,
}

impl UdpReceiver {
  pub fn new(
    address: &Address,
    handler: impl FnMut() + 'static,
    settings: &UdpSocketSettings,
  ) -> Result<Self> {
    let addr = address.socket_addr();
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if settings.sndbuf_size != 0 {
      socket.set_send_buffer_size(settings.sndbuf_size)?;
    }
    if settings.rcvbuf_size != 0 {
      socket.set_recv_buffer_size(settings.rcvbuf_size)?;
    }
    if address.is_multicast() {
      socket.set_reuse_address(true)?;
      #[cfg(unix)]
      socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    if address.is_multicast() {
      let group = match address.ip() {
        IpAddr::V4(group) => group,
        IpAddr::V6(_) => {
          return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "IPv6 multicast not supported yet",
          )))
        }
      };
      socket.join_multicast_v4_n(&group, &adapter_interface(&settings.adapter)?)?;
    }
    let mut socket = mio::net::UdpSocket::from_std(socket.into());
    let core = LoopCore::current();
    let cell = core.alloc_callable(make_handler(handler));
    core.register_source(&mut socket, cell)?;
    core.set_can_write(cell, true);
    Ok(Self { core, cell, socket })
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.core.set_handler(self.cell, make_handler(handler));
  }

  /// `None` when the incoming buffer is empty; otherwise the datagram size
  /// (possibly truncated to `data.len()`) and the sender. Expect garbage
  /// from any host, as usual with UDP.
  pub fn read_datagram(&mut self, data: &mut [u8]) -> Option<(usize, Address)> {
    if !self.core.can_read(self.cell) {
      return None;
    }
    match self.socket.recv_from(data) {
      Ok((n, peer)) => Some((n, peer.into())),
      Err(err) if would_block(&err) => {
        self.core.set_can_read(self.cell, false);
        None
      }
      Err(_) => None,
    }
  }

  pub fn local_addr(&self) -> Option<Address> {
    Some(self.socket.local_addr().ok()?.into())
  }

  pub fn can_write(&self) -> bool {
    self.core.can_write(self.cell)
  }

  /// Sends a reply; false when the outgoing buffer is full.
  pub fn write_datagram(&mut self, data: &[u8], peer: &Address) -> bool {
    if !self.core.can_write(self.cell) {
      return false;
    }
    match self.socket.send_to(data, peer.socket_addr()) {
      Ok(_) => true,
      Err(err) if would_block(&err) => {
        self.core.set_can_write(self.cell, false);
        false
      }
      Err(_) => true,
    }
  }
}

impl Drop for UdpReceiver {
  fn drop(&mut self) {
    self.core.cancel_scheduled(self.cell);
    self.core.deregister_source(&mut self.socket);
    self.core.free_callable(self.cell);
  }
}
