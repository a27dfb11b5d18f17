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

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// An IPv4 or IPv6 endpoint. Cheap value type, freely copied.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Address(SocketAddr);

impl Address {
  pub fn new(ip: &str, port: u16) -> Option<Self> {
    let ip = IpAddr::from_str(ip).ok()?;
    Some(Self(SocketAddr::new(ip, port)))
  }

  /// Parses `"ip:port"`. IPv6 uses the usual bracket form `[::1]:80`.
  pub fn parse(ip_port: &str) -> Option<Self> {
    SocketAddr::from_str(ip_port).ok().map(Self)
  }

  pub fn ip(&self) -> IpAddr {
    self.0.ip()
  }

  pub fn port(&self) -> u16 {
    self.0.port()
  }

  pub fn is_multicast(&self) -> bool {
    self.0.ip().is_multicast()
  }

  pub fn is_loopback(&self) -> bool {
    self.0.ip().is_loopback()
  }

  pub fn socket_addr(&self) -> SocketAddr {
    self.0
  }
}

impl From<SocketAddr> for Address {
  fn from(addr: SocketAddr) -> Self {
    Self(addr)
  }
}

impl From<SocketAddrV4> for Address {
  fn from(addr: SocketAddrV4) -> Self {
    Self(SocketAddr::V4(addr))
  }
}

impl From<SocketAddrV6> for Address {
  fn from(addr: SocketAddrV6) -> Self {
    Self(SocketAddr::V6(addr))
  }
}

impl Default for Address {
  fn default() -> Self {
    Self(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_and_predicates() {
    let a = Address::parse("127.0.0.1:8080").unwrap();
    assert_eq!(a.port(), 8080);
    assert!(a.is_loopback());
    assert!(!a.is_multicast());

    let m = Address::new("239.195.14.7", 7100).unwrap();
    assert!(m.is_multicast());

    let v6 = Address::parse("[::1]:443").unwrap();
    assert!(v6.is_loopback());
    assert_eq!(v6.to_string(), "[::1]:443");

    assert!(Address::parse("not an address").is_none());
    assert!(Address::new("300.0.0.1", 1).is_none());
  }
}
