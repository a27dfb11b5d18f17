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

//! _crabnet_ is an event-loop networking toolkit: a single-threaded reactor
//! with timers and cross-thread wakeups, non-blocking TCP/UDP endpoints, an
//! incremental HTTP/1.1 + WebSocket protocol engine, and a fair-queuing,
//! bounded-resource request server on top.
//!
//! Everything runs on explicit readiness: handlers are plain callbacks, a
//! syscall that would block returns 0/None, and the next readiness edge
//! re-invokes the handler. No async runtime is involved.
//!
//! # Example
//!
//! ```no_run
//! use crabnet::http::{Response, Server};
//! use crabnet::{Address, RunLoop, TcpAcceptorSettings};
//!
//! fn main() -> crabnet::Result<()> {
//!   let run_loop = RunLoop::new();
//!   let address = Address::parse("127.0.0.1:8080").unwrap();
//!   let server = Server::new(&address, TcpAcceptorSettings::default())?;
//!   server.set_request_handler(|_who, request| {
//!     Some(Response::text(200, format!("hello from {}", request.header.path)))
//!   });
//!   run_loop.run();
//!   Ok(())
//! }
//! ```
//!
//! ## WebSocket
//!
//! A request whose header `is_websocket_upgrade()` may be promoted with
//! `Server::web_socket_upgrade` (or `Connection::web_socket_upgrade`); the
//! connection then speaks RFC 6455 version 13, with automatic ping/pong,
//! fragment reassembly, UTF-8 validation and the close handshake.
//!
//! ## Fair server
//!
//! [`fair::FairServer`] ingests length-prefixed binary requests over many
//! connections, hands them to a worker pool, and writes replies back while
//! enforcing global and per-client resource caps, round-robin.

mod address;
mod buffer;
mod buffered;
mod dns;
mod error;
mod runloop;
mod tcp;
mod udp;

pub mod fair;
pub mod http;
pub mod util;
pub mod ws;

pub use crate::address::Address;
pub use crate::buffer::{Buffer, ReadStream, WriteStream};
pub use crate::buffered::BufferedTcpSocket;
pub use crate::dns::{sync_resolve, DnsResolver};
pub use crate::error::{Error, Result};
pub use crate::runloop::{Idle, RunLoop, RunLoopHandle, Timer, Watcher, WatcherHandle};
pub use crate::tcp::{TcpAcceptor, TcpAcceptorSettings, TcpSocket, TcpSocketSettings};
pub use crate::udp::{UdpReceiver, UdpSocketSettings, UdpTransmitter, MAX_DATAGRAM_SIZE};
