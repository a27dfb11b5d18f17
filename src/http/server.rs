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
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{Connection, Request, Response};
use crate::address::Address;
use crate::error::Result;
use crate::tcp::{TcpAcceptor, TcpAcceptorSettings};
use crate::ws::{OpCode, WebMessage};

/// Identifies a connected client across the server callbacks. Slots are
/// recycled; the embedded generation makes stale ids harmless.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClientId {
  index: usize,
  generation: u64,
}

type RequestHandler = Rc<RefCell<Box<dyn FnMut(ClientId, Request) -> Option<Response>>>>;
type MessageHandler = Rc<RefCell<Box<dyn FnMut(ClientId, WebMessage)>>>;
type DisconnectHandler = Rc<RefCell<Box<dyn FnMut(ClientId)>>>;

struct Slot {
  connection: Connection,
  generation: u64,
}

struct Inner {
  acceptor: Option<TcpAcceptor>,
  slots: Vec<Option<Slot>>,
  free: Vec<usize>,
  next_generation: u64,
  r_handler: Option<RequestHandler>,
  w_handler: Option<MessageHandler>,
  d_handler: Option<DisconnectHandler>,
  cached_date: String,
  cached_date_at: Option<Instant>,
}

/// An HTTP/WebSocket server on the current thread's loop.
///
/// The request handler returns `Some(response)` to answer immediately, or
/// `None` to defer (long poll); a deferred response is delivered later with
/// [`Server::write`]. The disconnect handler is where remembered
/// [`ClientId`]s must be forgotten.
pub struct Server {
  inner: Rc<RefCell<Inner>>,
}

impl Clone for Server {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl Server {
  pub fn new(address: &Address, settings: TcpAcceptorSettings) -> Result<Self> {
    let inner = Rc::new(RefCell::new(Inner {
      acceptor: None,
      slots: Vec::new(),
      free: Vec::new(),
      next_generation: 1,
      r_handler: None,
      w_handler: None,
      d_handler: None,
      cached_date: String::new(),
      cached_date_at: None,
    }));
    let weak = Rc::downgrade(&inner);
    let acceptor =
      TcpAcceptor::new(address, move || Self::accept_all(&weak), settings)?;
    inner.borrow_mut().acceptor = Some(acceptor);
    Ok(Self { inner })
  }

  pub fn local_addr(&self) -> Option<Address> {
    self.inner.borrow().acceptor.as_ref()?.local_addr()
  }

  /// Called with each complete request; return `None` to defer the response.
  pub fn set_request_handler(
    &self,
    handler: impl FnMut(ClientId, Request) -> Option<Response> + 'static,
  ) {
    self.inner.borrow_mut().r_handler = Some(Rc::new(RefCell::new(Box::new(handler))));
  }

  /// Called with text and binary messages; control frames are handled
  /// internally.
  pub fn set_message_handler(&self, handler: impl FnMut(ClientId, WebMessage) + 'static) {
    self.inner.borrow_mut().w_handler = Some(Rc::new(RefCell::new(Box::new(handler))));
  }

  pub fn set_disconnect_handler(&self, handler: impl FnMut(ClientId) + 'static) {
    self.inner.borrow_mut().d_handler = Some(Rc::new(RefCell::new(Box::new(handler))));
  }

  /// Completes a deferred (long-poll) response.
  pub fn write(&self, id: ClientId, mut response: Response) {
    let Some(mut connection) = self.connection(id) else {
      return;
    };
    if response.header.date.is_empty() {
      response.header.date = self.date();
    }
    connection.write_response(response);
  }

  pub fn write_message(&self, id: ClientId, message: WebMessage) {
    if let Some(mut connection) = self.connection(id) {
      connection.write_message(message);
    }
  }

  /// Promotes a client whose upgrade request is pending.
  pub fn web_socket_upgrade(&self, id: ClientId) {
    if let Some(mut connection) = self.connection(id) {
      connection.web_socket_upgrade();
    }
  }

  pub fn disconnect(&self, id: ClientId) {
    let mut inner = self.inner.borrow_mut();
    if let Some(slot) = inner.slots.get_mut(id.index) {
      if slot.as_ref().is_some_and(|s| s.generation == id.generation) {
        *slot = None;
        inner.free.push(id.index);
      }
    }
  }

  /// The RFC 7231 date string, refreshed at most twice a second.
  pub fn date(&self) -> String {
    let mut inner = self.inner.borrow_mut();
    let now = Instant::now();
    let stale = inner
      .cached_date_at
      .map_or(true, |at| now - at > Duration::from_millis(500));
    if stale {
      inner.cached_date = http_date_now();
      inner.cached_date_at = Some(now);
    }
    inner.cached_date.clone()
  }

  fn connection(&self, id: ClientId) -> Option<Connection> {
    let inner = self.inner.borrow();
    let slot = inner.slots.get(id.index)?.as_ref()?;
    if slot.generation != id.generation {
      return None;
    }
    Some(slot.connection.clone())
  }

  fn accept_all(weak: &Weak<RefCell<Inner>>) {
    let Some(rc) = weak.upgrade() else {
      return;
    };
    loop {
      let mut inner = rc.borrow_mut();
      let inner = &mut *inner;
      let Some(acceptor) = inner.acceptor.as_mut() else {
        return;
      };
      if !acceptor.can_accept() {
        return;
      }
      let index = inner.free.pop().unwrap_or_else(|| {
        inner.slots.push(None);
        inner.slots.len() - 1
      });
      let generation = inner.next_generation;
      inner.next_generation += 1;
      let id = ClientId { index, generation };
      let r_weak = weak.clone();
      let d_weak = weak.clone();
      let mut connection = Connection::new(
        move || Self::on_client(&r_weak, id),
        move || Self::on_disconnect(&d_weak, id),
      );
      connection.accept(acceptor);
      log::debug!("http client accepted from {}", connection.peer_addr());
      inner.slots[index] = Some(Slot {
        connection,
        generation,
      });
    }
  }

  fn on_client(weak: &Weak<RefCell<Inner>>, id: ClientId) {
    let Some(rc) = weak.upgrade() else {
      return;
    };
    let server = Server { inner: rc };
    let Some(mut connection) = server.connection(id) else {
      return;
    };
    let (r_handler, w_handler) = {
      let inner = server.inner.borrow();
      (inner.r_handler.clone(), inner.w_handler.clone())
    };
    loop {
      if let Some(message) = connection.read_next_message() {
        if !matches!(message.opcode, OpCode::Text | OpCode::Binary) {
          continue; // close already mirrored, ping/pong never surface
        }
        if let Some(handler) = &w_handler {
          (&mut *handler.borrow_mut())(id, message);
        }
      } else if let Some(request) = connection.read_next_request() {
        let response = match &r_handler {
          Some(handler) => (&mut *handler.borrow_mut())(id, request),
          None => Some(Response::status_page(404)),
        };
        if let Some(mut response) = response {
          if response.header.date.is_empty() {
            response.header.date = server.date();
          }
          connection.write_response(response);
        }
        // None: deferred, the application answers through Server::write
      } else {
        break;
      }
    }
  }

  fn on_disconnect(weak: &Weak<RefCell<Inner>>, id: ClientId) {
    let Some(rc) = weak.upgrade() else {
      return;
    };
    let d_handler = {
      let mut inner = rc.borrow_mut();
      if let Some(slot) = inner.slots.get_mut(id.index) {
        if slot.as_ref().is_some_and(|s| s.generation == id.generation) {
          *slot = None;
          inner.free.push(id.index);
        }
      }
      inner.d_handler.clone()
    };
    if let Some(handler) = d_handler {
      (&mut *handler.borrow_mut())(id);
    }
  }
}

fn http_date_now() -> String {
  let secs = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs();
  format_http_date(secs)
}

/// "Sun, 06 Nov 1994 08:49:37 GMT" from seconds since the epoch.
fn format_http_date(secs: u64) -> String {
  const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
  const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
  ];
  let days = (secs / 86400) as i64;
  let rem = secs % 86400;
  let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);
  let weekday = WEEKDAYS[((days + 4) % 7) as usize];
  // civil-from-days
  let z = days + 719_468;
  let era = z.div_euclid(146_097);
  let doe = z.rem_euclid(146_097);
  let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
  let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
  let mp = (5 * doy + 2) / 153;
  let day = doy - (153 * mp + 2) / 5 + 1;
  let month = if mp < 10 { mp + 3 } else { mp - 9 };
  let year = yoe + era * 400 + i64::from(month <= 2);
  format!(
    "{weekday}, {day:02} {} {year} {hour:02}:{minute:02}:{second:02} GMT",
    MONTHS[(month - 1) as usize]
  )
}

#[cfg(test)]
mod tests {
  use super::format_http_date;

  #[test]
  fn known_dates_format() {
    // RFC 7231's own example
    assert_eq!(format_http_date(784_111_777), "Sun, 06 Nov 1994 08:49:37 GMT");
    assert_eq!(format_http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    assert_eq!(format_http_date(951_782_400), "Tue, 29 Feb 2000 00:00:00 GMT");
  }
}
