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

//! Single-threaded event loop with timers, idle handlers and cross-thread
//! wakeups.
//!
//! Every reactor-owned object ([`Timer`], [`Watcher`], [`Idle`], the sockets
//! in [`crate::tcp`]/[`crate::udp`]) must be created, used and destroyed on
//! the thread that owns the [`RunLoop`]. [`WatcherHandle::call`] and
//! [`RunLoopHandle::cancel`] are the only operations safe from other threads.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Registry, Token};

pub(crate) type Handler = Rc<RefCell<dyn FnMut()>>;

pub(crate) fn make_handler(f: impl FnMut() + 'static) -> Handler {
  Rc::new(RefCell::new(f))
}

const WAKE_TOKEN: Token = Token(usize::MAX);

// On some systems, poll timeouts greater than ~35 minutes are treated as
// infinity. A spurious wakeup every 30 minutes is harmless.
const MAX_SLEEP: Duration = Duration::from_secs(30 * 60);

/// Identifies a registered callable. The generation guards against slot
/// reuse: stale queue entries and late watcher wakeups are dropped when the
/// generation no longer matches.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct CallableId {
  index: usize,
  generation: u64,
}

struct Callable {
  generation: u64,
  handler: Option<Handler>,
  can_read: bool,
  can_write: bool,
  queued: bool,
}

struct WatcherShared {
  queued: AtomicBool,
  index: usize,
  generation: u64,
}

struct LoopShared {
  quit: AtomicBool,
  waker: mio::Waker,
  fired: Mutex<Vec<Arc<WatcherShared>>>,
}

pub(crate) struct LoopCore {
  poll: RefCell<Poll>,
  registry: Registry,
  events: RefCell<Events>,
  callables: RefCell<Vec<Callable>>,
  free_callables: RefCell<Vec<usize>>,
  next_generation: Cell<u64>,
  triggered: RefCell<VecDeque<CallableId>>,
  timers: RefCell<TimerHeap>,
  idles: RefCell<VecDeque<CallableId>>,
  now: Cell<Instant>,
  shared: Arc<LoopShared>,
}

thread_local! {
  static CURRENT: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

impl LoopCore {
  pub(crate) fn current() -> Rc<LoopCore> {
    CURRENT.with(|c| {
      c.borrow()
        .clone()
        .expect("no RunLoop exists on this thread")
    })
  }

  pub(crate) fn now(&self) -> Instant {
    self.now.get()
  }

  pub(crate) fn alloc_callable(&self, handler: Handler) -> CallableId {
    let generation = self.next_generation.get();
    self.next_generation.set(generation + 1);
    let mut callables = self.callables.borrow_mut();
    let index = match self.free_callables.borrow_mut().pop() {
      Some(index) => index,
      None => {
        callables.push(Callable {
          generation: 0,
          handler: None,
          can_read: false,
          can_write: false,
          queued: false,
        });
        callables.len() - 1
      }
    };
    let cell = &mut callables[index];
    cell.generation = generation;
    cell.handler = Some(handler);
    cell.can_read = false;
    cell.can_write = false;
    cell.queued = false;
    CallableId { index, generation }
  }

  pub(crate) fn free_callable(&self, id: CallableId) {
    let mut callables = self.callables.borrow_mut();
    let cell = &mut callables[id.index];
    if cell.generation != id.generation {
      return;
    }
    cell.handler = None;
    cell.queued = false;
    self.free_callables.borrow_mut().push(id.index);
  }

  pub(crate) fn set_handler(&self, id: CallableId, handler: Handler) {
    let mut callables = self.callables.borrow_mut();
    let cell = &mut callables[id.index];
    if cell.generation == id.generation {
      cell.handler = Some(handler);
    }
  }

  fn with_cell<R>(&self, id: CallableId, f: impl FnOnce(&mut Callable) -> R) -> Option<R> {
    let mut callables = self.callables.borrow_mut();
    let cell = callables.get_mut(id.index)?;
    if cell.generation != id.generation {
      return None;
    }
    Some(f(cell))
  }

  pub(crate) fn can_read(&self, id: CallableId) -> bool {
    self.with_cell(id, |c| c.can_read).unwrap_or(false)
  }

  pub(crate) fn set_can_read(&self, id: CallableId, value: bool) {
    self.with_cell(id, |c| c.can_read = value);
  }

  pub(crate) fn can_write(&self, id: CallableId) -> bool {
    self.with_cell(id, |c| c.can_write).unwrap_or(false)
  }

  pub(crate) fn set_can_write(&self, id: CallableId, value: bool) {
    self.with_cell(id, |c| c.can_write = value);
  }

  /// Appends the callable to the triggered list, coalescing duplicates.
  pub(crate) fn schedule(&self, id: CallableId) {
    let fresh = self
      .with_cell(id, |c| {
        if c.queued {
          false
        } else {
          c.queued = true;
          true
        }
      })
      .unwrap_or(false);
    if fresh {
      self.triggered.borrow_mut().push_back(id);
    }
  }

  /// Removes any pending invocation without touching readiness flags.
  pub(crate) fn cancel_scheduled(&self, id: CallableId) {
    self.with_cell(id, |c| c.queued = false);
  }

  pub(crate) fn is_scheduled(&self, id: CallableId) -> bool {
    self.with_cell(id, |c| c.queued).unwrap_or(false)
  }

  pub(crate) fn register_source(
    &self,
    source: &mut impl mio::event::Source,
    id: CallableId,
  ) -> std::io::Result<()> {
    self.registry.register(
      source,
      Token(id.index),
      Interest::READABLE | Interest::WRITABLE,
    )
  }

  pub(crate) fn register_source_readable(
    &self,
    source: &mut impl mio::event::Source,
    id: CallableId,
  ) -> std::io::Result<()> {
    self
      .registry
      .register(source, Token(id.index), Interest::READABLE)
  }

  pub(crate) fn deregister_source(&self, source: &mut impl mio::event::Source) {
    let _ = self.registry.deregister(source);
  }

  fn pop_triggered(&self) -> Option<Handler> {
    loop {
      let id = self.triggered.borrow_mut().pop_front()?;
      let handler = {
        let mut callables = self.callables.borrow_mut();
        let cell = match callables.get_mut(id.index) {
          Some(cell) => cell,
          None => continue,
        };
        if cell.generation != id.generation || !cell.queued {
          continue; // cancelled or recycled since it was queued
        }
        cell.queued = false;
        match &cell.handler {
          Some(handler) => handler.clone(),
          None => continue,
        }
      };
      return Some(handler);
    }
  }

  /// Fires the earliest expired timer, or shortens `timeout` to its deadline.
  fn expired_timer(&self, timeout: &mut Duration) -> Option<Handler> {
    let now = self.now.get();
    let id = {
      let mut timers = self.timers.borrow_mut();
      let (fire_time, _) = timers.peek()?;
      if fire_time > now {
        let until = fire_time - now + Duration::from_millis(1);
        // round up so the loop never wakes before the deadline
        if until < *timeout {
          *timeout = until;
        }
        return None;
      }
      timers.pop()
    };
    let mut callables = self.callables.borrow_mut();
    let cell = callables.get_mut(id.index)?;
    if cell.generation != id.generation {
      return None;
    }
    cell.handler.clone()
  }

  fn drain_fired_watchers(&self) {
    let fired = std::mem::take(&mut *self.shared.fired.lock().unwrap());
    for watcher in fired {
      watcher.queued.store(false, Ordering::Release);
      self.schedule(CallableId {
        index: watcher.index,
        generation: watcher.generation,
      });
    }
  }

  fn step(&self, timeout: Duration) {
    let mut events = self.events.borrow_mut();
    let result = self.poll.borrow_mut().poll(&mut events, Some(timeout));
    if let Err(err) = result {
      if err.kind() == std::io::ErrorKind::Interrupted {
        return;
      }
      panic!("RunLoop poll backend failed: {err}");
    }
    for event in events.iter() {
      if event.token() == WAKE_TOKEN {
        self.drain_fired_watchers();
        continue;
      }
      let index = event.token().0;
      let id = {
        let mut callables = self.callables.borrow_mut();
        let cell = match callables.get_mut(index) {
          Some(cell) if cell.handler.is_some() => cell,
          _ => continue,
        };
        // Errors and hangups surface as a read edge; the following read
        // returns 0 or an error and closes the socket.
        if event.is_readable() || event.is_read_closed() || event.is_error() {
          cell.can_read = true;
        }
        if event.is_writable() || event.is_write_closed() {
          cell.can_write = true;
        }
        CallableId {
          index,
          generation: cell.generation,
        }
      };
      self.schedule(id);
    }
  }
}

/// The event loop. One per thread; objects find it through a thread-local.
pub struct RunLoop {
  core: Rc<LoopCore>,
}

impl RunLoop {
  pub fn new() -> Self {
    let poll = Poll::new().expect("RunLoop poll backend unavailable");
    let registry = poll
      .registry()
      .try_clone()
      .expect("RunLoop registry clone failed");
    let waker =
      mio::Waker::new(poll.registry(), WAKE_TOKEN).expect("RunLoop waker unavailable");
    let core = Rc::new(LoopCore {
      poll: RefCell::new(poll),
      registry,
      events: RefCell::new(Events::with_capacity(512)),
      callables: RefCell::new(Vec::new()),
      free_callables: RefCell::new(Vec::new()),
      next_generation: Cell::new(1),
      triggered: RefCell::new(VecDeque::new()),
      timers: RefCell::new(TimerHeap::new()),
      idles: RefCell::new(VecDeque::new()),
      now: Cell::new(Instant::now()),
      shared: Arc::new(LoopShared {
        quit: AtomicBool::new(false),
        waker,
        fired: Mutex::new(Vec::new()),
      }),
    });
    CURRENT.with(|c| {
      let mut current = c.borrow_mut();
      assert!(current.is_none(), "only one RunLoop per thread is allowed");
      *current = Some(core.clone());
    });
    Self { core }
  }

  /// Monotonic time, updated at most once per loop iteration.
  pub fn now(&self) -> Instant {
    self.core.now()
  }

  /// Runs until [`RunLoop::cancel`] / [`RunLoopHandle::cancel`]. The quit
  /// flag is not reset, so subsequent runs return immediately.
  pub fn run(&self) {
    let core = &self.core;
    core.now.set(Instant::now());
    while !core.shared.quit.load(Ordering::Acquire) {
      if let Some(handler) = core.pop_triggered() {
        (&mut *handler.borrow_mut())();
        continue;
      }
      let mut timeout = MAX_SLEEP;
      if let Some(handler) = core.expired_timer(&mut timeout) {
        (&mut *handler.borrow_mut())();
        continue;
      }
      // Round-robin: one idle handler per iteration, rotated to the back.
      let idle = core.idles.borrow_mut().pop_front();
      if let Some(id) = idle {
        core.schedule(id);
        core.idles.borrow_mut().push_back(id);
        timeout = Duration::ZERO;
      }
      core.step(timeout);
      core.now.set(Instant::now());
    }
  }

  pub fn cancel(&self) {
    self.core.shared.quit.store(true, Ordering::Release);
    let _ = self.core.shared.waker.wake();
  }

  /// A `Send` handle for cancelling the loop from another thread.
  pub fn handle(&self) -> RunLoopHandle {
    RunLoopHandle {
      shared: self.core.shared.clone(),
    }
  }
}

impl Default for RunLoop {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for RunLoop {
  fn drop(&mut self) {
    CURRENT.with(|c| *c.borrow_mut() = None);
  }
}

/// Cancels a [`RunLoop`] from any thread.
#[derive(Clone)]
pub struct RunLoopHandle {
  shared: Arc<LoopShared>,
}

impl RunLoopHandle {
  pub fn cancel(&self) {
    self.shared.quit.store(true, Ordering::Release);
    let _ = self.shared.waker.wake();
  }
}

/// One-shot timer. Re-arming an armed timer moves its deadline in place;
/// this is two comparisons and a heap fixup, so re-arming on every incoming
/// packet is fine even with very many timers set.
pub struct Timer {
  core: Rc<LoopCore>,
  cell: CallableId,
  key: TimerKey,
}

impl Timer {
  pub fn new(handler: impl FnMut() + 'static) -> Self {
    let core = LoopCore::current();
    let cell = core.alloc_callable(make_handler(handler));
    let key = core.timers.borrow_mut().alloc_slot(cell);
    Self { core, cell, key }
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.core.set_handler(self.cell, make_handler(handler));
  }

  pub fn once(&mut self, delay: Duration) {
    let fire_time = self.core.now().checked_add(delay).unwrap_or_else(|| {
      self.core.now() + Duration::from_secs(3600 * 24 * 365)
    });
    self.once_at(fire_time);
  }

  pub fn once_at(&mut self, fire_time: Instant) {
    self.core.timers.borrow_mut().arm(self.key, fire_time);
  }

  pub fn is_set(&self) -> bool {
    self.core.timers.borrow().is_armed(self.key)
  }

  pub fn cancel(&mut self) {
    self.core.timers.borrow_mut().disarm(self.key);
    self.core.cancel_scheduled(self.cell);
  }
}

impl Drop for Timer {
  fn drop(&mut self) {
    self.core.timers.borrow_mut().free_slot(self.key);
    self.core.free_callable(self.cell);
  }
}

/// Cross-thread wakeup. [`Watcher::handle`] yields a `Send + Sync` handle
/// whose `call` is the only operation permitted from other threads; several
/// calls between loop iterations coalesce into one handler invocation.
pub struct Watcher {
  core: Rc<LoopCore>,
  cell: CallableId,
  shared: Arc<WatcherShared>,
}

impl Watcher {
  pub fn new(handler: impl FnMut() + 'static) -> Self {
    let core = LoopCore::current();
    let cell = core.alloc_callable(make_handler(handler));
    let shared = Arc::new(WatcherShared {
      queued: AtomicBool::new(false),
      index: cell.index,
      generation: cell.generation,
    });
    Self { core, cell, shared }
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.core.set_handler(self.cell, make_handler(handler));
  }

  pub fn handle(&self) -> WatcherHandle {
    WatcherHandle {
      shared: self.shared.clone(),
      loop_shared: self.core.shared.clone(),
    }
  }

  pub fn call(&self) {
    self.handle().call();
  }

  /// After `cancel` no callback is delivered until the next `call`.
  pub fn cancel(&mut self) {
    {
      let mut fired = self.core.shared.fired.lock().unwrap();
      fired.retain(|w| !Arc::ptr_eq(w, &self.shared));
      self.shared.queued.store(false, Ordering::Release);
    }
    self.core.cancel_scheduled(self.cell);
  }
}

impl Drop for Watcher {
  fn drop(&mut self) {
    self.cancel();
    self.core.free_callable(self.cell);
  }
}

#[derive(Clone)]
pub struct WatcherHandle {
  shared: Arc<WatcherShared>,
  loop_shared: Arc<LoopShared>,
}

impl WatcherHandle {
  pub fn call(&self) {
    if !self.shared.queued.swap(true, Ordering::AcqRel) {
      self.loop_shared.fired.lock().unwrap().push(self.shared.clone());
    }
    let _ = self.loop_shared.waker.wake();
  }
}

/// A callable invoked in round-robin fashion whenever the loop has no other
/// work. Active after construction.
pub struct Idle {
  core: Rc<LoopCore>,
  cell: CallableId,
  active: bool,
}

impl Idle {
  pub fn new(handler: impl FnMut() + 'static) -> Self {
    let core = LoopCore::current();
    let cell = core.alloc_callable(make_handler(handler));
    core.idles.borrow_mut().push_back(cell);
    Self {
      core,
      cell,
      active: true,
    }
  }

  pub fn set_handler(&mut self, handler: impl FnMut() + 'static) {
    self.core.set_handler(self.cell, make_handler(handler));
  }

  pub fn is_active(&self) -> bool {
    self.active
  }

  pub fn set_active(&mut self, active: bool) {
    if active == self.active {
      return;
    }
    self.active = active;
    let mut idles = self.core.idles.borrow_mut();
    if active {
      idles.push_back(self.cell);
    } else {
      idles.retain(|id| *id != self.cell);
    }
  }
}

impl Drop for Idle {
  fn drop(&mut self) {
    self.set_active(false);
    self.core.cancel_scheduled(self.cell);
    self.core.free_callable(self.cell);
  }
}

type TimerKey = usize;

struct TimerSlot {
  cell: CallableId,
  fire_time: Instant,
  seq: u64,
  heap_pos: usize,
  armed: bool,
}

/// Binary min-heap of armed timers ordered by (deadline, insertion seq),
/// with back-pointers for O(log n) re-arm and cancel.
struct TimerHeap {
  heap: Vec<TimerKey>,
  slots: Vec<TimerSlot>,
  free: Vec<TimerKey>,
  next_seq: u64,
}

impl TimerHeap {
  fn new() -> Self {
    Self {
      heap: Vec::new(),
      slots: Vec::new(),
      free: Vec::new(),
      next_seq: 0,
    }
  }

  fn alloc_slot(&mut self, cell: CallableId) -> TimerKey {
    let slot = TimerSlot {
      cell,
      fire_time: Instant::now(),
      seq: 0,
      heap_pos: usize::MAX,
      armed: false,
    };
    match self.free.pop() {
      Some(key) => {
        self.slots[key] = slot;
        key
      }
      None => {
        self.slots.push(slot);
        self.slots.len() - 1
      }
    }
  }

  fn free_slot(&mut self, key: TimerKey) {
    self.disarm(key);
    self.free.push(key);
  }

  fn is_armed(&self, key: TimerKey) -> bool {
    self.slots[key].armed
  }

  fn arm(&mut self, key: TimerKey, fire_time: Instant) {
    self.next_seq += 1;
    let seq = self.next_seq;
    let slot = &mut self.slots[key];
    slot.fire_time = fire_time;
    slot.seq = seq;
    if slot.armed {
      let pos = slot.heap_pos;
      self.sift_up(pos);
      self.sift_down_from(key);
    } else {
      slot.armed = true;
      slot.heap_pos = self.heap.len();
      self.heap.push(key);
      self.sift_up(self.heap.len() - 1);
    }
  }

  fn disarm(&mut self, key: TimerKey) {
    if !self.slots[key].armed {
      return;
    }
    let pos = self.slots[key].heap_pos;
    self.slots[key].armed = false;
    let last = self.heap.pop().unwrap();
    if pos < self.heap.len() {
      self.heap[pos] = last;
      self.slots[last].heap_pos = pos;
      self.sift_up(pos);
      self.sift_down(pos);
    }
  }

  fn peek(&self) -> Option<(Instant, TimerKey)> {
    let key = *self.heap.first()?;
    Some((self.slots[key].fire_time, key))
  }

  fn pop(&mut self) -> CallableId {
    let key = self.heap[0];
    let cell = self.slots[key].cell;
    self.disarm(key);
    cell
  }

  fn before(&self, a: TimerKey, b: TimerKey) -> bool {
    let sa = &self.slots[a];
    let sb = &self.slots[b];
    (sa.fire_time, sa.seq) < (sb.fire_time, sb.seq)
  }

  fn sift_up(&mut self, mut pos: usize) {
    while pos > 0 {
      let parent = (pos - 1) / 2;
      if !self.before(self.heap[pos], self.heap[parent]) {
        break;
      }
      self.swap(pos, parent);
      pos = parent;
    }
  }

  fn sift_down_from(&mut self, key: TimerKey) {
    let pos = self.slots[key].heap_pos;
    self.sift_down(pos);
  }

  fn sift_down(&mut self, mut pos: usize) {
    loop {
      let left = pos * 2 + 1;
      if left >= self.heap.len() {
        break;
      }
      let mut child = left;
      let right = left + 1;
      if right < self.heap.len() && self.before(self.heap[right], self.heap[left]) {
        child = right;
      }
      if !self.before(self.heap[child], self.heap[pos]) {
        break;
      }
      self.swap(pos, child);
      pos = child;
    }
  }

  fn swap(&mut self, a: usize, b: usize) {
    self.heap.swap(a, b);
    let ka = self.heap[a];
    let kb = self.heap[b];
    self.slots[ka].heap_pos = a;
    self.slots[kb].heap_pos = b;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timers_fire_in_deadline_order() {
    let run_loop = RunLoop::new();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let start = Instant::now();

    let mut timers = Vec::new();
    for (label, delay_ms) in [("c", 30u64), ("a", 5), ("b", 15)] {
      let fired = fired.clone();
      let mut timer = Timer::new(move || {
        fired.borrow_mut().push((label, Instant::now()));
      });
      timer.once(Duration::from_millis(delay_ms));
      timers.push((timer, start + Duration::from_millis(delay_ms)));
    }
    let handle = run_loop.handle();
    let mut stop = Timer::new(move || handle.cancel());
    stop.once(Duration::from_millis(80));
    run_loop.run();

    let fired = fired.borrow();
    let order: Vec<&str> = fired.iter().map(|(l, _)| *l).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    // a fired timer never runs before its last-set deadline
    for ((_, at), ms) in fired.iter().zip([5u64, 15, 30]) {
      assert!(*at >= start + Duration::from_millis(ms));
    }
  }

  #[test]
  fn rearm_moves_deadline_and_fires_once() {
    let run_loop = RunLoop::new();
    let count = Rc::new(Cell::new(0u32));
    let c = count.clone();
    let mut timer = Timer::new(move || c.set(c.get() + 1));
    timer.once(Duration::from_millis(5));
    timer.once(Duration::from_millis(20)); // re-arm pushes it out
    assert!(timer.is_set());
    let handle = run_loop.handle();
    let mut stop = Timer::new(move || handle.cancel());
    stop.once(Duration::from_millis(60));
    run_loop.run();
    assert_eq!(count.get(), 1);
    assert!(!timer.is_set());
  }

  #[test]
  fn cancelled_timer_never_fires() {
    let run_loop = RunLoop::new();
    let count = Rc::new(Cell::new(0u32));
    let c = count.clone();
    let mut timer = Timer::new(move || c.set(c.get() + 1));
    timer.once(Duration::from_millis(1));
    timer.cancel();
    let handle = run_loop.handle();
    let mut stop = Timer::new(move || handle.cancel());
    stop.once(Duration::from_millis(30));
    run_loop.run();
    assert_eq!(count.get(), 0);
  }

  #[test]
  fn watcher_coalesces_cross_thread_calls() {
    let run_loop = RunLoop::new();
    let count = Rc::new(Cell::new(0u32));
    let c = count.clone();
    let watcher = Watcher::new(move || c.set(c.get() + 1));
    let handle = watcher.handle();
    let loop_handle = run_loop.handle();
    let thread = std::thread::spawn(move || {
      for _ in 0..100 {
        handle.call();
      }
      std::thread::sleep(Duration::from_millis(50));
      loop_handle.cancel();
    });
    run_loop.run();
    thread.join().unwrap();
    let fired = count.get();
    assert!(fired >= 1, "at-least-once delivery");
    assert!(fired <= 100, "coalesced delivery");
  }

  #[test]
  fn idles_rotate_round_robin() {
    let run_loop = RunLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut idles = Vec::new();
    for label in ["x", "y", "z"] {
      let order = order.clone();
      idles.push(Idle::new(move || order.borrow_mut().push(label)));
    }
    let handle = run_loop.handle();
    let mut stop = Timer::new(move || handle.cancel());
    stop.once(Duration::from_millis(25));
    run_loop.run();
    let order = order.borrow();
    assert!(order.len() >= 6);
    for (i, label) in order.iter().enumerate() {
      assert_eq!(*label, ["x", "y", "z"][i % 3]);
    }
  }
}
