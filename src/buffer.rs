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

/// A byte source that transfers as much as it can without blocking.
///
/// Returning 0 means "no bytes available right now"; for sockets the caller
/// will be woken by the next readiness edge.
pub trait ReadStream {
  fn read_some(&mut self, buf: &mut [u8]) -> usize;
}

/// A byte sink that accepts as much as it can without blocking.
pub trait WriteStream {
  fn write_some(&mut self, buf: &[u8]) -> usize;
}

impl WriteStream for Vec<u8> {
  fn write_some(&mut self, buf: &[u8]) -> usize {
    self.extend_from_slice(buf);
    buf.len()
  }
}

/// Classic circular buffer of fixed capacity.
///
/// Invariant: `read_pos <= write_pos <= read_pos + capacity`, with
/// `read_pos < capacity`. At most two contiguous spans exist in each
/// direction; when the buffer drains completely both positions reset to zero
/// so the next fill is a single span.
pub struct Buffer {
  data: Box<[u8]>,
  read_pos: usize,  // 0..capacity
  write_pos: usize, // read_pos..read_pos + capacity
}

impl Buffer {
  pub fn new(capacity: usize) -> Self {
    Self {
      data: vec![0u8; capacity].into_boxed_slice(),
      read_pos: 0,
      write_pos: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.data.len()
  }

  pub fn size(&self) -> usize {
    self.write_pos - self.read_pos
  }

  pub fn is_empty(&self) -> bool {
    self.size() == 0
  }

  pub fn full(&self) -> bool {
    self.size() == self.data.len()
  }

  pub fn clear(&mut self) {
    self.read_pos = 0;
    self.write_pos = 0;
  }

  /// Drops the contents and replaces the backing store with a fresh one of
  /// `capacity` bytes. Used where bodies of varying sizes are staged.
  pub fn clear_with_capacity(&mut self, capacity: usize) {
    self.data = vec![0u8; capacity].into_boxed_slice();
    self.clear();
  }

  /// First contiguous readable span.
  pub fn read_slice(&self) -> &[u8] {
    let n = self.data.len();
    if self.write_pos < n {
      &self.data[self.read_pos..self.write_pos]
    } else {
      &self.data[self.read_pos..]
    }
  }

  /// Second contiguous readable span (empty unless wrapped).
  pub fn read_slice2(&self) -> &[u8] {
    let n = self.data.len();
    if self.write_pos < n {
      &self.data[0..0]
    } else {
      &self.data[..self.write_pos - n]
    }
  }

  /// Both contiguous readable spans; the second is empty unless wrapped.
  pub fn read_slices(&self) -> (&[u8], &[u8]) {
    (self.read_slice(), self.read_slice2())
  }

  /// Both contiguous writable spans; the second is empty unless the free
  /// space wraps around.
  pub fn write_slices(&mut self) -> (&mut [u8], &mut [u8]) {
    let n = self.data.len();
    if self.write_pos < n {
      let (head, tail) = self.data.split_at_mut(self.write_pos);
      let head_end = self.read_pos;
      (tail, &mut head[..head_end])
    } else {
      let start = self.write_pos - n;
      let end = self.read_pos;
      (&mut self.data[start..end], Default::default())
    }
  }

  /// First contiguous writable span.
  pub fn write_slice(&mut self) -> &mut [u8] {
    let n = self.data.len();
    if self.write_pos < n {
      &mut self.data[self.write_pos..]
    } else {
      let start = self.write_pos - n;
      let end = self.read_pos;
      &mut self.data[start..end]
    }
  }

  pub fn did_write(&mut self, count: usize) {
    self.write_pos += count;
    assert!(
      self.write_pos <= self.read_pos + self.data.len(),
      "writing past end of Buffer"
    );
  }

  pub fn did_read(&mut self, count: usize) {
    self.read_pos += count;
    assert!(self.read_pos <= self.write_pos, "reading past end of Buffer");
    if self.read_pos >= self.data.len() {
      // could have read from both parts of the circular buffer
      self.read_pos -= self.data.len();
      self.write_pos -= self.data.len();
    }
    if self.read_pos == self.write_pos {
      self.read_pos = 0; // increases chance of single-span reading
      self.write_pos = 0;
    }
  }

  /// Copies up to `out.len()` bytes without consuming them. Returns false if
  /// fewer than `out.len()` bytes are buffered.
  pub fn peek(&self, out: &mut [u8]) -> bool {
    if out.len() > self.size() {
      return false;
    }
    let first = self.read_slice();
    let take = out.len().min(first.len());
    out[..take].copy_from_slice(&first[..take]);
    if take < out.len() {
      let remaining = out.len() - take;
      let second = self.read_slice2();
      out[take..].copy_from_slice(&second[..remaining]);
    }
    true
  }

  /// Copies exactly `out.len()` bytes and consumes them.
  ///
  /// Panics if not enough bytes are buffered; callers check `size()` first.
  pub fn read(&mut self, out: &mut [u8]) {
    assert!(self.peek(out), "reading from drained Buffer");
    self.did_read(out.len());
  }

  /// Fills the buffer from `source` until it is full or the source runs dry.
  pub fn read_from(&mut self, source: &mut impl ReadStream) -> usize {
    let mut total = 0;
    loop {
      let span = self.write_slice();
      if span.is_empty() {
        break;
      }
      let count = source.read_some(span);
      self.did_write(count);
      total += count;
      if count == 0 {
        break;
      }
    }
    total
  }

  /// Drains up to `max_count` bytes into `sink`, stopping early if the sink
  /// stops accepting.
  pub fn write_to_limit(
    &mut self,
    sink: &mut impl WriteStream,
    mut max_count: usize,
  ) -> usize {
    let mut total = 0;
    loop {
      let span = self.read_slice();
      let take = span.len().min(max_count);
      if take == 0 {
        break;
      }
      let count = sink.write_some(&span[..take]);
      self.did_read(count);
      max_count -= count;
      total += count;
      if count == 0 {
        break;
      }
    }
    total
  }

  pub fn write_to(&mut self, sink: &mut impl WriteStream) -> usize {
    self.write_to_limit(sink, usize::MAX)
  }
}

impl ReadStream for Buffer {
  fn read_some(&mut self, buf: &mut [u8]) -> usize {
    let span = self.read_slice();
    let take = span.len().min(buf.len());
    buf[..take].copy_from_slice(&span[..take]);
    self.did_read(take);
    take
  }
}

impl WriteStream for Buffer {
  fn write_some(&mut self, buf: &[u8]) -> usize {
    let span = self.write_slice();
    let take = span.len().min(buf.len());
    span[..take].copy_from_slice(&buf[..take]);
    self.did_write(take);
    take
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fifo_order_across_wrap() {
    let mut buf = Buffer::new(8);
    let mut written: u64 = 0;
    let mut read: u64 = 0;
    let mut expect: u8 = 0;
    // Interleave writes and reads of varying sizes; bytes must come out in
    // the exact order they went in.
    for step in 0..1000usize {
      let w = ((step * 7) % 5).min(buf.capacity() - buf.size());
      let mut chunk = Vec::new();
      for _ in 0..w {
        chunk.push((written & 0xff) as u8);
        written += 1;
      }
      let n = buf.write_some(&chunk);
      assert_eq!(n, chunk.len());
      let r = (step * 3) % 4;
      let mut out = vec![0u8; r.min(buf.size())];
      let n = buf.read_some(&mut out);
      assert_eq!(n, out.len());
      for b in out {
        assert_eq!(b, (read & 0xff) as u8);
        assert_eq!(b, expect);
        read += 1;
        expect = expect.wrapping_add(1);
      }
      assert_eq!(written - read, buf.size() as u64);
    }
    while !buf.is_empty() {
      let mut out = [0u8; 3];
      let n = buf.read_some(&mut out);
      for &b in &out[..n] {
        assert_eq!(b, (read & 0xff) as u8);
        read += 1;
      }
    }
    assert_eq!(written, read);
  }

  #[test]
  fn reset_when_drained() {
    let mut buf = Buffer::new(4);
    buf.write_some(b"abc");
    let mut out = [0u8; 3];
    buf.read_some(&mut out);
    // both positions reset, so the whole capacity is one span again
    assert_eq!(buf.write_slice().len(), 4);
  }

  #[test]
  fn peek_does_not_consume() {
    let mut buf = Buffer::new(6);
    buf.write_some(b"abcdef");
    buf.did_read(4);
    buf.write_some(b"gh"); // wraps: spans are "ef" and "gh"
    let mut out = [0u8; 4];
    assert!(buf.peek(&mut out));
    assert_eq!(&out, b"efgh");
    assert_eq!(buf.size(), 4);
    let mut out5 = [0u8; 5];
    assert!(!buf.peek(&mut out5));
  }

  #[test]
  fn buffer_to_buffer_transfer() {
    let mut a = Buffer::new(16);
    let mut b = Buffer::new(16);
    a.write_some(b"hello world");
    let moved = b.read_from(&mut a);
    assert_eq!(moved, 11);
    assert!(a.is_empty());
    let mut out = vec![0u8; 11];
    b.read_some(&mut out);
    assert_eq!(&out, b"hello world");
  }

  #[test]
  fn write_to_limit_stops_at_count() {
    let mut a = Buffer::new(16);
    a.write_some(b"0123456789");
    let mut sink = Vec::new();
    let n = a.write_to_limit(&mut sink, 4);
    assert_eq!(n, 4);
    assert_eq!(sink, b"0123");
    assert_eq!(a.size(), 6);
  }
}
