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

/// Linkage for one [`FairQueue`], embedded in the pooled element. An element
/// can sit in several queues at once by carrying one node per queue.
#[derive(Clone, Copy, Default)]
pub(crate) struct QueueNode {
  prev: Option<u32>,
  next: Option<u32>,
  linked: bool,
}

/// Intrusive FIFO over an arena of elements addressed by index.
///
/// Unlink is O(1), exactly like a pointer-based intrusive list, but without
/// self-referential structs; the accessor picks which embedded node this
/// queue uses.
pub(crate) struct FairQueue<T> {
  head: Option<u32>,
  tail: Option<u32>,
  node: fn(&mut T) -> &mut QueueNode,
}

impl<T> FairQueue<T> {
  pub fn new(node: fn(&mut T) -> &mut QueueNode) -> Self {
    Self {
      head: None,
      tail: None,
      node,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  pub fn front(&self) -> Option<u32> {
    self.head
  }

  pub fn push_back(&mut self, pool: &mut [T], index: u32) {
    let tail = self.tail;
    {
      let node = (self.node)(&mut pool[index as usize]);
      if node.linked {
        return;
      }
      node.linked = true;
      node.prev = tail;
      node.next = None;
    }
    match tail {
      Some(tail) => (self.node)(&mut pool[tail as usize]).next = Some(index),
      None => self.head = Some(index),
    }
    self.tail = Some(index);
  }

  pub fn unlink(&mut self, pool: &mut [T], index: u32) {
    let (prev, next) = {
      let node = (self.node)(&mut pool[index as usize]);
      if !node.linked {
        return;
      }
      let links = (node.prev, node.next);
      *node = QueueNode::default();
      links
    };
    match prev {
      Some(prev) => (self.node)(&mut pool[prev as usize]).next = next,
      None => self.head = next,
    }
    match next {
      Some(next) => (self.node)(&mut pool[next as usize]).prev = prev,
      None => self.tail = prev,
    }
  }

  pub fn pop_front(&mut self, pool: &mut [T]) -> Option<u32> {
    let head = self.head?;
    self.unlink(pool, head);
    Some(head)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct Elem {
    a: QueueNode,
    b: QueueNode,
  }

  fn node_a(e: &mut Elem) -> &mut QueueNode {
    &mut e.a
  }

  fn node_b(e: &mut Elem) -> &mut QueueNode {
    &mut e.b
  }

  #[test]
  fn fifo_order() {
    let mut pool: Vec<Elem> = (0..4).map(|_| Elem::default()).collect();
    let mut queue = FairQueue::new(node_a);
    for i in [2u32, 0, 3, 1] {
      queue.push_back(&mut pool, i);
    }
    let mut order = Vec::new();
    while let Some(i) = queue.pop_front(&mut pool) {
      order.push(i);
    }
    assert_eq!(order, vec![2, 0, 3, 1]);
    assert!(queue.is_empty());
  }

  #[test]
  fn unlink_from_middle_and_double_push() {
    let mut pool: Vec<Elem> = (0..4).map(|_| Elem::default()).collect();
    let mut queue = FairQueue::new(node_a);
    for i in 0..4u32 {
      queue.push_back(&mut pool, i);
    }
    queue.push_back(&mut pool, 2); // already linked, keeps its place
    queue.unlink(&mut pool, 1);
    queue.unlink(&mut pool, 1); // second unlink is a no-op
    queue.unlink(&mut pool, 3);
    let mut order = Vec::new();
    while let Some(i) = queue.pop_front(&mut pool) {
      order.push(i);
    }
    assert_eq!(order, vec![0, 2]);
  }

  #[test]
  fn element_in_two_queues() {
    let mut pool: Vec<Elem> = (0..2).map(|_| Elem::default()).collect();
    let mut first = FairQueue::new(node_a);
    let mut second = FairQueue::new(node_b);
    first.push_back(&mut pool, 0);
    second.push_back(&mut pool, 0);
    first.unlink(&mut pool, 0);
    assert!(first.is_empty());
    assert_eq!(second.pop_front(&mut pool), Some(0));
  }
}
