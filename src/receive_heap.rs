use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;

use crate::SeqNo;

/// A DATA message that arrived ahead of the id its peer is expected to send next.
#[derive(Clone, Debug)]
pub struct ReceiveHeapEntry {
    pub id: SeqNo,
    pub payload: Vec<u8>,
    pub from: SocketAddr,
}

// Reversed so that `BinaryHeap`, a max-heap, yields the lowest id first.
impl Ord for ReceiveHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.id.cmp(&self.id)
    }
}
impl PartialOrd for ReceiveHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for ReceiveHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ReceiveHeapEntry {}

/// What the head of the heap means for a given expected id.
#[derive(Debug)]
pub enum Drained {
    /// The head carried exactly the expected id and must be delivered.
    Deliver(ReceiveHeapEntry),
    /// The head is behind the expected id and was discarded.
    Stale(ReceiveHeapEntry),
}

/// Per-peer min-heap of out-of-order DATA payloads keyed by id.
#[derive(Debug, Default)]
pub struct ReceiveHeap {
    heap: BinaryHeap<ReceiveHeapEntry>,
}

impl ReceiveHeap {
    pub fn new() -> Self {
        Self::default()
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
    /// The lowest id held.
    pub fn peek_id(&self) -> Option<SeqNo> {
        self.heap.peek().map(|e| e.id)
    }
    pub fn contains(&self, id: SeqNo) -> bool {
        self.heap.iter().any(|e| e.id == id)
    }
    /// Holds `entry` until its id comes up. Returns `false`, and holds nothing, if an entry with
    /// the same id is already held.
    pub fn push(&mut self, entry: ReceiveHeapEntry) -> bool {
        if self.contains(entry.id) {
            return false;
        }
        self.heap.push(entry);
        true
    }
    /// One step of the drain that follows an in-order delivery.
    ///
    /// Pops the head if its id equals `expected` or is behind it. Returns `None` and leaves the
    /// heap untouched once the head is ahead of `expected`, or the heap is empty.
    pub fn pop_ready(&mut self, expected: SeqNo) -> Option<Drained> {
        match self.heap.peek()?.id.cmp(&expected) {
            Ordering::Greater => None,
            Ordering::Equal => self.heap.pop().map(Drained::Deliver),
            Ordering::Less => self.heap.pop().map(Drained::Stale),
        }
    }
    /// Drops every held entry and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.heap.len();
        self.heap.clear();
        n
    }
}
