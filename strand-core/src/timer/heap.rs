//! Indexed binary min-heap of timers.
//!
//! The heap is 1-indexed: a timer's `heap_index` is its position, and 0
//! means "not queued". Every index read or write happens while the caller
//! holds the scheduler's heap lock, which is what makes membership checks
//! and cancel-vs-fire races safe.
//!
//! ```text
//!              [1] wake=10
//!             /           \
//!      [2] wake=20     [3] wake=15
//!       /      \
//!  [4] 40    [5] 25
//! ```
//!
//! Removing an interior node swaps the last element into the hole and
//! re-heapifies up or down depending on how it compares to its new parent.
//!
//! A queued timer records which heap holds it. The index is only meaningful
//! to that heap, so other heaps refuse to insert or remove it.

use super::clock::Millis;
use super::Timer;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

static HEAP_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) struct TimerHeap {
    id: u64,
    /// `items[i - 1]` holds the timer at heap position `i`.
    items: Vec<Timer>,
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::with_capacity(64)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            id: HEAP_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            items: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Earliest timer, if any.
    #[inline]
    pub(crate) fn peek(&self) -> Option<&Timer> {
        self.items.first()
    }

    /// Wake time of the root.
    #[inline]
    pub(crate) fn peek_wake(&self) -> Option<Millis> {
        self.peek().map(Timer::wake_time)
    }

    /// Queue `timer` to wake at `wake`.
    ///
    /// A timer that is already queued is dequeued first, so it is never
    /// present twice. Returns `true` if the timer became the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerBusy`] if another heap holds the timer.
    pub(crate) fn insert(&mut self, timer: Timer, wake: Millis) -> Result<bool> {
        if !timer.claim(self.id) {
            return Err(Error::TimerBusy(timer.id()));
        }
        if timer.heap_index() != 0 {
            self.take_at(timer.heap_index());
        }

        timer.set_wake_time(wake);
        self.items.push(timer);
        let index = self.items.len();
        self.at(index).set_heap_index(index);

        Ok(self.sift_up(index) == 1)
    }

    /// Dequeue `timer` if it is queued in this heap.
    pub(crate) fn remove(&mut self, timer: &Timer) -> bool {
        if timer.queued_in() != self.id {
            return false;
        }
        let index = timer.heap_index();
        if index == 0 || index > self.items.len() || !self.at(index).ptr_eq(timer) {
            return false;
        }

        self.remove_at(index);
        true
    }

    /// Pop the root if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Millis) -> Option<Timer> {
        match self.peek_wake() {
            Some(wake) if wake <= now => Some(self.remove_at(1)),
            _ => None,
        }
    }

    /// Remove every queued timer, clearing their indices.
    pub(crate) fn drain(&mut self) -> Vec<Timer> {
        let drained: Vec<Timer> = self.items.drain(..).collect();
        for timer in &drained {
            timer.set_heap_index(0);
            timer.release();
        }
        drained
    }

    /// Check the heap ordering and index bookkeeping.
    pub(crate) fn is_valid(&self) -> bool {
        (1..=self.items.len()).all(|i| {
            let timer = self.at(i);
            let ordered = i == 1 || self.at(i / 2).wake_time() <= timer.wake_time();
            ordered && timer.heap_index() == i && timer.queued_in() == self.id
        })
    }

    fn remove_at(&mut self, index: usize) -> Timer {
        let removed = self.take_at(index);
        removed.release();
        removed
    }

    /// Unlink the timer at `index`, keeping its claim on this heap.
    fn take_at(&mut self, index: usize) -> Timer {
        let removed = self.items.swap_remove(index - 1);
        removed.set_heap_index(0);

        if index <= self.items.len() {
            self.at(index).set_heap_index(index);
            if index > 1 && self.at(index).wake_time() < self.at(index / 2).wake_time() {
                self.sift_up(index);
            } else {
                self.sift_down(index);
            }
        }

        removed
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 1 {
            let parent = index / 2;
            if self.at(parent).wake_time() <= self.at(index).wake_time() {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = index * 2;
            if left > len {
                break;
            }

            let right = left + 1;
            let child = if right <= len && self.at(right).wake_time() < self.at(left).wake_time() {
                right
            } else {
                left
            };

            if self.at(index).wake_time() <= self.at(child).wake_time() {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }

    #[inline]
    fn at(&self, index: usize) -> &Timer {
        &self.items[index - 1]
    }

    #[inline]
    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a - 1, b - 1);
        self.at(a).set_heap_index(a);
        self.at(b).set_heap_index(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn timer() -> Timer {
        Timer::new(|_| {})
    }

    #[test]
    fn test_insert_orders_by_wake_time() {
        let mut heap = TimerHeap::new();
        let a = timer();
        let b = timer();
        let c = timer();

        assert!(heap.insert(a.clone(), 100).unwrap());
        assert!(heap.insert(b.clone(), 50).unwrap());
        assert!(!heap.insert(c.clone(), 150).unwrap());

        assert_eq!(heap.peek_wake(), Some(50));
        assert!(heap.is_valid());

        assert!(heap.pop_due(49).is_none());
        assert!(heap.pop_due(100).unwrap().ptr_eq(&b));
        assert!(heap.pop_due(100).unwrap().ptr_eq(&a));
        assert!(heap.pop_due(100).is_none());
        assert_eq!(heap.len(), 1);
        assert_eq!(c.heap_index(), 1);
    }

    #[test]
    fn test_reinsert_does_not_duplicate() {
        let mut heap = TimerHeap::new();
        let a = timer();
        heap.insert(a.clone(), 100).unwrap();
        heap.insert(a.clone(), 10).unwrap();
        heap.insert(a.clone(), 70).unwrap();

        assert_eq!(heap.len(), 1);
        assert_eq!(heap.peek_wake(), Some(70));
    }

    #[test]
    fn test_remove_interior_node() {
        let mut heap = TimerHeap::new();
        let timers: Vec<Timer> = (0..10).map(|_| timer()).collect();
        for (i, t) in timers.iter().enumerate() {
            heap.insert(t.clone(), (i as u64 * 37) % 11).unwrap();
        }

        assert!(heap.remove(&timers[3]));
        assert!(!heap.remove(&timers[3]));
        assert_eq!(timers[3].heap_index(), 0);
        assert_eq!(heap.len(), 9);
        assert!(heap.is_valid());
    }

    #[test]
    fn test_remove_foreign_timer_is_noop() {
        let mut heap = TimerHeap::new();
        let mut other = TimerHeap::new();
        let a = timer();
        let b = timer();
        heap.insert(a.clone(), 5).unwrap();
        other.insert(b.clone(), 5).unwrap();

        assert!(!heap.remove(&b));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_timer_held_by_one_heap() {
        let mut heap = TimerHeap::new();
        let mut other = TimerHeap::new();
        let a = timer();
        let b = timer();
        heap.insert(b.clone(), 3).unwrap();
        heap.insert(a.clone(), 5).unwrap();

        assert!(matches!(other.insert(a.clone(), 1), Err(Error::TimerBusy(id)) if id == a.id()));
        assert!(!other.remove(&a));
        assert!(other.is_empty());
        assert_eq!(heap.len(), 2);
        assert!(heap.is_valid());
        assert_eq!(heap.peek_wake(), Some(3));

        assert!(heap.remove(&a));
        assert!(other.insert(a.clone(), 1).unwrap());
        assert!(other.is_valid());
        assert!(!heap.remove(&a));
    }

    #[test]
    fn test_drain_clears_indices() {
        let mut heap = TimerHeap::new();
        let a = timer();
        heap.insert(a.clone(), 1).unwrap();
        let drained = heap.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(a.heap_index(), 0);
        assert!(heap.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Schedule(usize, u64),
        Cancel(usize),
        Fire(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..16usize, 0..1_000u64).prop_map(|(t, w)| Op::Schedule(t, w)),
            (0..16usize).prop_map(Op::Cancel),
            (0..1_000u64).prop_map(Op::Fire),
        ]
    }

    proptest! {
        #[test]
        fn prop_heap_invariant_holds(ops in proptest::collection::vec(op(), 1..200)) {
            let mut heap = TimerHeap::new();
            let timers: Vec<Timer> = (0..16).map(|_| timer()).collect();

            for op in ops {
                match op {
                    Op::Schedule(t, wake) => {
                        heap.insert(timers[t].clone(), wake).unwrap();
                    }
                    Op::Cancel(t) => {
                        heap.remove(&timers[t]);
                    }
                    Op::Fire(now) => {
                        while let Some(fired) = heap.pop_due(now) {
                            prop_assert!(fired.wake_time() <= now);
                            prop_assert_eq!(fired.heap_index(), 0);
                        }
                        if let Some(wake) = heap.peek_wake() {
                            prop_assert!(wake > now);
                        }
                    }
                }

                prop_assert!(heap.is_valid());
                let queued = timers.iter().filter(|t| t.heap_index() != 0).count();
                prop_assert_eq!(queued, heap.len());
            }
        }
    }
}
