//! Bounded MPMC queue that always yields the smallest-keyed element.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{Condvar, Mutex},
    time::Duration,
};

use thiserror::Error;

/// What `push` does when the queue is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FullPolicy {
    /// Block until a popper makes room (backpressure).
    Block,
    /// Fail immediately, handing the item back.
    Reject,
}

#[derive(Debug, Error)]
pub enum PushError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("queue is closed")]
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the item that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

struct Entry<T> {
    key: i64,
    seq: u64,
    item: T,
}

// Reversed so BinaryHeap (a max-heap) pops the smallest key; sequence
// numbers break ties FIFO.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// Bounded multi-producer/multi-consumer min-heap keyed by a caller-supplied
/// function.
///
/// `pop` always returns the smallest key currently enqueued, so a single
/// consumer draining the queue observes keys in non-decreasing order no
/// matter how producers interleave. Capacity is enforced on `push` with
/// either blocking or rejecting semantics, chosen at construction.
pub struct OrderedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: FullPolicy,
    key: Box<dyn Fn(&T) -> i64 + Send + Sync>,
}

impl<T> OrderedQueue<T> {
    pub fn new(
        capacity: usize,
        policy: FullPolicy,
        key: impl Fn(&T) -> i64 + Send + Sync + 'static,
    ) -> Self {
        assert!(capacity > 0, "ordered queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                next_seq: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
            key,
        }
    }

    /// Insert an item, waking one waiting popper.
    ///
    /// With [`FullPolicy::Block`] this waits for room and only fails once
    /// the queue is closed; with [`FullPolicy::Reject`] a full queue fails
    /// immediately.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Err(PushError::Closed(item));
        }

        while inner.heap.len() >= self.capacity {
            match self.policy {
                FullPolicy::Reject => return Err(PushError::Full(item)),
                FullPolicy::Block => {
                    inner = self.not_full.wait(inner).unwrap();
                    if inner.closed {
                        return Err(PushError::Closed(item));
                    }
                }
            }
        }

        let key = (self.key)(&item);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { key, seq, item });
        drop(inner);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Wait up to `timeout` for an item and move out the current minimum.
    ///
    /// A zero timeout polls. Returns `None` on timeout, or immediately once
    /// the queue is closed and drained.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();

        if inner.heap.is_empty() && !inner.closed && !timeout.is_zero() {
            let (guard, _timeout_result) = self
                .not_empty
                .wait_timeout_while(inner, timeout, |inner| {
                    inner.heap.is_empty() && !inner.closed
                })
                .unwrap();
            inner = guard;
        }

        let entry = inner.heap.pop()?;
        drop(inner);

        self.not_full.notify_one();
        Some(entry.item)
    }

    /// Number of items currently enqueued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: subsequent pushes fail, blocked pushers and poppers
    /// wake, and pops keep draining what is left before returning `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);

        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Instant,
    };

    fn identity_queue(capacity: usize, policy: FullPolicy) -> OrderedQueue<i64> {
        OrderedQueue::new(capacity, policy, |item| *item)
    }

    /// Deterministic xorshift so permutation tests need no external crates.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn pops_come_out_sorted_for_any_push_order() {
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        for _round in 0..50 {
            let queue = identity_queue(64, FullPolicy::Reject);
            let mut values: Vec<i64> = (0..40).collect();
            // Fisher-Yates with the deterministic generator.
            for i in (1..values.len()).rev() {
                let j = (rng.next() as usize) % (i + 1);
                values.swap(i, j);
            }
            for &v in &values {
                queue.push(v).unwrap();
            }
            let popped: Vec<i64> = std::iter::from_fn(|| queue.pop(Duration::ZERO)).collect();
            let sorted: Vec<i64> = (0..40).collect();
            assert_eq!(popped, sorted);
        }
    }

    #[test]
    fn equal_keys_pop_in_push_order() {
        let queue = OrderedQueue::new(8, FullPolicy::Reject, |_item: &&str| 7);
        queue.push("first").unwrap();
        queue.push("second").unwrap();
        queue.push("third").unwrap();
        assert_eq!(queue.pop(Duration::ZERO), Some("first"));
        assert_eq!(queue.pop(Duration::ZERO), Some("second"));
        assert_eq!(queue.pop(Duration::ZERO), Some("third"));
    }

    #[test]
    fn reject_policy_fails_fast_at_capacity() {
        let queue = identity_queue(2, FullPolicy::Reject);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        match queue.push(3) {
            Err(PushError::Full(item)) => assert_eq!(item, 3),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn blocking_push_waits_for_a_popper() {
        let queue = Arc::new(identity_queue(1, FullPolicy::Block));
        queue.push(10).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.push(20).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1, "producer must still be blocked");
        assert_eq!(queue.pop(Duration::from_millis(100)), Some(10));
        producer.join().unwrap();
        assert_eq!(queue.pop(Duration::from_millis(100)), Some(20));
    }

    #[test]
    fn pop_times_out_without_side_effects() {
        let queue = identity_queue(4, FullPolicy::Block);
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)), None);
        assert!(started.elapsed() >= Duration::from_millis(45));
        queue.push(1).unwrap();
        assert_eq!(queue.pop(Duration::ZERO), Some(1));
    }

    #[test]
    fn close_drains_then_returns_none_and_rejects_pushes() {
        let queue = identity_queue(4, FullPolicy::Block);
        queue.push(2).unwrap();
        queue.push(1).unwrap();
        queue.close();

        assert!(matches!(queue.push(3), Err(PushError::Closed(3))));
        assert_eq!(queue.pop(Duration::ZERO), Some(1));
        assert_eq!(queue.pop(Duration::ZERO), Some(2));
        // Closed and drained: even a long timeout returns immediately.
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_secs(5)), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn close_wakes_a_blocked_pusher() {
        let queue = Arc::new(identity_queue(1, FullPolicy::Block));
        queue.push(1).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(matches!(producer.join().unwrap(), Err(PushError::Closed(2))));
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity_and_drain_sorted() {
        let capacity = 8;
        let queue = Arc::new(identity_queue(capacity, FullPolicy::Block));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let total: i64 = 200;

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for v in (p..total).step_by(4) {
                        queue.push(v).unwrap();
                    }
                })
            })
            .collect();

        let mut popped = Vec::with_capacity(total as usize);
        while popped.len() < total as usize {
            if let Some(v) = queue.pop(Duration::from_millis(100)) {
                popped.push(v);
            }
            let len = queue.len();
            max_seen.fetch_max(len, Ordering::Relaxed);
        }
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(max_seen.load(Ordering::Relaxed) <= capacity);
        let mut sorted = popped.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..total).collect::<Vec<_>>());
    }
}
