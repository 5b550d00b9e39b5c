//! Loom model of the queue cursor protocol.
//!
//! The production queue lives in shared memory and cannot run under loom, so
//! this is the same algorithm over loom atomics: masked head and tail, one
//! reserved slot, cached far cursors re-read only when the cached view is full
//! or empty, and a sequence stamp in every record.
//!
//! Keep capacities at 2-4 and message counts low; loom explores every
//! interleaving.

use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicU32, Ordering};
use loom::sync::Arc;

// ============================================================================
// Model
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Record {
    seq: u32,
    value: u64,
}

struct LoomQueue {
    head: AtomicU32,
    tail: AtomicU32,
    mask: u32,
    slots: Vec<UnsafeCell<Record>>,
}

// SAFETY: slots are only touched by the side that owns them under the
// cursor protocol, which is what the model checks.
unsafe impl Sync for LoomQueue {}

impl LoomQueue {
    fn new(capacity: u32) -> Arc<Self> {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| UnsafeCell::new(Record { seq: 0, value: 0 })).collect();
        Arc::new(Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            mask: capacity - 1,
            slots,
        })
    }
}

struct Producer {
    queue: Arc<LoomQueue>,
    head: u32,
    cached_tail: u32,
    seq: u32,
}

impl Producer {
    fn new(queue: Arc<LoomQueue>) -> Self {
        Self {
            queue,
            head: 0,
            cached_tail: 0,
            seq: 1,
        }
    }

    fn enqueue(&mut self, value: u64) -> Result<(), u64> {
        let next = (self.head + 1) & self.queue.mask;
        if next == self.cached_tail {
            self.cached_tail = self.queue.tail.load(Ordering::Acquire) & self.queue.mask;
            if next == self.cached_tail {
                return Err(value);
            }
        }
        let record = Record { seq: self.seq, value };
        self.queue.slots[self.head as usize].with_mut(|ptr| unsafe { ptr.write(record) });
        self.queue.head.store(next, Ordering::Release);
        self.head = next;
        self.seq = self.seq.wrapping_add(1).max(1);
        Ok(())
    }
}

struct Consumer {
    queue: Arc<LoomQueue>,
    tail: u32,
    cached_head: u32,
    seq: u32,
}

impl Consumer {
    fn new(queue: Arc<LoomQueue>) -> Self {
        Self {
            queue,
            tail: 0,
            cached_head: 0,
            seq: 1,
        }
    }

    fn dequeue(&mut self) -> Option<u64> {
        if self.cached_head == self.tail {
            self.cached_head = self.queue.head.load(Ordering::Acquire) & self.queue.mask;
            if self.cached_head == self.tail {
                return None;
            }
        }
        let record = self.queue.slots[self.tail as usize].with(|ptr| unsafe { ptr.read() });
        assert_eq!(record.seq, self.seq, "stale or torn record");
        self.tail = (self.tail + 1) & self.queue.mask;
        self.queue.tail.store(self.tail, Ordering::Release);
        self.seq = self.seq.wrapping_add(1).max(1);
        Some(record.value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn loom_published_record_is_visible() {
    loom::model(|| {
        let queue = LoomQueue::new(2);
        let mut producer = Producer::new(queue.clone());
        let mut consumer = Consumer::new(queue);

        let t = loom::thread::spawn(move || {
            assert!(producer.enqueue(42).is_ok());
        });

        let first = consumer.dequeue();
        t.join().unwrap();
        match first {
            Some(v) => assert_eq!(v, 42),
            None => assert_eq!(consumer.dequeue(), Some(42)),
        }
        assert_eq!(consumer.dequeue(), None);
    });
}

#[test]
fn loom_reserved_slot_bounds_occupancy() {
    loom::model(|| {
        let queue = LoomQueue::new(2);
        let mut producer = Producer::new(queue.clone());
        let mut consumer = Consumer::new(queue);

        assert!(producer.enqueue(1).is_ok());
        assert_eq!(producer.enqueue(2), Err(2));

        let t = loom::thread::spawn(move || consumer.dequeue());
        let second = producer.enqueue(2);
        let got = t.join().unwrap();

        assert_eq!(got, Some(1));
        // Freed or not, never more than one record in flight.
        if second.is_ok() {
            assert_eq!(producer.enqueue(3), Err(3));
        }
    });
}

#[test]
fn loom_fifo_across_wrap() {
    loom::model(|| {
        let queue = LoomQueue::new(2);
        let mut producer = Producer::new(queue.clone());
        let mut consumer = Consumer::new(queue);

        let t = loom::thread::spawn(move || {
            let mut next = 0;
            while next < 3 {
                if producer.enqueue(next).is_ok() {
                    next += 1;
                } else {
                    loom::thread::yield_now();
                }
            }
        });

        let mut got = Vec::new();
        while got.len() < 3 {
            match consumer.dequeue() {
                Some(v) => got.push(v),
                None => loom::thread::yield_now(),
            }
        }
        t.join().unwrap();
        assert_eq!(got, vec![0, 1, 2]);
    });
}

#[test]
fn loom_cached_cursor_never_overwrites_unread() {
    loom::model(|| {
        let queue = LoomQueue::new(4);
        let mut producer = Producer::new(queue.clone());
        let mut consumer = Consumer::new(queue);

        for v in 0..3 {
            assert!(producer.enqueue(v).is_ok());
        }

        let t = loom::thread::spawn(move || {
            let a = consumer.dequeue();
            let b = consumer.dequeue();
            (consumer, a, b)
        });
        let sent_more = producer.enqueue(3).is_ok();
        let (mut consumer, a, b) = t.join().unwrap();

        assert_eq!(a, Some(0));
        assert_eq!(b, Some(1));
        assert_eq!(consumer.dequeue(), Some(2));
        if sent_more {
            assert_eq!(consumer.dequeue(), Some(3));
        }
        assert_eq!(consumer.dequeue(), None);
    });
}
