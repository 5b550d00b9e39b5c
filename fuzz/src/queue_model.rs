//! Queue operations against a reference deque.

use std::collections::VecDeque;

use nicpipe::{Queue, QueueConsumer, QueueProducer, RingError};

/// Smallest capacity exercised.
pub const MIN_CAPACITY: u32 = 2;
/// Largest capacity exercised. Small rings wrap often.
pub const MAX_CAPACITY: u32 = 64;

/// Operations on one queue.
#[derive(Clone, Copy, Debug)]
pub enum QueueOp {
    Enqueue(u64),
    /// Reserve `n` slots, fill them with consecutive values from `first`, and
    /// commit only if `commit` is set.
    Reserve { n: u32, first: u64, commit: bool },
    Dequeue,
    Peek,
    /// Release up to `n` elements without reading them.
    Release(u32),
    Refresh,
}

/// Map an arbitrary byte onto a valid power-of-two capacity.
pub fn capacity_from(byte: u8) -> u32 {
    let c = (byte as u32 % MAX_CAPACITY).max(MIN_CAPACITY);
    c.next_power_of_two().min(MAX_CAPACITY)
}

struct Harness {
    producer: QueueProducer<u64>,
    consumer: QueueConsumer<u64>,
    usable: usize,
    expected: VecDeque<u64>,
}

/// Run `ops` on a fresh queue, checking contents and occupancy after each.
pub fn execute_and_verify(capacity: u32, ops: &[QueueOp]) -> Result<(), String> {
    let (producer, consumer) =
        Queue::<u64>::with_capacity(capacity).map_err(|e| format!("cannot build queue: {}", e))?;
    let mut h = Harness {
        producer,
        consumer,
        usable: capacity as usize - 1,
        expected: VecDeque::new(),
    };

    for (i, op) in ops.iter().enumerate() {
        h.apply(i, *op)?;
        h.verify(i)?;
    }
    Ok(())
}

impl Harness {
    fn apply(&mut self, i: usize, op: QueueOp) -> Result<(), String> {
        match op {
            QueueOp::Enqueue(v) => match self.producer.enqueue(v) {
                Ok(()) => {
                    if self.expected.len() >= self.usable {
                        return Err(format!("op {}: enqueue succeeded into a full queue", i));
                    }
                    self.expected.push_back(v);
                }
                Err(RingError::Full) => {
                    if self.expected.len() < self.usable {
                        return Err(format!(
                            "op {}: full with {} of {} slots used",
                            i,
                            self.expected.len(),
                            self.usable
                        ));
                    }
                }
                Err(e) => return Err(format!("op {}: unexpected {:?}", i, e)),
            },
            QueueOp::Reserve { n, first, commit } => match self.producer.reserve(n) {
                Ok(mut grant) => {
                    if self.expected.len() + n as usize > self.usable {
                        return Err(format!("op {}: reserved {} with {} used", i, n, self.expected.len()));
                    }
                    let (a, b) = grant.slots_mut();
                    if a.len() + b.len() != n as usize {
                        return Err(format!("op {}: grant of {} has {} slots", i, n, a.len() + b.len()));
                    }
                    for (k, slot) in a.iter_mut().chain(b.iter_mut()).enumerate() {
                        *slot = first.wrapping_add(k as u64);
                    }
                    if commit {
                        grant.commit();
                        self.expected.extend((0..n as u64).map(|k| first.wrapping_add(k)));
                    }
                }
                Err(RingError::TooLarge { requested, max }) => {
                    if requested as usize <= self.usable || max as usize != self.usable {
                        return Err(format!("op {}: TooLarge {} / {} on usable {}", i, requested, max, self.usable));
                    }
                }
                Err(RingError::Full) => {
                    if self.expected.len() + n as usize <= self.usable {
                        return Err(format!("op {}: reserve {} refused with {} used", i, n, self.expected.len()));
                    }
                }
            },
            QueueOp::Dequeue => {
                let got = self.consumer.dequeue();
                let want = self.expected.pop_front();
                if got != want {
                    return Err(format!("op {}: dequeued {:?}, expected {:?}", i, got, want));
                }
            }
            QueueOp::Peek => {
                let got = self.consumer.peek();
                let want = self.expected.front().copied();
                if got != want {
                    return Err(format!("op {}: peeked {:?}, expected {:?}", i, got, want));
                }
            }
            QueueOp::Release(n) => {
                self.consumer.refresh();
                let released = self.consumer.release(n) as usize;
                let want = (n as usize).min(self.expected.len());
                if released != want {
                    return Err(format!("op {}: released {} of {}, expected {}", i, released, n, want));
                }
                self.expected.drain(..released);
            }
            QueueOp::Refresh => {
                self.producer.refresh();
                self.consumer.refresh();
            }
        }
        Ok(())
    }

    fn verify(&mut self, i: usize) -> Result<(), String> {
        let len = self.producer.queue().len() as usize;
        if len != self.expected.len() {
            return Err(format!("after op {}: queue holds {}, expected {}", i, len, self.expected.len()));
        }
        let free = self.producer.free_slots() as usize;
        if free + len != self.usable {
            return Err(format!("after op {}: {} free + {} used != {}", i, free, len, self.usable));
        }
        let readable = self.consumer.refresh() as usize;
        if readable != len {
            return Err(format!("after op {}: consumer sees {}, queue holds {}", i, readable, len));
        }
        let (a, b) = self.consumer.readable();
        if !a.iter().chain(b).eq(self.expected.iter()) {
            return Err(format!("after op {}: readable range differs from reference", i));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_drain_wraps() {
        let mut ops = Vec::new();
        for round in 0..5 {
            for k in 0..4 {
                ops.push(QueueOp::Enqueue(round * 4 + k));
            }
            for _ in 0..4 {
                ops.push(QueueOp::Dequeue);
            }
        }
        execute_and_verify(4, &ops).unwrap();
    }

    #[test]
    fn test_uncommitted_grant_is_invisible() {
        let ops = [
            QueueOp::Reserve { n: 2, first: 10, commit: false },
            QueueOp::Peek,
            QueueOp::Reserve { n: 3, first: 20, commit: true },
            QueueOp::Reserve { n: 5, first: 30, commit: true },
            QueueOp::Release(2),
            QueueOp::Dequeue,
            QueueOp::Dequeue,
        ];
        execute_and_verify(8, &ops).unwrap();
    }
}
