//! Transmit pipes: all-or-nothing batches into device rings.

use crate::error::{ring_error_to_pipe, PipeError};
use crate::frame::{encode_messages, max_payload, MESSAGE_HEADER_LEN};
use crate::layout::{Flit, FLIT_SIZE};
use crate::queue::{Queue, QueueProducer};

use super::{PipeRing, PipeStats};

/// Transmit side of a pipe. This handle produces, the device consumes.
pub struct TxPipe {
    ring: PipeRing,
    producer: QueueProducer<Flit>,
    stats: PipeStats,
}

impl TxPipe {
    pub(crate) fn new(ring: PipeRing, queue: Queue<Flit>) -> Self {
        Self {
            ring,
            producer: queue.into_producer(),
            stats: PipeStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.ring.pipe_id()
    }

    pub fn ring(&self) -> &PipeRing {
        &self.ring
    }

    pub fn is_torn_down(&self) -> bool {
        self.ring.state().is_torn_down()
    }

    pub fn stats(&self) -> PipeStats {
        self.stats
    }

    /// Largest payload this pipe can ever carry in one message.
    pub fn max_message_len(&self) -> usize {
        max_payload(self.ring.ring_size())
    }

    /// Send a batch of messages.
    ///
    /// The whole batch is published at once or not at all. `QueueFull`
    /// means the ring currently lacks room; retrying is up to the caller.
    pub fn send(&mut self, messages: &[&[u8]]) -> Result<(), PipeError> {
        self.ring.check_alive()?;
        let max = self.max_message_len();
        if let Some(msg) = messages.iter().find(|m| m.len() > max) {
            return Err(PipeError::MessageTooLarge { len: msg.len(), max });
        }
        if let Err(e) = encode_messages(&mut self.producer, messages) {
            tracing::trace!(pipe_id = self.id(), error = %e, "tx batch rejected");
            return Err(ring_error_to_pipe(e));
        }
        if !messages.is_empty() {
            let bytes: usize = messages.iter().map(|m| m.len()).sum();
            self.stats.record(messages.len() as u64, bytes as u64);
            self.stats.batches += 1;
        }
        Ok(())
    }

    /// Send a single message.
    pub fn send_one(&mut self, message: &[u8]) -> Result<(), PipeError> {
        self.send(&[message])
    }

    /// Largest single message the ring can accept right now.
    pub fn capacity(&mut self) -> Result<usize, PipeError> {
        self.ring.check_alive()?;
        let free = self.producer.free_slots() as usize;
        Ok((free * FLIT_SIZE).saturating_sub(MESSAGE_HEADER_LEN))
    }

    /// Flits sent and not yet consumed by the device.
    pub fn pending(&mut self) -> Result<u32, PipeError> {
        self.ring.check_alive()?;
        self.producer.refresh();
        Ok(self.producer.pending())
    }
}

impl std::fmt::Debug for TxPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxPipe")
            .field("ring", &self.ring)
            .field("head", &self.producer.head())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::frame::drain_messages;
    use crate::layout::queue_footprint;
    use crate::pipe::PipeState;
    use crate::queue::QueueConsumer;
    use crate::region::heap_region;

    fn tx_pipe(capacity: u32) -> (TxPipe, QueueConsumer<Flit>, Arc<PipeState>) {
        let region = heap_region(queue_footprint::<Flit>(capacity)).unwrap();
        let device = Queue::<Flit>::init(region.clone(), capacity).unwrap().into_consumer();
        let state = Arc::new(PipeState::default());
        let ring = PipeRing {
            pipe_id: 3,
            ring_base: 0,
            ring_size: capacity,
            state: state.clone(),
        };
        (TxPipe::new(ring, Queue::attach(region).unwrap()), device, state)
    }

    #[test]
    fn test_send_then_device_drains() {
        let (mut pipe, mut dev, _) = tx_pipe(16);
        pipe.send(&[b"ping", b"pong"]).unwrap();
        assert_eq!(pipe.pending().unwrap(), 2);
        assert_eq!(drain_messages(&mut dev).unwrap(), vec![b"ping".to_vec(), b"pong".to_vec()]);
        assert_eq!(pipe.pending().unwrap(), 0);
        assert_eq!(pipe.stats().messages, 2);
    }

    #[test]
    fn test_full_ring_accepts_nothing() {
        let (mut pipe, mut dev, _) = tx_pipe(4);
        pipe.send(&[b"a", b"b"]).unwrap();
        assert!(matches!(pipe.send(&[b"c", b"d"]), Err(PipeError::QueueFull)));
        assert_eq!(drain_messages(&mut dev).unwrap().len(), 2);
        pipe.send(&[b"c", b"d"]).unwrap();
        assert_eq!(drain_messages(&mut dev).unwrap(), vec![b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_oversized_message() {
        let (mut pipe, _dev, _) = tx_pipe(4);
        let big = vec![0u8; pipe.max_message_len() + 1];
        assert!(matches!(
            pipe.send(&[&big]),
            Err(PipeError::MessageTooLarge { max: 184, .. })
        ));
        let fits = vec![0u8; pipe.max_message_len()];
        pipe.send_one(&fits).unwrap();
        assert_eq!(pipe.capacity().unwrap(), 0);
    }

    #[test]
    fn test_batch_larger_than_ring() {
        let (mut pipe, _dev, _) = tx_pipe(4);
        assert!(matches!(
            pipe.send(&[b"a", b"b", b"c", b"d"]),
            Err(PipeError::BatchTooLarge { flits: 4, max: 3 })
        ));
    }

    #[test]
    fn test_send_after_teardown() {
        let (mut pipe, _dev, state) = tx_pipe(4);
        state.tear_down();
        assert!(matches!(pipe.send_one(b"x"), Err(PipeError::PipeTornDown { pipe_id: 3 })));
    }
}
