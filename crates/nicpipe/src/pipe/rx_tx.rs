//! Rx/Tx pairs with a shared lifetime.

use std::ops::Range;

use crate::error::PipeError;
use crate::iter::{MessageIterator, Peeking};

use super::{RxPipe, TxPipe};

/// An Rx and a Tx pipe allocated together.
///
/// The pair is only closed once both halves have been torn down.
#[derive(Debug)]
pub struct RxTxPipe {
    rx: RxPipe,
    tx: TxPipe,
    scratch: Vec<u8>,
}

impl RxTxPipe {
    pub(crate) fn new(rx: RxPipe, tx: TxPipe) -> Self {
        Self {
            rx,
            tx,
            scratch: Vec::new(),
        }
    }

    pub fn rx(&self) -> &RxPipe {
        &self.rx
    }

    pub fn tx(&self) -> &TxPipe {
        &self.tx
    }

    pub fn rx_mut(&mut self) -> &mut RxPipe {
        &mut self.rx
    }

    pub fn tx_mut(&mut self) -> &mut TxPipe {
        &mut self.tx
    }

    pub fn into_parts(self) -> (RxPipe, TxPipe) {
        (self.rx, self.tx)
    }

    /// Both halves have been torn down.
    pub fn is_closed(&self) -> bool {
        self.rx.is_torn_down() && self.tx.is_torn_down()
    }

    /// Send back everything received, unchanged, up to `limit` flits.
    ///
    /// Received messages are released only once the transmit has been
    /// accepted, so on `QueueFull` nothing is lost. Returns the number of
    /// messages forwarded.
    pub fn forward_batch(&mut self, limit: u32) -> Result<usize, PipeError> {
        self.scratch.clear();
        let mut ranges: Vec<Range<usize>> = Vec::new();
        {
            let mut iter = self.rx.recv_batch::<Peeking>(limit)?.iter();
            while iter.has_next() {
                let view = iter.next()?;
                let start = self.scratch.len();
                let (a, b) = view.segments();
                self.scratch.extend_from_slice(a);
                self.scratch.extend_from_slice(b);
                ranges.push(start..self.scratch.len());
            }
        }
        if ranges.is_empty() {
            return Ok(0);
        }

        let messages: Vec<&[u8]> = ranges.iter().map(|r| &self.scratch[r.clone()]).collect();
        self.tx.send(&messages)?;
        self.rx.confirm(ranges.len())?;
        Ok(ranges.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::frame::{drain_messages, encode_messages};
    use crate::layout::{queue_footprint, Flit};
    use crate::pipe::{PipeRing, PipeState};
    use crate::queue::{Queue, QueueConsumer, QueueProducer};
    use crate::region::heap_region;

    struct Loopback {
        pipe: RxTxPipe,
        to_rx: QueueProducer<Flit>,
        from_tx: QueueConsumer<Flit>,
        rx_state: Arc<PipeState>,
        tx_state: Arc<PipeState>,
    }

    fn ring(pipe_id: u32, capacity: u32) -> (PipeRing, Arc<PipeState>, Queue<Flit>, Queue<Flit>) {
        let region = heap_region(queue_footprint::<Flit>(capacity)).unwrap();
        let device = Queue::<Flit>::init(region.clone(), capacity).unwrap();
        let state = Arc::new(PipeState::default());
        let ring = PipeRing {
            pipe_id,
            ring_base: 0,
            ring_size: capacity,
            state: state.clone(),
        };
        (ring, state, device, Queue::attach(region).unwrap())
    }

    fn loopback(rx_capacity: u32, tx_capacity: u32) -> Loopback {
        let (rx_ring, rx_state, rx_dev, rx_q) = ring(1, rx_capacity);
        let (tx_ring, tx_state, tx_dev, tx_q) = ring(2, tx_capacity);
        Loopback {
            pipe: RxTxPipe::new(RxPipe::new(rx_ring, rx_q, false, 64), TxPipe::new(tx_ring, tx_q)),
            to_rx: rx_dev.into_producer(),
            from_tx: tx_dev.into_consumer(),
            rx_state,
            tx_state,
        }
    }

    #[test]
    fn test_forward_echoes_messages() {
        let mut lb = loopback(16, 16);
        encode_messages(&mut lb.to_rx, &[b"alpha", b"beta"]).unwrap();
        assert_eq!(lb.pipe.forward_batch(64).unwrap(), 2);
        assert_eq!(drain_messages(&mut lb.from_tx).unwrap(), vec![b"alpha".to_vec(), b"beta".to_vec()]);
        assert_eq!(lb.pipe.rx_mut().available().unwrap(), 0);
        assert_eq!(lb.pipe.forward_batch(64).unwrap(), 0);
    }

    #[test]
    fn test_forward_keeps_input_when_tx_full() {
        let mut lb = loopback(16, 4);
        lb.pipe.tx_mut().send(&[b"x", b"y"]).unwrap();
        encode_messages(&mut lb.to_rx, &[b"m1", b"m2"]).unwrap();

        assert!(matches!(lb.pipe.forward_batch(64), Err(PipeError::QueueFull)));
        assert_eq!(lb.pipe.rx_mut().peek_pkts().unwrap().len(), 2);

        drain_messages(&mut lb.from_tx).unwrap();
        assert_eq!(lb.pipe.forward_batch(64).unwrap(), 2);
    }

    #[test]
    fn test_closed_only_when_both_halves_down() {
        let lb = loopback(4, 4);
        assert!(!lb.pipe.is_closed());
        lb.rx_state.tear_down();
        assert!(!lb.pipe.is_closed());
        lb.tx_state.tear_down();
        assert!(lb.pipe.is_closed());
    }
}
