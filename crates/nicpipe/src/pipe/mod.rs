//! Pipes: application handles over device rings.
//!
//! A pipe is built from an [`AllocatePipeNotification`] by the control plane
//! and owned by one thread afterwards. The control plane keeps a shared
//! [`PipeState`] for each pipe so that a `FreePipe` notification can retire
//! the handle wherever it lives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device::Device;
use crate::error::PipeError;
use crate::layout::{queue_footprint, Flit};
use crate::notification::{AllocatePipeNotification, NotificationTag, ProtocolError};
use crate::queue::Queue;

mod rx;
mod rx_tx;
mod tx;

pub use rx::RxPipe;
pub use rx_tx::RxTxPipe;
pub use tx::TxPipe;

/// What to ask the device for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Rx,
    /// Rx pipe that receives traffic no other pipe matched.
    FallbackRx,
    Tx,
    /// One Rx and one Tx ring with a shared lifetime.
    RxTx,
    /// An Rx/Tx pair whose Rx half is a fallback pipe.
    FallbackRxTx,
}

/// A pipe produced by the control plane.
#[derive(Debug)]
pub enum Pipe {
    Rx(RxPipe),
    Tx(TxPipe),
    RxTx(RxTxPipe),
}

impl Pipe {
    pub fn into_rx(self) -> Option<RxPipe> {
        match self {
            Pipe::Rx(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_tx(self) -> Option<TxPipe> {
        match self {
            Pipe::Tx(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_rx_tx(self) -> Option<RxTxPipe> {
        match self {
            Pipe::RxTx(p) => Some(p),
            _ => None,
        }
    }
}

/// Liveness shared between a pipe handle and the control plane.
#[derive(Debug, Default)]
pub struct PipeState {
    torn_down: AtomicBool,
}

impl PipeState {
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn tear_down(&self) {
        self.torn_down.store(true, Ordering::Release);
    }
}

/// The device ring behind one pipe direction.
#[derive(Debug, Clone)]
pub struct PipeRing {
    pipe_id: u32,
    ring_base: u64,
    ring_size: u32,
    state: Arc<PipeState>,
}

impl PipeRing {
    #[inline]
    pub fn pipe_id(&self) -> u32 {
        self.pipe_id
    }

    /// Offset of the ring in device memory.
    #[inline]
    pub fn ring_base(&self) -> u64 {
        self.ring_base
    }

    /// Ring capacity in flits.
    #[inline]
    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub fn state(&self) -> &Arc<PipeState> {
        &self.state
    }

    pub(crate) fn check_alive(&self) -> Result<(), PipeError> {
        if self.state.is_torn_down() {
            return Err(PipeError::PipeTornDown {
                pipe_id: self.pipe_id,
            });
        }
        Ok(())
    }
}

/// Map and validate the ring announced by `grant`.
///
/// The device lays the ring out before announcing it; a ring whose header
/// disagrees with the announced size is a protocol violation.
pub(crate) fn attach_ring<D: Device + ?Sized>(
    device: &D,
    grant: &AllocatePipeNotification,
) -> Result<(PipeRing, Queue<Flit>), PipeError> {
    let len = queue_footprint::<Flit>(grant.ring_size);
    let region = device.map_region(grant.ring_base, len)?;
    let queue = Queue::<Flit>::attach(region)?;
    if queue.capacity() != grant.ring_size {
        return Err(PipeError::ProtocolMismatch(ProtocolError::InvalidField {
            tag: NotificationTag::AllocatePipe,
            field: "ring_size",
            value: grant.ring_size as u64,
        }));
    }
    let ring = PipeRing {
        pipe_id: grant.pipe_id,
        ring_base: grant.ring_base,
        ring_size: grant.ring_size,
        state: Arc::new(PipeState::default()),
    };
    Ok((ring, queue))
}

/// Counters kept by a pipe handle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    /// Messages received (consumed) or sent.
    pub messages: u64,
    /// Payload bytes, excluding headers and padding.
    pub bytes: u64,
    /// Non-empty batches consumed or sent. Peeking alone does not count.
    pub batches: u64,
}

impl PipeStats {
    pub(crate) fn record(&mut self, messages: u64, bytes: u64) {
        self.messages += messages;
        self.bytes += bytes;
    }
}
