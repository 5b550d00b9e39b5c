//! Caller-facing errors.

use crate::device::DeviceError;
use crate::frame::FramingError;
use crate::layout::LayoutError;
use crate::notification::{FallbackReason, ProtocolError};
use crate::queue::RingError;

/// Errors returned by pipes, iterators and the control plane.
///
/// "No data" is never an error: empty queues and batches are reported as
/// `None` or as an empty batch.
#[derive(Debug)]
pub enum PipeError {
    /// The ring has no room for the whole request. Nothing was written.
    QueueFull,
    /// `next()` called on an iterator whose `has_next()` is false.
    IteratorExhausted,
    /// The device declined an allocation.
    PipeAllocationFailed { reason: FallbackReason },
    /// The device declined a flow rule.
    BindFailed { pipe_id: u32, reason: FallbackReason },
    /// The peer violated the shared protocol. Once returned by the control
    /// plane, every later call returns it again.
    ProtocolMismatch(ProtocolError),
    /// The pipe's teardown notification has been processed.
    PipeTornDown { pipe_id: u32 },
    /// A single message can never fit in the ring.
    MessageTooLarge { len: usize, max: usize },
    /// The batch as a whole needs more flits than the ring holds.
    BatchTooLarge { flits: u32, max: u32 },
    /// `confirm` asked for more messages than are available.
    InvalidConfirm { requested: usize, available: usize },
    /// No live pipe with this id.
    UnknownPipe { pipe_id: u32 },
    /// The allocation or bind request has already completed or never existed.
    UnknownRequest { request_id: u32 },
    /// Rejected configuration.
    InvalidConfig(&'static str),
    /// The device could not map memory.
    Device(DeviceError),
}

impl PipeError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::IteratorExhausted => write!(f, "iterator exhausted"),
            Self::PipeAllocationFailed { reason } => write!(f, "pipe allocation failed: {}", reason),
            Self::BindFailed { pipe_id, reason } => {
                write!(f, "flow rule for pipe {} declined: {}", pipe_id, reason)
            }
            Self::ProtocolMismatch(e) => write!(f, "protocol mismatch: {}", e),
            Self::PipeTornDown { pipe_id } => write!(f, "pipe {} has been torn down", pipe_id),
            Self::MessageTooLarge { len, max } => {
                write!(f, "message of {} bytes exceeds pipe limit of {}", len, max)
            }
            Self::BatchTooLarge { flits, max } => {
                write!(f, "batch of {} flits exceeds ring limit of {}", flits, max)
            }
            Self::InvalidConfirm { requested, available } => write!(
                f,
                "cannot confirm {} messages, only {} available",
                requested, available
            ),
            Self::UnknownPipe { pipe_id } => write!(f, "unknown pipe {}", pipe_id),
            Self::UnknownRequest { request_id } => write!(f, "unknown request {}", request_id),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Device(e) => write!(f, "device error: {}", e),
        }
    }
}

impl std::error::Error for PipeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ProtocolMismatch(e) => Some(e),
            Self::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for PipeError {
    fn from(e: ProtocolError) -> Self {
        PipeError::ProtocolMismatch(e)
    }
}

impl From<LayoutError> for PipeError {
    fn from(e: LayoutError) -> Self {
        PipeError::ProtocolMismatch(ProtocolError::Layout(e))
    }
}

impl From<FramingError> for PipeError {
    fn from(e: FramingError) -> Self {
        PipeError::ProtocolMismatch(ProtocolError::Framing(e))
    }
}

impl From<DeviceError> for PipeError {
    fn from(e: DeviceError) -> Self {
        PipeError::Device(e)
    }
}

/// Convert a ring error on a send path.
pub(crate) fn ring_error_to_pipe(e: RingError) -> PipeError {
    match e {
        RingError::Full => PipeError::QueueFull,
        RingError::TooLarge { requested, max } => PipeError::BatchTooLarge { flits: requested, max },
    }
}
