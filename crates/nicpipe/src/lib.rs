//! nicpipe: kernel-bypass NIC pipes over lock-free shared-memory rings.
//!
//! The NIC and the application share memory. Packets move through per-pipe
//! rings, control events move through a pair of notification queues, and
//! every ring has exactly one producer and one consumer, so the only
//! synchronization is an acquire/release pair on each cursor.
//!
//! # Characteristics
//!
//! - SPSC rings with cached far cursors
//! - Zero-copy receive: messages are read in place, even across the wrap
//! - All-or-nothing transmit batches
//! - Non-blocking everywhere; optional socketpair doorbells for wakeups
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Notification buffers (at REG_NOTIF_BUF_BASE)                    │
//! │    device → software queue   |   software → device queue         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Rx ring, pipe 7    [QueueHeader][flit][flit]...                 │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Tx ring, pipe 8    [QueueHeader][flit][flit]...                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`ControlPlane`] owns the notification buffers and hands out pipes;
//! [`RxPipe`], [`TxPipe`] and [`RxTxPipe`] are owned by the thread that
//! collected them. The memory itself comes from a [`Device`].

pub mod config;
pub mod control;
pub mod device;
pub mod doorbell;
pub mod error;
pub mod frame;
pub mod iter;
pub mod layout;
pub mod notification;
pub mod pipe;
pub mod queue;
pub mod region;

pub use config::{
    PipeConfig, DEFAULT_BATCH_LIMIT, DEFAULT_NOTIFICATION_CAPACITY, DEFAULT_NOTIF_BUF_OFFSET, DEFAULT_PIPE_CAPACITY,
};
pub use control::{ControlPlane, MmioTicket, PendingBind, PendingPipe, RoundRobinStatus};
pub use device::{regs, Device, DeviceError};
pub use doorbell::Doorbell;
pub use error::PipeError;
pub use frame::{FramingError, MessageHeader};
pub use iter::{
    Consuming, IterKind, MessageBatch, MessageIter, MessageIterator, MessageView, PeekPktIterator, Peeking,
    PktIterator,
};
pub use layout::{Flit, LayoutError, FLIT_SIZE};
pub use notification::{
    AllocatePipeNotification, FallbackNotification, FallbackReason, FlowRule, FlowRuleNotification,
    FreePipeNotification, MmioNotification, MmioOp, NotifBufNotification, NotifBufOp, Notification,
    NotificationBufPair, NotificationRecord, NotificationTag, PipeEvent, PipeNotification, ProtocolError,
    RingDirection, RoundRobinNotification,
};
pub use pipe::{Pipe, PipeKind, PipeRing, PipeStats, RxPipe, RxTxPipe, TxPipe};
pub use queue::{Grant, Queue, QueueConsumer, QueueProducer, RingError};
pub use region::{MappedRegion, RegionError, SharedRegion};

/// The names most applications need.
pub mod prelude {
    pub use crate::{
        ControlPlane, Device, MessageIterator, Pipe, PipeConfig, PipeError, PipeKind, RxPipe, RxTxPipe, TxPipe,
    };
}
