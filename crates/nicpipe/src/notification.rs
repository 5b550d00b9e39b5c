//! Notification protocol between software and the device.
//!
//! Notifications are fixed-size tagged records carried by a pair of SPSC
//! queues, one per direction, so neither direction can starve the other.
//!
//! # Wire format
//!
//! ```text
//! ┌────────┬─────────┬────────┬──────────────────────────────────────┐
//! │ tag u16│ ver u16 │ seq u32│ words: [u64; 7] (meaning set by tag) │
//! └────────┴─────────┴────────┴──────────────────────────────────────┘
//! ```
//!
//! `seq` is stamped by the sender, starting at 1 and increasing by one per
//! record. A receiver that finds a different stamp than it expects is looking
//! at a slot the far side did not write, and stops.

use bytemuck::{Pod, Zeroable};

use crate::device::{regs, Device};
use crate::doorbell::Doorbell;
use crate::error::PipeError;
use crate::frame::FramingError;
use crate::layout::{queue_footprint, LayoutError};
use crate::queue::{Queue, QueueConsumer, QueueProducer, RingError};
use crate::region::MappedRegion;

/// Protocol version carried in every record.
pub const WIRE_VERSION: u16 = 1;

/// One notification as stored in shared memory (64 bytes).
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct NotificationRecord {
    pub tag: u16,
    pub version: u16,
    pub seq: u32,
    pub words: [u64; 7],
}

const _: () = assert!(std::mem::size_of::<NotificationRecord>() == 64);

/// Record discriminant.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationTag {
    Mmio = 1,
    AllocatePipe = 2,
    FreePipe = 3,
    Fallback = 4,
    NotifBuf = 5,
    RoundRobin = 6,
    Pipe = 7,
    FlowRule = 8,
}

impl TryFrom<u16> for NotificationTag {
    type Error = ProtocolError;

    fn try_from(tag: u16) -> Result<Self, ProtocolError> {
        Ok(match tag {
            1 => Self::Mmio,
            2 => Self::AllocatePipe,
            3 => Self::FreePipe,
            4 => Self::Fallback,
            5 => Self::NotifBuf,
            6 => Self::RoundRobin,
            7 => Self::Pipe,
            8 => Self::FlowRule,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Register access, requested by software and echoed back by the device
/// once the access has taken effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioNotification {
    pub op: MmioOp,
    pub register: u64,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioOp {
    Write = 0,
    Read = 1,
}

/// Pipe allocation. As a request, `pipe_id`, `ring_base` and `ring_size`
/// are zero or hints; the device answers with the assigned values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatePipeNotification {
    pub request_id: u32,
    pub pipe_id: u32,
    pub direction: RingDirection,
    /// Rx pipe that receives traffic no other pipe matched.
    pub fallback: bool,
    /// Offset of the ring in device memory.
    pub ring_base: u64,
    /// Ring capacity in flits.
    pub ring_size: u32,
}

/// Direction of a single ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingDirection {
    Rx = 0,
    Tx = 1,
}

/// Pipe teardown, requested by software or announced by the device. Once
/// received no further data lands in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreePipeNotification {
    pub pipe_id: u32,
}

/// A request the device could not satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackNotification {
    pub reason: FallbackReason,
    pub request_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoPipesAvailable = 1,
    OutOfMemory = 2,
    FlowSteering = 3,
    InvalidRequest = 4,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPipesAvailable => write!(f, "no pipes available"),
            Self::OutOfMemory => write!(f, "out of ring memory"),
            Self::FlowSteering => write!(f, "flow steering failed"),
            Self::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

/// Control of the notification channel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifBufNotification {
    pub op: NotifBufOp,
    pub notif_buf_id: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifBufOp {
    Register = 0,
    Unregister = 1,
}

/// Round-robin dispatch status, with the queue the device will serve next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundRobinNotification {
    pub enabled: bool,
    pub target_queue: u32,
}

/// Per-pipe event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeNotification {
    pub pipe_id: u32,
    pub event: PipeEvent,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
    /// New data in an Rx ring; `value` is the new head.
    RxReady = 1,
    /// The device consumed Tx data; `value` is the number of bytes.
    TxComplete = 2,
}

/// Match on the packet 5-tuple. Addresses and ports are in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowRule {
    pub dst_port: u16,
    pub src_port: u16,
    pub dst_ip: u32,
    pub src_ip: u32,
    pub protocol: u32,
}

/// Steer traffic matching `rule` into Rx pipe `pipe_id`. Echoed back by the
/// device once the rule is installed, or answered with a `Fallback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRuleNotification {
    pub request_id: u32,
    pub pipe_id: u32,
    pub rule: FlowRule,
}

// =============================================================================
// Notification
// =============================================================================

/// Every notification that may cross the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Mmio(MmioNotification),
    AllocatePipe(AllocatePipeNotification),
    FreePipe(FreePipeNotification),
    Fallback(FallbackNotification),
    NotifBuf(NotifBufNotification),
    RoundRobin(RoundRobinNotification),
    Pipe(PipeNotification),
    FlowRule(FlowRuleNotification),
}

impl Notification {
    pub fn tag(&self) -> NotificationTag {
        match self {
            Self::Mmio(_) => NotificationTag::Mmio,
            Self::AllocatePipe(_) => NotificationTag::AllocatePipe,
            Self::FreePipe(_) => NotificationTag::FreePipe,
            Self::Fallback(_) => NotificationTag::Fallback,
            Self::NotifBuf(_) => NotificationTag::NotifBuf,
            Self::RoundRobin(_) => NotificationTag::RoundRobin,
            Self::Pipe(_) => NotificationTag::Pipe,
            Self::FlowRule(_) => NotificationTag::FlowRule,
        }
    }

    /// Encode into a wire record stamped with `seq`.
    pub fn encode(&self, seq: u32) -> NotificationRecord {
        let mut words = [0u64; 7];
        match *self {
            Self::Mmio(n) => {
                words[0] = n.op as u64;
                words[1] = n.register;
                words[2] = n.value;
            }
            Self::AllocatePipe(n) => {
                words[0] = n.request_id as u64;
                words[1] = n.pipe_id as u64;
                words[2] = n.direction as u64;
                words[3] = n.fallback as u64;
                words[4] = n.ring_base;
                words[5] = n.ring_size as u64;
            }
            Self::FreePipe(n) => {
                words[0] = n.pipe_id as u64;
            }
            Self::Fallback(n) => {
                words[0] = n.reason as u64;
                words[1] = n.request_id as u64;
            }
            Self::NotifBuf(n) => {
                words[0] = n.op as u64;
                words[1] = n.notif_buf_id as u64;
                words[2] = n.capacity as u64;
            }
            Self::RoundRobin(n) => {
                words[0] = n.enabled as u64;
                words[1] = n.target_queue as u64;
            }
            Self::Pipe(n) => {
                words[0] = n.pipe_id as u64;
                words[1] = n.event as u64;
                words[2] = n.value;
            }
            Self::FlowRule(n) => {
                words[0] = n.request_id as u64;
                words[1] = n.pipe_id as u64;
                words[2] = n.rule.dst_port as u64;
                words[3] = n.rule.src_port as u64;
                words[4] = n.rule.dst_ip as u64;
                words[5] = n.rule.src_ip as u64;
                words[6] = n.rule.protocol as u64;
            }
        }
        NotificationRecord {
            tag: self.tag() as u16,
            version: WIRE_VERSION,
            seq,
            words,
        }
    }

    /// Decode a wire record. The sequence stamp is not checked here.
    pub fn decode(record: &NotificationRecord) -> Result<Self, ProtocolError> {
        if record.version != WIRE_VERSION {
            return Err(ProtocolError::VersionSkew {
                expected: WIRE_VERSION,
                found: record.version,
            });
        }
        let tag = NotificationTag::try_from(record.tag)?;
        let w = Fields {
            tag,
            words: &record.words,
        };

        Ok(match tag {
            NotificationTag::Mmio => Self::Mmio(MmioNotification {
                op: match w.word(0) {
                    0 => MmioOp::Write,
                    1 => MmioOp::Read,
                    v => return Err(w.invalid("op", v)),
                },
                register: w.word(1),
                value: w.word(2),
            }),
            NotificationTag::AllocatePipe => Self::AllocatePipe(AllocatePipeNotification {
                request_id: w.u32(0, "request_id")?,
                pipe_id: w.u32(1, "pipe_id")?,
                direction: match w.word(2) {
                    0 => RingDirection::Rx,
                    1 => RingDirection::Tx,
                    v => return Err(w.invalid("direction", v)),
                },
                fallback: w.bool(3, "fallback")?,
                ring_base: w.word(4),
                ring_size: w.u32(5, "ring_size")?,
            }),
            NotificationTag::FreePipe => Self::FreePipe(FreePipeNotification {
                pipe_id: w.u32(0, "pipe_id")?,
            }),
            NotificationTag::Fallback => Self::Fallback(FallbackNotification {
                reason: match w.word(0) {
                    1 => FallbackReason::NoPipesAvailable,
                    2 => FallbackReason::OutOfMemory,
                    3 => FallbackReason::FlowSteering,
                    4 => FallbackReason::InvalidRequest,
                    v => return Err(w.invalid("reason", v)),
                },
                request_id: w.u32(1, "request_id")?,
            }),
            NotificationTag::NotifBuf => Self::NotifBuf(NotifBufNotification {
                op: match w.word(0) {
                    0 => NotifBufOp::Register,
                    1 => NotifBufOp::Unregister,
                    v => return Err(w.invalid("op", v)),
                },
                notif_buf_id: w.u32(1, "notif_buf_id")?,
                capacity: w.u32(2, "capacity")?,
            }),
            NotificationTag::RoundRobin => Self::RoundRobin(RoundRobinNotification {
                enabled: w.bool(0, "enabled")?,
                target_queue: w.u32(1, "target_queue")?,
            }),
            NotificationTag::Pipe => Self::Pipe(PipeNotification {
                pipe_id: w.u32(0, "pipe_id")?,
                event: match w.word(1) {
                    1 => PipeEvent::RxReady,
                    2 => PipeEvent::TxComplete,
                    v => return Err(w.invalid("event", v)),
                },
                value: w.word(2),
            }),
            NotificationTag::FlowRule => Self::FlowRule(FlowRuleNotification {
                request_id: w.u32(0, "request_id")?,
                pipe_id: w.u32(1, "pipe_id")?,
                rule: FlowRule {
                    dst_port: w.u16(2, "dst_port")?,
                    src_port: w.u16(3, "src_port")?,
                    dst_ip: w.u32(4, "dst_ip")?,
                    src_ip: w.u32(5, "src_ip")?,
                    protocol: w.u32(6, "protocol")?,
                },
            }),
        })
    }
}

struct Fields<'a> {
    tag: NotificationTag,
    words: &'a [u64; 7],
}

impl Fields<'_> {
    fn word(&self, i: usize) -> u64 {
        self.words[i]
    }

    fn invalid(&self, field: &'static str, value: u64) -> ProtocolError {
        ProtocolError::InvalidField {
            tag: self.tag,
            field,
            value,
        }
    }

    fn u32(&self, i: usize, field: &'static str) -> Result<u32, ProtocolError> {
        u32::try_from(self.words[i]).map_err(|_| self.invalid(field, self.words[i]))
    }

    fn u16(&self, i: usize, field: &'static str) -> Result<u16, ProtocolError> {
        u16::try_from(self.words[i]).map_err(|_| self.invalid(field, self.words[i]))
    }

    fn bool(&self, i: usize, field: &'static str) -> Result<bool, ProtocolError> {
        match self.words[i] {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(self.invalid(field, v)),
        }
    }
}

// =============================================================================
// NotificationBufPair
// =============================================================================

/// Bytes of device memory used by a pair of `capacity`-slot queues.
pub const fn notif_buf_len(capacity: u32) -> usize {
    2 * queue_footprint::<NotificationRecord>(capacity)
}

/// Inbound and outbound notification queues of one party.
///
/// The region holds the device-to-software queue followed by the
/// software-to-device queue. Software creates the region; the device (or a
/// software peer) attaches to it with [`NotificationBufPair::attach_device_side`].
pub struct NotificationBufPair {
    inbound: QueueConsumer<NotificationRecord>,
    outbound: QueueProducer<NotificationRecord>,
    send_seq: u32,
    recv_seq: u32,
    doorbell: Option<Doorbell>,
}

impl NotificationBufPair {
    /// Map the pair at `offset`, lay out both queues and announce them to the
    /// device through its registers.
    pub fn create<D: Device + ?Sized>(device: &D, offset: u64, capacity: u32) -> Result<Self, PipeError> {
        let region = device
            .map_region(offset, notif_buf_len(capacity))
            .map_err(PipeError::Device)?;
        let pair = Self::init_software_side(region, capacity)
            .map_err(|e| PipeError::ProtocolMismatch(ProtocolError::Layout(e)))?;
        device.mmio_write(regs::REG_NOTIF_BUF_BASE, offset);
        device.mmio_write(regs::REG_NOTIF_BUF_CAPACITY, capacity as u64);
        tracing::debug!(offset, capacity, "notification buffers created");
        Ok(pair)
    }

    /// Lay out both queues in `region` and take the software roles.
    pub fn init_software_side(region: MappedRegion, capacity: u32) -> Result<Self, LayoutError> {
        let (to_sw, to_dev) = split_region(&region, capacity)?;
        let inbound = Queue::init(to_sw, capacity)?.into_consumer();
        let outbound = Queue::init(to_dev, capacity)?.into_producer();
        Ok(Self::from_roles(inbound, outbound))
    }

    /// Attach to queues laid out by software and take the device roles.
    pub fn attach_device_side(region: MappedRegion, capacity: u32) -> Result<Self, LayoutError> {
        let (to_sw, to_dev) = split_region(&region, capacity)?;
        let outbound = Queue::attach(to_sw)?.into_producer();
        let inbound = Queue::attach(to_dev)?.into_consumer();
        Ok(Self::from_roles(inbound, outbound))
    }

    /// Build a pair from already-split roles.
    pub fn from_roles(
        inbound: QueueConsumer<NotificationRecord>,
        outbound: QueueProducer<NotificationRecord>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            send_seq: 1,
            recv_seq: 1,
            doorbell: None,
        }
    }

    /// Ring `doorbell` after every successful send.
    pub fn with_doorbell(mut self, doorbell: Doorbell) -> Self {
        self.set_doorbell(doorbell);
        self
    }

    pub fn set_doorbell(&mut self, doorbell: Doorbell) {
        self.doorbell = Some(doorbell);
    }

    pub fn doorbell(&self) -> Option<&Doorbell> {
        self.doorbell.as_ref()
    }

    /// Take the next inbound notification, if any.
    ///
    /// A malformed record is reported and left in place, so every later poll
    /// reports it again: the channel is unusable until it is rebuilt.
    pub fn poll(&mut self) -> Result<Option<Notification>, ProtocolError> {
        let Some(record) = self.inbound.peek() else {
            return Ok(None);
        };
        if record.seq != self.recv_seq {
            tracing::warn!(expected = self.recv_seq, found = record.seq, "notification out of sequence");
            return Err(ProtocolError::OutOfSequence {
                expected: self.recv_seq,
                found: record.seq,
            });
        }
        let notification = Notification::decode(&record).map_err(|e| {
            tracing::warn!(error = %e, "malformed notification");
            e
        })?;
        self.inbound.release(1);
        self.recv_seq = next_seq(self.recv_seq);
        Ok(Some(notification))
    }

    /// Queue a notification for the peer.
    pub fn send(&mut self, notification: &Notification) -> Result<(), RingError> {
        let record = notification.encode(self.send_seq);
        if let Err(e) = self.outbound.enqueue(record) {
            tracing::trace!(tag = ?notification.tag(), "notification queue full");
            return Err(e);
        }
        self.send_seq = next_seq(self.send_seq);
        if let Some(doorbell) = &self.doorbell {
            doorbell.signal();
        }
        Ok(())
    }

    /// Inbound notifications waiting to be polled.
    pub fn pending(&mut self) -> u32 {
        self.inbound.refresh()
    }

    /// Outbound slots currently free.
    pub fn free_slots(&mut self) -> u32 {
        self.outbound.free_slots()
    }

    /// Stamp the next outbound notification will carry.
    pub fn next_send_seq(&self) -> u32 {
        self.send_seq
    }

    /// Write a raw record, bypassing encoding. The record's stamp is used as is.
    pub fn send_raw(&mut self, record: NotificationRecord) -> Result<(), RingError> {
        self.outbound.enqueue(record)?;
        self.send_seq = next_seq(record.seq);
        Ok(())
    }
}

fn next_seq(seq: u32) -> u32 {
    seq.wrapping_add(1).max(1)
}

fn split_region(region: &MappedRegion, capacity: u32) -> Result<(MappedRegion, MappedRegion), LayoutError> {
    let half = queue_footprint::<NotificationRecord>(capacity);
    let too_small = LayoutError::RegionTooSmall {
        required: 2 * half,
        found: region.len(),
    };
    let first = region.subregion(0, half).ok_or_else(|| too_small.clone())?;
    let second = region.subregion(half, half).ok_or(too_small)?;
    Ok((first, second))
}

// =============================================================================
// Errors
// =============================================================================

/// Violations of the shared protocol. None of these can be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Tag outside the known set.
    UnknownTag(u16),
    /// Record written by a different protocol version.
    VersionSkew { expected: u16, found: u16 },
    /// Slot not written by the far side since it was last read.
    OutOfSequence { expected: u32, found: u32 },
    /// Field out of range for its tag.
    InvalidField {
        tag: NotificationTag,
        field: &'static str,
        value: u64,
    },
    /// Shared region failed validation.
    Layout(LayoutError),
    /// Message framing inside a pipe ring is corrupt.
    Framing(FramingError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTag(tag) => write!(f, "unknown notification tag {}", tag),
            Self::VersionSkew { expected, found } => {
                write!(f, "wire version skew: expected {}, found {}", expected, found)
            }
            Self::OutOfSequence { expected, found } => {
                write!(f, "notification out of sequence: expected {}, found {}", expected, found)
            }
            Self::InvalidField { tag, field, value } => {
                write!(f, "invalid {:?}.{} value {}", tag, field, value)
            }
            Self::Layout(e) => write!(f, "layout mismatch: {}", e),
            Self::Framing(e) => write!(f, "framing error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<LayoutError> for ProtocolError {
    fn from(e: LayoutError) -> Self {
        ProtocolError::Layout(e)
    }
}

impl From<FramingError> for ProtocolError {
    fn from(e: FramingError) -> Self {
        ProtocolError::Framing(e)
    }
}
