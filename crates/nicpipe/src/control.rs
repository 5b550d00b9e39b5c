//! The control plane: pipe allocation, teardown and register access.
//!
//! Every exchange with the device is a request on the outbound notification
//! queue and an answer on the inbound one. Nothing here waits for the answer:
//! callers issue a request, keep polling, and pick up the result once the
//! device has replied.
//!
//! ```text
//!  software                                   device
//!  allocate_pipe(Rx) ── AllocatePipe{req 1} ──▶
//!                    ◀── AllocatePipe{req 1, pipe 7, base, size}
//!  poll_pipe()  ──▶ Some(Pipe::Rx)
//!                    ◀── FreePipe{pipe 7}
//!  pipe.recv_pkts() ──▶ Err(PipeTornDown)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::config::PipeConfig;
use crate::device::Device;
use crate::doorbell::Doorbell;
use crate::error::{ring_error_to_pipe, PipeError};
use crate::layout::Flit;
use crate::notification::{
    AllocatePipeNotification, FallbackNotification, FallbackReason, FlowRule, FlowRuleNotification,
    FreePipeNotification, MmioNotification, MmioOp, NotifBufNotification, NotifBufOp, Notification,
    NotificationBufPair, NotificationTag, PipeEvent, PipeNotification, ProtocolError, RingDirection,
    RoundRobinNotification,
};
use crate::pipe::{attach_ring, Pipe, PipeKind, PipeRing, PipeState, RxPipe, RxTxPipe, TxPipe};
use crate::queue::Queue;

/// An allocation that has been requested but not yet collected.
#[derive(Debug)]
pub struct PendingPipe {
    kind: PipeKind,
    rx: Option<u32>,
    tx: Option<u32>,
}

impl PendingPipe {
    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    /// Request ids sent to the device, one per ring.
    pub fn request_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.rx.iter().chain(self.tx.iter()).copied()
    }
}

/// A flow rule that has been requested but not yet confirmed.
#[derive(Debug)]
pub struct PendingBind {
    request_id: u32,
    pipe_id: u32,
}

impl PendingBind {
    pub fn pipe_id(&self) -> u32 {
        self.pipe_id
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }
}

/// Handle for an MMIO request, acknowledged in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MmioTicket(u64);

/// Round-robin dispatch as last reported by the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundRobinStatus {
    pub enabled: bool,
    pub target_queue: u32,
}

enum Request {
    Pending { direction: RingDirection },
    Granted { ring: PipeRing, queue: Queue<Flit> },
    Failed(FallbackReason),
    // The caller gave up; free the ring once it is granted.
    Abandoned,
}

enum BindState {
    Pending { pipe_id: u32 },
    Installed,
    Failed(FallbackReason),
}

struct PipeEntry {
    state: Arc<PipeState>,
    direction: RingDirection,
    free_requested: bool,
    tx_completed: u64,
}

/// Software side of the notification protocol.
pub struct ControlPlane<D: Device> {
    device: D,
    config: PipeConfig,
    notif: NotificationBufPair,
    next_request_id: u32,
    requests: HashMap<u32, Request>,
    binds: HashMap<u32, BindState>,
    pipes: HashMap<u32, PipeEntry>,
    deferred_frees: VecDeque<u32>,
    mmio_issued: u64,
    mmio_acked: u64,
    registers: HashMap<u64, u64>,
    round_robin: RoundRobinStatus,
    ready: VecDeque<u32>,
    notif_buf_id: Option<u32>,
    last_fallback: Option<FallbackNotification>,
    unregistered: bool,
    failed: Option<ProtocolError>,
}

impl<D: Device> ControlPlane<D> {
    /// Set up the notification buffers and register them with the device.
    pub fn new(device: D, config: PipeConfig) -> Result<Self, PipeError> {
        config.validate()?;
        let notif =
            NotificationBufPair::create(&device, config.notif_buf_offset, config.notification_capacity)?;
        let mut cp = Self {
            device,
            notif,
            next_request_id: 1,
            requests: HashMap::new(),
            binds: HashMap::new(),
            pipes: HashMap::new(),
            deferred_frees: VecDeque::new(),
            mmio_issued: 0,
            mmio_acked: 0,
            registers: HashMap::new(),
            round_robin: RoundRobinStatus::default(),
            ready: VecDeque::new(),
            notif_buf_id: None,
            last_fallback: None,
            unregistered: false,
            failed: None,
            config,
        };
        cp.send(Notification::NotifBuf(NotifBufNotification {
            op: NotifBufOp::Register,
            notif_buf_id: 0,
            capacity: cp.config.notification_capacity,
        }))?;
        Ok(cp)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Ring `doorbell` whenever a request is sent.
    pub fn set_doorbell(&mut self, doorbell: Doorbell) {
        self.notif.set_doorbell(doorbell);
    }

    fn send(&mut self, notification: Notification) -> Result<(), PipeError> {
        self.check_failed()?;
        self.notif.send(&notification).map_err(ring_error_to_pipe)
    }

    fn check_failed(&self) -> Result<(), PipeError> {
        match &self.failed {
            Some(e) => Err(PipeError::ProtocolMismatch(e.clone())),
            None => Ok(()),
        }
    }

    /// The protocol violation that stopped this control plane, if any.
    pub fn failure(&self) -> Option<&ProtocolError> {
        self.failed.as_ref()
    }

    fn take_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    // =========================================================================
    // Pipes
    // =========================================================================

    /// Ask the device for a pipe. Collect it with [`ControlPlane::poll_pipe`].
    ///
    /// Either every request for the pipe is sent or none is.
    pub fn allocate_pipe(&mut self, kind: PipeKind) -> Result<PendingPipe, PipeError> {
        let rings: &[(RingDirection, bool)] = match kind {
            PipeKind::Rx => &[(RingDirection::Rx, false)],
            PipeKind::FallbackRx => &[(RingDirection::Rx, true)],
            PipeKind::Tx => &[(RingDirection::Tx, false)],
            PipeKind::RxTx => &[(RingDirection::Rx, false), (RingDirection::Tx, false)],
            PipeKind::FallbackRxTx => &[(RingDirection::Rx, true), (RingDirection::Tx, false)],
        };
        self.check_failed()?;
        if (self.notif.free_slots() as usize) < rings.len() {
            return Err(PipeError::QueueFull);
        }

        let mut pending = PendingPipe { kind, rx: None, tx: None };
        for &(direction, fallback) in rings {
            let request_id = self.take_request_id();
            self.send(Notification::AllocatePipe(AllocatePipeNotification {
                request_id,
                pipe_id: 0,
                direction,
                fallback,
                ring_base: 0,
                ring_size: self.config.pipe_capacity,
            }))?;
            self.requests.insert(request_id, Request::Pending { direction });
            match direction {
                RingDirection::Rx => pending.rx = Some(request_id),
                RingDirection::Tx => pending.tx = Some(request_id),
            }
        }
        tracing::debug!(?kind, "pipe requested");
        Ok(pending)
    }

    /// Process notifications and return the pipe once the device has granted
    /// every ring of it.
    ///
    /// If the device declines any ring, rings already granted for the same
    /// pipe are freed and `PipeAllocationFailed` is returned.
    pub fn poll_pipe(&mut self, pending: &PendingPipe) -> Result<Option<Pipe>, PipeError> {
        self.process_notifications()?;

        let mut failure = None;
        let mut complete = true;
        for request_id in pending.request_ids() {
            match self.requests.get(&request_id) {
                None | Some(Request::Abandoned) => return Err(PipeError::UnknownRequest { request_id }),
                Some(Request::Failed(reason)) => failure = Some(*reason),
                Some(Request::Pending { .. }) => complete = false,
                Some(Request::Granted { .. }) => {}
            }
        }

        if let Some(reason) = failure {
            for request_id in pending.request_ids() {
                self.abandon(request_id);
            }
            tracing::debug!(kind = ?pending.kind, %reason, "pipe allocation failed");
            return Err(PipeError::PipeAllocationFailed { reason });
        }
        if !complete {
            return Ok(None);
        }

        let batch_limit = self.config.batch_limit;
        let rx = self.take_grant(pending.rx)?;
        let tx = self.take_grant(pending.tx)?;
        let pipe = match (pending.kind, rx, tx) {
            (PipeKind::Rx, Some((ring, queue)), None) => Pipe::Rx(RxPipe::new(ring, queue, false, batch_limit)),
            (PipeKind::FallbackRx, Some((ring, queue)), None) => {
                Pipe::Rx(RxPipe::new(ring, queue, true, batch_limit))
            }
            (PipeKind::Tx, None, Some((ring, queue))) => Pipe::Tx(TxPipe::new(ring, queue)),
            (PipeKind::RxTx, Some((rx_ring, rx_queue)), Some((tx_ring, tx_queue))) => Pipe::RxTx(RxTxPipe::new(
                RxPipe::new(rx_ring, rx_queue, false, batch_limit),
                TxPipe::new(tx_ring, tx_queue),
            )),
            (PipeKind::FallbackRxTx, Some((rx_ring, rx_queue)), Some((tx_ring, tx_queue))) => {
                Pipe::RxTx(RxTxPipe::new(
                    RxPipe::new(rx_ring, rx_queue, true, batch_limit),
                    TxPipe::new(tx_ring, tx_queue),
                ))
            }
            _ => return Err(PipeError::InvalidConfig("pending pipe does not match its kind")),
        };
        Ok(Some(pipe))
    }

    fn take_grant(&mut self, request_id: Option<u32>) -> Result<Option<(PipeRing, Queue<Flit>)>, PipeError> {
        let Some(request_id) = request_id else {
            return Ok(None);
        };
        match self.requests.remove(&request_id) {
            Some(Request::Granted { ring, queue }) => Ok(Some((ring, queue))),
            Some(other) => {
                self.requests.insert(request_id, other);
                Err(PipeError::UnknownRequest { request_id })
            }
            None => Err(PipeError::UnknownRequest { request_id }),
        }
    }

    fn abandon(&mut self, request_id: u32) {
        match self.requests.remove(&request_id) {
            Some(Request::Granted { ring, .. }) => self.request_free(ring.pipe_id()),
            Some(Request::Pending { .. }) => {
                self.requests.insert(request_id, Request::Abandoned);
            }
            Some(Request::Failed(_)) | Some(Request::Abandoned) | None => {}
        }
    }

    /// Send a free for a pipe nobody holds a handle to, now or later.
    fn request_free(&mut self, pipe_id: u32) {
        if let Err(e) = self.free_pipe(pipe_id) {
            tracing::debug!(pipe_id, error = %e, "deferring pipe free");
            self.deferred_frees.push_back(pipe_id);
        }
    }

    fn flush_deferred_frees(&mut self) {
        while let Some(pipe_id) = self.deferred_frees.pop_front() {
            if let Err(PipeError::QueueFull) = self.free_pipe(pipe_id) {
                self.deferred_frees.push_front(pipe_id);
                break;
            }
        }
    }

    /// Ask the device to free a pipe. The pipe is torn down when the device's
    /// `FreePipe` notification is processed. Repeated calls send one request.
    pub fn free_pipe(&mut self, pipe_id: u32) -> Result<(), PipeError> {
        let Some(entry) = self.pipes.get(&pipe_id) else {
            return Err(PipeError::UnknownPipe { pipe_id });
        };
        if entry.free_requested {
            return Ok(());
        }
        self.send(Notification::FreePipe(FreePipeNotification { pipe_id }))?;
        if let Some(entry) = self.pipes.get_mut(&pipe_id) {
            entry.free_requested = true;
        }
        tracing::debug!(pipe_id, "pipe free requested");
        Ok(())
    }

    /// Whether the pipe has been granted and not torn down.
    pub fn is_pipe_alive(&self, pipe_id: u32) -> bool {
        self.pipes
            .get(&pipe_id)
            .is_some_and(|entry| !entry.state.is_torn_down())
    }

    /// Number of pipes granted and not yet torn down.
    pub fn live_pipes(&self) -> usize {
        self.pipes.len()
    }

    /// Next pipe the device reported as having data, in report order.
    pub fn next_rx_pipe(&mut self) -> Option<u32> {
        self.ready.pop_front()
    }

    /// Bytes the device reports having transmitted from a Tx pipe.
    pub fn tx_completed(&self, pipe_id: u32) -> Option<u64> {
        self.pipes
            .get(&pipe_id)
            .filter(|entry| entry.direction == RingDirection::Tx)
            .map(|entry| entry.tx_completed)
    }

    /// The most recent fallback reported by the device.
    pub fn last_fallback(&self) -> Option<FallbackNotification> {
        self.last_fallback
    }

    // =========================================================================
    // Flow steering
    // =========================================================================

    /// Ask the device to steer traffic matching `rule` into an Rx pipe.
    /// Collect the outcome with [`ControlPlane::poll_bind`].
    pub fn bind(&mut self, pipe_id: u32, rule: FlowRule) -> Result<PendingBind, PipeError> {
        match self.pipes.get(&pipe_id) {
            Some(entry) if entry.direction == RingDirection::Rx => {}
            Some(_) => return Err(PipeError::InvalidConfig("flow rules can only target rx pipes")),
            None => return Err(PipeError::UnknownPipe { pipe_id }),
        }
        let request_id = self.take_request_id();
        self.send(Notification::FlowRule(FlowRuleNotification {
            request_id,
            pipe_id,
            rule,
        }))?;
        self.binds.insert(request_id, BindState::Pending { pipe_id });
        tracing::debug!(pipe_id, ?rule, "flow rule requested");
        Ok(PendingBind { request_id, pipe_id })
    }

    /// Process notifications and report whether the rule is installed.
    pub fn poll_bind(&mut self, pending: &PendingBind) -> Result<bool, PipeError> {
        self.process_notifications()?;
        let request_id = pending.request_id;
        match self.binds.remove(&request_id) {
            Some(BindState::Installed) => Ok(true),
            Some(BindState::Failed(reason)) => Err(PipeError::BindFailed {
                pipe_id: pending.pipe_id,
                reason,
            }),
            Some(state @ BindState::Pending { .. }) => {
                self.binds.insert(request_id, state);
                Ok(false)
            }
            None => Err(PipeError::UnknownRequest { request_id }),
        }
    }

    // =========================================================================
    // Registers and device state
    // =========================================================================

    /// Write a register through the notification channel.
    pub fn write_register(&mut self, register: u64, value: u64) -> Result<MmioTicket, PipeError> {
        self.issue_mmio(MmioOp::Write, register, value)
    }

    /// Read a register. The value is available from
    /// [`ControlPlane::register_value`] once the ticket is acknowledged.
    pub fn read_register(&mut self, register: u64) -> Result<MmioTicket, PipeError> {
        self.issue_mmio(MmioOp::Read, register, 0)
    }

    fn issue_mmio(&mut self, op: MmioOp, register: u64, value: u64) -> Result<MmioTicket, PipeError> {
        self.send(Notification::Mmio(MmioNotification { op, register, value }))?;
        self.mmio_issued += 1;
        Ok(MmioTicket(self.mmio_issued))
    }

    /// Whether the device has applied the access behind `ticket`.
    pub fn is_acknowledged(&self, ticket: MmioTicket) -> bool {
        self.mmio_acked >= ticket.0
    }

    /// Last value the device reported for a register.
    pub fn register_value(&self, register: u64) -> Option<u64> {
        self.registers.get(&register).copied()
    }

    /// Turn round-robin dispatch on or off.
    pub fn set_round_robin(&mut self, enabled: bool) -> Result<(), PipeError> {
        self.send(Notification::RoundRobin(RoundRobinNotification {
            enabled,
            target_queue: 0,
        }))
    }

    pub fn round_robin(&self) -> RoundRobinStatus {
        self.round_robin
    }

    /// Id the device assigned to our notification buffers, once registered.
    pub fn notif_buf_id(&self) -> Option<u32> {
        self.notif_buf_id
    }

    /// Free every pipe and unregister the notification buffers.
    ///
    /// On `QueueFull`, call again once the device has caught up; requests
    /// already sent are not repeated.
    pub fn shutdown(&mut self) -> Result<(), PipeError> {
        self.flush_deferred_frees();
        let ids: Vec<u32> = self.pipes.keys().copied().collect();
        for pipe_id in ids {
            self.free_pipe(pipe_id)?;
        }
        if !self.unregistered {
            self.send(Notification::NotifBuf(NotifBufNotification {
                op: NotifBufOp::Unregister,
                notif_buf_id: self.notif_buf_id.unwrap_or(0),
                capacity: self.config.notification_capacity,
            }))?;
            self.unregistered = true;
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Handle every notification the device has posted.
    ///
    /// A malformed or unexpected notification is a hard error: it is
    /// returned from this and every later call, and no further requests are
    /// sent.
    pub fn process_notifications(&mut self) -> Result<usize, PipeError> {
        self.check_failed()?;
        self.flush_deferred_frees();
        let mut handled = 0;
        loop {
            let result = match self.notif.poll() {
                Ok(Some(notification)) => self.dispatch(notification),
                Ok(None) => return Ok(handled),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "notification channel failed");
                self.failed = Some(e.clone());
                return Err(PipeError::ProtocolMismatch(e));
            }
            handled += 1;
        }
    }

    fn dispatch(&mut self, notification: Notification) -> Result<(), ProtocolError> {
        match notification {
            Notification::AllocatePipe(grant) => self.on_allocate(grant),
            Notification::FreePipe(FreePipeNotification { pipe_id }) => {
                match self.pipes.remove(&pipe_id) {
                    Some(entry) => {
                        entry.state.tear_down();
                        self.ready.retain(|id| *id != pipe_id);
                        tracing::debug!(pipe_id, "pipe torn down");
                    }
                    None => tracing::warn!(pipe_id, "free notification for unknown pipe"),
                }
                Ok(())
            }
            Notification::Fallback(fallback) => {
                self.last_fallback = Some(fallback);
                if let Some(bind) = self.binds.get_mut(&fallback.request_id) {
                    if let BindState::Pending { pipe_id } = *bind {
                        tracing::debug!(pipe_id, reason = %fallback.reason, "flow rule declined");
                        *bind = BindState::Failed(fallback.reason);
                        return Ok(());
                    }
                }
                match self.requests.get_mut(&fallback.request_id) {
                    Some(request @ Request::Pending { .. }) => *request = Request::Failed(fallback.reason),
                    Some(Request::Abandoned) => {
                        self.requests.remove(&fallback.request_id);
                    }
                    _ => tracing::warn!(
                        request_id = fallback.request_id,
                        reason = %fallback.reason,
                        "unsolicited fallback"
                    ),
                }
                Ok(())
            }
            Notification::Mmio(mmio) => {
                if self.mmio_acked >= self.mmio_issued {
                    return Err(invalid(NotificationTag::Mmio, "register", mmio.register));
                }
                self.mmio_acked += 1;
                self.registers.insert(mmio.register, mmio.value);
                Ok(())
            }
            Notification::RoundRobin(rr) => {
                self.round_robin = RoundRobinStatus {
                    enabled: rr.enabled,
                    target_queue: rr.target_queue,
                };
                Ok(())
            }
            Notification::NotifBuf(nb) => {
                self.notif_buf_id = match nb.op {
                    NotifBufOp::Register => Some(nb.notif_buf_id),
                    NotifBufOp::Unregister => None,
                };
                tracing::debug!(op = ?nb.op, id = nb.notif_buf_id, "notification buffers");
                Ok(())
            }
            Notification::Pipe(PipeNotification { pipe_id, event, value }) => {
                match (event, self.pipes.get_mut(&pipe_id)) {
                    (PipeEvent::RxReady, Some(_)) => {
                        if !self.ready.contains(&pipe_id) {
                            self.ready.push_back(pipe_id);
                        }
                    }
                    (PipeEvent::TxComplete, Some(entry)) => {
                        entry.tx_completed = entry.tx_completed.saturating_add(value);
                    }
                    (_, None) => tracing::trace!(pipe_id, ?event, "event for unknown pipe"),
                }
                Ok(())
            }
            Notification::FlowRule(ack) => {
                let Some(bind) = self.binds.get_mut(&ack.request_id) else {
                    return Err(invalid(NotificationTag::FlowRule, "request_id", ack.request_id as u64));
                };
                match *bind {
                    BindState::Pending { pipe_id } if pipe_id == ack.pipe_id => {}
                    BindState::Pending { .. } => {
                        return Err(invalid(NotificationTag::FlowRule, "pipe_id", ack.pipe_id as u64));
                    }
                    _ => return Err(invalid(NotificationTag::FlowRule, "request_id", ack.request_id as u64)),
                }
                *bind = BindState::Installed;
                tracing::debug!(pipe_id = ack.pipe_id, rule = ?ack.rule, "flow rule installed");
                Ok(())
            }
        }
    }

    fn on_allocate(&mut self, grant: AllocatePipeNotification) -> Result<(), ProtocolError> {
        let request_id = grant.request_id;
        let known = matches!(
            self.requests.get(&request_id),
            Some(Request::Pending { .. }) | Some(Request::Abandoned)
        );
        if known && self.pipes.contains_key(&grant.pipe_id) {
            return Err(invalid(NotificationTag::AllocatePipe, "pipe_id", grant.pipe_id as u64));
        }
        match self.requests.get(&request_id) {
            Some(Request::Pending { direction }) => {
                if *direction != grant.direction {
                    return Err(invalid(NotificationTag::AllocatePipe, "direction", grant.direction as u64));
                }
                let (ring, queue) = match attach_ring(&self.device, &grant) {
                    Ok(attached) => attached,
                    Err(e) => {
                        self.requests.remove(&request_id);
                        return Err(match e {
                            PipeError::ProtocolMismatch(e) => e,
                            _ => invalid(NotificationTag::AllocatePipe, "ring_base", grant.ring_base),
                        });
                    }
                };
                self.register_pipe(&grant, ring.state().clone());
                self.requests.insert(request_id, Request::Granted { ring, queue });
                tracing::debug!(
                    pipe_id = grant.pipe_id,
                    ring_base = grant.ring_base,
                    ring_size = grant.ring_size,
                    "pipe allocated"
                );
                Ok(())
            }
            Some(Request::Abandoned) => {
                self.requests.remove(&request_id);
                self.register_pipe(&grant, Arc::new(PipeState::default()));
                self.request_free(grant.pipe_id);
                Ok(())
            }
            _ => Err(invalid(NotificationTag::AllocatePipe, "request_id", request_id as u64)),
        }
    }

    fn register_pipe(&mut self, grant: &AllocatePipeNotification, state: Arc<PipeState>) {
        self.pipes.insert(
            grant.pipe_id,
            PipeEntry {
                state,
                direction: grant.direction,
                free_requested: false,
                tx_completed: 0,
            },
        );
    }
}

fn invalid(tag: NotificationTag, field: &'static str, value: u64) -> ProtocolError {
    ProtocolError::InvalidField { tag, field, value }
}

impl<D: Device> std::fmt::Debug for ControlPlane<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("notif_buf_id", &self.notif_buf_id)
            .field("live_pipes", &self.pipes.len())
            .field("pending_requests", &self.requests.len())
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::device::{regs, DeviceError};
    use crate::layout::queue_footprint;
    use crate::notification::notif_buf_len;
    use crate::region::{heap_region, MappedRegion};

    /// Just enough device to play the far side by hand.
    struct ScratchDevice {
        memory: MappedRegion,
        registers: Mutex<HashMap<u64, u64>>,
    }

    impl ScratchDevice {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                memory: heap_region(1 << 20).unwrap(),
                registers: Mutex::new(HashMap::new()),
            })
        }
    }

    impl Device for ScratchDevice {
        fn map_region(&self, offset: u64, len: usize) -> Result<MappedRegion, DeviceError> {
            self.memory.subregion(offset as usize, len).ok_or(DeviceError::OutOfBounds {
                offset,
                len,
                size: self.memory.len(),
            })
        }

        fn mmio_write(&self, register: u64, value: u64) {
            self.registers.lock().insert(register, value);
        }

        fn mmio_read(&self, register: u64) -> u64 {
            self.registers.lock().get(&register).copied().unwrap_or(0)
        }
    }

    const CAP: u32 = 16;

    fn setup() -> (ControlPlane<Arc<ScratchDevice>>, NotificationBufPair, Arc<ScratchDevice>) {
        let device = ScratchDevice::new();
        let config = PipeConfig {
            notification_capacity: CAP,
            pipe_capacity: 64,
            ..PipeConfig::default()
        };
        let cp = ControlPlane::new(device.clone(), config).unwrap();
        assert_eq!(device.mmio_read(regs::REG_NOTIF_BUF_CAPACITY), CAP as u64);
        let region = device.map_region(0, notif_buf_len(CAP)).unwrap();
        let peer = NotificationBufPair::attach_device_side(region, CAP).unwrap();
        (cp, peer, device)
    }

    /// Lay out a ring at `base` the way a device would and answer `request`.
    fn grant(device: &ScratchDevice, peer: &mut NotificationBufPair, request: Notification, pipe_id: u32, base: u64) {
        let Notification::AllocatePipe(req) = request else {
            panic!("expected an allocation request, got {:?}", request);
        };
        let region = device.map_region(base, queue_footprint::<Flit>(req.ring_size)).unwrap();
        Queue::<Flit>::init(region, req.ring_size).unwrap();
        peer.send(&Notification::AllocatePipe(AllocatePipeNotification {
            pipe_id,
            ring_base: base,
            ..req
        }))
        .unwrap();
    }

    fn expect_register(peer: &mut NotificationBufPair) {
        assert!(matches!(
            peer.poll().unwrap(),
            Some(Notification::NotifBuf(NotifBufNotification {
                op: NotifBufOp::Register,
                ..
            }))
        ));
    }

    #[test]
    fn test_allocate_free_scenario() {
        let (mut cp, mut peer, device) = setup();
        expect_register(&mut peer);

        let pending = cp.allocate_pipe(PipeKind::Rx).unwrap();
        assert!(cp.poll_pipe(&pending).unwrap().is_none());

        let request = peer.poll().unwrap().unwrap();
        grant(&device, &mut peer, request, 7, 0x10000);
        let mut rx = cp.poll_pipe(&pending).unwrap().unwrap().into_rx().unwrap();
        assert_eq!(rx.id(), 7);
        assert_eq!(rx.ring().ring_base(), 0x10000);
        assert_eq!(rx.ring().ring_size(), 64);
        assert!(cp.is_pipe_alive(7));
        assert!(rx.recv_pkts().unwrap().is_empty());

        peer.send(&Notification::FreePipe(FreePipeNotification { pipe_id: 7 })).unwrap();
        cp.process_notifications().unwrap();
        assert!(!cp.is_pipe_alive(7));
        assert!(matches!(rx.recv_pkts(), Err(PipeError::PipeTornDown { pipe_id: 7 })));

        // The pending handle has been used up.
        assert!(matches!(cp.poll_pipe(&pending), Err(PipeError::UnknownRequest { .. })));
    }

    #[test]
    fn test_fallback_fails_allocation() {
        let (mut cp, mut peer, _device) = setup();
        expect_register(&mut peer);
        let pending = cp.allocate_pipe(PipeKind::Tx).unwrap();
        let request_id = pending.request_ids().next().unwrap();

        peer.send(&Notification::Fallback(FallbackNotification {
            reason: FallbackReason::NoPipesAvailable,
            request_id,
        }))
        .unwrap();
        assert!(matches!(
            cp.poll_pipe(&pending),
            Err(PipeError::PipeAllocationFailed {
                reason: FallbackReason::NoPipesAvailable
            })
        ));
        assert_eq!(cp.last_fallback().map(|f| f.request_id), Some(request_id));
    }

    #[test]
    fn test_half_granted_pair_is_freed_on_fallback() {
        let (mut cp, mut peer, device) = setup();
        expect_register(&mut peer);
        let pending = cp.allocate_pipe(PipeKind::RxTx).unwrap();

        let rx_req = peer.poll().unwrap().unwrap();
        let Some(Notification::AllocatePipe(tx_req)) = peer.poll().unwrap() else {
            panic!("expected tx request");
        };
        grant(&device, &mut peer, rx_req, 3, 0x20000);
        peer.send(&Notification::Fallback(FallbackNotification {
            reason: FallbackReason::OutOfMemory,
            request_id: tx_req.request_id,
        }))
        .unwrap();

        assert!(matches!(
            cp.poll_pipe(&pending),
            Err(PipeError::PipeAllocationFailed { .. })
        ));
        assert_eq!(
            peer.poll().unwrap(),
            Some(Notification::FreePipe(FreePipeNotification { pipe_id: 3 }))
        );
    }

    #[test]
    fn test_unsolicited_grant_is_protocol_error() {
        let (mut cp, mut peer, _device) = setup();
        peer.send(&Notification::AllocatePipe(AllocatePipeNotification {
            request_id: 99,
            pipe_id: 1,
            direction: RingDirection::Rx,
            fallback: false,
            ring_base: 0,
            ring_size: 64,
        }))
        .unwrap();
        assert!(matches!(
            cp.process_notifications(),
            Err(PipeError::ProtocolMismatch(ProtocolError::InvalidField {
                field: "request_id",
                ..
            }))
        ));
    }

    #[test]
    fn test_mmio_acknowledged_in_order() {
        let (mut cp, mut peer, _device) = setup();
        expect_register(&mut peer);
        let first = cp.write_register(0x100, 5).unwrap();
        let second = cp.read_register(0x108).unwrap();

        let Some(Notification::Mmio(write)) = peer.poll().unwrap() else {
            panic!("expected mmio");
        };
        peer.send(&Notification::Mmio(write)).unwrap();
        cp.process_notifications().unwrap();
        assert!(cp.is_acknowledged(first));
        assert!(!cp.is_acknowledged(second));
        assert_eq!(cp.register_value(0x100), Some(5));

        let Some(Notification::Mmio(read)) = peer.poll().unwrap() else {
            panic!("expected mmio");
        };
        peer.send(&Notification::Mmio(MmioNotification { value: 42, ..read })).unwrap();
        cp.process_notifications().unwrap();
        assert!(cp.is_acknowledged(second));
        assert_eq!(cp.register_value(0x108), Some(42));

        // An acknowledgement nobody asked for.
        peer.send(&Notification::Mmio(read)).unwrap();
        assert!(cp.process_notifications().is_err());
    }

    #[test]
    fn test_status_notifications() {
        let (mut cp, mut peer, _device) = setup();
        peer.send(&Notification::NotifBuf(NotifBufNotification {
            op: NotifBufOp::Register,
            notif_buf_id: 4,
            capacity: CAP,
        }))
        .unwrap();
        peer.send(&Notification::RoundRobin(RoundRobinNotification {
            enabled: true,
            target_queue: 2,
        }))
        .unwrap();
        assert_eq!(cp.process_notifications().unwrap(), 2);
        assert_eq!(cp.notif_buf_id(), Some(4));
        assert_eq!(
            cp.round_robin(),
            RoundRobinStatus {
                enabled: true,
                target_queue: 2
            }
        );
    }

    #[test]
    fn test_unsolicited_ack_stops_the_control_plane() {
        let (mut cp, mut peer, _device) = setup();
        expect_register(&mut peer);
        peer.send(&Notification::Mmio(MmioNotification {
            op: MmioOp::Write,
            register: 0x100,
            value: 1,
        }))
        .unwrap();

        for _ in 0..2 {
            assert!(matches!(
                cp.process_notifications(),
                Err(PipeError::ProtocolMismatch(ProtocolError::InvalidField {
                    tag: NotificationTag::Mmio,
                    field: "register",
                    ..
                }))
            ));
        }
        assert!(cp.failure().is_some());
        assert!(matches!(cp.allocate_pipe(PipeKind::Rx), Err(PipeError::ProtocolMismatch(_))));
        assert!(matches!(cp.write_register(0x100, 2), Err(PipeError::ProtocolMismatch(_))));
        // Nothing was sent after the failure.
        assert_eq!(peer.poll().unwrap(), None);
    }

    #[test]
    fn test_grant_of_live_pipe_id_is_protocol_error() {
        let (mut cp, mut peer, device) = setup();
        expect_register(&mut peer);

        let first = cp.allocate_pipe(PipeKind::Rx).unwrap();
        let request = peer.poll().unwrap().unwrap();
        grant(&device, &mut peer, request, 5, 0x10000);
        let mut rx = cp.poll_pipe(&first).unwrap().unwrap().into_rx().unwrap();

        let second = cp.allocate_pipe(PipeKind::Rx).unwrap();
        let request = peer.poll().unwrap().unwrap();
        grant(&device, &mut peer, request, 5, 0x20000);
        assert!(matches!(
            cp.poll_pipe(&second),
            Err(PipeError::ProtocolMismatch(ProtocolError::InvalidField {
                field: "pipe_id",
                value: 5,
                ..
            }))
        ));
        assert!(matches!(cp.poll_pipe(&second), Err(PipeError::ProtocolMismatch(_))));
        // The first handle still owns pipe 5.
        assert!(cp.is_pipe_alive(5));
        assert!(rx.recv_pkts().unwrap().is_empty());
    }

    #[test]
    fn test_bad_ring_layout_is_protocol_error() {
        let (mut cp, mut peer, _device) = setup();
        expect_register(&mut peer);
        let pending = cp.allocate_pipe(PipeKind::Tx).unwrap();
        let Some(Notification::AllocatePipe(req)) = peer.poll().unwrap() else {
            panic!("expected an allocation request");
        };
        // No queue was laid out at this base.
        peer.send(&Notification::AllocatePipe(AllocatePipeNotification {
            pipe_id: 2,
            ring_base: 0x40000,
            ..req
        }))
        .unwrap();
        assert!(matches!(
            cp.poll_pipe(&pending),
            Err(PipeError::ProtocolMismatch(ProtocolError::Layout(_)))
        ));
        assert!(matches!(
            cp.process_notifications(),
            Err(PipeError::ProtocolMismatch(ProtocolError::Layout(_)))
        ));
    }

    #[test]
    fn test_tx_complete_saturates() {
        let (mut cp, mut peer, device) = setup();
        expect_register(&mut peer);
        let pending = cp.allocate_pipe(PipeKind::Tx).unwrap();
        let request = peer.poll().unwrap().unwrap();
        grant(&device, &mut peer, request, 4, 0x10000);
        let _tx = cp.poll_pipe(&pending).unwrap().unwrap();

        for _ in 0..2 {
            peer.send(&Notification::Pipe(PipeNotification {
                pipe_id: 4,
                event: PipeEvent::TxComplete,
                value: u64::MAX,
            }))
            .unwrap();
        }
        assert_eq!(cp.process_notifications().unwrap(), 2);
        assert_eq!(cp.tx_completed(4), Some(u64::MAX));
    }

    #[test]
    fn test_bind_installed_or_declined() {
        let (mut cp, mut peer, device) = setup();
        expect_register(&mut peer);
        let pending = cp.allocate_pipe(PipeKind::Rx).unwrap();
        let request = peer.poll().unwrap().unwrap();
        grant(&device, &mut peer, request, 6, 0x10000);
        let _rx = cp.poll_pipe(&pending).unwrap().unwrap();

        let rule = FlowRule {
            dst_port: 8080,
            src_port: 0,
            dst_ip: 0x0A00_0002,
            src_ip: 0,
            protocol: 17,
        };
        let accepted = cp.bind(6, rule).unwrap();
        let declined = cp.bind(6, FlowRule { dst_port: 9090, ..rule }).unwrap();
        assert!(!cp.poll_bind(&accepted).unwrap());

        let Some(Notification::FlowRule(first)) = peer.poll().unwrap() else {
            panic!("expected a flow rule");
        };
        assert_eq!(first.rule, rule);
        peer.send(&Notification::FlowRule(first)).unwrap();
        let Some(Notification::FlowRule(second)) = peer.poll().unwrap() else {
            panic!("expected a flow rule");
        };
        peer.send(&Notification::Fallback(FallbackNotification {
            reason: FallbackReason::FlowSteering,
            request_id: second.request_id,
        }))
        .unwrap();

        assert!(cp.poll_bind(&accepted).unwrap());
        assert!(matches!(
            cp.poll_bind(&declined),
            Err(PipeError::BindFailed {
                pipe_id: 6,
                reason: FallbackReason::FlowSteering
            })
        ));
        assert!(matches!(cp.poll_bind(&accepted), Err(PipeError::UnknownRequest { .. })));
        assert!(matches!(cp.bind(99, rule), Err(PipeError::UnknownPipe { pipe_id: 99 })));
    }
}
