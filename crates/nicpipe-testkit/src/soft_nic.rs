//! A NIC made of heap memory.
//!
//! [`SoftNic`] implements [`Device`] and plays the device side of every
//! protocol exchange, one batch of notifications per [`SoftNic::step`]. Tests
//! drive it explicitly, so every interleaving they exercise is deterministic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use nicpipe::device::regs;
use nicpipe::frame::{drain_messages, encode_messages};
use nicpipe::layout::queue_footprint;
use nicpipe::notification::notif_buf_len;
use nicpipe::region::heap_region;
use nicpipe::{
    AllocatePipeNotification, Device, DeviceError, Doorbell, FallbackNotification, FallbackReason, Flit, FlowRule,
    FreePipeNotification, MappedRegion, MmioNotification, MmioOp, NotifBufNotification, NotifBufOp, Notification,
    NotificationBufPair, NotificationRecord, PipeEvent, PipeNotification, ProtocolError, Queue, QueueConsumer,
    QueueProducer, RingDirection, RoundRobinNotification,
};
use parking_lot::Mutex;

use crate::TestError;

const RING_ALIGN: u64 = 4096;

/// Memory size and allocation policy.
#[derive(Debug, Clone)]
pub struct SoftNicConfig {
    /// Bytes of device memory.
    pub memory_len: usize,
    /// Rings are carved from here upwards; everything below is left to the
    /// notification buffers.
    pub ring_area_offset: u64,
    /// Id given to the first pipe.
    pub first_pipe_id: u32,
    /// Allocations beyond this many live pipes get `NoPipesAvailable`.
    pub max_pipes: usize,
    /// Size of the flow table. Rules beyond it are declined.
    pub max_flow_rules: usize,
}

impl Default for SoftNicConfig {
    fn default() -> Self {
        Self {
            memory_len: 8 << 20,
            ring_area_offset: 1 << 20,
            first_pipe_id: 1,
            max_pipes: 64,
            max_flow_rules: 256,
        }
    }
}

enum DeviceRing {
    // The device produces into Rx rings and consumes from Tx rings.
    Rx(QueueProducer<Flit>),
    Tx(QueueConsumer<Flit>),
}

struct DevicePipe {
    ring: DeviceRing,
    fallback: bool,
}

struct Inner {
    config: SoftNicConfig,
    registers: HashMap<u64, u64>,
    notif: Option<NotificationBufPair>,
    attach_error: Option<String>,
    doorbell: Option<Doorbell>,
    next_ring: u64,
    next_pipe_id: u32,
    pipes: BTreeMap<u32, DevicePipe>,
    flows: HashMap<FlowRule, u32>,
    fail_next: Option<FallbackReason>,
    round_robin: bool,
    rr_cursor: usize,
    notif_bufs: u32,
}

/// Software stand-in for the NIC. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SoftNic {
    memory: MappedRegion,
    inner: Arc<Mutex<Inner>>,
}

impl SoftNic {
    pub fn new() -> Self {
        Self::with_config(SoftNicConfig::default())
    }

    pub fn with_config(config: SoftNicConfig) -> Self {
        let memory = match heap_region(config.memory_len) {
            Ok(memory) => memory,
            Err(e) => panic!("cannot allocate {} bytes of device memory: {}", config.memory_len, e),
        };
        let inner = Inner {
            next_ring: config.ring_area_offset,
            next_pipe_id: config.first_pipe_id,
            config,
            registers: HashMap::new(),
            notif: None,
            attach_error: None,
            doorbell: None,
            pipes: BTreeMap::new(),
            flows: HashMap::new(),
            fail_next: None,
            round_robin: false,
            rr_cursor: 0,
            notif_bufs: 0,
        };
        Self {
            memory,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Ring `doorbell` after every notification the device posts.
    pub fn set_doorbell(&self, doorbell: Doorbell) {
        let mut inner = self.inner.lock();
        match inner.notif.as_mut() {
            Some(notif) => notif.set_doorbell(doorbell),
            None => inner.doorbell = Some(doorbell),
        }
    }

    /// Service every notification software has posted. Returns how many.
    pub fn step(&self) -> Result<usize, TestError> {
        let mut inner = self.inner.lock();
        let mut requests = Vec::new();
        {
            let notif = inner.notif_mut()?;
            while let Some(n) = notif.poll()? {
                requests.push(n);
            }
        }
        let count = requests.len();
        for request in requests {
            inner.handle(&self.memory, request)?;
        }
        Ok(count)
    }

    /// Frame `payload` into an Rx ring and announce it.
    pub fn inject(&self, pipe_id: u32, payload: &[u8]) -> Result<(), TestError> {
        self.inject_batch(pipe_id, &[payload])
    }

    /// Frame a batch into an Rx ring, published at once, and announce it.
    pub fn inject_batch(&self, pipe_id: u32, payloads: &[&[u8]]) -> Result<(), TestError> {
        let mut inner = self.inner.lock();
        let head = match inner.pipes.get_mut(&pipe_id).map(|p| &mut p.ring) {
            Some(DeviceRing::Rx(producer)) => {
                encode_messages(producer, payloads)?;
                producer.head()
            }
            Some(DeviceRing::Tx(_)) => {
                return Err(TestError::Setup(format!("pipe {} is not an rx pipe", pipe_id)));
            }
            None => return Err(TestError::Setup(format!("no pipe {}", pipe_id))),
        };
        inner.post(Notification::Pipe(PipeNotification {
            pipe_id,
            event: PipeEvent::RxReady,
            value: head as u64,
        }))
    }

    /// Deliver a packet the way the flow table steers it: to the pipe bound
    /// to `flow`, or else to the first fallback pipe. Returns the pipe used.
    pub fn deliver(&self, flow: &FlowRule, payload: &[u8]) -> Result<u32, TestError> {
        let pipe_id = {
            let inner = self.inner.lock();
            inner.flows.get(flow).copied().or_else(|| {
                inner
                    .pipes
                    .iter()
                    .find(|(_, p)| p.fallback && matches!(p.ring, DeviceRing::Rx(_)))
                    .map(|(id, _)| *id)
            })
        };
        let pipe_id = pipe_id.ok_or_else(|| TestError::Setup(format!("no pipe takes {:?}", flow)))?;
        self.inject(pipe_id, payload)?;
        Ok(pipe_id)
    }

    /// Pipe a flow is bound to, if any.
    pub fn flow_target(&self, flow: &FlowRule) -> Option<u32> {
        self.inner.lock().flows.get(flow).copied()
    }

    /// Take everything software has sent on a Tx pipe and report the bytes
    /// as transmitted.
    pub fn drain_tx(&self, pipe_id: u32) -> Result<Vec<Vec<u8>>, TestError> {
        let mut inner = self.inner.lock();
        let messages = match inner.pipes.get_mut(&pipe_id).map(|p| &mut p.ring) {
            Some(DeviceRing::Tx(consumer)) => {
                drain_messages(consumer).map_err(|e| TestError::Protocol(ProtocolError::Framing(e)))?
            }
            Some(DeviceRing::Rx(_)) => {
                return Err(TestError::Setup(format!("pipe {} is not a tx pipe", pipe_id)));
            }
            None => return Err(TestError::Setup(format!("no pipe {}", pipe_id))),
        };
        if !messages.is_empty() {
            let bytes: usize = messages.iter().map(Vec::len).sum();
            inner.post(Notification::Pipe(PipeNotification {
                pipe_id,
                event: PipeEvent::TxComplete,
                value: bytes as u64,
            }))?;
        }
        Ok(messages)
    }

    /// Tear a pipe down without being asked.
    pub fn teardown(&self, pipe_id: u32) -> Result<(), TestError> {
        let mut inner = self.inner.lock();
        if inner.remove_pipe(pipe_id).is_none() {
            return Err(TestError::Setup(format!("no pipe {}", pipe_id)));
        }
        tracing::debug!(pipe_id, "soft nic tearing down pipe");
        inner.post(Notification::FreePipe(FreePipeNotification { pipe_id }))
    }

    /// Post a notification of our choosing.
    pub fn push(&self, notification: Notification) -> Result<(), TestError> {
        self.inner.lock().post(notification)
    }

    /// Post a raw record, bypassing encoding. `seq` of zero means "stamp it
    /// with the next sequence number".
    pub fn push_record(&self, mut record: NotificationRecord) -> Result<(), TestError> {
        let mut inner = self.inner.lock();
        let notif = inner.notif_mut()?;
        if record.seq == 0 {
            record.seq = notif.next_send_seq();
        }
        notif.send_raw(record)?;
        Ok(())
    }

    /// Decline the next allocation request with `reason`.
    pub fn fail_next_allocation(&self, reason: FallbackReason) {
        self.inner.lock().fail_next = Some(reason);
    }

    /// Current value of a device register.
    pub fn register(&self, register: u64) -> u64 {
        self.inner.lock().registers.get(&register).copied().unwrap_or(0)
    }

    /// Ids of the pipes the device considers live.
    pub fn pipe_ids(&self) -> Vec<u32> {
        self.inner.lock().pipes.keys().copied().collect()
    }

    pub fn is_fallback_pipe(&self, pipe_id: u32) -> bool {
        self.inner.lock().pipes.get(&pipe_id).is_some_and(|p| p.fallback)
    }

    pub fn round_robin_enabled(&self) -> bool {
        self.inner.lock().round_robin
    }
}

impl Default for SoftNic {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftNic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftNic")
            .field("memory_len", &self.memory.len())
            .field("pipes", &self.pipe_ids())
            .finish()
    }
}

impl Device for SoftNic {
    fn map_region(&self, offset: u64, len: usize) -> Result<MappedRegion, DeviceError> {
        usize::try_from(offset)
            .ok()
            .and_then(|offset| self.memory.subregion(offset, len))
            .ok_or(DeviceError::OutOfBounds {
                offset,
                len,
                size: self.memory.len(),
            })
    }

    fn mmio_write(&self, register: u64, value: u64) {
        let mut inner = self.inner.lock();
        inner.registers.insert(register, value);
        if register == regs::REG_NOTIF_BUF_CAPACITY {
            inner.attach_notif_bufs(&self.memory);
        }
    }

    fn mmio_read(&self, register: u64) -> u64 {
        self.register(register)
    }
}

impl Inner {
    fn notif_mut(&mut self) -> Result<&mut NotificationBufPair, TestError> {
        match self.notif.as_mut() {
            Some(notif) => Ok(notif),
            None => Err(TestError::Setup(
                self.attach_error
                    .clone()
                    .unwrap_or_else(|| "notification buffers not registered".to_string()),
            )),
        }
    }

    fn post(&mut self, notification: Notification) -> Result<(), TestError> {
        self.notif_mut()?.send(&notification)?;
        Ok(())
    }

    fn attach_notif_bufs(&mut self, memory: &MappedRegion) {
        let base = self.registers.get(&regs::REG_NOTIF_BUF_BASE).copied().unwrap_or(0);
        let capacity = self.registers.get(&regs::REG_NOTIF_BUF_CAPACITY).copied().unwrap_or(0);
        let attached = u32::try_from(capacity)
            .ok()
            .and_then(|capacity| {
                let region = memory.subregion(base as usize, notif_buf_len(capacity))?;
                Some(NotificationBufPair::attach_device_side(region, capacity).map_err(|e| e.to_string()))
            })
            .unwrap_or_else(|| Err(format!("notification buffers at {:#x} do not fit", base)));

        match attached {
            Ok(mut notif) => {
                if let Some(doorbell) = self.doorbell.take() {
                    notif.set_doorbell(doorbell);
                }
                tracing::debug!(base, capacity, "soft nic attached notification buffers");
                self.notif = Some(notif);
                self.attach_error = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "soft nic could not attach notification buffers");
                self.notif = None;
                self.attach_error = Some(e);
            }
        }
    }

    fn handle(&mut self, memory: &MappedRegion, request: Notification) -> Result<(), TestError> {
        match request {
            Notification::AllocatePipe(req) => {
                let reply = match self.allocate(memory, &req) {
                    Ok(grant) => Notification::AllocatePipe(grant),
                    Err(reason) => Notification::Fallback(FallbackNotification {
                        reason,
                        request_id: req.request_id,
                    }),
                };
                self.post(reply)
            }
            Notification::FreePipe(FreePipeNotification { pipe_id }) => {
                if self.remove_pipe(pipe_id).is_some() {
                    tracing::debug!(pipe_id, "soft nic freed pipe");
                    self.post(request)?;
                }
                Ok(())
            }
            Notification::Mmio(mmio) => {
                let value = match mmio.op {
                    MmioOp::Write => {
                        self.registers.insert(mmio.register, mmio.value);
                        mmio.value
                    }
                    MmioOp::Read => self.registers.get(&mmio.register).copied().unwrap_or(0),
                };
                self.post(Notification::Mmio(MmioNotification { value, ..mmio }))
            }
            Notification::NotifBuf(nb) => {
                let notif_buf_id = match nb.op {
                    NotifBufOp::Register => {
                        self.notif_bufs += 1;
                        self.notif_bufs
                    }
                    NotifBufOp::Unregister => nb.notif_buf_id,
                };
                self.post(Notification::NotifBuf(NotifBufNotification { notif_buf_id, ..nb }))
            }
            Notification::RoundRobin(rr) => {
                self.round_robin = rr.enabled;
                let target_queue = self.next_round_robin_target();
                self.post(Notification::RoundRobin(RoundRobinNotification {
                    enabled: rr.enabled,
                    target_queue,
                }))
            }
            Notification::FlowRule(req) => {
                let is_rx = self
                    .pipes
                    .get(&req.pipe_id)
                    .is_some_and(|p| matches!(p.ring, DeviceRing::Rx(_)));
                let replaces = self.flows.contains_key(&req.rule);
                if !is_rx || (!replaces && self.flows.len() >= self.config.max_flow_rules) {
                    tracing::debug!(pipe_id = req.pipe_id, rule = ?req.rule, "soft nic declined flow rule");
                    return self.post(Notification::Fallback(FallbackNotification {
                        reason: FallbackReason::FlowSteering,
                        request_id: req.request_id,
                    }));
                }
                self.flows.insert(req.rule, req.pipe_id);
                self.post(request)
            }
            Notification::Fallback(_) | Notification::Pipe(_) => {
                tracing::warn!(tag = ?request.tag(), "soft nic ignoring device-only notification");
                Ok(())
            }
        }
    }

    fn allocate(
        &mut self,
        memory: &MappedRegion,
        req: &AllocatePipeNotification,
    ) -> Result<AllocatePipeNotification, FallbackReason> {
        if let Some(reason) = self.fail_next.take() {
            return Err(reason);
        }
        if self.pipes.len() >= self.config.max_pipes {
            return Err(FallbackReason::NoPipesAvailable);
        }
        if req.ring_size < 2 || !req.ring_size.is_power_of_two() {
            return Err(FallbackReason::InvalidRequest);
        }

        let len = queue_footprint::<Flit>(req.ring_size);
        let base = self.next_ring.next_multiple_of(RING_ALIGN);
        let region = memory
            .subregion(base as usize, len)
            .ok_or(FallbackReason::OutOfMemory)?;
        let queue = Queue::<Flit>::init(region, req.ring_size).map_err(|_| FallbackReason::InvalidRequest)?;
        self.next_ring = base + len as u64;

        let pipe_id = self.next_pipe_id;
        self.next_pipe_id += 1;
        let ring = match req.direction {
            RingDirection::Rx => DeviceRing::Rx(queue.into_producer()),
            RingDirection::Tx => DeviceRing::Tx(queue.into_consumer()),
        };
        self.pipes.insert(
            pipe_id,
            DevicePipe {
                ring,
                fallback: req.fallback,
            },
        );
        tracing::debug!(pipe_id, ring_base = base, ring_size = req.ring_size, "soft nic granted pipe");

        Ok(AllocatePipeNotification {
            pipe_id,
            ring_base: base,
            ..*req
        })
    }

    fn remove_pipe(&mut self, pipe_id: u32) -> Option<DevicePipe> {
        let pipe = self.pipes.remove(&pipe_id)?;
        self.flows.retain(|_, target| *target != pipe_id);
        Some(pipe)
    }

    fn next_round_robin_target(&mut self) -> u32 {
        let rx: Vec<u32> = self
            .pipes
            .iter()
            .filter(|(_, p)| matches!(p.ring, DeviceRing::Rx(_)))
            .map(|(id, _)| *id)
            .collect();
        if rx.is_empty() {
            return 0;
        }
        let target = rx[self.rr_cursor % rx.len()];
        self.rr_cursor += 1;
        target
    }
}
