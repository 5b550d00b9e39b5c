//! Conformance scenarios for nicpipe.
//!
//! Each `run_*` function sets up a [`SoftNic`] and a [`ControlPlane`] on top of
//! it, drives both sides, and panics with a description if anything deviates.
//!
//! # Usage
//!
//! ```ignore
//! #[test]
//! fn allocate_and_free() {
//!     nicpipe_testkit::run_allocate_and_free();
//! }
//! ```

use nicpipe::{
    AllocatePipeNotification, ControlPlane, FallbackReason, FlowRule, FreePipeNotification, MessageIterator,
    MmioNotification, MmioOp, Notification, NotificationTag, Pipe, PipeConfig, PipeError, PipeEvent, PipeKind,
    PipeNotification, ProtocolError, RingDirection, RingError, RxPipe, TxPipe,
};

mod soft_nic;

pub use soft_nic::{SoftNic, SoftNicConfig};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// The fixture could not be set up.
    Setup(String),
    /// A pipe or control-plane call failed.
    Pipe(PipeError),
    /// The software side sent something the device could not decode.
    Protocol(ProtocolError),
    /// A device-side ring was full.
    Ring(RingError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Pipe(e) => write!(f, "pipe error: {}", e),
            TestError::Protocol(e) => write!(f, "protocol error: {}", e),
            TestError::Ring(e) => write!(f, "device ring error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<PipeError> for TestError {
    fn from(e: PipeError) -> Self {
        TestError::Pipe(e)
    }
}

impl From<ProtocolError> for TestError {
    fn from(e: ProtocolError) -> Self {
        TestError::Protocol(e)
    }
}

impl From<RingError> for TestError {
    fn from(e: RingError) -> Self {
        TestError::Ring(e)
    }
}

/// Install a fmt subscriber that writes through the test harness. Safe to
/// call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(TestError::Assertion(format!($($arg)+)));
        }
    };
}

// ============================================================================
// Fixture
// ============================================================================

/// A control plane wired to a software NIC.
pub struct Harness {
    pub nic: SoftNic,
    pub cp: ControlPlane<SoftNic>,
}

impl Harness {
    pub fn new(nic_config: SoftNicConfig, config: PipeConfig) -> Result<Self, TestError> {
        init_tracing();
        let nic = SoftNic::with_config(nic_config);
        let cp = ControlPlane::new(nic.clone(), config)?;
        let mut harness = Self { nic, cp };
        harness.settle()?;
        Ok(harness)
    }

    /// Small rings, default everything else.
    pub fn small() -> Result<Self, TestError> {
        Self::new(SoftNicConfig::default(), small_config())
    }

    /// Let both sides exchange notifications until neither has anything left.
    pub fn settle(&mut self) -> Result<(), TestError> {
        for _ in 0..64 {
            let device = self.nic.step()?;
            let software = self.cp.process_notifications()?;
            if device == 0 && software == 0 {
                return Ok(());
            }
        }
        Err(TestError::Setup("notification exchange did not settle".into()))
    }

    /// Allocate a pipe and drive the exchange until it is granted.
    pub fn allocate(&mut self, kind: PipeKind) -> Result<Pipe, TestError> {
        let pending = self.cp.allocate_pipe(kind)?;
        for _ in 0..64 {
            self.nic.step()?;
            if let Some(pipe) = self.cp.poll_pipe(&pending)? {
                return Ok(pipe);
            }
        }
        Err(TestError::Setup(format!("{:?} allocation never completed", kind)))
    }

    /// Install a flow rule and drive the exchange until the device answers.
    pub fn bind(&mut self, pipe_id: u32, rule: FlowRule) -> Result<(), TestError> {
        let pending = self.cp.bind(pipe_id, rule)?;
        for _ in 0..64 {
            self.nic.step()?;
            if self.cp.poll_bind(&pending)? {
                return Ok(());
            }
        }
        Err(TestError::Setup(format!("flow rule for pipe {} never settled", pipe_id)))
    }

    pub fn rx(&mut self) -> Result<RxPipe, TestError> {
        self.allocate(PipeKind::Rx)?
            .into_rx()
            .ok_or_else(|| TestError::Setup("expected an rx pipe".into()))
    }

    pub fn tx(&mut self) -> Result<TxPipe, TestError> {
        self.allocate(PipeKind::Tx)?
            .into_tx()
            .ok_or_else(|| TestError::Setup("expected a tx pipe".into()))
    }
}

/// Config with rings small enough to wrap quickly.
pub fn small_config() -> PipeConfig {
    PipeConfig {
        notification_capacity: 64,
        pipe_capacity: 16,
        batch_limit: 16,
        ..PipeConfig::default()
    }
}

fn payload(i: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| (i * 31 + j) as u8).collect()
}

fn run(name: &str, result: Result<(), TestError>) {
    if let Err(e) = result {
        panic!("{} failed: {}", name, e);
    }
}

// ============================================================================
// Pipe lifecycle
// ============================================================================

/// A pipe granted as id 7 with a 1024-flit ring is built from that grant, and
/// refuses to receive once the device frees it.
pub fn run_allocate_and_free() {
    run("run_allocate_and_free", run_allocate_and_free_inner());
}

fn run_allocate_and_free_inner() -> Result<(), TestError> {
    let nic_config = SoftNicConfig {
        first_pipe_id: 7,
        ..SoftNicConfig::default()
    };
    let config = PipeConfig {
        pipe_capacity: 1024,
        ..PipeConfig::default()
    };
    let mut h = Harness::new(nic_config, config)?;
    let mut rx = h.rx()?;

    ensure!(rx.id() == 7, "expected pipe 7, got {}", rx.id());
    ensure!(rx.ring().ring_size() == 1024, "ring size {}", rx.ring().ring_size());
    let base = rx.ring().ring_base();
    ensure!(base >= SoftNicConfig::default().ring_area_offset, "ring base {:#x}", base);
    ensure!(h.cp.is_pipe_alive(7), "pipe 7 should be alive");

    h.nic.teardown(7)?;
    h.settle()?;
    ensure!(!h.cp.is_pipe_alive(7), "pipe 7 should be gone");
    for _ in 0..2 {
        match rx.recv_pkts() {
            Err(PipeError::PipeTornDown { pipe_id: 7 }) => {}
            other => return Err(TestError::Assertion(format!("expected PipeTornDown, got {:?}", other))),
        }
    }
    Ok(())
}

/// Software-initiated free completes once the device confirms it.
pub fn run_software_free() {
    run("run_software_free", run_software_free_inner());
}

fn run_software_free_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut tx = h.tx()?;
    let id = tx.id();

    h.cp.free_pipe(id)?;
    h.cp.free_pipe(id)?;
    ensure!(!tx.is_torn_down(), "teardown must wait for the device");
    h.settle()?;
    ensure!(tx.is_torn_down(), "pipe should be torn down");
    ensure!(h.nic.pipe_ids().is_empty(), "device still has {:?}", h.nic.pipe_ids());
    ensure!(
        matches!(tx.send_one(b"late"), Err(PipeError::PipeTornDown { .. })),
        "send after teardown must fail"
    );
    ensure!(
        matches!(h.cp.free_pipe(id), Err(PipeError::UnknownPipe { .. })),
        "freeing twice after teardown must fail"
    );
    Ok(())
}

/// Declined allocations surface as errors and are not retried.
pub fn run_allocation_fallback() {
    run("run_allocation_fallback", run_allocation_fallback_inner());
}

fn run_allocation_fallback_inner() -> Result<(), TestError> {
    let nic_config = SoftNicConfig {
        max_pipes: 1,
        ..SoftNicConfig::default()
    };
    let mut h = Harness::new(nic_config, small_config())?;

    h.nic.fail_next_allocation(FallbackReason::FlowSteering);
    match h.allocate(PipeKind::Rx) {
        Err(TestError::Pipe(PipeError::PipeAllocationFailed {
            reason: FallbackReason::FlowSteering,
        })) => {}
        other => return Err(TestError::Assertion(format!("expected FlowSteering, got {:?}", other.err()))),
    }

    let _rx = h.rx()?;
    match h.allocate(PipeKind::Tx) {
        Err(TestError::Pipe(PipeError::PipeAllocationFailed {
            reason: FallbackReason::NoPipesAvailable,
        })) => {}
        other => return Err(TestError::Assertion(format!("expected NoPipesAvailable, got {:?}", other.err()))),
    }
    ensure!(h.cp.live_pipes() == 1, "live pipes {}", h.cp.live_pipes());
    Ok(())
}

/// A pair whose second half is declined gives back the first half.
pub fn run_pair_allocation_rollback() {
    run("run_pair_allocation_rollback", run_pair_allocation_rollback_inner());
}

fn run_pair_allocation_rollback_inner() -> Result<(), TestError> {
    let nic_config = SoftNicConfig {
        max_pipes: 1,
        ..SoftNicConfig::default()
    };
    let mut h = Harness::new(nic_config, small_config())?;
    match h.allocate(PipeKind::RxTx) {
        Err(TestError::Pipe(PipeError::PipeAllocationFailed { .. })) => {}
        other => return Err(TestError::Assertion(format!("expected failure, got {:?}", other.err()))),
    }
    h.settle()?;
    ensure!(h.nic.pipe_ids().is_empty(), "device kept {:?}", h.nic.pipe_ids());
    ensure!(h.cp.live_pipes() == 0, "control plane kept {} pipes", h.cp.live_pipes());
    Ok(())
}

/// A fallback Rx pipe is requested as such.
pub fn run_fallback_rx_pipe() {
    run("run_fallback_rx_pipe", run_fallback_rx_pipe_inner());
}

fn run_fallback_rx_pipe_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let rx = h
        .allocate(PipeKind::FallbackRx)?
        .into_rx()
        .ok_or_else(|| TestError::Setup("expected an rx pipe".into()))?;
    ensure!(rx.is_fallback(), "pipe should be a fallback pipe");
    ensure!(h.nic.is_fallback_pipe(rx.id()), "device should know it is a fallback pipe");

    let pair = h
        .allocate(PipeKind::FallbackRxTx)?
        .into_rx_tx()
        .ok_or_else(|| TestError::Setup("expected an rx/tx pipe".into()))?;
    ensure!(pair.rx().is_fallback(), "rx half should be a fallback pipe");
    ensure!(h.nic.is_fallback_pipe(pair.rx().id()), "device should know the rx half is a fallback pipe");
    ensure!(!h.nic.is_fallback_pipe(pair.tx().id()), "tx half is an ordinary pipe");
    Ok(())
}

/// An Rx/Tx pair is only closed once both halves are torn down.
pub fn run_rx_tx_lifecycle() {
    run("run_rx_tx_lifecycle", run_rx_tx_lifecycle_inner());
}

fn run_rx_tx_lifecycle_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let pipe = h
        .allocate(PipeKind::RxTx)?
        .into_rx_tx()
        .ok_or_else(|| TestError::Setup("expected an rx/tx pipe".into()))?;

    h.nic.teardown(pipe.rx().id())?;
    h.settle()?;
    ensure!(pipe.rx().is_torn_down(), "rx half should be down");
    ensure!(!pipe.is_closed(), "pair must stay open while tx is alive");

    h.nic.teardown(pipe.tx().id())?;
    h.settle()?;
    ensure!(pipe.is_closed(), "pair should be closed");
    Ok(())
}

// ============================================================================
// Data path
// ============================================================================

/// Messages arrive in order and byte-identical, with batching done by the
/// device.
pub fn run_rx_round_trip() {
    run("run_rx_round_trip", run_rx_round_trip_inner());
}

fn run_rx_round_trip_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut rx = h.rx()?;

    let sent: Vec<Vec<u8>> = (0..5).map(|i| payload(i, i * 13)).collect();
    let batch: Vec<&[u8]> = sent.iter().map(Vec::as_slice).collect();
    h.nic.inject_batch(rx.id(), &batch)?;

    let mut received = Vec::new();
    {
        let mut iter = rx.recv_pkts()?.iter();
        while iter.has_next() {
            received.push(iter.next()?.to_vec());
        }
        ensure!(
            matches!(iter.next(), Err(PipeError::IteratorExhausted)),
            "next() past the end must fail"
        );
    }
    ensure!(received == sent, "received {:?}, sent {:?}", received, sent);
    ensure!(rx.available()? == 0, "ring should be empty");
    ensure!(rx.stats().messages == 5, "stats {:?}", rx.stats());
    Ok(())
}

/// Draining an empty pipe never errors and never moves anything.
pub fn run_empty_is_idempotent() {
    run("run_empty_is_idempotent", run_empty_is_idempotent_inner());
}

fn run_empty_is_idempotent_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut rx = h.rx()?;
    for _ in 0..10 {
        ensure!(rx.recv_pkts()?.is_empty(), "batch should be empty");
        ensure!(rx.peek_pkts()?.is_empty(), "peek batch should be empty");
    }
    rx.confirm(0)?;
    ensure!(rx.stats().batches == 0, "empty batches must not count");

    h.nic.inject(rx.id(), b"after")?;
    let got = rx.recv_pkts()?.to_vecs()?;
    ensure!(got == vec![b"after".to_vec()], "got {:?}", got);
    Ok(())
}

/// Peek, confirm part, and find the rest still there.
pub fn run_peek_confirm() {
    run("run_peek_confirm", run_peek_confirm_inner());
}

fn run_peek_confirm_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut rx = h.rx()?;
    let sent: Vec<Vec<u8>> = (0..5).map(|i| payload(i, 20)).collect();
    for msg in &sent {
        h.nic.inject(rx.id(), msg)?;
    }

    {
        let mut iter = rx.peek_pkts()?.iter();
        let mut n = 0;
        while iter.has_next() {
            let view = iter.next()?;
            ensure!(view.to_vec() == sent[n], "peeked message {} differs", n);
            n += 1;
        }
        ensure!(n == 5, "peeked {} messages", n);
        iter.confirm(2)?;
    }

    let rest = rx.recv_pkts()?.to_vecs()?;
    ensure!(rest == sent[2..], "remaining {:?}", rest);
    Ok(())
}

/// A message that straddles the end of the ring reads back identically.
pub fn run_wrap_reconstruction() {
    run("run_wrap_reconstruction", run_wrap_reconstruction_inner());
}

fn run_wrap_reconstruction_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?; // 16-flit rings
    let mut rx = h.rx()?;
    let mut scratch = Vec::new();
    let mut wrapped = 0;

    for round in 0..12 {
        let msg = payload(round, 300); // 5 flits
        h.nic.inject(rx.id(), &msg)?;
        let mut iter = rx.recv_pkts()?.iter();
        let view = iter.next()?;
        if !view.is_contiguous() {
            wrapped += 1;
        }
        ensure!(view.contiguous(&mut scratch) == msg.as_slice(), "round {} differs", round);
        ensure!(view.to_vec() == msg, "round {} copy differs", round);
    }
    ensure!(wrapped > 0, "no message wrapped");
    Ok(())
}

/// Transmitted batches reach the device whole and in order.
pub fn run_tx_round_trip() {
    run("run_tx_round_trip", run_tx_round_trip_inner());
}

fn run_tx_round_trip_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut tx = h.tx()?;
    let sent: Vec<Vec<u8>> = (0..3).map(|i| payload(i, 40 + i)).collect();
    let batch: Vec<&[u8]> = sent.iter().map(Vec::as_slice).collect();
    tx.send(&batch)?;

    let got = h.nic.drain_tx(tx.id())?;
    ensure!(got == sent, "device got {:?}", got);
    h.settle()?;
    let bytes: usize = sent.iter().map(Vec::len).sum();
    ensure!(
        h.cp.tx_completed(tx.id()) == Some(bytes as u64),
        "tx completed {:?}",
        h.cp.tx_completed(tx.id())
    );
    ensure!(tx.pending()? == 0, "ring should be drained");
    Ok(())
}

/// A batch that does not fit is refused as a whole.
pub fn run_tx_all_or_nothing() {
    run("run_tx_all_or_nothing", run_tx_all_or_nothing_inner());
}

fn run_tx_all_or_nothing_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?; // 15 usable flits
    let mut tx = h.tx()?;
    let big = payload(0, 400); // 7 flits
    tx.send(&[big.as_slice(), big.as_slice()])?;
    match tx.send(&[b"a", b"b"]) {
        Err(PipeError::QueueFull) => {}
        other => return Err(TestError::Assertion(format!("expected QueueFull, got {:?}", other))),
    }
    tx.send_one(b"c")?;

    let got = h.nic.drain_tx(tx.id())?;
    ensure!(got.len() == 3, "device got {} messages", got.len());
    ensure!(got[2] == b"c", "partial batch leaked: {:?}", got[2]);
    Ok(())
}

/// An Rx/Tx pair echoes what it receives.
pub fn run_forward_loopback() {
    run("run_forward_loopback", run_forward_loopback_inner());
}

fn run_forward_loopback_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut pipe = h
        .allocate(PipeKind::RxTx)?
        .into_rx_tx()
        .ok_or_else(|| TestError::Setup("expected an rx/tx pipe".into()))?;
    let sent = [payload(1, 10), payload(2, 70)];
    h.nic.inject_batch(pipe.rx().id(), &[sent[0].as_slice(), sent[1].as_slice()])?;

    let n = pipe.forward_batch(16)?;
    ensure!(n == 2, "forwarded {}", n);
    let got = h.nic.drain_tx(pipe.tx().id())?;
    ensure!(got == sent, "echoed {:?}", got);
    Ok(())
}

// ============================================================================
// Notifications
// ============================================================================

/// Register accesses are acknowledged in issue order.
pub fn run_mmio_ordering() {
    run("run_mmio_ordering", run_mmio_ordering_inner());
}

fn run_mmio_ordering_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let tickets = (0..8u64)
        .map(|i| h.cp.write_register(0x200 + i * 8, i * 100))
        .collect::<Result<Vec<_>, _>>()?;
    let read = h.cp.read_register(0x200 + 3 * 8)?;
    ensure!(!h.cp.is_acknowledged(tickets[0]), "acknowledged before the device ran");

    h.settle()?;
    for ticket in &tickets {
        ensure!(h.cp.is_acknowledged(*ticket), "ticket {:?} not acknowledged", ticket);
    }
    ensure!(h.cp.is_acknowledged(read), "read not acknowledged");
    ensure!(h.cp.register_value(0x218) == Some(300), "read back {:?}", h.cp.register_value(0x218));
    ensure!(h.nic.register(0x238) == 700, "device register {}", h.nic.register(0x238));
    Ok(())
}

/// Data announcements are queued per pipe, in order.
pub fn run_rx_ready_events() {
    run("run_rx_ready_events", run_rx_ready_events_inner());
}

fn run_rx_ready_events_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let a = h.rx()?;
    let b = h.rx()?;
    h.nic.inject(b.id(), b"1")?;
    h.nic.inject(a.id(), b"2")?;
    h.nic.inject(b.id(), b"3")?;
    h.settle()?;

    ensure!(h.cp.next_rx_pipe() == Some(b.id()), "b first");
    ensure!(h.cp.next_rx_pipe() == Some(a.id()), "then a");
    ensure!(h.cp.next_rx_pipe().is_none(), "b is only reported once");
    Ok(())
}

/// Round-robin status and channel registration are tracked from replies.
pub fn run_device_status() {
    run("run_device_status", run_device_status_inner());
}

fn run_device_status_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    ensure!(h.cp.notif_buf_id() == Some(1), "notif buf id {:?}", h.cp.notif_buf_id());

    let rx = h.rx()?;
    h.cp.set_round_robin(true)?;
    h.settle()?;
    ensure!(h.nic.round_robin_enabled(), "device should have round robin on");
    let status = h.cp.round_robin();
    ensure!(status.enabled, "status {:?}", status);
    ensure!(status.target_queue == rx.id(), "target {}", status.target_queue);

    h.cp.shutdown()?;
    h.settle()?;
    ensure!(h.cp.notif_buf_id().is_none(), "still registered");
    ensure!(rx.is_torn_down(), "shutdown should free pipes");
    Ok(())
}

/// A malformed notification stops the control plane for good.
pub fn run_protocol_mismatch() {
    run("run_protocol_mismatch", run_protocol_mismatch_inner());
}

fn run_protocol_mismatch_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut record = Notification::FreePipe(FreePipeNotification { pipe_id: 1 }).encode(0);
    record.tag = 0x7F;
    h.nic.push_record(record)?;

    for _ in 0..2 {
        match h.cp.process_notifications() {
            Err(PipeError::ProtocolMismatch(ProtocolError::UnknownTag(0x7F))) => {}
            other => return Err(TestError::Assertion(format!("expected UnknownTag, got {:?}", other))),
        }
    }
    Ok(())
}

/// The device acknowledging a register access nobody issued stops the
/// control plane, and it stays stopped.
pub fn run_unsolicited_ack() {
    run("run_unsolicited_ack", run_unsolicited_ack_inner());
}

fn run_unsolicited_ack_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    h.nic.push(Notification::Mmio(MmioNotification {
        op: MmioOp::Write,
        register: 0x100,
        value: 1,
    }))?;

    for _ in 0..2 {
        match h.cp.process_notifications() {
            Err(PipeError::ProtocolMismatch(ProtocolError::InvalidField {
                tag: NotificationTag::Mmio,
                field: "register",
                ..
            })) => {}
            other => return Err(TestError::Assertion(format!("expected a stuck mismatch, got {:?}", other))),
        }
    }
    ensure!(
        matches!(h.cp.allocate_pipe(PipeKind::Rx), Err(PipeError::ProtocolMismatch(_))),
        "allocation after a mismatch must fail"
    );
    ensure!(h.nic.step()? == 0, "nothing may be sent after a mismatch");
    Ok(())
}

/// A grant naming a pipe that is still live is refused, and the original
/// handle keeps its pipe.
pub fn run_duplicate_pipe_grant() {
    run("run_duplicate_pipe_grant", run_duplicate_pipe_grant_inner());
}

fn run_duplicate_pipe_grant_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut rx = h.rx()?;
    h.nic.inject(rx.id(), b"kept")?;

    let pending = h.cp.allocate_pipe(PipeKind::Rx)?;
    let request_id = pending
        .request_ids()
        .next()
        .ok_or_else(|| TestError::Setup("no request id".into()))?;
    h.nic.push(Notification::AllocatePipe(AllocatePipeNotification {
        request_id,
        pipe_id: rx.id(),
        direction: RingDirection::Rx,
        fallback: false,
        ring_base: rx.ring().ring_base(),
        ring_size: rx.ring().ring_size(),
    }))?;

    for _ in 0..2 {
        match h.cp.poll_pipe(&pending) {
            Err(PipeError::ProtocolMismatch(ProtocolError::InvalidField { field: "pipe_id", .. })) => {}
            other => return Err(TestError::Assertion(format!("expected a pipe_id mismatch, got {:?}", other))),
        }
    }
    ensure!(h.cp.is_pipe_alive(rx.id()), "original pipe should still be live");
    let got = rx.recv_pkts()?.to_vecs()?;
    ensure!(got == vec![b"kept".to_vec()], "original handle read {:?}", got);
    Ok(())
}

/// Transmit completion counts from the device cannot overflow the total.
pub fn run_tx_complete_saturates() {
    run("run_tx_complete_saturates", run_tx_complete_saturates_inner());
}

fn run_tx_complete_saturates_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let tx = h.tx()?;
    for _ in 0..2 {
        h.nic.push(Notification::Pipe(PipeNotification {
            pipe_id: tx.id(),
            event: PipeEvent::TxComplete,
            value: u64::MAX,
        }))?;
    }
    h.settle()?;
    ensure!(
        h.cp.tx_completed(tx.id()) == Some(u64::MAX),
        "tx completed {:?}",
        h.cp.tx_completed(tx.id())
    );
    Ok(())
}

// ============================================================================
// Flow steering
// ============================================================================

fn flow(dst_port: u16) -> FlowRule {
    FlowRule {
        dst_port,
        src_port: 0,
        dst_ip: 0x0A00_0001,
        src_ip: 0,
        protocol: 17,
    }
}

/// Bound flows land in their pipe; everything else lands in the fallback pipe.
pub fn run_flow_binding() {
    run("run_flow_binding", run_flow_binding_inner());
}

fn run_flow_binding_inner() -> Result<(), TestError> {
    let mut h = Harness::small()?;
    let mut bound = h.rx()?;
    let mut fallback = h
        .allocate(PipeKind::FallbackRx)?
        .into_rx()
        .ok_or_else(|| TestError::Setup("expected an rx pipe".into()))?;

    h.bind(bound.id(), flow(53))?;
    ensure!(h.nic.flow_target(&flow(53)) == Some(bound.id()), "rule not installed");

    let to = h.nic.deliver(&flow(53), b"dns")?;
    ensure!(to == bound.id(), "bound flow went to pipe {}", to);
    let to = h.nic.deliver(&flow(80), b"http")?;
    ensure!(to == fallback.id(), "unbound flow went to pipe {}", to);

    ensure!(bound.recv_pkts()?.to_vecs()? == vec![b"dns".to_vec()], "bound pipe contents");
    ensure!(fallback.recv_pkts()?.to_vecs()? == vec![b"http".to_vec()], "fallback pipe contents");

    let tx = h.tx()?;
    ensure!(
        matches!(h.cp.bind(tx.id(), flow(443)), Err(PipeError::InvalidConfig(_))),
        "tx pipes cannot be bound"
    );

    h.nic.teardown(bound.id())?;
    h.settle()?;
    ensure!(h.nic.flow_target(&flow(53)).is_none(), "rule should go with its pipe");
    Ok(())
}

/// A full flow table declines the rule with `FlowSteering`.
pub fn run_flow_binding_declined() {
    run("run_flow_binding_declined", run_flow_binding_declined_inner());
}

fn run_flow_binding_declined_inner() -> Result<(), TestError> {
    let nic_config = SoftNicConfig {
        max_flow_rules: 1,
        ..SoftNicConfig::default()
    };
    let mut h = Harness::new(nic_config, small_config())?;
    let rx = h.rx()?;

    h.bind(rx.id(), flow(1000))?;
    match h.bind(rx.id(), flow(1001)) {
        Err(TestError::Pipe(PipeError::BindFailed {
            pipe_id,
            reason: FallbackReason::FlowSteering,
        })) if pipe_id == rx.id() => {}
        other => return Err(TestError::Assertion(format!("expected FlowSteering, got {:?}", other))),
    }
    ensure!(h.nic.flow_target(&flow(1001)).is_none(), "declined rule was installed");
    // Rebinding an installed flow replaces it and needs no new table entry.
    h.bind(rx.id(), flow(1000))?;
    Ok(())
}
