//! Conformance scenarios against the software NIC.

use std::time::Duration;

use nicpipe::prelude::*;
use nicpipe::Doorbell;
use nicpipe_testkit::{Harness, SoftNic};

#[test]
fn allocate_and_free() {
    nicpipe_testkit::run_allocate_and_free();
}

#[test]
fn software_free() {
    nicpipe_testkit::run_software_free();
}

#[test]
fn allocation_fallback() {
    nicpipe_testkit::run_allocation_fallback();
}

#[test]
fn pair_allocation_rollback() {
    nicpipe_testkit::run_pair_allocation_rollback();
}

#[test]
fn fallback_rx_pipe() {
    nicpipe_testkit::run_fallback_rx_pipe();
}

#[test]
fn rx_tx_lifecycle() {
    nicpipe_testkit::run_rx_tx_lifecycle();
}

#[test]
fn rx_round_trip() {
    nicpipe_testkit::run_rx_round_trip();
}

#[test]
fn empty_is_idempotent() {
    nicpipe_testkit::run_empty_is_idempotent();
}

#[test]
fn peek_confirm() {
    nicpipe_testkit::run_peek_confirm();
}

#[test]
fn wrap_reconstruction() {
    nicpipe_testkit::run_wrap_reconstruction();
}

#[test]
fn tx_round_trip() {
    nicpipe_testkit::run_tx_round_trip();
}

#[test]
fn tx_all_or_nothing() {
    nicpipe_testkit::run_tx_all_or_nothing();
}

#[test]
fn forward_loopback() {
    nicpipe_testkit::run_forward_loopback();
}

#[test]
fn mmio_ordering() {
    nicpipe_testkit::run_mmio_ordering();
}

#[test]
fn rx_ready_events() {
    nicpipe_testkit::run_rx_ready_events();
}

#[test]
fn device_status() {
    nicpipe_testkit::run_device_status();
}

#[test]
fn protocol_mismatch() {
    nicpipe_testkit::run_protocol_mismatch();
}

#[test]
fn unsolicited_ack() {
    nicpipe_testkit::run_unsolicited_ack();
}

#[test]
fn duplicate_pipe_grant() {
    nicpipe_testkit::run_duplicate_pipe_grant();
}

#[test]
fn tx_complete_saturates() {
    nicpipe_testkit::run_tx_complete_saturates();
}

#[test]
fn flow_binding() {
    nicpipe_testkit::run_flow_binding();
}

#[test]
fn flow_binding_declined() {
    nicpipe_testkit::run_flow_binding_declined();
}

#[test]
fn bad_config_is_rejected() {
    let config = PipeConfig {
        pipe_capacity: 1000,
        ..PipeConfig::default()
    };
    assert!(matches!(
        ControlPlane::new(SoftNic::new(), config),
        Err(PipeError::InvalidConfig(_))
    ));
}

#[test]
fn notification_buffers_must_fit_device_memory() {
    let nic = SoftNic::with_config(nicpipe_testkit::SoftNicConfig {
        memory_len: 4096,
        ring_area_offset: 0,
        ..Default::default()
    });
    assert!(matches!(
        ControlPlane::new(nic, PipeConfig::default()),
        Err(PipeError::Device(_))
    ));
}

#[tokio::test]
async fn doorbells_wake_both_sides() {
    nicpipe_testkit::init_tracing();
    let (to_software, software_bell) = Doorbell::pair().unwrap();
    let (to_device, device_bell) = Doorbell::pair().unwrap();

    let mut h = Harness::small().unwrap();
    h.nic.set_doorbell(to_software);
    h.cp.set_doorbell(to_device);
    let mut rx = h.rx().unwrap();
    device_bell.drain();
    software_bell.drain();

    h.cp.write_register(0x300, 1).unwrap();
    tokio::time::timeout(Duration::from_secs(1), device_bell.wait())
        .await
        .expect("device was not woken")
        .unwrap();
    h.nic.step().unwrap();

    h.nic.inject(rx.id(), b"wake").unwrap();
    tokio::time::timeout(Duration::from_secs(1), software_bell.wait())
        .await
        .expect("software was not woken")
        .unwrap();
    h.cp.process_notifications().unwrap();
    assert_eq!(h.cp.next_rx_pipe(), Some(rx.id()));
    assert_eq!(rx.recv_pkts().unwrap().to_vecs().unwrap(), vec![b"wake".to_vec()]);
}
