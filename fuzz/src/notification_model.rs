//! Notification decoding and the notification channel against a reference.

use std::collections::VecDeque;

use nicpipe::notification::notif_buf_len;
use nicpipe::region::heap_region;
use nicpipe::{
    FreePipeNotification, MmioNotification, MmioOp, Notification, NotificationBufPair, NotificationRecord,
    PipeEvent, PipeNotification, ProtocolError, RingError,
};

/// Decoding arbitrary bytes must never panic, and whatever decodes must
/// encode back to a record that decodes the same way.
pub fn check_decode(record: &NotificationRecord) -> Result<(), String> {
    let Ok(decoded) = Notification::decode(record) else {
        return Ok(());
    };
    let again = decoded.encode(record.seq);
    if again.tag != record.tag || again.version != record.version || again.seq != record.seq {
        return Err(format!("re-encoding {:?} changed its header: {:?}", decoded, again));
    }
    match Notification::decode(&again) {
        Ok(n) if n == decoded => Ok(()),
        other => Err(format!("{:?} re-decoded as {:?}", decoded, other)),
    }
}

/// Operations on a channel seen from both ends.
#[derive(Clone, Copy, Debug)]
pub enum ChannelOp {
    /// Device posts a data event for `pipe`.
    DevicePost { pipe: u32, value: u64 },
    /// Software posts a register write.
    SoftwarePost { register: u64 },
    /// Device frees a pipe.
    DeviceFree { pipe: u32 },
    SoftwarePoll,
    DevicePoll,
}

/// Run `ops` against a fresh channel of `capacity` records per direction.
pub fn execute_and_verify(capacity: u32, ops: &[ChannelOp]) -> Result<(), String> {
    let region = heap_region(notif_buf_len(capacity)).map_err(|e| e.to_string())?;
    let mut software =
        NotificationBufPair::init_software_side(region.clone(), capacity).map_err(|e| e.to_string())?;
    let mut device = NotificationBufPair::attach_device_side(region, capacity).map_err(|e| e.to_string())?;
    let usable = capacity as usize - 1;

    let mut to_software: VecDeque<Notification> = VecDeque::new();
    let mut to_device: VecDeque<Notification> = VecDeque::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            ChannelOp::DevicePost { pipe, value } => {
                let n = Notification::Pipe(PipeNotification {
                    pipe_id: pipe,
                    event: PipeEvent::RxReady,
                    value,
                });
                post(i, &mut device, &mut to_software, usable, n)?;
            }
            ChannelOp::DeviceFree { pipe } => {
                let n = Notification::FreePipe(FreePipeNotification { pipe_id: pipe });
                post(i, &mut device, &mut to_software, usable, n)?;
            }
            ChannelOp::SoftwarePost { register } => {
                let n = Notification::Mmio(MmioNotification {
                    op: MmioOp::Write,
                    register,
                    value: register ^ 0x5A5A,
                });
                post(i, &mut software, &mut to_device, usable, n)?;
            }
            ChannelOp::SoftwarePoll => poll(i, &mut software, &mut to_software)?,
            ChannelOp::DevicePoll => poll(i, &mut device, &mut to_device)?,
        }
    }

    while !to_software.is_empty() {
        poll(ops.len(), &mut software, &mut to_software)?;
    }
    while !to_device.is_empty() {
        poll(ops.len(), &mut device, &mut to_device)?;
    }
    Ok(())
}

fn post(
    i: usize,
    side: &mut NotificationBufPair,
    reference: &mut VecDeque<Notification>,
    usable: usize,
    n: Notification,
) -> Result<(), String> {
    match side.send(&n) {
        Ok(()) if reference.len() < usable => {
            reference.push_back(n);
            Ok(())
        }
        Ok(()) => Err(format!("op {}: sent into a full channel", i)),
        Err(RingError::Full) if reference.len() >= usable => Ok(()),
        Err(e) => Err(format!("op {}: send failed with {} of {} queued: {}", i, reference.len(), usable, e)),
    }
}

fn poll(i: usize, side: &mut NotificationBufPair, reference: &mut VecDeque<Notification>) -> Result<(), String> {
    let got: Result<Option<Notification>, ProtocolError> = side.poll();
    let want = reference.pop_front();
    match got {
        Ok(n) if n == want => Ok(()),
        other => Err(format!("op {}: polled {:?}, expected {:?}", i, other, want)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_both_directions() {
        let mut ops = Vec::new();
        for k in 0..6 {
            ops.push(ChannelOp::DevicePost { pipe: k, value: k as u64 });
            ops.push(ChannelOp::SoftwarePost { register: k as u64 * 8 });
        }
        ops.push(ChannelOp::SoftwarePoll);
        ops.push(ChannelOp::DeviceFree { pipe: 1 });
        ops.push(ChannelOp::DevicePoll);
        execute_and_verify(4, &ops).unwrap();
    }

    #[test]
    fn test_empty_record_does_not_decode() {
        let record = NotificationRecord {
            tag: 0,
            version: 0,
            seq: 0,
            words: [0; 7],
        };
        assert!(Notification::decode(&record).is_err());
        check_decode(&record).unwrap();
    }
}
