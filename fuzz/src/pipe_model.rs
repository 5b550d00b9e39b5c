//! Message framing over a flit ring against a reference deque.

use std::collections::VecDeque;

use nicpipe::frame::{batch_flits, drain_messages, encode_messages, max_payload, message_flits};
use nicpipe::{Flit, Queue, RingError};

/// Operations on one framed ring.
#[derive(Clone, Debug)]
pub enum PipeOp {
    /// Send a batch of messages with the given lengths.
    Send(Vec<u16>),
    Drain,
}

fn payload(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| (seed.wrapping_mul(131) ^ j) as u8).collect()
}

/// Run `ops` on a fresh ring of `capacity` flits.
pub fn execute_and_verify(capacity: u32, ops: &[PipeOp]) -> Result<(), String> {
    let (mut producer, mut consumer) =
        Queue::<Flit>::with_capacity(capacity).map_err(|e| format!("cannot build ring: {}", e))?;
    let usable = capacity as usize - 1;
    let mut expected: VecDeque<Vec<u8>> = VecDeque::new();
    let mut in_flight = 0usize;
    let mut seed = 0usize;

    for (i, op) in ops.iter().enumerate() {
        match op {
            PipeOp::Send(lens) => {
                let batch: Vec<Vec<u8>> = lens
                    .iter()
                    .map(|len| {
                        seed += 1;
                        payload(seed, *len as usize)
                    })
                    .collect();
                let refs: Vec<&[u8]> = batch.iter().map(Vec::as_slice).collect();
                let flits = batch_flits(&refs).ok_or_else(|| format!("op {}: batch not framable", i))?;

                match encode_messages(&mut producer, &refs) {
                    Ok(written) => {
                        if written as usize != flits || in_flight + flits > usable {
                            return Err(format!("op {}: wrote {} flits, {} in flight", i, written, in_flight));
                        }
                        in_flight += flits;
                        expected.extend(batch);
                    }
                    Err(RingError::Full) => {
                        if flits > usable || in_flight + flits <= usable {
                            return Err(format!("op {}: {} flits refused with {} in flight", i, flits, in_flight));
                        }
                    }
                    Err(RingError::TooLarge { .. }) => {
                        if flits <= usable {
                            return Err(format!("op {}: {} flits called too large", i, flits));
                        }
                    }
                }
            }
            PipeOp::Drain => {
                let got = drain_messages(&mut consumer).map_err(|e| format!("op {}: {}", i, e))?;
                let want: Vec<Vec<u8>> = expected.drain(..).collect();
                if got != want {
                    return Err(format!("op {}: drained {} messages, expected {}", i, got.len(), want.len()));
                }
                in_flight = 0;
            }
        }

        let queued = producer.queue().len() as usize;
        if queued != in_flight {
            return Err(format!("after op {}: {} flits queued, expected {}", i, queued, in_flight));
        }
        let counted: usize = expected.iter().map(|m| message_flits(m.len())).sum();
        if counted != in_flight {
            return Err(format!("after op {}: reference accounts for {} flits", i, counted));
        }
        if expected.iter().any(|m| m.len() > max_payload(capacity)) {
            return Err(format!("after op {}: accepted a message longer than the ring", i));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_messages() {
        let mut ops = Vec::new();
        for _ in 0..10 {
            ops.push(PipeOp::Send(vec![300]));
            ops.push(PipeOp::Drain);
        }
        execute_and_verify(16, &ops).unwrap();
    }

    #[test]
    fn test_oversized_batch_is_refused_whole() {
        let ops = [
            PipeOp::Send(vec![400, 400]),
            PipeOp::Send(vec![1, 1]),
            PipeOp::Send(vec![1]),
            PipeOp::Send(vec![2000]),
            PipeOp::Drain,
        ];
        execute_and_verify(16, &ops).unwrap();
    }
}
