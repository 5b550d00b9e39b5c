//! Bolero fuzzer for queue operations.
//!
//! Properties tested:
//! - FIFO order is preserved across the wrap
//! - At most `capacity - 1` elements are ever queued
//! - Uncommitted grants are never visible to the consumer
//! - Producer and consumer agree on occupancy after every step

use bolero::check;
use nicpipe_fuzz::queue_model::{capacity_from, execute_and_verify, QueueOp};

fn main() {
    check!()
        .with_type::<(u8, Vec<QueueOpInput>)>()
        .for_each(|(capacity_byte, ops)| {
            let capacity = capacity_from(*capacity_byte);
            let ops: Vec<QueueOp> = ops.iter().map(QueueOpInput::to_op).collect();
            if let Err(e) = execute_and_verify(capacity, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[derive(Debug, Clone, bolero::TypeGenerator)]
enum QueueOpInput {
    Enqueue(u64),
    Reserve { n: u8, first: u64, commit: bool },
    Dequeue,
    Peek,
    Release(u8),
    Refresh,
}

impl QueueOpInput {
    fn to_op(&self) -> QueueOp {
        match *self {
            QueueOpInput::Enqueue(v) => QueueOp::Enqueue(v),
            QueueOpInput::Reserve { n, first, commit } => QueueOp::Reserve {
                n: n as u32,
                first,
                commit,
            },
            QueueOpInput::Dequeue => QueueOp::Dequeue,
            QueueOpInput::Peek => QueueOp::Peek,
            QueueOpInput::Release(n) => QueueOp::Release(n as u32),
            QueueOpInput::Refresh => QueueOp::Refresh,
        }
    }
}
