//! Bolero fuzzer for the notification channel.
//!
//! Properties tested:
//! - Arbitrary records never panic the decoder
//! - Anything that decodes re-encodes to an equivalent record
//! - Each direction delivers in order, independently of the other
//! - A direction is full at exactly `capacity - 1` records

use bolero::check;
use nicpipe::NotificationRecord;
use nicpipe_fuzz::notification_model::{check_decode, execute_and_verify, ChannelOp};

fn main() {
    check!()
        .with_type::<(u16, u16, u32, [u64; 7], u8, Vec<ChannelOpInput>)>()
        .for_each(|(tag, version, seq, words, capacity_byte, ops)| {
            let record = NotificationRecord {
                tag: *tag % 16,
                version: *version % 4,
                seq: *seq,
                words: *words,
            };
            if let Err(e) = check_decode(&record) {
                panic!("Decode invariant violated: {}", e);
            }

            let capacity = (1u32 << (capacity_byte % 5)).max(4);
            let ops: Vec<ChannelOp> = ops.iter().map(ChannelOpInput::to_op).collect();
            if let Err(e) = execute_and_verify(capacity, &ops) {
                panic!("Channel invariant violated: {}", e);
            }
        });
}

#[derive(Debug, Clone, bolero::TypeGenerator)]
enum ChannelOpInput {
    DevicePost { pipe: u32, value: u64 },
    SoftwarePost { register: u64 },
    DeviceFree { pipe: u32 },
    SoftwarePoll,
    DevicePoll,
}

impl ChannelOpInput {
    fn to_op(&self) -> ChannelOp {
        match *self {
            ChannelOpInput::DevicePost { pipe, value } => ChannelOp::DevicePost { pipe, value },
            ChannelOpInput::SoftwarePost { register } => ChannelOp::SoftwarePost { register },
            ChannelOpInput::DeviceFree { pipe } => ChannelOp::DeviceFree { pipe },
            ChannelOpInput::SoftwarePoll => ChannelOp::SoftwarePoll,
            ChannelOpInput::DevicePoll => ChannelOp::DevicePoll,
        }
    }
}
