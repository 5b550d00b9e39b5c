//! Message framing inside pipe rings.
//!
//! A message is an 8-byte [`MessageHeader`] followed by its payload, padded
//! with zeroes to a whole number of flits:
//!
//! ```text
//! flit k      [ len | flags | payload[0..56]            ]
//! flit k+1    [ payload[56..120]                        ]
//! ...
//! flit k+n-1  [ payload[..]  | zero padding             ]
//! ```
//!
//! Because every message starts on a flit boundary its header is always
//! contiguous, even when the payload runs past the physical end of the ring.

use bytemuck::{Pod, Zeroable};

use crate::layout::{Flit, FLIT_SIZE};
use crate::queue::{QueueConsumer, QueueProducer, RingError};

/// Size of the per-message header.
pub const MESSAGE_HEADER_LEN: usize = 8;

/// Header preceding every message payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MessageHeader {
    /// Payload length in bytes.
    pub len: u32,
    /// Reserved, written as zero.
    pub flags: u32,
}

const _: () = assert!(std::mem::size_of::<MessageHeader>() == MESSAGE_HEADER_LEN);

/// Flits occupied by a message with a `len`-byte payload.
#[inline]
pub const fn message_flits(len: usize) -> usize {
    (len + MESSAGE_HEADER_LEN).div_ceil(FLIT_SIZE)
}

/// Largest payload a ring of `capacity` flits can carry in one message.
#[inline]
pub const fn max_payload(capacity: u32) -> usize {
    (capacity as usize - 1) * FLIT_SIZE - MESSAGE_HEADER_LEN
}

/// Flits needed for a whole batch, or `None` if a payload cannot be framed.
pub fn batch_flits(messages: &[&[u8]]) -> Option<usize> {
    messages.iter().try_fold(0usize, |acc, msg| {
        u32::try_from(msg.len()).ok()?;
        acc.checked_add(message_flits(msg.len()))
    })
}

/// Write every message into the ring and publish them together.
///
/// Either the whole batch becomes visible to the consumer or nothing does.
/// Returns the number of flits written.
pub fn encode_messages(producer: &mut QueueProducer<Flit>, messages: &[&[u8]]) -> Result<u32, RingError> {
    let max = producer.queue().usable_capacity();
    let total = batch_flits(messages)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(RingError::TooLarge { requested: u32::MAX, max })?;
    if total == 0 {
        return Ok(0);
    }

    let mut grant = producer.reserve(total)?;
    {
        let (a, b) = grant.slots_mut();
        let mut slots = a.iter_mut().chain(b.iter_mut());
        for msg in messages {
            let header = MessageHeader {
                len: msg.len() as u32,
                flags: 0,
            };
            let mut remaining: &[u8] = msg;
            for (i, flit) in slots.by_ref().take(message_flits(msg.len())).enumerate() {
                let dst = &mut flit.0;
                let start = if i == 0 {
                    dst[..MESSAGE_HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
                    MESSAGE_HEADER_LEN
                } else {
                    0
                };
                let take = remaining.len().min(FLIT_SIZE - start);
                dst[start..start + take].copy_from_slice(&remaining[..take]);
                dst[start + take..].fill(0);
                remaining = &remaining[take..];
            }
        }
    }
    grant.commit();
    Ok(total)
}

/// Header of the message starting `flit_offset` flits into `(a, b)`.
pub(crate) fn read_header(a: &[u8], b: &[u8], flit_offset: usize) -> Option<MessageHeader> {
    let start = flit_offset * FLIT_SIZE;
    let bytes = if start < a.len() {
        a.get(start..start + MESSAGE_HEADER_LEN)?
    } else {
        let start = start - a.len();
        b.get(start..start + MESSAGE_HEADER_LEN)?
    };
    Some(bytemuck::pod_read_unaligned(bytes))
}

/// `len` bytes starting `start` bytes into the logical concatenation of
/// `a` and `b`, as up to two physical pieces.
pub(crate) fn logical_span<'a>(a: &'a [u8], b: &'a [u8], start: usize, len: usize) -> (&'a [u8], &'a [u8]) {
    if start >= a.len() {
        let start = start - a.len();
        return (&b[start..start + len], &[]);
    }
    let first = len.min(a.len() - start);
    (&a[start..start + first], &b[..len - first])
}

/// Locate the message at `flit_offset` within `available` readable flits.
///
/// Returns `Ok(None)` when the message has not fully arrived yet.
pub(crate) fn locate(
    a: &[u8],
    b: &[u8],
    flit_offset: usize,
    available: usize,
    capacity: u32,
) -> Result<Option<(MessageHeader, usize)>, FramingError> {
    if flit_offset >= available {
        return Ok(None);
    }
    let Some(header) = read_header(a, b, flit_offset) else {
        return Ok(None);
    };
    let flits = message_flits(header.len as usize);
    let max = capacity as usize - 1;
    if flits > max {
        return Err(FramingError::Oversized {
            len: header.len as usize,
            max: max_payload(capacity),
        });
    }
    if flit_offset + flits > available {
        return Ok(None);
    }
    Ok(Some((header, flits)))
}

/// Decode and release every complete message in the ring.
pub fn drain_messages(consumer: &mut QueueConsumer<Flit>) -> Result<Vec<Vec<u8>>, FramingError> {
    let capacity = consumer.queue().capacity();
    let available = consumer.refresh() as usize;
    let mut out = Vec::new();
    let mut offset = 0;
    {
        let (fa, fb) = consumer.readable();
        let (a, b): (&[u8], &[u8]) = (bytemuck::cast_slice(fa), bytemuck::cast_slice(fb));
        while let Some((header, flits)) = locate(a, b, offset, available, capacity)? {
            let (p, q) = logical_span(a, b, offset * FLIT_SIZE + MESSAGE_HEADER_LEN, header.len as usize);
            let mut msg = Vec::with_capacity(p.len() + q.len());
            msg.extend_from_slice(p);
            msg.extend_from_slice(q);
            out.push(msg);
            offset += flits;
        }
    }
    consumer.release(offset as u32);
    Ok(out)
}

/// A message header that can never be satisfied by the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// Header claims a payload larger than the ring can hold.
    Oversized { len: usize, max: usize },
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversized { len, max } => {
                write!(f, "message of {} bytes exceeds ring limit of {}", len, max)
            }
        }
    }
}

impl std::error::Error for FramingError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;

    #[test]
    fn test_message_flits() {
        assert_eq!(message_flits(0), 1);
        assert_eq!(message_flits(56), 1);
        assert_eq!(message_flits(57), 2);
        assert_eq!(message_flits(120), 2);
        assert_eq!(message_flits(121), 3);
        assert_eq!(max_payload(4), 3 * 64 - 8);
    }

    #[test]
    fn test_encode_then_drain() {
        let (mut p, mut c) = Queue::<Flit>::with_capacity(16).unwrap();
        let big = vec![0x5A; 200];
        let flits = encode_messages(&mut p, &[b"hello", &big, b""]).unwrap();
        assert_eq!(flits, 1 + 4 + 1);

        let msgs = drain_messages(&mut c).unwrap();
        assert_eq!(msgs, vec![b"hello".to_vec(), big, Vec::new()]);
        assert_eq!(c.available(), 0);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (mut p, mut c) = Queue::<Flit>::with_capacity(4).unwrap();
        encode_messages(&mut p, &[b"a"]).unwrap();
        // Two more single-flit messages fit, three do not.
        assert_eq!(encode_messages(&mut p, &[b"b", b"c", b"d"]), Err(RingError::Full));
        assert_eq!(c.refresh(), 1);
        encode_messages(&mut p, &[b"b", b"c"]).unwrap();
        let msgs = drain_messages(&mut c).unwrap();
        assert_eq!(msgs.len(), 3);
    }

    #[test]
    fn test_payload_split_at_wrap() {
        let (mut p, mut c) = Queue::<Flit>::with_capacity(8).unwrap();
        encode_messages(&mut p, &[&[0u8; 330]]).unwrap(); // 6 flits
        drain_messages(&mut c).unwrap();

        let payload: Vec<u8> = (0..150u8).collect(); // slots 6, 7, 0
        encode_messages(&mut p, &[&payload]).unwrap();
        c.refresh();
        {
            let (fa, fb) = c.readable();
            assert_eq!((fa.len(), fb.len()), (2, 1));
        }
        assert_eq!(drain_messages(&mut c).unwrap(), vec![payload]);
    }

    #[test]
    fn test_oversized_header_rejected() {
        let (mut p, mut c) = Queue::<Flit>::with_capacity(4).unwrap();
        let mut flit = Flit::default();
        flit.0[..4].copy_from_slice(&1000u32.to_ne_bytes());
        p.enqueue(flit).unwrap();
        assert!(matches!(
            drain_messages(&mut c),
            Err(FramingError::Oversized { len: 1000, .. })
        ));
    }

    #[test]
    fn test_logical_span() {
        let a = [1u8, 2, 3];
        let b = [4u8, 5];
        assert_eq!(logical_span(&a, &b, 1, 3), (&[2u8, 3][..], &[4u8][..]));
        assert_eq!(logical_span(&a, &b, 3, 2), (&[4u8, 5][..], &[][..]));
        assert_eq!(logical_span(&a, &b, 0, 2), (&[1u8, 2][..], &[][..]));
    }
}
