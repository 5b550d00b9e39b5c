//! Batches of received messages and the iterators over them.
//!
//! A [`MessageBatch`] covers the complete messages present in an Rx ring when
//! it was taken. Iterating it yields [`MessageView`]s that borrow the ring
//! directly. The kind parameter decides what iteration does to the ring:
//!
//! - [`Consuming`] ([`PktIterator`]) hands each message back to the device
//!   once the caller moves on to the next one, or drops the iterator.
//! - [`Peeking`] ([`PeekPktIterator`]) leaves the ring alone; the caller
//!   decides afterwards how many messages to [`RxPipe::confirm`].
//!
//! Iterators are single-pass. Data that arrives after the batch was taken is
//! seen by the next batch.

use std::marker::PhantomData;

use crate::error::PipeError;
use crate::pipe::RxPipe;

mod sealed {
    pub trait Sealed {}
}

/// Selects consuming or peeking iteration.
pub trait IterKind: sealed::Sealed {
    /// Whether yielded messages are released back to the ring.
    const CONSUMING: bool;
}

/// Release each message after it has been yielded.
#[derive(Debug)]
pub enum Consuming {}

/// Never release; see [`RxPipe::confirm`].
#[derive(Debug)]
pub enum Peeking {}

impl sealed::Sealed for Consuming {}
impl sealed::Sealed for Peeking {}

impl IterKind for Consuming {
    const CONSUMING: bool = true;
}

impl IterKind for Peeking {
    const CONSUMING: bool = false;
}

/// Extent of a run of complete messages at the front of a ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub flits: u32,
    pub messages: usize,
    pub bytes: u64,
}

/// Messages available on an [`RxPipe`] when the batch was taken.
#[derive(Debug)]
pub struct MessageBatch<'p, K: IterKind> {
    pipe: &'p mut RxPipe,
    span: Span,
    limit: u32,
    _kind: PhantomData<K>,
}

impl<'p, K: IterKind> MessageBatch<'p, K> {
    pub(crate) fn new(pipe: &'p mut RxPipe, span: Span, limit: u32) -> Self {
        Self {
            pipe,
            span,
            limit,
            _kind: PhantomData,
        }
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.span.messages
    }

    pub fn is_empty(&self) -> bool {
        self.span.messages == 0
    }

    /// Flits covered, including headers and padding.
    pub fn len_flits(&self) -> u32 {
        self.span.flits
    }

    /// Payload bytes across all messages.
    pub fn payload_bytes(&self) -> u64 {
        self.span.bytes
    }

    /// Flit limit the batch was taken with.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn iter(self) -> MessageIter<'p, K> {
        MessageIter {
            pipe: self.pipe,
            total: self.span.messages,
            yielded: 0,
            offset: 0,
            unreleased: None,
            _kind: PhantomData,
        }
    }

    /// Copy every message out.
    pub fn to_vecs(self) -> Result<Vec<Vec<u8>>, PipeError> {
        let mut out = Vec::with_capacity(self.len());
        let mut iter = self.iter();
        while iter.has_next() {
            out.push(iter.next()?.to_vec());
        }
        Ok(out)
    }
}

/// Lending iteration over a batch.
pub trait MessageIterator {
    /// Whether `next` will yield a message.
    fn has_next(&self) -> bool;

    /// The next message. Fails with [`PipeError::IteratorExhausted`] when
    /// `has_next` is false.
    fn next(&mut self) -> Result<MessageView<'_>, PipeError>;
}

/// Iterator over a [`MessageBatch`].
#[derive(Debug)]
pub struct MessageIter<'p, K: IterKind> {
    pipe: &'p mut RxPipe,
    total: usize,
    yielded: usize,
    // Flits between the ring tail and the next message.
    offset: u32,
    // Last yielded message, not yet released (consuming only).
    unreleased: Option<(u32, u64)>,
    _kind: PhantomData<K>,
}

/// Destructive iterator.
pub type PktIterator<'p> = MessageIter<'p, Consuming>;

/// Non-destructive iterator.
pub type PeekPktIterator<'p> = MessageIter<'p, Peeking>;

impl<K: IterKind> MessageIter<'_, K> {
    /// Messages yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Messages left in the batch.
    pub fn remaining(&self) -> usize {
        self.total - self.yielded
    }

    fn release_previous(&mut self) {
        if let Some((flits, bytes)) = self.unreleased.take() {
            self.pipe.release_messages(flits, 1, bytes);
        }
    }
}

impl MessageIter<'_, Peeking> {
    /// Consume the first `n` messages of the ring and end the iteration.
    pub fn confirm(self, n: usize) -> Result<(), PipeError> {
        self.pipe.confirm(n)
    }
}

impl<K: IterKind> MessageIterator for MessageIter<'_, K> {
    fn has_next(&self) -> bool {
        self.yielded < self.total
    }

    fn next(&mut self) -> Result<MessageView<'_>, PipeError> {
        if !self.has_next() {
            return Err(PipeError::IteratorExhausted);
        }
        self.pipe.ring().check_alive()?;
        if K::CONSUMING {
            self.release_previous();
        }

        let Some((view, flits)) = self.pipe.message_at(self.offset)? else {
            return Err(PipeError::IteratorExhausted);
        };
        self.yielded += 1;
        if K::CONSUMING {
            self.unreleased = Some((flits, view.len() as u64));
        } else {
            self.offset += flits;
        }
        Ok(view)
    }
}

impl<K: IterKind> Drop for MessageIter<'_, K> {
    fn drop(&mut self) {
        if K::CONSUMING && !self.pipe.is_torn_down() {
            self.release_previous();
        }
    }
}

/// A message payload in the ring, possibly split where the ring wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageView<'a> {
    first: &'a [u8],
    second: &'a [u8],
}

impl<'a> MessageView<'a> {
    pub(crate) fn new(first: &'a [u8], second: &'a [u8]) -> Self {
        Self { first, second }
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the payload is in one piece.
    pub fn is_contiguous(&self) -> bool {
        self.second.is_empty()
    }

    pub fn as_contiguous(&self) -> Option<&'a [u8]> {
        self.is_contiguous().then_some(self.first)
    }

    /// Both physical pieces, in order. The second is empty unless the
    /// payload wraps.
    pub fn segments(&self) -> (&'a [u8], &'a [u8]) {
        (self.first, self.second)
    }

    /// Copy as much of the payload as fits into `dst`, returning the count.
    pub fn copy_to_slice(&self, dst: &mut [u8]) -> usize {
        let a = self.first.len().min(dst.len());
        dst[..a].copy_from_slice(&self.first[..a]);
        let b = self.second.len().min(dst.len() - a);
        dst[a..a + b].copy_from_slice(&self.second[..b]);
        a + b
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.first);
        out.extend_from_slice(self.second);
        out
    }

    /// The payload as one slice, stitched into `scratch` only if it wraps.
    pub fn contiguous<'s>(&self, scratch: &'s mut Vec<u8>) -> &'s [u8]
    where
        'a: 's,
    {
        if self.second.is_empty() {
            return self.first;
        }
        scratch.clear();
        scratch.extend_from_slice(self.first);
        scratch.extend_from_slice(self.second);
        scratch
    }
}

impl PartialEq<[u8]> for MessageView<'_> {
    fn eq(&self, other: &[u8]) -> bool {
        self.len() == other.len() && {
            let (a, b) = other.split_at(self.first.len());
            a == self.first && b == self.second
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_stitching() {
        let data: &[u8] = b"abc";
        let whole = MessageView::new(data, b"");
        let split = MessageView::new(b"ab", b"c");
        assert!(whole.is_contiguous());
        assert!(!split.is_contiguous());
        assert_eq!(split.as_contiguous(), None);
        assert_eq!(whole.to_vec(), split.to_vec());
        assert!(split == b"abc"[..]);

        let mut scratch = Vec::new();
        assert_eq!(split.contiguous(&mut scratch), b"abc");
        assert_eq!(whole.contiguous(&mut scratch).as_ptr(), data.as_ptr());
        assert!(scratch.len() == 3);
    }

    #[test]
    fn test_copy_to_short_slice() {
        let view = MessageView::new(b"hello ", b"world");
        let mut dst = [0u8; 8];
        assert_eq!(view.copy_to_slice(&mut dst), 8);
        assert_eq!(&dst, b"hello wo");
    }
}
