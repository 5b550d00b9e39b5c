//! Receive pipes: zero-copy reads of device-written messages.

use crate::error::PipeError;
use crate::frame::{locate, logical_span, MESSAGE_HEADER_LEN};
use crate::iter::{Consuming, IterKind, MessageBatch, MessageView, Peeking, Span};
use crate::layout::{Flit, FLIT_SIZE};
use crate::queue::{Queue, QueueConsumer};

use super::{PipeRing, PipeStats};

/// Receive side of a pipe. The device produces, this handle consumes.
pub struct RxPipe {
    ring: PipeRing,
    consumer: QueueConsumer<Flit>,
    fallback: bool,
    batch_limit: u32,
    stats: PipeStats,
    context: u64,
}

impl RxPipe {
    pub(crate) fn new(ring: PipeRing, queue: Queue<Flit>, fallback: bool, batch_limit: u32) -> Self {
        Self {
            ring,
            consumer: queue.into_consumer(),
            fallback,
            batch_limit,
            stats: PipeStats::default(),
            context: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.ring.pipe_id()
    }

    pub fn ring(&self) -> &PipeRing {
        &self.ring
    }

    /// Whether this pipe receives traffic no other pipe matched.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn is_torn_down(&self) -> bool {
        self.ring.state().is_torn_down()
    }

    /// Application-defined tag.
    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn set_context(&mut self, context: u64) {
        self.context = context;
    }

    pub fn stats(&self) -> PipeStats {
        self.stats
    }

    /// Flit limit used by [`RxPipe::recv_pkts`] and [`RxPipe::peek_pkts`].
    pub fn batch_limit(&self) -> u32 {
        self.batch_limit
    }

    pub fn set_batch_limit(&mut self, limit: u32) {
        self.batch_limit = limit;
    }

    /// Take the complete messages currently in the ring, up to `limit` flits.
    ///
    /// The first message is always included, however large, so that a small
    /// limit cannot stall the pipe. An empty ring gives an empty batch.
    pub fn recv_batch<K: IterKind>(&mut self, limit: u32) -> Result<MessageBatch<'_, K>, PipeError> {
        self.ring.check_alive()?;
        self.consumer.refresh();
        let span = self.scan(limit, usize::MAX)?;
        if K::CONSUMING && span.messages > 0 {
            self.stats.batches += 1;
        }
        Ok(MessageBatch::new(self, span, limit))
    }

    /// A consuming batch with the default limit.
    pub fn recv_pkts(&mut self) -> Result<MessageBatch<'_, Consuming>, PipeError> {
        self.recv_batch(self.batch_limit)
    }

    /// A peeking batch with the default limit.
    pub fn peek_pkts(&mut self) -> Result<MessageBatch<'_, Peeking>, PipeError> {
        self.recv_batch(self.batch_limit)
    }

    /// Release exactly the first `n` messages in the ring.
    pub fn confirm(&mut self, n: usize) -> Result<(), PipeError> {
        self.ring.check_alive()?;
        if n == 0 {
            return Ok(());
        }
        self.consumer.refresh();
        let span = self.scan(u32::MAX, n)?;
        if span.messages < n {
            return Err(PipeError::InvalidConfirm {
                requested: n,
                available: span.messages,
            });
        }
        self.release_messages(span.flits, n as u64, span.bytes);
        self.stats.batches += 1;
        Ok(())
    }

    /// Drop everything in the ring. Returns the number of flits released.
    pub fn clear(&mut self) -> Result<u32, PipeError> {
        self.ring.check_alive()?;
        let flits = self.consumer.clear();
        if flits > 0 {
            tracing::debug!(pipe_id = self.id(), flits, "rx pipe cleared");
        }
        Ok(flits)
    }

    /// Flits waiting in the ring.
    pub fn available(&mut self) -> Result<u32, PipeError> {
        self.ring.check_alive()?;
        Ok(self.consumer.refresh())
    }

    fn ring_bytes(&self) -> (&[u8], &[u8], usize) {
        let (a, b) = self.consumer.readable();
        (bytemuck::cast_slice(a), bytemuck::cast_slice(b), a.len() + b.len())
    }

    /// Complete messages from the tail, stopping at `max_messages` or before
    /// the message that would take the total past `flit_limit`.
    pub(crate) fn scan(&self, flit_limit: u32, max_messages: usize) -> Result<Span, PipeError> {
        let mut span = Span::default();
        if flit_limit == 0 {
            return Ok(span);
        }
        let (a, b, available) = self.ring_bytes();
        while span.messages < max_messages {
            let Some((header, flits)) = locate(a, b, span.flits as usize, available, self.ring.ring_size())? else {
                break;
            };
            let flits = flits as u32;
            if span.messages > 0 && span.flits + flits > flit_limit {
                break;
            }
            span.flits += flits;
            span.messages += 1;
            span.bytes += header.len as u64;
        }
        Ok(span)
    }

    /// The message starting `flit_offset` flits past the tail.
    pub(crate) fn message_at(&self, flit_offset: u32) -> Result<Option<(MessageView<'_>, u32)>, PipeError> {
        let (a, b, available) = self.ring_bytes();
        let Some((header, flits)) = locate(a, b, flit_offset as usize, available, self.ring.ring_size())? else {
            return Ok(None);
        };
        let start = flit_offset as usize * FLIT_SIZE + MESSAGE_HEADER_LEN;
        let (first, second) = logical_span(a, b, start, header.len as usize);
        Ok(Some((MessageView::new(first, second), flits as u32)))
    }

    pub(crate) fn release_messages(&mut self, flits: u32, messages: u64, bytes: u64) {
        self.consumer.release(flits);
        self.stats.record(messages, bytes);
    }
}

impl std::fmt::Debug for RxPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxPipe")
            .field("ring", &self.ring)
            .field("tail", &self.consumer.tail())
            .field("fallback", &self.fallback)
            .field("stats", &self.stats)
            .finish()
    }
}
