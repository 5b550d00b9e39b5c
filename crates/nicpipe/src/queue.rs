//! Lock-free SPSC queue over shared memory.
//!
//! A [`Queue`] is a view of a ring laid out as described in [`crate::layout`].
//! It is never used directly for I/O: it is split into a [`QueueProducer`] and
//! a [`QueueConsumer`], each of which owns exactly one cursor and keeps a
//! private cached copy of the other one.
//!
//! # Full/empty
//!
//! One slot is always kept empty. Cursors stay in `[0, capacity)`,
//! occupancy is `(head - tail) & (capacity - 1)` and the queue is full at
//! `capacity - 1` elements. Hardware that publishes already-masked register
//! values can therefore drive either side directly.
//!
//! # Ordering
//!
//! The producer writes a slot and then publishes `head` with a release store;
//! the consumer reads `head` with an acquire load before touching the slot.
//! The same pairing on `tail` hands slots back to the producer. The far
//! cursor is only re-read when the cached copy says the queue is full
//! (producer) or empty (consumer).

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use bytemuck::Pod;

use crate::layout::{check_capacity, queue_footprint, LayoutError, QueueHeader, CACHE_LINE_SIZE};
use crate::region::{heap_region, MappedRegion, RegionError, SharedRegion};

/// A ring of `T` in a shared region, before it is split into roles.
pub struct Queue<T> {
    region: MappedRegion,
    header: NonNull<QueueHeader>,
    slots: NonNull<T>,
    capacity: u32,
    _marker: PhantomData<T>,
}

// SAFETY: a Queue only hands out role handles; T crosses threads by value.
unsafe impl<T: Send> Send for Queue<T> {}

impl<T: Pod> Queue<T> {
    /// Lay out a fresh queue of `capacity` slots at the start of `region`.
    ///
    /// The region must not yet be visible to the peer.
    pub fn init(region: MappedRegion, capacity: u32) -> Result<Self, LayoutError> {
        check_capacity(capacity)?;
        check_element::<T>()?;
        check_alignment(&region)?;
        let required = queue_footprint::<T>(capacity);
        if region.len() < required {
            return Err(LayoutError::RegionTooSmall {
                required,
                found: region.len(),
            });
        }

        let header = region.as_ptr().cast::<QueueHeader>();
        // SAFETY: aligned and in bounds (checked above); nobody else has the
        // region yet so the exclusive borrow is sound.
        unsafe { (*header).init(size_of::<T>() as u32, capacity) };

        Ok(Self::from_parts(region, capacity))
    }

    /// Attach to a queue another party has already laid out.
    pub fn attach(region: MappedRegion) -> Result<Self, LayoutError> {
        check_element::<T>()?;
        check_alignment(&region)?;
        if region.len() < size_of::<QueueHeader>() {
            return Err(LayoutError::RegionTooSmall {
                required: size_of::<QueueHeader>(),
                found: region.len(),
            });
        }
        // SAFETY: aligned and large enough for a header.
        let header = unsafe { &*region.as_ptr().cast::<QueueHeader>() };
        let capacity = header.validate(size_of::<T>(), region.len())?;
        Ok(Self::from_parts(region, capacity))
    }

    /// Create an in-process queue on the heap and split it.
    pub fn with_capacity(capacity: u32) -> Result<(QueueProducer<T>, QueueConsumer<T>), RegionError> {
        check_capacity(capacity)?;
        let region = heap_region(queue_footprint::<T>(capacity))?;
        Ok(Self::init(region, capacity)?.split())
    }

    /// Create or join the named queue `name` inside `dir`.
    ///
    /// A queue that does not exist yet is created and initialised. An
    /// existing one is joined only when `join_if_exists` is set, and must have
    /// been created with the same capacity and element type.
    pub fn open_named(
        dir: impl AsRef<Path>,
        name: &str,
        capacity: u32,
        join_if_exists: bool,
    ) -> Result<Self, RegionError> {
        check_capacity(capacity)?;
        let path = dir.as_ref().join(name);
        let shared = SharedRegion::open(&path, queue_footprint::<T>(capacity), join_if_exists)?;
        let created = shared.created();
        let region = shared.into_region();
        let queue = if created {
            Self::init(region, capacity)?
        } else {
            Self::attach(region)?
        };
        tracing::debug!(name, capacity, created, "opened named queue");
        Ok(queue)
    }

    fn from_parts(region: MappedRegion, capacity: u32) -> Self {
        let base = region.as_ptr();
        // SAFETY: both pointers are derived from a non-null region and lie
        // within the footprint validated by the caller.
        let (header, slots) = unsafe {
            (
                NonNull::new_unchecked(base.cast::<QueueHeader>()),
                NonNull::new_unchecked(base.add(size_of::<QueueHeader>()).cast::<T>()),
            )
        };
        Self {
            region,
            header,
            slots,
            capacity,
            _marker: PhantomData,
        }
    }

    /// Split into the two roles. Each may be moved to a different thread.
    pub fn split(self) -> (QueueProducer<T>, QueueConsumer<T>) {
        let twin = Self::from_parts(self.region.clone(), self.capacity);
        (self.into_producer(), twin.into_consumer())
    }

    /// Take the producer role. The peer must hold the consumer role.
    pub fn into_producer(self) -> QueueProducer<T> {
        let head = self.header().head.load(Ordering::Acquire) & self.mask();
        let cached_tail = self.header().tail.load(Ordering::Acquire) & self.mask();
        QueueProducer {
            queue: self,
            head,
            cached_tail,
        }
    }

    /// Take the consumer role. The peer must hold the producer role.
    pub fn into_consumer(self) -> QueueConsumer<T> {
        let tail = self.header().tail.load(Ordering::Acquire) & self.mask();
        let cached_head = self.header().head.load(Ordering::Acquire) & self.mask();
        QueueConsumer {
            queue: self,
            tail,
            cached_head,
        }
    }
}

impl<T> Queue<T> {
    #[inline]
    fn header(&self) -> &QueueHeader {
        // SAFETY: header points to a validated QueueHeader kept alive by region.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    #[inline]
    fn slot(&self, index: u32) -> *mut T {
        debug_assert!(index < self.capacity);
        // SAFETY: index is masked by every caller, so the slot is in bounds.
        unsafe { self.slots.as_ptr().add(index as usize) }
    }

    /// Number of slots, including the one that is always kept empty.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of elements that fit at once (`capacity - 1`).
    #[inline]
    pub fn usable_capacity(&self) -> u32 {
        self.capacity - 1
    }

    /// Snapshot of the occupancy as seen by a third party.
    pub fn len(&self) -> u32 {
        let tail = self.header().tail.load(Ordering::Acquire);
        let head = self.header().head.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.mask()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The region this queue lives in.
    pub fn region(&self) -> &MappedRegion {
        &self.region
    }
}

fn check_element<T>() -> Result<(), LayoutError> {
    if size_of::<T>() == 0 {
        return Err(LayoutError::InvalidConfig("zero-sized elements are not supported"));
    }
    if align_of::<T>() > CACHE_LINE_SIZE {
        return Err(LayoutError::InvalidConfig("element alignment exceeds a cache line"));
    }
    Ok(())
}

fn check_alignment(region: &MappedRegion) -> Result<(), LayoutError> {
    let address = region.as_ptr() as usize;
    if address % CACHE_LINE_SIZE != 0 {
        return Err(LayoutError::Misaligned { address });
    }
    Ok(())
}

// =============================================================================
// Producer
// =============================================================================

/// Enqueue-only handle. Owns `head`.
pub struct QueueProducer<T> {
    queue: Queue<T>,
    head: u32,
    cached_tail: u32,
}

// SAFETY: the producer is the only writer of head and of unpublished slots.
unsafe impl<T: Send> Send for QueueProducer<T> {}

impl<T: Pod> QueueProducer<T> {
    /// Append one element. Fails with [`RingError::Full`] when
    /// `capacity - 1` elements are outstanding.
    pub fn enqueue(&mut self, item: T) -> Result<(), RingError> {
        let mask = self.queue.mask();
        let next = (self.head + 1) & mask;
        if next == self.cached_tail {
            self.refresh();
            if next == self.cached_tail {
                return Err(RingError::Full);
            }
        }

        // SAFETY: the slot at head is outside [tail, head) so the consumer
        // does not read it until head is published below.
        unsafe { self.queue.slot(self.head).write(item) };
        self.head = next;
        self.queue.header().head.store(next, Ordering::Release);
        Ok(())
    }

    /// Reserve `n` contiguous-in-order slots to fill in place.
    ///
    /// Nothing becomes visible to the consumer until [`Grant::commit`].
    pub fn reserve(&mut self, n: u32) -> Result<Grant<'_, T>, RingError> {
        let max = self.queue.usable_capacity();
        if n > max {
            return Err(RingError::TooLarge { requested: n, max });
        }
        if self.free_cached() < n {
            self.refresh();
            if self.free_cached() < n {
                return Err(RingError::Full);
            }
        }
        Ok(Grant { producer: self, len: n })
    }
}

impl<T> QueueProducer<T> {
    #[inline]
    fn free_cached(&self) -> u32 {
        let mask = self.queue.mask();
        mask - (self.head.wrapping_sub(self.cached_tail) & mask)
    }

    /// Re-read the consumer's cursor.
    pub fn refresh(&mut self) {
        self.cached_tail = self.queue.header().tail.load(Ordering::Acquire) & self.queue.mask();
    }

    /// Free slots according to a fresh read of the consumer's cursor.
    pub fn free_slots(&mut self) -> u32 {
        self.refresh();
        self.free_cached()
    }

    /// Elements published and not yet released by the consumer, according
    /// to the cached cursor.
    pub fn pending(&self) -> u32 {
        self.head.wrapping_sub(self.cached_tail) & self.queue.mask()
    }

    pub fn is_full(&mut self) -> bool {
        self.free_slots() == 0
    }

    /// The producer's cursor.
    #[inline]
    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }
}

/// Slots reserved by [`QueueProducer::reserve`].
///
/// Dropping a grant without committing publishes nothing.
pub struct Grant<'a, T> {
    producer: &'a mut QueueProducer<T>,
    len: u32,
}

impl<T> Grant<'_, T> {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The reserved slots, split at the physical end of the ring.
    pub fn slots_mut(&mut self) -> (&mut [T], &mut [T]) {
        let queue = &self.producer.queue;
        let head = self.producer.head;
        let first = self.len.min(queue.capacity - head);
        let second = self.len - first;
        // SAFETY: the reserved slots are not readable by the consumer and are
        // exclusively borrowed through this grant.
        unsafe {
            (
                std::slice::from_raw_parts_mut(queue.slot(head), first as usize),
                std::slice::from_raw_parts_mut(queue.slots.as_ptr(), second as usize),
            )
        }
    }

    /// Publish every reserved slot at once.
    pub fn commit(self) {
        let producer = self.producer;
        let next = (producer.head + self.len) & producer.queue.mask();
        producer.head = next;
        producer.queue.header().head.store(next, Ordering::Release);
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Dequeue-only handle. Owns `tail`.
pub struct QueueConsumer<T> {
    queue: Queue<T>,
    tail: u32,
    cached_head: u32,
}

// SAFETY: the consumer is the only writer of tail and only reads published slots.
unsafe impl<T: Send> Send for QueueConsumer<T> {}

impl<T: Pod> QueueConsumer<T> {
    /// Remove the oldest element.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.available() == 0 {
            return None;
        }
        // SAFETY: tail < head (published with release, observed with acquire).
        let item = unsafe { self.queue.slot(self.tail).read() };
        self.release(1);
        Some(item)
    }

    /// Copy of the oldest element without consuming it.
    pub fn peek(&mut self) -> Option<T> {
        if self.available() == 0 {
            return None;
        }
        // SAFETY: as in dequeue.
        Some(unsafe { self.queue.slot(self.tail).read() })
    }
}

impl<T> QueueConsumer<T> {
    #[inline]
    fn occupancy_cached(&self) -> u32 {
        self.cached_head.wrapping_sub(self.tail) & self.queue.mask()
    }

    /// Re-read the producer's cursor and return the new occupancy.
    pub fn refresh(&mut self) -> u32 {
        self.cached_head = self.queue.header().head.load(Ordering::Acquire) & self.queue.mask();
        self.occupancy_cached()
    }

    /// Elements readable now. The producer's cursor is only re-read when the
    /// cached view is empty.
    pub fn available(&mut self) -> u32 {
        match self.occupancy_cached() {
            0 => self.refresh(),
            n => n,
        }
    }

    /// Reference to the element `offset` places after the oldest one, if it
    /// is within the cached readable range.
    pub fn peek_at(&self, offset: u32) -> Option<&T> {
        if offset >= self.occupancy_cached() {
            return None;
        }
        let index = (self.tail + offset) & self.queue.mask();
        // SAFETY: the slot is published and cannot be reused while &self is
        // borrowed, since releasing requires &mut self.
        Some(unsafe { &*self.queue.slot(index) })
    }

    /// The cached readable range, split at the physical end of the ring.
    pub fn readable(&self) -> (&[T], &[T]) {
        let n = self.occupancy_cached();
        let first = n.min(self.queue.capacity - self.tail);
        let second = n - first;
        // SAFETY: see peek_at.
        unsafe {
            (
                std::slice::from_raw_parts(self.queue.slot(self.tail), first as usize),
                std::slice::from_raw_parts(self.queue.slots.as_ptr(), second as usize),
            )
        }
    }

    /// Hand `n` elements back to the producer. Returns how many were
    /// released, which is less than `n` only if fewer were readable.
    pub fn release(&mut self, n: u32) -> u32 {
        let n = n.min(self.occupancy_cached());
        if n == 0 {
            return 0;
        }
        self.tail = (self.tail + n) & self.queue.mask();
        self.queue.header().tail.store(self.tail, Ordering::Release);
        n
    }

    /// Release everything currently readable.
    pub fn clear(&mut self) -> u32 {
        let n = self.refresh();
        self.release(n)
    }

    pub fn is_empty(&mut self) -> bool {
        self.available() == 0
    }

    /// The consumer's cursor.
    #[inline]
    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Ring is full.
    Full,
    /// More slots requested than the ring can ever hold.
    TooLarge { requested: u32, max: u32 },
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "ring is full"),
            Self::TooLarge { requested, max } => {
                write!(f, "requested {} slots, ring holds at most {}", requested, max)
            }
        }
    }
}

impl std::error::Error for RingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let (mut p, mut c) = Queue::<u64>::with_capacity(8).unwrap();
        p.enqueue(42).unwrap();
        assert_eq!(c.dequeue(), Some(42));
        assert_eq!(c.dequeue(), None);
    }

    #[test]
    fn test_queue_empty() {
        let (_p, mut c) = Queue::<u64>::with_capacity(8).unwrap();
        for _ in 0..3 {
            assert_eq!(c.dequeue(), None);
            assert_eq!(c.peek(), None);
        }
        assert_eq!(c.tail(), 0);
    }

    #[test]
    fn test_queue_full() {
        let (mut p, _c) = Queue::<u64>::with_capacity(8).unwrap();
        for i in 0..7 {
            p.enqueue(i).unwrap();
        }
        assert_eq!(p.enqueue(7), Err(RingError::Full));
        assert!(p.is_full());
    }

    #[test]
    fn test_empty_after_full() {
        let (mut p, mut c) = Queue::<u64>::with_capacity(8).unwrap();
        for i in 0..7 {
            p.enqueue(i).unwrap();
        }
        for i in 0..7 {
            assert_eq!(c.dequeue(), Some(i));
        }
        assert_eq!(c.dequeue(), None);
        assert_eq!(p.free_slots(), 7);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut p, mut c) = Queue::<u64>::with_capacity(4).unwrap();
        p.enqueue(9).unwrap();
        assert_eq!(c.peek(), Some(9));
        assert_eq!(c.peek(), Some(9));
        assert_eq!(c.tail(), 0);
        assert_eq!(c.dequeue(), Some(9));
    }

    #[test]
    fn test_capacity_four_scenario() {
        let (mut p, mut c) = Queue::<u32>::with_capacity(4).unwrap();
        let mut drained = Vec::new();

        p.enqueue(1).unwrap();
        p.enqueue(2).unwrap();
        p.enqueue(3).unwrap();
        drained.push(c.dequeue().unwrap());
        p.enqueue(4).unwrap();
        assert_eq!(p.enqueue(5), Err(RingError::Full));
        drained.push(c.dequeue().unwrap());
        p.enqueue(5).unwrap();
        while let Some(v) = c.dequeue() {
            drained.push(v);
        }

        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_wrap_around() {
        let (mut p, mut c) = Queue::<u64>::with_capacity(4).unwrap();
        for round in 0..10u64 {
            for i in 0..3 {
                p.enqueue(round * 3 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(c.dequeue(), Some(round * 3 + i));
            }
        }
    }

    #[test]
    fn test_consumer_caches_head_until_empty() {
        let (mut p, mut c) = Queue::<u64>::with_capacity(8).unwrap();
        p.enqueue(1).unwrap();
        assert_eq!(c.available(), 1);
        p.enqueue(2).unwrap();
        // Cached view still has data, so the producer's cursor is not re-read.
        assert_eq!(c.available(), 1);
        assert_eq!(c.refresh(), 2);
    }

    #[test]
    fn test_reserve_commit_across_wrap() {
        let (mut p, mut c) = Queue::<u32>::with_capacity(8).unwrap();
        for i in 0..6 {
            p.enqueue(i).unwrap();
        }
        for _ in 0..6 {
            c.dequeue().unwrap();
        }

        let mut grant = p.reserve(5).unwrap();
        {
            let (a, b) = grant.slots_mut();
            assert_eq!((a.len(), b.len()), (2, 3));
            for (i, slot) in a.iter_mut().chain(b.iter_mut()).enumerate() {
                *slot = 100 + i as u32;
            }
        }
        assert_eq!(c.refresh(), 0);
        grant.commit();

        assert_eq!(c.refresh(), 5);
        let (a, b) = c.readable();
        assert_eq!(a, &[100, 101]);
        assert_eq!(b, &[102, 103, 104]);
        assert_eq!(c.peek_at(4), Some(&104));
        assert_eq!(c.peek_at(5), None);
        assert_eq!(c.release(10), 5);
    }

    #[test]
    fn test_dropped_grant_publishes_nothing() {
        let (mut p, mut c) = Queue::<u32>::with_capacity(4).unwrap();
        {
            let mut grant = p.reserve(2).unwrap();
            grant.slots_mut().0[0] = 7;
        }
        assert_eq!(c.available(), 0);
        assert_eq!(p.reserve(4).err(), Some(RingError::TooLarge { requested: 4, max: 3 }));
        assert!(p.reserve(3).is_ok());
    }

    #[test]
    fn test_attach_validates_element_size() {
        let region = heap_region(queue_footprint::<u64>(8)).unwrap();
        let queue = Queue::<u64>::init(region.clone(), 8).unwrap();
        assert_eq!(queue.capacity(), 8);
        assert!(matches!(
            Queue::<u32>::attach(region.clone()),
            Err(LayoutError::ElementSizeMismatch { expected: 4, found: 8 })
        ));
        assert_eq!(Queue::<u64>::attach(region).unwrap().capacity(), 8);
    }

    #[test]
    fn test_init_rejects_bad_geometry() {
        let region = heap_region(queue_footprint::<u64>(4)).unwrap();
        assert!(matches!(
            Queue::<u64>::init(region.clone(), 8),
            Err(LayoutError::RegionTooSmall { .. })
        ));
        assert!(matches!(
            Queue::<u64>::init(region.clone(), 3),
            Err(LayoutError::InvalidConfig(_))
        ));
        let unaligned = region.subregion(8, 64).unwrap();
        assert!(matches!(
            Queue::<u64>::init(unaligned, 2),
            Err(LayoutError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_named_queue_join() {
        let dir = std::env::temp_dir();
        let name = format!("nicpipe-queue-{}", std::process::id());
        let _ = std::fs::remove_file(dir.join(&name));

        let mut p = Queue::<u64>::open_named(&dir, &name, 16, true).unwrap().into_producer();
        p.enqueue(5).unwrap();

        let mut c = Queue::<u64>::open_named(&dir, &name, 16, true).unwrap().into_consumer();
        assert_eq!(c.dequeue(), Some(5));

        assert!(matches!(
            Queue::<u64>::open_named(&dir, &name, 16, false),
            Err(RegionError::AlreadyExists(_))
        ));
        std::fs::remove_file(dir.join(&name)).unwrap();
    }

    #[test]
    fn test_threads_preserve_order() {
        const N: u64 = 100_000;
        let (mut p, mut c) = Queue::<u64>::with_capacity(64).unwrap();

        let producer = std::thread::spawn(move || {
            for i in 0..N {
                while p.enqueue(i).is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0;
        while expected < N {
            if let Some(v) = c.dequeue() {
                assert_eq!(v, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
        assert_eq!(c.dequeue(), None);
    }
}
