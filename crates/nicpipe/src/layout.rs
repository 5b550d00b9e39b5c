//! Shared-memory layout definitions.
//!
//! Every ring that crosses the software/device boundary starts with a
//! [`QueueHeader`] followed by a contiguous array of fixed-size slots. The
//! header is the only place where the two parties agree on geometry, so it is
//! validated every time a side attaches.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Metadata (64 bytes: magic, version, elem_size, capacity)            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  head (64 bytes, written only by the producer)                       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  tail (64 bytes, written only by the consumer)                       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Slots (capacity × size_of::<T>())                                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::mem::{align_of, size_of};
use std::sync::atomic::AtomicU32;

use bytemuck::{Pod, Zeroable};

/// Magic bytes identifying a nicpipe ring.
pub const MAGIC: [u8; 8] = *b"NICPIPE\0";

/// Current layout version (major.minor packed into u32).
/// Major = high 16 bits, minor = low 16 bits.
pub const LAYOUT_VERSION: u32 = 1 << 16; // v1.0

/// Cache line size assumed by every shared structure.
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of the transfer quantum used by pipe rings.
pub const FLIT_SIZE: usize = 64;

/// Smallest capacity a queue may be created with.
pub const MIN_QUEUE_CAPACITY: u32 = 2;

/// Largest capacity a queue may be created with.
pub const MAX_QUEUE_CAPACITY: u32 = 1 << 30;

/// Wrapper that gives its contents a cache line of their own.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T>(pub T);

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

// =============================================================================
// Queue Header
// =============================================================================

/// Header at the start of every queue region (192 bytes).
///
/// Metadata is written once by the creating side before the region is handed
/// to the peer and is read-only afterwards. Each cursor lives on its own cache
/// line and has exactly one writer.
#[repr(C, align(64))]
pub struct QueueHeader {
    /// Magic bytes: "NICPIPE\0".
    pub magic: [u8; 8],
    /// Layout version (major.minor packed).
    pub version: u32,
    /// Size in bytes of one slot.
    pub elem_size: u32,
    /// Number of slots (power of 2).
    pub capacity: u32,
    /// Padding to one cache line.
    pub _reserved: [u8; 44],

    /// Next slot the producer will write. Always in `[0, capacity)`.
    pub head: CacheAligned<AtomicU32>,
    /// Next slot the consumer will read. Always in `[0, capacity)`.
    pub tail: CacheAligned<AtomicU32>,
}

const _: () = assert!(size_of::<QueueHeader>() == 192);
const _: () = assert!(align_of::<QueueHeader>() == CACHE_LINE_SIZE);

impl QueueHeader {
    /// Initialize a header for `capacity` slots of `elem_size` bytes.
    ///
    /// Must only be called before the region is visible to the peer.
    pub fn init(&mut self, elem_size: u32, capacity: u32) {
        self.magic = MAGIC;
        self.version = LAYOUT_VERSION;
        self.elem_size = elem_size;
        self.capacity = capacity;
        self._reserved = [0; 44];
        self.head = CacheAligned(AtomicU32::new(0));
        self.tail = CacheAligned(AtomicU32::new(0));
    }

    /// Validate the header against the caller's expectations and return the
    /// capacity recorded in it.
    pub fn validate(&self, elem_size: usize, region_len: usize) -> Result<u32, LayoutError> {
        if self.magic != MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        let major = self.version >> 16;
        let our_major = LAYOUT_VERSION >> 16;
        if major != our_major {
            return Err(LayoutError::IncompatibleVersion {
                expected: LAYOUT_VERSION,
                found: self.version,
            });
        }
        if self.elem_size as usize != elem_size {
            return Err(LayoutError::ElementSizeMismatch {
                expected: elem_size,
                found: self.elem_size as usize,
            });
        }
        check_capacity(self.capacity)?;
        let required = queue_footprint_checked(elem_size, self.capacity)
            .ok_or(LayoutError::InvalidConfig("queue footprint overflows usize"))?;
        if region_len < required {
            return Err(LayoutError::RegionTooSmall {
                required,
                found: region_len,
            });
        }
        Ok(self.capacity)
    }
}

/// Check that a capacity can back a queue.
pub fn check_capacity(capacity: u32) -> Result<(), LayoutError> {
    if !capacity.is_power_of_two() {
        return Err(LayoutError::InvalidConfig("capacity must be a power of 2"));
    }
    if capacity < MIN_QUEUE_CAPACITY {
        return Err(LayoutError::InvalidConfig("capacity must be at least 2"));
    }
    if capacity > MAX_QUEUE_CAPACITY {
        return Err(LayoutError::InvalidConfig("capacity exceeds 2^30"));
    }
    Ok(())
}

/// Bytes needed for a queue of `capacity` elements of type `T`.
pub const fn queue_footprint<T>(capacity: u32) -> usize {
    size_of::<QueueHeader>() + capacity as usize * size_of::<T>()
}

fn queue_footprint_checked(elem_size: usize, capacity: u32) -> Option<usize> {
    elem_size
        .checked_mul(capacity as usize)?
        .checked_add(size_of::<QueueHeader>())
}

// =============================================================================
// Flit
// =============================================================================

/// One 64-byte transfer quantum.
///
/// Pipe rings are arrays of flits and messages are padded to a whole number
/// of them, so a message never shares a flit with its neighbour.
#[repr(C, align(64))]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Flit(pub [u8; FLIT_SIZE]);

const _: () = assert!(size_of::<Flit>() == FLIT_SIZE);

impl Default for Flit {
    fn default() -> Self {
        Flit([0; FLIT_SIZE])
    }
}

impl std::fmt::Debug for Flit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flit({:02x?}..)", &self.0[..8])
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic bytes.
    InvalidMagic,
    /// Incompatible layout version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Slot size recorded by the peer differs from ours.
    ElementSizeMismatch { expected: usize, found: usize },
    /// Region too small for the recorded geometry.
    RegionTooSmall { required: usize, found: usize },
    /// Region base is not cache-line aligned.
    Misaligned { address: usize },
    /// Invalid configuration.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid magic bytes"),
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xFFFF,
                    found >> 16,
                    found & 0xFFFF
                )
            }
            Self::ElementSizeMismatch { expected, found } => {
                write!(
                    f,
                    "element size mismatch: expected {} bytes, found {}",
                    expected, found
                )
            }
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {} bytes, got {}", required, found)
            }
            Self::Misaligned { address } => {
                write!(f, "region at {:#x} is not cache-line aligned", address)
            }
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}
