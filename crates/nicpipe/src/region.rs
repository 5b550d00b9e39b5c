//! Memory regions that rings are laid out in.
//!
//! A [`MappedRegion`] is a raw pointer plus length, kept alive by an owner
//! handle. Devices hand them out from `map_region`, the heap provides them for
//! in-process pairs, and [`SharedRegion`] maps them from a file so that two
//! processes can share a queue.

use std::alloc::Layout;
use std::any::Any;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::MmapOptions;

use crate::layout::LayoutError;

/// Alignment of heap-backed regions.
pub const REGION_ALIGN: usize = 4096;

/// A contiguous range of memory shared with a peer.
///
/// Cloning produces another handle to the same bytes. Nothing here
/// synchronizes access: the structures laid out in the region are responsible
/// for that.
#[derive(Clone)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the region is plain memory; concurrent access is mediated by the
// acquire/release protocol of the structures placed in it.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Wrap raw memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// `owner` is alive.
    pub unsafe fn from_raw_parts(
        ptr: NonNull<u8>,
        len: usize,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            len,
            _owner: owner,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A handle to `len` bytes starting at `offset`, sharing the same owner.
    pub fn subregion(&self, offset: usize, len: usize) -> Option<MappedRegion> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset is within the region checked above.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Some(MappedRegion {
            ptr,
            len,
            _owner: self._owner.clone(),
        })
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// =============================================================================
// Heap regions
// =============================================================================

/// Zeroed, page-aligned heap memory.
struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: HeapRegion only owns the allocation; it never reads or writes it.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `heap_region` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Allocate a zeroed, page-aligned region on the heap.
pub fn heap_region(len: usize) -> Result<MappedRegion, RegionError> {
    let layout =
        Layout::from_size_align(len.max(1), REGION_ALIGN).map_err(|_| RegionError::InvalidLength(len))?;
    // SAFETY: layout has non-zero size.
    let raw = unsafe { std::alloc::alloc_zeroed(layout) };
    let Some(ptr) = NonNull::new(raw) else {
        std::alloc::handle_alloc_error(layout);
    };
    let owner = Arc::new(HeapRegion { ptr, layout });
    // SAFETY: the allocation is `len` bytes and lives as long as `owner`.
    Ok(unsafe { MappedRegion::from_raw_parts(ptr, len, owner) })
}

// =============================================================================
// File-backed regions
// =============================================================================

/// A file-backed shared mapping, usually on tmpfs or hugetlbfs.
pub struct SharedRegion {
    path: PathBuf,
    region: MappedRegion,
    created: bool,
}

impl SharedRegion {
    /// Create or join the region stored at `path`.
    ///
    /// A new file is created with `len` zeroed bytes. An existing file is
    /// joined only if `join_if_exists` is set and its size equals `len`.
    pub fn open(path: impl AsRef<Path>, len: usize, join_if_exists: bool) -> Result<Self, RegionError> {
        let path = path.as_ref().to_path_buf();
        if len == 0 {
            return Err(RegionError::InvalidLength(len));
        }

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                file.set_len(len as u64)?;
                (file, true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !join_if_exists {
                    return Err(RegionError::AlreadyExists(path));
                }
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                let found = file.metadata()?.len() as usize;
                if found != len {
                    return Err(RegionError::SizeMismatch { expected: len, found });
                }
                (file, false)
            }
            Err(e) => return Err(e.into()),
        };

        // SAFETY: the file stays open for the life of the mapping and both
        // parties treat its contents through the ring protocol only.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or(RegionError::InvalidLength(len))?;
        let owner: Arc<dyn Any + Send + Sync> = Arc::new(mmap);
        // SAFETY: the mapping is `len` bytes and is owned by `owner`.
        let region = unsafe { MappedRegion::from_raw_parts(ptr, len, owner) };

        tracing::debug!(path = %path.display(), len, created, "mapped shared region");

        Ok(Self {
            path,
            region,
            created,
        })
    }

    /// Whether this call created the backing file.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    pub fn into_region(self) -> MappedRegion {
        self.region
    }

    /// Remove the backing file. Existing mappings stay valid.
    pub fn unlink(&self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

/// Errors from creating or joining a region.
#[derive(Debug)]
pub enum RegionError {
    /// Filesystem or mmap failure.
    Io(io::Error),
    /// The region exists and joining was not requested.
    AlreadyExists(PathBuf),
    /// The existing region has a different size.
    SizeMismatch { expected: usize, found: usize },
    /// Length cannot back a region.
    InvalidLength(usize),
    /// The region's contents failed validation.
    Layout(LayoutError),
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "region I/O error: {}", e),
            Self::AlreadyExists(path) => write!(f, "region already exists: {}", path.display()),
            Self::SizeMismatch { expected, found } => {
                write!(f, "region size mismatch: expected {} bytes, found {}", expected, found)
            }
            Self::InvalidLength(len) => write!(f, "invalid region length: {}", len),
            Self::Layout(e) => write!(f, "region layout error: {}", e),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegionError {
    fn from(e: io::Error) -> Self {
        RegionError::Io(e)
    }
}

impl From<LayoutError> for RegionError {
    fn from(e: LayoutError) -> Self {
        RegionError::Layout(e)
    }
}
