//! The seam between the core and whatever provides memory and registers.

use std::sync::Arc;

use crate::region::{MappedRegion, RegionError};

/// Register offsets understood by every device.
pub mod regs {
    /// Offset of the notification buffer pair in device memory.
    pub const REG_NOTIF_BUF_BASE: u64 = 0x00;
    /// Capacity of each notification queue.
    pub const REG_NOTIF_BUF_CAPACITY: u64 = 0x08;
}

/// Memory mapping and register access.
///
/// Discovery, BAR mapping and driver loading all happen before a `Device`
/// exists; the core only maps regions it has been told about and pokes
/// registers.
pub trait Device: Send + Sync {
    /// Map `len` bytes of device-visible memory starting at `offset`.
    fn map_region(&self, offset: u64, len: usize) -> Result<MappedRegion, DeviceError>;

    /// Write a register.
    fn mmio_write(&self, register: u64, value: u64);

    /// Read a register.
    fn mmio_read(&self, register: u64) -> u64;
}

impl<D: Device + ?Sized> Device for Arc<D> {
    fn map_region(&self, offset: u64, len: usize) -> Result<MappedRegion, DeviceError> {
        (**self).map_region(offset, len)
    }

    fn mmio_write(&self, register: u64, value: u64) {
        (**self).mmio_write(register, value)
    }

    fn mmio_read(&self, register: u64) -> u64 {
        (**self).mmio_read(register)
    }
}

/// Errors reported by a [`Device`].
#[derive(Debug)]
pub enum DeviceError {
    /// The requested range is outside device memory.
    OutOfBounds { offset: u64, len: usize, size: usize },
    /// Backing memory could not be provided.
    Region(RegionError),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "range {:#x}+{} is outside device memory of {} bytes",
                offset, len, size
            ),
            Self::Region(e) => write!(f, "device memory error: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Region(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegionError> for DeviceError {
    fn from(e: RegionError) -> Self {
        DeviceError::Region(e)
    }
}
