//! Control-plane configuration.

use crate::error::PipeError;
use crate::layout::{check_capacity, MAX_QUEUE_CAPACITY};

/// Slots in each notification queue.
pub const DEFAULT_NOTIFICATION_CAPACITY: u32 = 256;

/// Device-memory offset of the notification buffer pair.
pub const DEFAULT_NOTIF_BUF_OFFSET: u64 = 0;

/// Flits requested for each pipe ring (256 KiB).
pub const DEFAULT_PIPE_CAPACITY: u32 = 4096;

/// Most flits one `recv_pkts`/`peek_pkts` batch covers.
pub const DEFAULT_BATCH_LIMIT: u32 = 1024;

/// Sizes and placement for a [`crate::ControlPlane`].
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Slots in each notification queue (power of two).
    pub notification_capacity: u32,
    /// Where in device memory the notification buffers live.
    pub notif_buf_offset: u64,
    /// Ring size requested for new pipes, in flits (power of two). The
    /// device may grant a different size.
    pub pipe_capacity: u32,
    /// Default flit limit for a receive batch.
    pub batch_limit: u32,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            notif_buf_offset: DEFAULT_NOTIF_BUF_OFFSET,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

impl PipeConfig {
    pub fn validate(&self) -> Result<(), PipeError> {
        check_capacity(self.notification_capacity)
            .map_err(|_| PipeError::InvalidConfig("notification_capacity must be a power of two >= 2"))?;
        check_capacity(self.pipe_capacity)
            .map_err(|_| PipeError::InvalidConfig("pipe_capacity must be a power of two >= 2"))?;
        if self.notification_capacity < 4 {
            // Room for at least one full allocation exchange plus a free.
            return Err(PipeError::InvalidConfig("notification_capacity must be at least 4"));
        }
        if self.batch_limit == 0 || self.batch_limit > MAX_QUEUE_CAPACITY {
            return Err(PipeError::InvalidConfig("batch_limit out of range"));
        }
        if self.notif_buf_offset % 64 != 0 {
            return Err(PipeError::InvalidConfig("notif_buf_offset must be cache-line aligned"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PipeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_capacities() {
        let config = PipeConfig {
            pipe_capacity: 1000,
            ..PipeConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipeError::InvalidConfig(_))));

        let config = PipeConfig {
            notification_capacity: 2,
            ..PipeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipeConfig {
            notif_buf_offset: 12,
            ..PipeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
