//! Configuration structures for StrataDB buffer tiers.

use crate::error::{Result, StrataError};
use crate::types::DeviceId;
use serde::{Deserialize, Serialize};

/// Configuration for one buffer pool tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Device this tier serves; passed through to buffer transfers.
    pub device_id: DeviceId,
    /// Total byte budget for slab backing memory.
    pub max_buffer_size: usize,
    /// Bytes per slab; must be a multiple of `page_size`.
    pub slab_size: usize,
    /// Allocation granularity in bytes.
    pub page_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId(0),
            max_buffer_size: 256 * 1024 * 1024, // 256 MB
            slab_size: 4 * 1024 * 1024,         // 4 MB
            page_size: 4096,
        }
    }
}

impl PoolConfig {
    /// Validates the construction parameters.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StrataError::Config("page_size must be positive".into()));
        }
        if self.slab_size == 0 {
            return Err(StrataError::Config("slab_size must be positive".into()));
        }
        if self.slab_size % self.page_size != 0 {
            return Err(StrataError::Config(format!(
                "slab_size {} is not a multiple of page_size {}",
                self.slab_size, self.page_size
            )));
        }
        if self.max_buffer_size < self.slab_size {
            return Err(StrataError::Config(format!(
                "max_buffer_size {} is smaller than one slab of {} bytes",
                self.max_buffer_size, self.slab_size
            )));
        }
        Ok(())
    }

    /// Number of pages in each slab.
    pub fn num_pages_per_slab(&self) -> usize {
        self.slab_size / self.page_size
    }

    /// Number of slabs the byte budget allows.
    pub fn max_num_slabs(&self) -> usize {
        self.max_buffer_size / self.slab_size
    }
}
