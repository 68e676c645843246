//! Device configuration
//!
//! All values are fixed when the registry is created.

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

pub const DEFAULT_QUANTUM: usize = 4000;
pub const DEFAULT_QSET: usize = 1000;
pub const DEFAULT_PIPE_BUFFER: usize = 4000;
pub const DEFAULT_NR_DEVS: usize = 4;
pub const DEFAULT_NR_PIPE_DEVS: usize = 4;

/// Major number handed out when `first_major` is left at 0
pub const DYNAMIC_MAJOR: u32 = 240;

/// Sizes and counts for a device registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bytes per quantum (block) of a sparse store
    pub quantum: usize,
    /// Quanta per index node of a sparse store
    pub qset: usize,
    /// Capacity of a pipe ring; one byte is always kept free
    pub pipe_buffer: usize,
    /// Number of unrestricted `scullN` devices
    pub nr_devs: usize,
    /// Number of `scullpipeN` devices
    pub nr_pipe_devs: usize,
    /// Major device number, 0 asks for a dynamic one
    pub first_major: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            qset: DEFAULT_QSET,
            pipe_buffer: DEFAULT_PIPE_BUFFER,
            nr_devs: DEFAULT_NR_DEVS,
            nr_pipe_devs: DEFAULT_NR_PIPE_DEVS,
            first_major: 0,
        }
    }
}

impl DeviceConfig {
    /// Parse a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    /// `InvalidArgument` if the JSON is malformed or a size is unusable.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| {
            log::warn!("config: cannot parse device config: {e}");
            DeviceError::InvalidArgument
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every size can back a working device.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero quantum/qset or a pipe ring under 2 bytes.
    pub fn validate(&self) -> Result<()> {
        if self.quantum == 0 || self.qset == 0 {
            return Err(DeviceError::InvalidArgument);
        }
        if self.quantum.checked_mul(self.qset).is_none() {
            return Err(DeviceError::InvalidArgument);
        }
        // A ring of one byte could never hold data
        if self.pipe_buffer < 2 {
            return Err(DeviceError::InvalidArgument);
        }
        Ok(())
    }

    #[must_use]
    pub fn with_quantum(mut self, quantum: usize, qset: usize) -> Self {
        self.quantum = quantum;
        self.qset = qset;
        self
    }

    #[must_use]
    pub fn with_pipe_buffer(mut self, pipe_buffer: usize) -> Self {
        self.pipe_buffer = pipe_buffer;
        self
    }

    #[must_use]
    pub fn with_device_counts(mut self, nr_devs: usize, nr_pipe_devs: usize) -> Self {
        self.nr_devs = nr_devs;
        self.nr_pipe_devs = nr_pipe_devs;
        self
    }

    /// Major number the registry should use
    #[must_use]
    pub fn major(&self) -> u32 {
        if self.first_major == 0 {
            DYNAMIC_MAJOR
        } else {
            self.first_major
        }
    }
}
