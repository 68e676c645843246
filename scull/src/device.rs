//! A sparse store behind its own lock
//!
//! Every read, write and trim of one device is serialized here, so the size a
//! reader sees always reflects completed writes.

use parking_lot::Mutex;
use std::fmt;

use crate::error::{DeviceError, Result};
use crate::sparse::{Geometry, SparseStore};

pub struct ScullDevice {
    name: String,
    store: Mutex<SparseStore>,
}

impl ScullDevice {
    #[must_use]
    pub fn new(name: &str, geometry: Geometry) -> Self {
        Self {
            name: name.to_string(),
            store: Mutex::new(SparseStore::new(geometry)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes from `pos`, at most up to the end of one quantum. 0 means
    /// end of data or a hole.
    ///
    /// # Errors
    /// `InvalidAddress` if `pos` does not fit the address space.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = to_offset(pos)?;
        Ok(self.store.lock().read(offset, buf))
    }

    /// # Errors
    /// `InvalidAddress` or `OutOfMemory` from the store.
    pub fn write(&self, pos: u64, data: &[u8]) -> Result<usize> {
        let offset = to_offset(pos)?;
        self.store.lock().write(offset, data)
    }

    pub fn trim(&self) {
        log::debug!("device {}: trim", self.name);
        self.store.lock().trim();
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.store.lock().size() as u64
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.store.lock().geometry()
    }

    #[must_use]
    pub fn allocated_quanta(&self) -> usize {
        self.store.lock().allocated_quanta()
    }
}

fn to_offset(pos: u64) -> Result<usize> {
    usize::try_from(pos).map_err(|_| DeviceError::InvalidAddress)
}

impl fmt::Debug for ScullDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.store.lock();
        write!(
            f,
            "ScullDevice(name={}, size={}, nodes={})",
            self.name,
            store.size(),
            store.node_count()
        )
    }
}
