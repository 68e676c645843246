//! Per-client stores, one per session key
//!
//! Entries are created on first reference and kept until the registry is
//! torn down. The map lock is only held to resolve or insert a key; I/O on
//! the resolved device goes through the device's own lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::access::SessionKey;
use crate::device::ScullDevice;
use crate::error::Result;
use crate::sparse::Geometry;

pub struct KeyedStores {
    name: String,
    geometry: Geometry,
    stores: Mutex<HashMap<SessionKey, Arc<ScullDevice>>>,
}

impl KeyedStores {
    #[must_use]
    pub fn new(name: &str, geometry: Geometry) -> Self {
        Self {
            name: name.to_string(),
            geometry,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Get the store for `key`, creating an empty one if absent.
    ///
    /// Concurrent first references to one key all get the same store.
    ///
    /// # Errors
    /// `OutOfMemory` if the map cannot grow.
    pub fn lookup_or_create(&self, key: SessionKey) -> Result<Arc<ScullDevice>> {
        let mut stores = self.stores.lock();
        if let Some(device) = stores.get(&key) {
            return Ok(Arc::clone(device));
        }

        stores.try_reserve(1)?;
        let device = Arc::new(ScullDevice::new(
            &format!("{}/{}", self.name, key),
            self.geometry,
        ));
        stores.insert(key, Arc::clone(&device));
        log::debug!("keyed {}: new store for {key}", self.name);
        Ok(device)
    }

    #[must_use]
    pub fn get(&self, key: SessionKey) -> Option<Arc<ScullDevice>> {
        self.stores.lock().get(&key).cloned()
    }

    /// Keys with a store, in ascending order
    #[must_use]
    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.stores.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.lock().is_empty()
    }

    /// Trim and forget every store
    pub fn destroy(&self) {
        let stores: Vec<Arc<ScullDevice>> = self.stores.lock().drain().map(|(_, d)| d).collect();
        for device in stores {
            device.trim();
        }
    }
}
