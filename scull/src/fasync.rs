//! Asynchronous "data available" listeners
//!
//! Listeners are keyed by the open-file handle that registered them. The
//! pipe invokes them after a successful write, once its own lock is
//! released, so a listener may call straight back into the pipe.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::idgen::Handle;

/// Delivered to a listener once per successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEvent {
    /// Handle the listener was registered under
    pub listener: Handle,
    /// Bytes the triggering write added
    pub written: usize,
}

pub type AsyncCallback = Arc<dyn Fn(AsyncEvent) + Send + Sync>;

#[derive(Default)]
pub struct AsyncListeners {
    listeners: Mutex<HashMap<Handle, AsyncCallback>>,
}

impl AsyncListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the listener for `handle`
    pub fn register(&self, handle: Handle, callback: AsyncCallback) {
        if self.listeners.lock().insert(handle, callback).is_some() {
            log::debug!("fasync: replaced listener for {handle}");
        }
    }

    /// Returns whether a listener was removed
    pub fn unregister(&self, handle: Handle) -> bool {
        self.listeners.lock().remove(&handle).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Call every listener; the table lock is not held during the calls
    pub fn notify(&self, written: usize) {
        let snapshot: Vec<(Handle, AsyncCallback)> = self
            .listeners
            .lock()
            .iter()
            .map(|(handle, callback)| (*handle, Arc::clone(callback)))
            .collect();

        for (listener, callback) in snapshot {
            callback(AsyncEvent { listener, written });
        }
    }
}

impl fmt::Debug for AsyncListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncListeners(count={})", self.len())
    }
}
