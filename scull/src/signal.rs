//! Per-caller interruption
//!
//! A [`Signal`] stands in for "a signal is pending on the calling task".
//! Blocking waits race it and give up with `Interrupted` once it is raised.
//! The flag stays raised until [`Signal::clear`], so a caller that retries
//! without clearing is interrupted again at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::access::Credentials;

#[derive(Debug, Default)]
struct SignalInner {
    pending: AtomicBool,
    notify: Notify,
}

/// Cloneable interruption flag; all clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a signal pending and wake every wait racing this flag
    pub fn raise(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.inner.pending.store(false, Ordering::SeqCst);
    }

    /// Resolves once the signal is raised
    pub async fn raised(&self) {
        loop {
            // Created before the check: notify_waiters reaches it even unpolled
            let notified = self.inner.notify.notified();
            if self.is_pending() {
                return;
            }
            notified.await;
        }
    }
}

/// The calling task: who it is and how to interrupt it
#[derive(Debug, Clone)]
pub struct Caller {
    pub credentials: Credentials,
    pub signal: Signal,
}

impl Caller {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            signal: Signal::new(),
        }
    }
}
