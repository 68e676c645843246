use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identifies an open file or a wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    id: i64,
}

impl Handle {
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// Value carried by a wake-up: a byte count, or -1 when a queue is retired
pub type WakeArg = i64;

/// Thread-safe handle generator, shared by everything one registry creates
#[derive(Debug)]
pub struct IdGen {
    next_id: AtomicI64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    /// Get the next unique handle
    pub fn next_handle(&self) -> Handle {
        Handle::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let idgen = IdGen::new();
        let a = idgen.next_handle();
        let b = idgen.next_handle();
        assert_ne!(a, b);
        assert_eq!(b.id(), a.id() + 1);
    }
}
