use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Global counter for tracking live connections (negotiating or relaying)
pub static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Source of per-connection ids used in log fields
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// RAII guard to ensure the active count is properly decremented
#[derive(Debug)]
pub struct ConnectionGuard {
    id: u64,
    decremented: bool,
}

impl ConnectionGuard {
    /// Register a new connection and increment the global counter
    pub fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::AcqRel);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            decremented: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn decrement(&mut self) {
        if !self.decremented {
            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::AcqRel);
            self.decremented = true;
        }
    }

    /// Get the current active connection count
    pub fn active_count() -> usize {
        ACTIVE_CONNECTIONS.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}
