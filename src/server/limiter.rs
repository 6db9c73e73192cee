//! Global cap on concurrently served connections

use crate::metrics::Metrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counting limiter shared by every accept path of a server
#[derive(Clone)]
pub struct ConnectionLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    max: usize,
    active: AtomicUsize,
    metrics: Arc<Metrics>,
}

/// Slot held for the lifetime of one connection
pub struct ConnectionPermit {
    inner: Arc<Inner>,
}

impl ConnectionLimiter {
    pub fn new(max: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                max,
                active: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    /// Take a slot, or count a rejection when all are in use
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        let inner = &self.inner;
        let acquired = inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < inner.max).then_some(active + 1)
            })
            .is_ok();

        if !acquired {
            inner.metrics.rejected_connections.inc();
            return None;
        }

        inner.metrics.total_connections.inc();
        inner.metrics.active_connections.inc();
        Some(ConnectionPermit {
            inner: Arc::clone(inner),
        })
    }

    /// Connections currently holding a permit
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
        self.inner.metrics.active_connections.dec();
    }
}

impl std::fmt::Debug for ConnectionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLimiter")
            .field("max", &self.inner.max)
            .field("active", &self.active())
            .finish()
    }
}

impl std::fmt::Debug for ConnectionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionPermit")
    }
}
