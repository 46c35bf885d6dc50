//! Usage Tracking - Chained Byte Accounting
//!
//! A [`UsageTracker`] counts the bytes reserved by one pool. Trackers derived
//! through [`UsageTracker::add_child`] forward every update to their parent, so
//! a tracker always reports the aggregate of its own pool and all pools below
//! it that carry derived trackers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Point-in-time view of a tracker
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Bytes currently reserved
    pub current_bytes: u64,
    /// Highest value `current_bytes` has reached
    pub peak_bytes: u64,
    /// Number of reservations recorded
    pub num_allocs: u64,
    /// Number of releases recorded
    pub num_frees: u64,
    /// Total bytes ever reserved
    pub cumulative_bytes: u64,
}

/// Hierarchical usage tracker
#[derive(Debug, Default)]
pub struct UsageTracker {
    parent: Option<Arc<UsageTracker>>,
    current_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    num_allocs: AtomicU64,
    num_frees: AtomicU64,
    cumulative_bytes: AtomicU64,
}

impl UsageTracker {
    /// Create root tracker
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Derive a tracker chained to this one
    #[must_use]
    pub fn add_child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            ..Self::default()
        })
    }

    /// Parent tracker, if any
    #[must_use]
    pub const fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    /// Apply a signed byte delta here and on every ancestor
    pub fn update(&self, delta: i64) {
        let mut tracker = Some(self);
        while let Some(current) = tracker {
            current.apply(delta);
            tracker = current.parent.as_deref();
        }
    }

    /// Bytes currently reserved
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Peak reserved bytes
    #[must_use]
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Snapshot all counters
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            current_bytes: self.current_bytes(),
            peak_bytes: self.peak_bytes(),
            num_allocs: self.num_allocs.load(Ordering::Relaxed),
            num_frees: self.num_frees.load(Ordering::Relaxed),
            cumulative_bytes: self.cumulative_bytes.load(Ordering::Relaxed),
        }
    }

    fn apply(&self, delta: i64) {
        let magnitude = delta.unsigned_abs();
        if delta >= 0 {
            self.num_allocs.fetch_add(1, Ordering::Relaxed);
            self.cumulative_bytes.fetch_add(magnitude, Ordering::Relaxed);
            let new_total = self.current_bytes.fetch_add(magnitude, Ordering::Relaxed) + magnitude;

            // Update peak
            let mut peak = self.peak_bytes.load(Ordering::Relaxed);
            while new_total > peak {
                match self.peak_bytes.compare_exchange_weak(
                    peak,
                    new_total,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(x) => peak = x,
                }
            }
        } else {
            self.num_frees.fetch_add(1, Ordering::Relaxed);
            // Saturate at zero
            let _ = self
                .current_bytes
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.saturating_sub(magnitude))
                });
        }
    }
}
