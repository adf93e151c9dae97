//! Lock-free counters for resolver activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing what the resolver has done since the mount started.
///
/// All counters use `Relaxed` ordering; they are monotonic tallies with no
/// synchronization role.
#[derive(Debug, Default)]
pub struct PassthroughStats {
    special_created: AtomicU64,
    special_removed: AtomicU64,
    regular_forwarded: AtomicU64,
    metadata_ops: AtomicU64,
    transfers: AtomicU64,
    errors: AtomicU64,
    inconsistencies: AtomicU64,
}

/// Point-in-time copy of [`PassthroughStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub special_created: u64,
    pub special_removed: u64,
    pub regular_forwarded: u64,
    pub metadata_ops: u64,
    pub transfers: u64,
    pub errors: u64,
    pub inconsistencies: u64,
}

impl StatsSnapshot {
    /// Special entries currently alive according to the counters.
    pub fn live_special(&self) -> u64 {
        self.special_created.saturating_sub(self.special_removed)
    }
}

impl PassthroughStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_special_created(&self) {
        self.special_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_special_removed(&self) {
        self.special_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request handed to the content engine.
    #[inline]
    pub fn record_regular_forwarded(&self) {
        self.regular_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_metadata_op(&self) {
        self.metadata_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inconsistency(&self) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            special_created: self.special_created.load(Ordering::Relaxed),
            special_removed: self.special_removed.load(Ordering::Relaxed),
            regular_forwarded: self.regular_forwarded.load(Ordering::Relaxed),
            metadata_ops: self.metadata_ops.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
        }
    }
}
