use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for broker traffic and losses (atomics; shared across workers).
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    /// Items handed to a consumer.
    items_dispatched: AtomicU64,
    /// Items delivered back to their originating port.
    items_returned: AtomicU64,
    /// Returns dropped because the destination port was gone.
    orphaned_drops: AtomicU64,
    /// Returns dropped because the fingerprint was no longer routable
    /// (already delivered, swept, or never known).
    duplicate_drops: AtomicU64,
    /// Routing entries purged by the stale sweeper.
    stale_purged: AtomicU64,
    /// Items explicitly abandoned by a consumer that gave up returning them.
    abandoned: AtomicU64,
}

impl BrokerMetrics {
    pub fn items_dispatched(&self) -> u64 {
        self.items_dispatched.load(Ordering::Relaxed)
    }

    pub fn items_returned(&self) -> u64 {
        self.items_returned.load(Ordering::Relaxed)
    }

    pub fn orphaned_drops(&self) -> u64 {
        self.orphaned_drops.load(Ordering::Relaxed)
    }

    pub fn duplicate_drops(&self) -> u64 {
        self.duplicate_drops.load(Ordering::Relaxed)
    }

    pub fn stale_purged(&self) -> u64 {
        self.stale_purged.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dispatched(&self) {
        self.items_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_returned(&self) {
        self.items_returned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_orphaned(&self) {
        self.orphaned_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicate_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_purged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }
}
