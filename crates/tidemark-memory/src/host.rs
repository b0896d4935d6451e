use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Occupancy of the long-lived ("tenured") region of the host's memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub used: u64,
    pub committed: u64,
    pub max: u64,
}

/// Memory introspection the manager consumes.
///
/// Implementations may be momentarily inconsistent (for example `used`
/// exceeding `max` while a pool is being resized). The manager validates each
/// reading and retries, so implementations should report what they see rather
/// than try to correct it.
pub trait HostMemory: Send + Sync {
    /// Hard upper bound the process may grow to.
    fn max_memory(&self) -> Result<u64, HostError>;

    /// Memory currently committed to the process.
    fn total_memory(&self) -> Result<u64, HostError>;

    fn used_memory(&self) -> Result<u64, HostError>;

    /// `None` when the host has no separate long-lived pool; the manager then
    /// treats the whole process as the pool.
    fn generational_pool_usage(&self) -> Result<Option<PoolUsage>, HostError>;

    fn set_usage_threshold(&self, bytes: u64);

    fn is_threshold_exceeded(&self) -> bool;

    /// Number of completed collections; only ever increases.
    fn collection_count(&self) -> u64;

    /// Percentage of the pool the host's collector keeps in reserve.
    fn collector_reserve_percent(&self) -> u8 {
        0
    }

    /// Ask the host to reclaim whatever it can. Best-effort.
    fn collect(&self) {}
}

/// A host whose readings are set explicitly.
///
/// Useful for tests and for embedders that account memory themselves and
/// want the manager to act on their numbers.
#[derive(Debug, Default)]
pub struct SimulatedHost {
    max: AtomicU64,
    total: AtomicU64,
    used: AtomicU64,
    pool_used: AtomicU64,
    pool_max: AtomicU64,
    threshold: AtomicU64,
    collections: AtomicU64,
    reserve_percent: AtomicU8,
    failures_remaining: AtomicU32,
    collect_on_request: AtomicBool,
}

impl SimulatedHost {
    /// A host with `max` bytes available and nothing used.
    pub fn new(max: u64) -> Self {
        let host = Self::default();
        host.max.store(max, Ordering::Relaxed);
        host.total.store(max, Ordering::Relaxed);
        host.pool_max.store(max, Ordering::Relaxed);
        host.collect_on_request.store(true, Ordering::Relaxed);
        host
    }

    /// Set process usage; the tenured pool follows it.
    pub fn set_used(&self, used: u64) {
        self.used.store(used, Ordering::Relaxed);
        self.pool_used.store(used, Ordering::Relaxed);
    }

    /// Set usage so that `percent` of max memory is free.
    pub fn set_free_percent(&self, percent: f64) {
        let max = self.max.load(Ordering::Relaxed);
        let free = (max as f64 * percent / 100.0) as u64;
        self.set_used(max.saturating_sub(free));
    }

    pub fn set_pool(&self, used: u64, max: u64) {
        self.pool_used.store(used, Ordering::Relaxed);
        self.pool_max.store(max, Ordering::Relaxed);
    }

    pub fn set_reserve_percent(&self, percent: u8) {
        self.reserve_percent.store(percent, Ordering::Relaxed);
    }

    /// Fail the next `count` introspection reads.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::Relaxed);
    }

    /// Record a completed collection, as a host collector would.
    pub fn record_collection(&self) {
        self.collections.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether [`HostMemory::collect`] counts as a completed collection.
    pub fn set_collect_on_request(&self, enabled: bool) {
        self.collect_on_request.store(enabled, Ordering::Relaxed);
    }

    pub fn usage_threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    fn check_failure(&self) -> Result<(), HostError> {
        let remaining = self.failures_remaining.load(Ordering::Relaxed);
        if remaining == 0 {
            return Ok(());
        }
        self.failures_remaining
            .store(remaining - 1, Ordering::Relaxed);
        Err(HostError::new("simulated transient failure"))
    }
}

impl HostMemory for SimulatedHost {
    fn max_memory(&self) -> Result<u64, HostError> {
        Ok(self.max.load(Ordering::Relaxed))
    }

    fn total_memory(&self) -> Result<u64, HostError> {
        Ok(self.total.load(Ordering::Relaxed))
    }

    fn used_memory(&self) -> Result<u64, HostError> {
        self.check_failure()?;
        Ok(self.used.load(Ordering::Relaxed))
    }

    fn generational_pool_usage(&self) -> Result<Option<PoolUsage>, HostError> {
        let max = self.pool_max.load(Ordering::Relaxed);
        Ok(Some(PoolUsage {
            used: self.pool_used.load(Ordering::Relaxed),
            committed: max,
            max,
        }))
    }

    fn set_usage_threshold(&self, bytes: u64) {
        self.threshold.store(bytes, Ordering::Relaxed);
    }

    fn is_threshold_exceeded(&self) -> bool {
        let threshold = self.threshold.load(Ordering::Relaxed);
        threshold > 0 && self.pool_used.load(Ordering::Relaxed) >= threshold
    }

    fn collection_count(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    fn collector_reserve_percent(&self) -> u8 {
        self.reserve_percent.load(Ordering::Relaxed)
    }

    fn collect(&self) {
        if self.collect_on_request.load(Ordering::Relaxed) {
            self.record_collection();
        }
    }
}
