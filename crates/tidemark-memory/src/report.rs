use crate::cost::Cost;
use crate::host::PoolUsage;
use crate::threshold::Thresholds;
use crate::zone::Zone;
use serde::{Deserialize, Serialize};

/// One host reading, validated by the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub max: u64,
    pub total: u64,
    pub used: u64,
    pub pool: PoolUsage,
}

impl MemorySample {
    pub fn free(&self) -> u64 {
        self.max.saturating_sub(self.used)
    }

    pub(crate) fn is_consistent(&self) -> bool {
        self.max > 0 && self.used <= self.max && self.pool.max > 0 && self.pool.used <= self.pool.max
    }

    /// Best available reading from an inconsistent one.
    pub(crate) fn clamped(mut self) -> Self {
        self.used = self.used.min(self.max);
        self.pool.used = self.pool.used.min(self.pool.max);
        self
    }
}

/// A cost level reached by a clear, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearRecord {
    pub cost: Cost,
    pub at_epoch_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUsage {
    pub cost: Cost,
    pub handlers: usize,
    pub estimated_bytes: u64,
}

/// Snapshot of the manager's state intended for telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneReport {
    pub sample: Option<MemorySample>,
    pub zone: Option<Zone>,
    pub thresholds: Thresholds,
    pub padding_bytes: u64,
    pub padding_segments: usize,
    pub last_cleared: Option<ClearRecord>,
    pub high_water: Option<ClearRecord>,
    pub total_cleared_bytes: u64,
    pub panic_clears: u64,
    pub incremental_clears: u64,
    pub idle_clears: u64,
    pub tiers: Vec<TierUsage>,
}

impl ZoneReport {
    pub fn estimated_total_bytes(&self) -> u64 {
        self.tiers
            .iter()
            .fold(0u64, |total, tier| total.saturating_add(tier.estimated_bytes))
    }
}
