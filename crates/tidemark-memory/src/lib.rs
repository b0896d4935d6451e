//! Cost-tiered memory management for in-process caches.
//!
//! Caches implement [`MemoryHandler`] and register with a [`MemoryManager`]
//! under a [`Cost`]. The manager samples the host through [`HostMemory`] and,
//! when free memory runs short, asks handlers to give memory back, cheapest
//! tier first.
//!
//! - Handlers and listeners are held weakly; dropping a cache deregisters it.
//! - All sizes are estimates supplied by the handlers themselves.
//! - A filler reserve ("padding") makes threshold crossings fire earlier and is
//!   released right before eviction to give cleanup some headroom.

mod cgroup;
mod cost;
mod error;
mod global;
mod handler;
mod host;
mod manager;
mod monitor;
mod padding;
mod process;
mod registry;
mod report;
mod settings;
mod threshold;
mod zone;

pub use cost::Cost;
pub use error::{HostError, MemoryError, Result};
pub use global::{global, install_global, uninstall_global};
pub use handler::{MemoryHandler, MemoryHandlerGroup, MemoryListener};
pub use host::{HostMemory, PoolUsage, SimulatedHost};
pub use manager::MemoryManager;
pub use monitor::MemoryMonitor;
pub use padding::{MAX_PADDING_SIZE, MAX_SEGMENTS, MAX_SEGMENT_SIZE};
pub use process::{current_rss_bytes, ProcessHost};
pub use report::{ClearRecord, MemorySample, TierUsage, ZoneReport};
pub use settings::{parse_byte_size, ManagerSettings, ENV_PREFIX, GB, KB, MB, TB};
pub use threshold::{calculated_tenured_threshold, safety_threshold, Thresholds};
pub use zone::{Zone, ZoneBounds};

/// Seconds since the Unix epoch, as used by
/// [`MemoryHandler::last_accessed_epoch_secs`].
pub fn now_epoch_secs() -> u64 {
    manager::epoch_secs(std::time::SystemTime::now())
}
