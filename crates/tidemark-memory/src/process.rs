//! [`HostMemory`] for an ordinary (non garbage-collected) process.
//!
//! The whole process is treated as the long-lived pool: usage is resident set
//! size and the ceiling is the tightest of the configured maximum, the cgroup
//! limit and physical memory.

use crate::cgroup;
use crate::error::HostError;
use crate::host::{HostMemory, PoolUsage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub struct ProcessHost {
    max_override: Option<u64>,
    threshold: AtomicU64,
    collections: AtomicU64,
    system: Mutex<sysinfo::System>,
}

impl ProcessHost {
    pub fn new() -> Self {
        Self::with_max_memory(None)
    }

    /// `max_memory` wins over anything detected (typically `MAX_MEMORY`).
    pub fn with_max_memory(max_memory: Option<u64>) -> Self {
        Self {
            max_override: max_memory,
            threshold: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    fn physical_memory(&self) -> Option<u64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        match system.total_memory() {
            0 => None,
            total => Some(total),
        }
    }

    fn process_memory_fallback(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_process(pid);
        system.process(pid).map(|process| process.memory())
    }
}

impl Default for ProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHost")
            .field("max_override", &self.max_override)
            .field("threshold", &self.threshold.load(Ordering::Relaxed))
            .field("collections", &self.collections.load(Ordering::Relaxed))
            .finish()
    }
}

impl HostMemory for ProcessHost {
    fn max_memory(&self) -> Result<u64, HostError> {
        if let Some(max) = self.max_override {
            return Ok(max);
        }
        let detected = [cgroup::memory_limit_bytes(), self.physical_memory()]
            .into_iter()
            .flatten()
            .min();
        detected.ok_or_else(|| HostError::new("unable to determine memory ceiling"))
    }

    fn total_memory(&self) -> Result<u64, HostError> {
        let used = self.used_memory()?;
        Ok(cgroup::memory_current_bytes().map_or(used, |current| current.max(used)))
    }

    fn used_memory(&self) -> Result<u64, HostError> {
        current_rss_bytes()
            .or_else(|| self.process_memory_fallback())
            .ok_or_else(|| HostError::new("unable to sample resident set size"))
    }

    fn generational_pool_usage(&self) -> Result<Option<PoolUsage>, HostError> {
        Ok(None)
    }

    fn set_usage_threshold(&self, bytes: u64) {
        self.threshold.store(bytes, Ordering::Relaxed);
    }

    fn is_threshold_exceeded(&self) -> bool {
        let threshold = self.threshold.load(Ordering::Relaxed);
        threshold > 0
            && self
                .used_memory()
                .map(|used| used >= threshold)
                .unwrap_or(false)
    }

    fn collection_count(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    fn collect(&self) {
        trim_heap();
        self.collections.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() {
    // SAFETY: `malloc_trim` only hands free heap pages back to the OS.
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() {}

/// Resident set size from `/proc/self/status`, Linux only.
pub fn current_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "tidemark.memory",
                        error = %err,
                        "failed to read /proc/self/status while sampling rss"
                    );
                }
                return None;
            }
        };
        parse_vm_rss(&status)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("VmRSS:"))?;
    let kb = line.split_whitespace().next()?;
    match kb.parse::<u64>() {
        Ok(kb) => Some(kb.saturating_mul(1024)),
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target: "tidemark.memory",
                    value = kb,
                    error = %err,
                    "unparsable VmRSS in /proc/self/status"
                );
            }
            None
        }
    }
}
