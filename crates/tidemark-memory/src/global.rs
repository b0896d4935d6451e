//! A confined process-wide handle with explicit install and shutdown.

use crate::manager::MemoryManager;
use parking_lot::RwLock;

static GLOBAL: RwLock<Option<MemoryManager>> = parking_lot::const_rwlock(None);

/// Install `manager` as the process-wide instance, returning any previous one.
pub fn install_global(manager: MemoryManager) -> Option<MemoryManager> {
    GLOBAL.write().replace(manager)
}

pub fn global() -> Option<MemoryManager> {
    GLOBAL.read().clone()
}

/// Remove and shut down the process-wide instance.
pub fn uninstall_global() -> Option<MemoryManager> {
    let previous = GLOBAL.write().take();
    if let Some(manager) = &previous {
        manager.shutdown();
    }
    previous
}
