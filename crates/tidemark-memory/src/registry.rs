use crate::cost::Cost;
use crate::handler::MemoryHandler;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Weakly-held handlers, one set per cost tier.
///
/// Guarded by its own lock so registration never waits on a clearing cycle.
/// Readers take a snapshot and iterate it without holding the lock.
pub(crate) struct HandlerRegistry {
    tiers: RwLock<[Vec<Weak<dyn MemoryHandler>>; Cost::COUNT]>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            tiers: RwLock::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// Returns `false` if the handler was already registered.
    pub(crate) fn register(&self, handler: Arc<dyn MemoryHandler>) -> bool {
        let cost = handler.cost();
        let weak = Arc::downgrade(&handler);
        let mut tiers = self.tiers.write();
        let tier = &mut tiers[cost.level()];
        tier.retain(|entry| entry.strong_count() > 0);
        if tier.iter().any(|entry| entry.ptr_eq(&weak)) {
            return false;
        }
        tier.push(weak);
        true
    }

    pub(crate) fn deregister(&self, handler: &Arc<dyn MemoryHandler>) -> bool {
        let weak = Arc::downgrade(handler);
        let mut tiers = self.tiers.write();
        let mut removed = false;
        // The handler's cost may have changed since registration; scan all tiers.
        for tier in tiers.iter_mut() {
            let before = tier.len();
            tier.retain(|entry| !entry.ptr_eq(&weak));
            removed |= tier.len() < before;
        }
        removed
    }

    /// Live handlers registered under `cost`.
    pub(crate) fn snapshot(&self, cost: Cost) -> Vec<Arc<dyn MemoryHandler>> {
        let weak: Vec<Weak<dyn MemoryHandler>> = self.tiers.read()[cost.level()].clone();
        weak.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn snapshot_all(&self) -> Vec<Arc<dyn MemoryHandler>> {
        let weak: Vec<Weak<dyn MemoryHandler>> =
            self.tiers.read().iter().flatten().cloned().collect();
        weak.iter().filter_map(Weak::upgrade).collect()
    }

    /// Drop registrations whose handler has been dropped.
    pub(crate) fn prune(&self) -> usize {
        let mut tiers = self.tiers.write();
        let mut pruned = 0;
        for tier in tiers.iter_mut() {
            let before = tier.len();
            tier.retain(|entry| entry.strong_count() > 0);
            pruned += before - tier.len();
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Cost);

    impl MemoryHandler for Fixed {
        fn description(&self) -> &str {
            "fixed"
        }
        fn cost(&self) -> Cost {
            self.0
        }
        fn estimated_size(&self) -> u64 {
            10
        }
        fn last_accessed_epoch_secs(&self) -> u64 {
            0
        }
        fn queued_free_memory(&self, _percentage: f64) -> u64 {
            0
        }
    }

    #[test]
    fn dropped_handlers_deregister_themselves() {
        let registry = HandlerRegistry::new();
        let kept: Arc<dyn MemoryHandler> = Arc::new(Fixed(Cost::Low));
        let dropped: Arc<dyn MemoryHandler> = Arc::new(Fixed(Cost::Low));
        assert!(registry.register(kept.clone()));
        assert!(registry.register(dropped.clone()));
        assert!(!registry.register(kept.clone()));
        assert_eq!(registry.snapshot(Cost::Low).len(), 2);

        drop(dropped);
        assert_eq!(registry.snapshot(Cost::Low).len(), 1);
        assert_eq!(registry.prune(), 1);
        assert!(registry.deregister(&kept));
        assert!(registry.snapshot_all().is_empty());
    }
}
