use crate::cost::Cost;
use crate::manager::guarded;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A component that holds reclaimable memory and gives it back on request.
///
/// Handlers are registered with [`crate::MemoryManager`] under their
/// [`Cost`] and are held weakly: dropping the last `Arc` to a handler removes
/// it from eviction without an explicit deregistration.
///
/// All byte counts are estimates. Implementations must not block for long in
/// any of these calls since they run while the manager holds its clearing lock.
pub trait MemoryHandler: Send + Sync {
    fn description(&self) -> &str;

    fn cost(&self) -> Cost;

    fn estimated_size(&self) -> u64;

    /// Seconds since the Unix epoch at which the handler was last read or
    /// written. `0` means never.
    fn last_accessed_epoch_secs(&self) -> u64;

    /// Release roughly `percentage` (in `0.0..=1.0`) of the held data,
    /// returning the bytes freed.
    fn queued_free_memory(&self, percentage: f64) -> u64;

    /// Release everything unconditionally. Called for [`Cost::Panic`] tier
    /// handlers when the manager has exhausted every cheaper tier.
    fn panic_free_memory(&self) -> u64 {
        self.queued_free_memory(1.0)
    }

    /// Physically compact storage whose data has already been released.
    fn tidy_up(&self) -> u64 {
        0
    }
}

/// Notified after the manager has cleared memory up to a cost level.
///
/// Listeners are held weakly and invoked from a background thread, never
/// while the manager holds its clearing lock.
pub trait MemoryListener: Send + Sync {
    fn on_memory_cleared(&self, cost: Cost);
}

/// Several handlers registered as one unit under a shared description and cost.
///
/// Members are held weakly, like registrations with the manager itself, so a
/// group never keeps a dropped cache alive.
pub struct MemoryHandlerGroup {
    description: String,
    cost: Cost,
    members: Mutex<Vec<Weak<dyn MemoryHandler>>>,
}

impl MemoryHandlerGroup {
    pub fn new(description: impl Into<String>, cost: Cost) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            cost,
            members: Mutex::new(Vec::new()),
        })
    }

    pub fn add<H: MemoryHandler + 'static>(&self, handler: &Arc<H>) {
        let handler: Arc<dyn MemoryHandler> = handler.clone();
        let weak = Arc::downgrade(&handler);
        let mut members = self.members.lock();
        if !members.iter().any(|member| member.ptr_eq(&weak)) {
            members.push(weak);
        }
    }

    pub fn remove<H: MemoryHandler + 'static>(&self, handler: &Arc<H>) -> bool {
        let handler: Arc<dyn MemoryHandler> = handler.clone();
        let weak = Arc::downgrade(&handler);
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|member| !member.ptr_eq(&weak) && member.strong_count() > 0);
        members.len() < before
    }

    /// Live members; dead entries are pruned as a side effect.
    pub fn members(&self) -> Vec<Arc<dyn MemoryHandler>> {
        let mut members = self.members.lock();
        members.retain(|member| member.strong_count() > 0);
        members.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Each member is isolated so one panicking member does not stop the rest.
    fn sum(&self, per_member: impl Fn(&dyn MemoryHandler) -> u64) -> u64 {
        self.members()
            .iter()
            .fold(0u64, |total, member| total.saturating_add(per_member(&**member)))
    }
}

impl MemoryHandler for MemoryHandlerGroup {
    fn description(&self) -> &str {
        &self.description
    }

    fn cost(&self) -> Cost {
        self.cost
    }

    fn estimated_size(&self) -> u64 {
        self.sum(|member| guarded(member, "estimated_size", |h| h.estimated_size()))
    }

    fn last_accessed_epoch_secs(&self) -> u64 {
        self.members()
            .iter()
            .map(|member| {
                guarded(&**member, "last_accessed_epoch_secs", |h| {
                    h.last_accessed_epoch_secs()
                })
            })
            .max()
            .unwrap_or(0)
    }

    fn queued_free_memory(&self, percentage: f64) -> u64 {
        self.sum(|member| {
            guarded(member, "queued_free_memory", |h| h.queued_free_memory(percentage))
        })
    }

    fn panic_free_memory(&self) -> u64 {
        self.sum(|member| guarded(member, "panic_free_memory", |h| h.panic_free_memory()))
    }

    fn tidy_up(&self) -> u64 {
        self.sum(|member| guarded(member, "tidy_up", |h| h.tidy_up()))
    }
}

impl std::fmt::Debug for MemoryHandlerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandlerGroup")
            .field("description", &self.description)
            .field("cost", &self.cost)
            .field("members", &self.members.lock().len())
            .finish()
    }
}
