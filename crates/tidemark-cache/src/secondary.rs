use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tidemark_memory::{Cost, MemoryHandler, MemoryManager};

type AnyValue = Arc<dyn Any + Send + Sync>;

/// Overhead charged per cached child on top of the value's own size.
const CHILD_OVERHEAD: u64 = 48;

/// Implemented by owners whose derived caches are shared by a named group.
///
/// Every owner reporting the same key shares one set of children, and
/// [`SecondaryCache::clear_group`] drops them all at once.
pub trait CacheGroup {
    fn cache_group_key(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OwnerKey {
    /// Address of a live `Arc` allocation.
    Identity(usize),
    Group(String),
}

struct Children {
    /// Identity-keyed slots remember their owner so a reused address is
    /// never mistaken for the original object.
    owner: Option<Weak<dyn Any + Send + Sync>>,
    values: HashMap<TypeId, (AnyValue, u64)>,
}

impl Children {
    fn new(owner: Option<Weak<dyn Any + Send + Sync>>) -> Self {
        Self {
            owner,
            values: HashMap::new(),
        }
    }

    fn is_stale(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| owner.strong_count() == 0)
    }

    fn bytes(&self) -> u64 {
        self.values.values().map(|(_, weight)| *weight).sum()
    }
}

/// A cache of derived caches keyed by the identity of an owning object or
/// by a declared [`CacheGroup`] key.
///
/// Owners are never kept alive by this cache. The memory manager can only
/// clear it all-or-nothing; it registers at [`Cost::MediumLow`].
pub struct SecondaryCache {
    description: String,
    slots: Mutex<HashMap<OwnerKey, Children>>,
    last_accessed: AtomicU64,
}

fn identity_key<O>(owner: &Arc<O>) -> OwnerKey {
    OwnerKey::Identity(Arc::as_ptr(owner) as *const () as usize)
}

fn downcast<T: Any + Send + Sync>(value: &AnyValue) -> Option<Arc<T>> {
    value.clone().downcast::<T>().ok()
}

impl SecondaryCache {
    pub fn new(description: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            slots: Mutex::new(HashMap::new()),
            last_accessed: AtomicU64::new(0),
        })
    }

    pub fn registered(description: impl Into<String>, manager: &MemoryManager) -> Arc<Self> {
        let cache = Self::new(description);
        manager.register(&cache);
        cache
    }

    fn touch(&self) {
        self.last_accessed
            .store(tidemark_memory::now_epoch_secs(), Ordering::Relaxed);
    }

    fn lookup<T: Any + Send + Sync>(&self, key: &OwnerKey) -> Option<Arc<T>> {
        self.touch();
        let slots = self.slots.lock();
        let children = slots.get(key).filter(|children| !children.is_stale())?;
        let (value, _) = children.values.get(&TypeId::of::<T>())?;
        downcast(value)
    }

    /// Store `created` unless a concurrent caller got there first, in which
    /// case the existing value wins.
    fn place<T: Any + Send + Sync>(
        &self,
        key: OwnerKey,
        owner: Option<Weak<dyn Any + Send + Sync>>,
        created: Arc<T>,
    ) -> Arc<T> {
        let mut slots = self.slots.lock();
        let children = slots
            .entry(key)
            .or_insert_with(|| Children::new(owner.clone()));
        if children.is_stale() {
            *children = Children::new(owner);
        }
        let (value, _) = children.values.entry(TypeId::of::<T>()).or_insert_with(|| {
            let weight = std::mem::size_of::<T>() as u64 + CHILD_OVERHEAD;
            (created.clone() as AnyValue, weight)
        });
        downcast(value).unwrap_or(created)
    }

    pub fn get<O, T>(&self, owner: &Arc<O>) -> Option<Arc<T>>
    where
        O: Any + Send + Sync,
        T: Any + Send + Sync,
    {
        self.lookup(&identity_key(owner))
    }

    /// The `T` derived from `owner`, building it with `create` on a miss.
    ///
    /// `create` runs without the cache lock held, so it may itself consult
    /// this cache.
    pub fn get_or_insert_with<O, T, F>(&self, owner: &Arc<O>, create: F) -> Arc<T>
    where
        O: Any + Send + Sync,
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let key = identity_key(owner);
        if let Some(found) = self.lookup(&key) {
            return found;
        }
        let created = Arc::new(create());
        let weak = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        self.place(key, Some(weak), created)
    }

    pub fn get_for_group<G, T>(&self, group: &G) -> Option<Arc<T>>
    where
        G: CacheGroup + ?Sized,
        T: Any + Send + Sync,
    {
        self.lookup(&OwnerKey::Group(group.cache_group_key()))
    }

    pub fn get_or_insert_for_group<G, T, F>(&self, group: &G, create: F) -> Arc<T>
    where
        G: CacheGroup + ?Sized,
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let key = OwnerKey::Group(group.cache_group_key());
        if let Some(found) = self.lookup(&key) {
            return found;
        }
        self.place(key, None, Arc::new(create()))
    }

    /// Drop every child of the named group. Returns whether anything was cached.
    pub fn clear_group(&self, group_key: &str) -> bool {
        let removed = self
            .slots
            .lock()
            .remove(&OwnerKey::Group(group_key.to_string()))
            .is_some();
        if removed {
            tracing::debug!(
                target: "tidemark.cache",
                cache = %self.description,
                group = group_key,
                "cleared secondary cache group"
            );
        }
        removed
    }

    pub fn clear_owner<O: Any + Send + Sync>(&self, owner: &Arc<O>) -> bool {
        self.slots.lock().remove(&identity_key(owner)).is_some()
    }

    /// Drop everything. Returns the estimated bytes released.
    pub fn clear(&self) -> u64 {
        let drained = std::mem::take(&mut *self.slots.lock());
        drained.values().map(Children::bytes).sum()
    }

    /// Owners and groups with cached children, excluding dead owners.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|children| !children.is_stale())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget the children of owners that have been dropped.
    pub fn prune(&self) -> u64 {
        let mut freed = 0;
        self.slots.lock().retain(|_, children| {
            if children.is_stale() {
                freed += children.bytes();
                false
            } else {
                true
            }
        });
        freed
    }
}

impl MemoryHandler for SecondaryCache {
    fn description(&self) -> &str {
        &self.description
    }

    fn cost(&self) -> Cost {
        Cost::MediumLow
    }

    fn estimated_size(&self) -> u64 {
        self.slots.lock().values().map(Children::bytes).sum()
    }

    fn last_accessed_epoch_secs(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// Partial eviction is not supported; any request clears everything.
    fn queued_free_memory(&self, percentage: f64) -> u64 {
        if percentage.is_nan() || percentage <= 0.0 {
            return 0;
        }
        self.clear()
    }

    fn tidy_up(&self) -> u64 {
        self.prune()
    }
}

impl std::fmt::Debug for SecondaryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryCache")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
