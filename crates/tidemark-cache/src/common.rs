use parking_lot::Mutex;
use std::collections::hash_map::{Entry, RandomState};
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tidemark_memory::{Cost, MemoryHandler, MemoryManager};

/// Maps equal values onto one shared allocation.
pub trait Interner<V>: Send + Sync {
    fn intern(&self, value: Arc<V>) -> Arc<V>;
}

/// Weak interning pool for immutable values shared by many cache entries.
///
/// The pool never keeps a value alive by itself. Dead slots are pruned on
/// lookup collisions and whenever the memory manager tidies the pool, which
/// it registers for at [`Cost::Lowest`] so it is the first thing drained.
pub struct CommonData<V> {
    description: String,
    hasher: RandomState,
    buckets: Mutex<HashMap<u64, Vec<Weak<V>>>>,
    last_accessed: AtomicU64,
}

impl<V> CommonData<V>
where
    V: Hash + Eq + Send + Sync + 'static,
{
    pub fn new(description: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            hasher: RandomState::new(),
            buckets: Mutex::new(HashMap::new()),
            last_accessed: AtomicU64::new(0),
        })
    }

    /// Create the pool and register it with `manager`.
    pub fn registered(description: impl Into<String>, manager: &MemoryManager) -> Arc<Self> {
        let pool = Self::new(description);
        manager.register(&pool);
        pool
    }

    /// The shared instance equal to `value`, adopting `value` if none is live.
    pub fn intern(&self, value: Arc<V>) -> Arc<V> {
        self.last_accessed
            .store(tidemark_memory::now_epoch_secs(), Ordering::Relaxed);
        let hash = self.hasher.hash_one(&*value);
        let mut buckets = self.buckets.lock();
        match buckets.entry(hash) {
            Entry::Vacant(slot) => {
                slot.insert(vec![Arc::downgrade(&value)]);
                value
            }
            Entry::Occupied(mut slot) => {
                let candidates = slot.get_mut();
                candidates.retain(|weak| weak.strong_count() > 0);
                if let Some(existing) = candidates
                    .iter()
                    .filter_map(Weak::upgrade)
                    .find(|existing| **existing == *value)
                {
                    return existing;
                }
                candidates.push(Arc::downgrade(&value));
                value
            }
        }
    }

    pub fn intern_value(&self, value: V) -> Arc<V> {
        self.intern(Arc::new(value))
    }

    /// Live pooled values.
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .values()
            .flatten()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop dead slots. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut buckets = self.buckets.lock();
        let mut removed = 0;
        buckets.retain(|_, candidates| {
            let before = candidates.len();
            candidates.retain(|weak| weak.strong_count() > 0);
            removed += before - candidates.len();
            !candidates.is_empty()
        });
        removed
    }
}

impl<V> Interner<V> for CommonData<V>
where
    V: Hash + Eq + Send + Sync + 'static,
{
    fn intern(&self, value: Arc<V>) -> Arc<V> {
        CommonData::intern(self, value)
    }
}

impl<V> MemoryHandler for CommonData<V>
where
    V: Hash + Eq + Send + Sync + 'static,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn cost(&self) -> Cost {
        Cost::Lowest
    }

    fn estimated_size(&self) -> u64 {
        let slots: usize = self.buckets.lock().values().map(Vec::len).sum();
        (slots * std::mem::size_of::<Weak<V>>()) as u64
    }

    fn last_accessed_epoch_secs(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    fn queued_free_memory(&self, _percentage: f64) -> u64 {
        (self.prune() * std::mem::size_of::<Weak<V>>()) as u64
    }

    fn tidy_up(&self) -> u64 {
        (self.prune() * std::mem::size_of::<Weak<V>>()) as u64
    }
}

impl<V> std::fmt::Debug for CommonData<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonData")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
