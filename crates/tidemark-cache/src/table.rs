use crate::common::Interner;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tidemark_memory::{Cost, MemoryHandler, MemoryManager};

const NIL: usize = usize::MAX;
/// Rough bookkeeping cost of one chained entry.
const ENTRY_OVERHEAD: u64 = 64;
const DEFAULT_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;

pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u64 + Send + Sync>;

/// How keys are hashed. Chosen once when the table is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStrategy {
    /// Keys go through the standard randomised hasher.
    #[default]
    Hashed,
    /// Integer keys are folded directly (high 32 bits xor low 32 bits);
    /// other keys fall back to the standard hasher.
    LongKeyed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub compactions: u64,
    pub rehashes: u64,
    pub len: usize,
    pub size: usize,
    pub buckets: usize,
    pub estimated_bytes: u64,
}

#[derive(Debug)]
enum Stored<V> {
    Value(Arc<V>),
    NotFound(Arc<str>),
}

impl<V> Clone for Stored<V> {
    fn clone(&self) -> Self {
        match self {
            Stored::Value(value) => Stored::Value(value.clone()),
            Stored::NotFound(reason) => Stored::NotFound(reason.clone()),
        }
    }
}

impl<V> Stored<V> {
    fn value(&self) -> Option<&Arc<V>> {
        match self {
            Stored::Value(value) => Some(value),
            Stored::NotFound(_) => None,
        }
    }
}

/// Outcome of writing a key.
enum Written<V> {
    /// `keep_found` was set and a live value already existed.
    Kept(Arc<V>),
    /// The new data is stored; holds whatever it displaced.
    Replaced(Option<Stored<V>>),
}

/// Reachability of an entry's data.
#[derive(Debug)]
enum Slot<V> {
    /// Evictable by the memory manager.
    Held(Stored<V>),
    /// Pinned against eviction.
    Locked(Stored<V>),
    /// Evicted; the chain entry stays until the table is tidied.
    Cleared,
}

impl<V> Slot<V> {
    fn stored(&self) -> Option<&Stored<V>> {
        match self {
            Slot::Held(stored) | Slot::Locked(stored) => Some(stored),
            Slot::Cleared => None,
        }
    }

    fn is_live(&self) -> bool {
        !matches!(self, Slot::Cleared)
    }
}

struct Entry<K, V> {
    key: K,
    hash: u32,
    next: usize,
    slot: Slot<V>,
    weight: u64,
    touched: AtomicU64,
}

/// Chained buckets over an arena of entries.
struct Table<K, V> {
    buckets: Vec<usize>,
    arena: Vec<Option<Entry<K, V>>>,
    vacant: Vec<usize>,
    /// Entries linked into chains, including cleared ones.
    size: usize,
    /// Entries whose data is still reachable.
    live: usize,
    live_bytes: u64,
}

fn bucket_index(hash: u32, buckets: usize) -> usize {
    ((hash & 0x7FFF_FFFF) as usize) % buckets
}

impl<K: CacheKey, V> Table<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buckets: vec![NIL; capacity.max(1)],
            arena: Vec::new(),
            vacant: Vec::new(),
            size: 0,
            live: 0,
            live_bytes: 0,
        }
    }

    fn entry(&self, idx: usize) -> &Entry<K, V> {
        self.arena[idx]
            .as_ref()
            .unwrap_or_else(|| unreachable!("chain points at vacant slot {idx}"))
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry<K, V> {
        self.arena[idx]
            .as_mut()
            .unwrap_or_else(|| unreachable!("chain points at vacant slot {idx}"))
    }

    /// Arena index of `key` and of its predecessor in the chain.
    fn find(&self, key: &K, hash: u32) -> Option<(usize, usize)> {
        let mut prev = NIL;
        let mut idx = self.buckets[bucket_index(hash, self.buckets.len())];
        while idx != NIL {
            let entry = self.entry(idx);
            if entry.hash == hash && entry.key == *key {
                return Some((idx, prev));
            }
            prev = idx;
            idx = entry.next;
        }
        None
    }

    fn push_front(&mut self, entry: Entry<K, V>) {
        let bucket = bucket_index(entry.hash, self.buckets.len());
        let mut entry = entry;
        entry.next = self.buckets[bucket];
        let idx = match self.vacant.pop() {
            Some(idx) => {
                self.arena[idx] = Some(entry);
                idx
            }
            None => {
                self.arena.push(Some(entry));
                self.arena.len() - 1
            }
        };
        self.buckets[bucket] = idx;
        self.size += 1;
    }

    fn unlink(&mut self, idx: usize, prev: usize) -> Entry<K, V> {
        let next = self.entry(idx).next;
        if prev == NIL {
            let bucket = bucket_index(self.entry(idx).hash, self.buckets.len());
            self.buckets[bucket] = next;
        } else {
            self.entry_mut(prev).next = next;
        }
        self.size -= 1;
        self.vacant.push(idx);
        self.arena[idx]
            .take()
            .unwrap_or_else(|| unreachable!("unlinking vacant slot {idx}"))
    }

    fn clear_slot(&mut self, idx: usize) -> u64 {
        let entry = self.entry_mut(idx);
        if !entry.slot.is_live() {
            return 0;
        }
        entry.slot = Slot::Cleared;
        let weight = entry.weight;
        self.live -= 1;
        self.live_bytes = self.live_bytes.saturating_sub(weight);
        weight
    }

    /// Unlink every cleared entry. Returns how many were removed.
    fn compact(&mut self) -> usize {
        let mut removed = 0;
        for bucket in 0..self.buckets.len() {
            let mut prev = NIL;
            let mut idx = self.buckets[bucket];
            while idx != NIL {
                let next = self.entry(idx).next;
                if self.entry(idx).slot.is_live() {
                    prev = idx;
                } else {
                    self.unlink(idx, prev);
                    removed += 1;
                }
                idx = next;
            }
        }
        removed
    }

    /// Stop-the-world resize to `2n + 1` buckets.
    fn rehash(&mut self) {
        let new_len = self.buckets.len() * 2 + 1;
        self.buckets = vec![NIL; new_len];
        for idx in 0..self.arena.len() {
            let Some(entry) = self.arena[idx].as_mut() else {
                continue;
            };
            let bucket = bucket_index(entry.hash, new_len);
            entry.next = self.buckets[bucket];
            self.buckets[bucket] = idx;
        }
    }
}

/// A concurrent hash table whose entries can be evicted by the memory manager.
///
/// Each entry is either *held* (evictable), *locked* (pinned), or *cleared*
/// (evicted but still chained until [`CacheTable::tidy_up`] compacts it).
/// A single read/write lock guards the whole table: lookups share it,
/// mutations and resizes take it exclusively.
///
/// Partial eviction prefers the least recently touched entries; this is
/// best-effort rather than strict LRU.
pub struct CacheTable<K, V> {
    description: String,
    cost: Cost,
    strategy: TableStrategy,
    load_factor: f32,
    hasher: RandomState,
    table: RwLock<Table<K, V>>,
    clock: AtomicU64,
    estimated_empty: AtomicUsize,
    last_accessed: AtomicU64,
    weigher: Option<Weigher<K, V>>,
    interner: Option<Arc<dyn Interner<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    compactions: AtomicU64,
    rehashes: AtomicU64,
}

pub struct CacheTableBuilder<K, V> {
    description: String,
    cost: Cost,
    capacity: usize,
    load_factor: f32,
    strategy: TableStrategy,
    weigher: Option<Weigher<K, V>>,
    interner: Option<Arc<dyn Interner<V>>>,
    manager: Option<MemoryManager>,
}

impl<K, V> CacheTableBuilder<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    pub fn cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Clamped to `0.1..=4.0`.
    pub fn load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor.clamp(0.1, 4.0);
        self
    }

    pub fn strategy(mut self, strategy: TableStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u64 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Deduplicate values through `interner` before they are stored.
    pub fn interner(mut self, interner: Arc<dyn Interner<V>>) -> Self {
        self.interner = Some(interner);
        self
    }

    /// Register the built table with `manager` under its cost.
    pub fn register_with(mut self, manager: &MemoryManager) -> Self {
        self.manager = Some(manager.clone());
        self
    }

    pub fn build(self) -> Arc<CacheTable<K, V>> {
        let table = Arc::new(CacheTable {
            description: self.description,
            cost: self.cost,
            strategy: self.strategy,
            load_factor: self.load_factor,
            hasher: RandomState::new(),
            table: RwLock::new(Table::with_capacity(self.capacity)),
            clock: AtomicU64::new(1),
            estimated_empty: AtomicUsize::new(0),
            last_accessed: AtomicU64::new(0),
            weigher: self.weigher,
            interner: self.interner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            rehashes: AtomicU64::new(0),
        });
        if let Some(manager) = self.manager {
            manager.register(&table);
        }
        table
    }
}

impl<K, V> CacheTable<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    pub fn builder(description: impl Into<String>) -> CacheTableBuilder<K, V> {
        CacheTableBuilder {
            description: description.into(),
            cost: Cost::Medium,
            capacity: DEFAULT_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            strategy: TableStrategy::default(),
            weigher: None,
            interner: None,
            manager: None,
        }
    }

    pub fn new(description: impl Into<String>, cost: Cost) -> Arc<Self> {
        Self::builder(description).cost(cost).build()
    }

    pub fn strategy(&self) -> TableStrategy {
        self.strategy
    }

    fn hash(&self, key: &K) -> u32 {
        if self.strategy == TableStrategy::LongKeyed {
            if let Some(value) = key.long_key() {
                let value = value as u64;
                return (value ^ (value >> 32)) as u32;
            }
        }
        let hash = self.hasher.hash_one(key);
        (hash ^ (hash >> 32)) as u32
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn mark_accessed(&self) {
        self.last_accessed
            .store(tidemark_memory::now_epoch_secs(), Ordering::Relaxed);
    }

    fn weigh(&self, key: &K, stored: &Stored<V>) -> u64 {
        let payload = match stored {
            Stored::Value(value) => match &self.weigher {
                Some(weigher) => weigher(key, value),
                None => (std::mem::size_of::<K>() + std::mem::size_of::<V>()) as u64,
            },
            Stored::NotFound(reason) => reason.len() as u64,
        };
        payload.saturating_add(ENTRY_OVERHEAD)
    }

    fn lookup(&self, key: &K) -> Option<Stored<V>> {
        let hash = self.hash(key);
        let table = self.table.read();
        let Some((idx, _)) = table.find(key, hash) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let entry = table.entry(idx);
        match entry.slot.stored() {
            Some(stored) => {
                entry.touched.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.mark_accessed();
                Some(stored.clone())
            }
            None => {
                self.estimated_empty.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// The cached value, or `None` on a miss, after eviction, or when the
    /// key holds a negative-lookup marker (see [`CacheTable::find`]).
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.lookup(key)
            .and_then(|stored| stored.value().cloned())
    }

    /// Like [`CacheTable::get`], but a memoised negative lookup surfaces as
    /// [`CacheError::NotFound`] instead of `None`.
    pub fn find(&self, key: &K) -> Result<Option<Arc<V>>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Stored::Value(value)) => Ok(Some(value)),
            Some(Stored::NotFound(reason)) => Err(CacheError::NotFound {
                table: self.description.clone(),
                reason: reason.to_string(),
            }),
        }
    }

    /// Store `value` under `key`; `None` removes the key. Returns the
    /// previous value. A locked entry stays locked when replaced.
    pub fn put(&self, key: K, value: Option<Arc<V>>) -> Option<Arc<V>> {
        match value {
            Some(value) => {
                let (previous, _) = self.store_value(key, value, false);
                previous.and_then(|stored| stored.value().cloned())
            }
            None => self.remove(&key),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        self.put(key, Some(Arc::new(value)))
    }

    /// Memoise a negative lookup for `key`.
    pub fn put_not_found(&self, key: K, reason: impl Into<Arc<str>>) {
        self.write(key, Stored::NotFound(reason.into()), false);
    }

    /// Insert-or-return-existing. With `keep_found`, an existing live value
    /// wins and is returned; otherwise `value` replaces it.
    pub fn place(&self, key: K, value: Arc<V>, keep_found: bool) -> Arc<V> {
        self.store_value(key, value, keep_found).1
    }

    pub fn place_if_absent(&self, key: K, value: Arc<V>) -> Arc<V> {
        self.place(key, value, true)
    }

    /// Returns the previous stored data and the value now visible under `key`.
    fn store_value(&self, key: K, value: Arc<V>, keep_found: bool) -> (Option<Stored<V>>, Arc<V>) {
        let value = match &self.interner {
            Some(interner) => interner.intern(value),
            None => value,
        };
        match self.write(key, Stored::Value(value.clone()), keep_found) {
            Written::Kept(existing) => (Some(Stored::Value(existing.clone())), existing),
            Written::Replaced(previous) => (previous, value),
        }
    }

    fn write(&self, key: K, stored: Stored<V>, keep_found: bool) -> Written<V> {
        let hash = self.hash(&key);
        let weight = self.weigh(&key, &stored);
        let touched = self.tick();
        self.mark_accessed();

        let mut table = self.table.write();
        if let Some((idx, _)) = table.find(&key, hash) {
            let entry = table.entry_mut(idx);
            if keep_found {
                if let Some(existing) = entry.slot.stored().and_then(|s| s.value()).cloned() {
                    entry.touched.store(touched, Ordering::Relaxed);
                    return Written::Kept(existing);
                }
            }

            let was_live = entry.slot.is_live();
            let previous_weight = entry.weight;
            let previous = match std::mem::replace(&mut entry.slot, Slot::Cleared) {
                Slot::Held(previous) => {
                    entry.slot = Slot::Held(stored);
                    Some(previous)
                }
                Slot::Locked(previous) => {
                    entry.slot = Slot::Locked(stored);
                    Some(previous)
                }
                Slot::Cleared => {
                    entry.slot = Slot::Held(stored);
                    None
                }
            };
            entry.weight = weight;
            entry.touched.store(touched, Ordering::Relaxed);

            if was_live {
                table.live_bytes = table.live_bytes.saturating_sub(previous_weight);
            } else {
                table.live += 1;
            }
            table.live_bytes = table.live_bytes.saturating_add(weight);
            return Written::Replaced(previous);
        }

        table.push_front(Entry {
            key,
            hash,
            next: NIL,
            slot: Slot::Held(stored),
            weight,
            touched: AtomicU64::new(touched),
        });
        table.live += 1;
        table.live_bytes = table.live_bytes.saturating_add(weight);
        self.maybe_resize(&mut table);
        Written::Replaced(None)
    }

    /// Grow once the chains exceed the load factor, compacting instead when
    /// lookups have seen enough cleared entries to make that worthwhile.
    fn maybe_resize(&self, table: &mut Table<K, V>) {
        if table.size <= self.resize_threshold(table) {
            return;
        }

        let cleared = table.size - table.live;
        let seen_empty = self.estimated_empty.load(Ordering::Relaxed);
        if cleared > 0 && (seen_empty > 0 || cleared * 4 >= table.size) {
            table.compact();
            self.estimated_empty.store(0, Ordering::Relaxed);
            self.compactions.fetch_add(1, Ordering::Relaxed);
            if table.size <= self.resize_threshold(table) {
                return;
            }
        }

        table.rehash();
        self.rehashes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            target: "tidemark.cache",
            table = %self.description,
            buckets = table.buckets.len(),
            size = table.size,
            "rehashed cache table"
        );
    }

    fn resize_threshold(&self, table: &Table<K, V>) -> usize {
        (table.buckets.len() as f32 * self.load_factor) as usize
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.hash(key);
        let mut table = self.table.write();
        let (idx, prev) = table.find(key, hash)?;
        let entry = table.unlink(idx, prev);
        if entry.slot.is_live() {
            table.live -= 1;
            table.live_bytes = table.live_bytes.saturating_sub(entry.weight);
        }
        entry.slot.stored().and_then(|s| s.value()).cloned()
    }

    /// Pin `key` against eviction. `false` if absent, evicted or already locked.
    pub fn lock(&self, key: &K) -> bool {
        self.transition(key, |slot| match slot {
            Slot::Held(stored) => Ok(Slot::Locked(stored)),
            other => Err(other),
        })
    }

    /// Make `key` evictable again. `false` if absent or not locked.
    pub fn unlock(&self, key: &K) -> bool {
        self.transition(key, |slot| match slot {
            Slot::Locked(stored) => Ok(Slot::Held(stored)),
            other => Err(other),
        })
    }

    fn transition(&self, key: &K, change: impl FnOnce(Slot<V>) -> std::result::Result<Slot<V>, Slot<V>>) -> bool {
        let hash = self.hash(key);
        let mut table = self.table.write();
        let Some((idx, _)) = table.find(key, hash) else {
            return false;
        };
        let entry = table.entry_mut(idx);
        match change(std::mem::replace(&mut entry.slot, Slot::Cleared)) {
            Ok(slot) => {
                entry.slot = slot;
                true
            }
            Err(slot) => {
                entry.slot = slot;
                false
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hash(key);
        let table = self.table.read();
        table
            .find(key, hash)
            .is_some_and(|(idx, _)| table.entry(idx).slot.is_live())
    }

    pub fn is_locked(&self, key: &K) -> bool {
        let hash = self.hash(key);
        let table = self.table.read();
        table
            .find(key, hash)
            .is_some_and(|(idx, _)| matches!(table.entry(idx).slot, Slot::Locked(_)))
    }

    /// Entries whose data is still reachable.
    pub fn len(&self) -> usize {
        self.table.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries linked into chains, including evicted ones not yet tidied.
    pub fn size(&self) -> usize {
        self.table.read().size
    }

    pub fn clear(&self) {
        let mut table = self.table.write();
        let buckets = table.buckets.len();
        *table = Table::with_capacity(buckets);
        self.estimated_empty.store(0, Ordering::Relaxed);
    }

    /// Evict roughly `percentage` of the evictable entries, least recently
    /// touched first. Locked entries are never evicted.
    pub fn queued_free_memory(&self, percentage: f64) -> u64 {
        if percentage.is_nan() || percentage <= 0.0 {
            return 0;
        }
        let percentage = percentage.min(1.0);
        let mut table = self.table.write();

        let mut candidates: Vec<(u64, usize)> = table
            .arena
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                let entry = entry.as_ref()?;
                matches!(entry.slot, Slot::Held(_))
                    .then(|| (entry.touched.load(Ordering::Relaxed), idx))
            })
            .collect();
        let count = ((candidates.len() as f64) * percentage).ceil() as usize;
        let count = count.min(candidates.len());
        if count == 0 {
            return 0;
        }
        if count < candidates.len() {
            candidates.select_nth_unstable(count - 1);
        }

        let mut freed = 0u64;
        for &(_, idx) in &candidates[..count] {
            freed = freed.saturating_add(table.clear_slot(idx));
        }
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        self.estimated_empty.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(
            target: "tidemark.cache",
            table = %self.description,
            percentage,
            evicted = count,
            freed,
            "evicted cache entries"
        );
        freed
    }

    /// Unlink evicted entries from their chains.
    pub fn tidy_up(&self) -> u64 {
        let mut table = self.table.write();
        let removed = table.compact();
        self.estimated_empty.store(0, Ordering::Relaxed);
        if removed > 0 {
            self.compactions.fetch_add(1, Ordering::Relaxed);
        }
        removed as u64 * ENTRY_OVERHEAD
    }

    pub fn estimated_size(&self) -> u64 {
        self.table.read().live_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table.read();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            rehashes: self.rehashes.load(Ordering::Relaxed),
            len: table.live,
            size: table.size,
            buckets: table.buckets.len(),
            estimated_bytes: table.live_bytes,
        }
    }
}

impl<K, V> MemoryHandler for CacheTable<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn cost(&self) -> Cost {
        self.cost
    }

    fn estimated_size(&self) -> u64 {
        CacheTable::estimated_size(self)
    }

    fn last_accessed_epoch_secs(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    fn queued_free_memory(&self, percentage: f64) -> u64 {
        CacheTable::queued_free_memory(self, percentage)
    }

    fn panic_free_memory(&self) -> u64 {
        let freed = self.estimated_size();
        self.clear();
        freed
    }

    fn tidy_up(&self) -> u64 {
        CacheTable::tidy_up(self)
    }
}

impl<K, V> std::fmt::Debug for CacheTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTable")
            .field("description", &self.description)
            .field("cost", &self.cost)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_index_masks_sign_bit() {
        assert_eq!(bucket_index(0xFFFF_FFFF, 16), (0x7FFF_FFFF % 16) as usize);
        assert_eq!(bucket_index(5, 16), 5);
    }

    #[test]
    fn long_keyed_hash_folds_high_and_low_words() {
        let table = CacheTable::<i64, ()>::builder("longs")
            .strategy(TableStrategy::LongKeyed)
            .build();
        assert_eq!(table.hash(&7), 7);
        assert_eq!(table.hash(&(1i64 << 32)), 1);
        assert_eq!(table.hash(&-1), 0);
    }

    #[test]
    fn chains_survive_rehash_and_compaction() {
        let table = CacheTable::<u32, u32>::builder("chains")
            .capacity(1)
            .build();
        for key in 0..64 {
            table.insert(key, key * 10);
        }
        assert!(table.stats().rehashes > 0);
        for key in 0..64 {
            assert_eq!(table.get(&key).as_deref(), Some(&(key * 10)));
        }

        table.queued_free_memory(1.0);
        assert_eq!(table.len(), 0);
        assert_eq!(table.size(), 64);
        table.tidy_up();
        assert_eq!(table.size(), 0);

        // Vacant arena slots are reused.
        table.insert(1, 1);
        assert_eq!(table.table.read().arena.len(), 64);
    }
}
