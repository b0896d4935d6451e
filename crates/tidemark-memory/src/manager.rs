use crate::cost::Cost;
use crate::error::{HostError, MemoryError, Result};
use crate::handler::{MemoryHandler, MemoryListener};
use crate::host::{HostMemory, PoolUsage};
use crate::padding::Padding;
use crate::registry::HandlerRegistry;
use crate::report::{ClearRecord, MemorySample, TierUsage, ZoneReport};
use crate::settings::ManagerSettings;
use crate::threshold::{self, Thresholds};
use crate::zone::ZoneBounds;
use parking_lot::{Mutex, MutexGuard};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const MAX_INTROSPECTION_ATTEMPTS: u32 = 3;
const LOCK_POLL: Duration = Duration::from_millis(50);
const GC_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// A handler reporting more than this has almost certainly underflowed.
const IMPLAUSIBLE_FREED_BYTES: u64 = u64::MAX / 2;

/// State mutated only while holding the clearing lock.
struct ZoneState {
    padding: Padding,
    thresholds: Thresholds,
    last_sample: Option<MemorySample>,
    last_cleared: Option<ClearRecord>,
    high_water: Option<ClearRecord>,
    total_cleared_bytes: u64,
    panic_clears: u64,
    incremental_clears: u64,
    idle_clears: u64,
    collections_at_last_panic: Option<u64>,
    last_incremental: Option<(u64, Instant)>,
    last_idle_tidy: Option<Instant>,
}

struct Inner {
    host: Arc<dyn HostMemory>,
    settings: ManagerSettings,
    registry: HandlerRegistry,
    listeners: Mutex<Vec<Weak<dyn MemoryListener>>>,
    zone: Mutex<ZoneState>,
    gc_lock: Mutex<()>,
    last_error: Mutex<Option<MemoryError>>,
    shutdown: AtomicBool,
}

/// Process-wide coordinator of cost-tiered eviction.
///
/// Handlers register under a [`Cost`]; a periodic driver (see
/// [`MemoryManager::spawn_monitor`]) calls [`MemoryManager::check_zone`],
/// which samples the host and clears tiers cheapest-first when free memory
/// runs short.
///
/// Locks:
/// - the clearing lock serialises whole check/clear cycles;
/// - the registry lock is independent, so registration never waits on a cycle;
/// - the collection lock keeps two threads from triggering a collection at once.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

/// Which path a check cycle took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClearKind {
    Panic,
    Incremental,
}

impl MemoryManager {
    pub fn new(host: Arc<dyn HostMemory>, settings: ManagerSettings) -> Self {
        let padding = Padding::new(0, settings.padding_max_growth_percent);
        Self {
            inner: Arc::new(Inner {
                host,
                settings,
                registry: HandlerRegistry::new(),
                listeners: Mutex::new(Vec::new()),
                zone: Mutex::new(ZoneState {
                    padding,
                    thresholds: Thresholds::default(),
                    last_sample: None,
                    last_cleared: None,
                    high_water: None,
                    total_cleared_bytes: 0,
                    panic_clears: 0,
                    incremental_clears: 0,
                    idle_clears: 0,
                    collections_at_last_panic: None,
                    last_incremental: None,
                    last_idle_tidy: None,
                }),
                gc_lock: Mutex::new(()),
                last_error: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub fn host(&self) -> &Arc<dyn HostMemory> {
        &self.inner.host
    }

    /// Register `handler` under its cost. The manager only keeps a weak
    /// reference; returns `false` if it was already registered.
    pub fn register<H: MemoryHandler + 'static>(&self, handler: &Arc<H>) -> bool {
        let registered = self.inner.registry.register(handler.clone());
        if registered {
            tracing::debug!(
                target: "tidemark.memory",
                handler = handler.description(),
                cost = %handler.cost(),
                "registered memory handler"
            );
        }
        registered
    }

    pub fn deregister<H: MemoryHandler + 'static>(&self, handler: &Arc<H>) -> bool {
        let handler: Arc<dyn MemoryHandler> = handler.clone();
        self.inner.registry.deregister(&handler)
    }

    /// Live handlers registered under `cost`, as a snapshot.
    pub fn handlers(&self, cost: Cost) -> Vec<Arc<dyn MemoryHandler>> {
        self.inner.registry.snapshot(cost)
    }

    /// Subscribe to clear notifications; the listener is held weakly.
    pub fn subscribe<L: MemoryListener + 'static>(&self, listener: &Arc<L>) {
        let listener: Arc<dyn MemoryListener> = listener.clone();
        let weak = Arc::downgrade(&listener);
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|existing| existing.strong_count() > 0);
        if !listeners.iter().any(|existing| existing.ptr_eq(&weak)) {
            listeners.push(weak);
        }
    }

    /// Make every subsequent lock wait fail with [`MemoryError::Interrupted`].
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// The sticky failure recorded by the last cycle, if any. Polling clears it.
    pub fn last_error(&self) -> Result<()> {
        match self.inner.last_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run one check cycle and return the estimated bytes freed.
    pub fn check_zone(&self) -> Result<u64> {
        let mut state = self.lock_zone()?;
        let settings = &self.inner.settings;
        let mut freed = 0u64;

        let Some(sample) = self.sample(&mut state) else {
            return Ok(0);
        };

        if percent(sample.free(), sample.max) < settings.panic_free_percent as f64 {
            let released = state.padding.release_all();
            if released > 0 {
                tracing::info!(
                    target: "tidemark.memory",
                    released,
                    "memory full; released padding reserve"
                );
            }
        }

        self.ensure_padding(&mut state, sample.max);
        let thresholds = self.recompute_thresholds(&mut state, &sample);

        let free_adjusted = sample.free().saturating_add(state.padding.bytes());
        let free_percent = percent(free_adjusted, sample.max);
        let collections = self.inner.host.collection_count();

        let mut collect_after = false;
        if free_percent < settings.panic_free_percent as f64 {
            if state.collections_at_last_panic == Some(collections) {
                tracing::debug!(
                    target: "tidemark.memory",
                    free_percent,
                    "panic clear deferred until a collection completes"
                );
                collect_after = true;
            } else {
                state.padding.release_all();
                let required = threshold::panic_required_bytes(
                    sample.max,
                    free_adjusted,
                    settings.min_free_percent,
                );
                let (reached, cleared) = self.panic_clear(required);
                freed = freed.saturating_add(cleared);
                state.panic_clears += 1;
                state.collections_at_last_panic = Some(self.inner.host.collection_count());
                self.record_clear(&mut state, ClearKind::Panic, reached, cleared);
            }
        } else if self.inner.host.is_threshold_exceeded() && is_new_crossing(&state, collections, settings) {
            let released = state.padding.release_all();
            let pool_used = sample.pool.used.saturating_sub(released);
            let required = pool_used.saturating_sub(thresholds.incremental_target);
            let (reached, cleared) = self.incremental_clear(required);
            freed = freed.saturating_add(cleared);
            state.incremental_clears += 1;
            state.last_incremental = Some((collections, Instant::now()));
            self.record_clear(&mut state, ClearKind::Incremental, reached, cleared);
        }

        let idle_due = state
            .last_idle_tidy
            .map_or(true, |at| at.elapsed() >= settings.idle_tidy_interval);
        if idle_due {
            state.last_idle_tidy = Some(Instant::now());
            freed = freed.saturating_add(self.idle_tidy(&mut state, SystemTime::now()));
        }

        let desired = self.desired_padding(&state, &sample);
        state.padding.adjust(desired);
        drop(state);

        if collect_after {
            if let Err(err) = self.collect() {
                tracing::debug!(
                    target: "tidemark.memory",
                    error = %err,
                    "collection after deferred panic clear failed"
                );
            }
        }
        Ok(freed)
    }

    /// Clear every tier up to and including `cost` by `percentage`.
    pub fn clear_memory(&self, cost: Cost, percentage: f64) -> Result<u64> {
        let percentage = percentage.clamp(0.0, 1.0);
        let mut state = self.lock_zone()?;
        state.padding.release_all();

        let mut cleared = 0u64;
        for tier in Cost::ALL.into_iter().take_while(|tier| *tier <= cost) {
            for handler in self.inner.registry.snapshot(tier) {
                cleared = cleared.saturating_add(if tier == Cost::Panic && percentage >= 1.0 {
                    guarded(&*handler, "panic_free_memory", |h| h.panic_free_memory())
                } else {
                    guarded(&*handler, "queued_free_memory", |h| {
                        h.queued_free_memory(percentage)
                    })
                });
            }
        }

        state.total_cleared_bytes = state.total_cleared_bytes.saturating_add(cleared);
        update_levels(&mut state, cost);
        drop(state);
        self.notify_listeners(cost);
        Ok(cleared)
    }

    /// Free handlers idle past their tier's `MAX_IDLE_<COST>` window as of
    /// `now`, and compact every handler.
    pub fn tidy_idle(&self, now: SystemTime) -> Result<u64> {
        let mut state = self.lock_zone()?;
        state.last_idle_tidy = Some(Instant::now());
        Ok(self.idle_tidy(&mut state, now))
    }

    /// Compact every handler and ask the host to collect.
    ///
    /// Only one collection runs at a time; a caller that cannot get the
    /// collection lock within a bounded wait gets [`MemoryError::Timeout`].
    pub fn collect(&self) -> Result<u64> {
        let Some(_guard) = self.inner.gc_lock.try_lock_for(GC_LOCK_TIMEOUT) else {
            return Err(MemoryError::Timeout {
                what: "collection lock",
                waited: GC_LOCK_TIMEOUT,
            });
        };

        let tidied = self
            .inner
            .registry
            .snapshot_all()
            .iter()
            .fold(0u64, |total, handler| {
                total.saturating_add(guarded(&**handler, "tidy_up", |h| h.tidy_up()))
            });
        self.inner.registry.prune();
        self.inner.host.collect();
        Ok(tidied)
    }

    pub fn report(&self) -> Result<ZoneReport> {
        let state = self.lock_zone()?;
        let settings = &self.inner.settings;
        let bounds = ZoneBounds {
            upper: settings.safe_zone_upper as f64,
            lower: settings.safe_zone_lower as f64,
            panic: settings.panic_free_percent as f64,
        };
        let zone = state.last_sample.map(|sample| {
            let free = sample.free().saturating_add(state.padding.bytes());
            bounds.zone_for_free_percent(percent(free, sample.max))
        });

        let tiers = Cost::ALL
            .into_iter()
            .map(|cost| {
                let handlers = self.inner.registry.snapshot(cost);
                TierUsage {
                    cost,
                    handlers: handlers.len(),
                    estimated_bytes: tier_estimated_size(&handlers),
                }
            })
            .collect();

        Ok(ZoneReport {
            sample: state.last_sample,
            zone,
            thresholds: state.thresholds,
            padding_bytes: state.padding.bytes(),
            padding_segments: state.padding.pinned(),
            last_cleared: state.last_cleared,
            high_water: state.high_water,
            total_cleared_bytes: state.total_cleared_bytes,
            panic_clears: state.panic_clears,
            incremental_clears: state.incremental_clears,
            idle_clears: state.idle_clears,
            tiers,
        })
    }

    /// Estimated bytes held by every live handler under `cost`.
    pub fn estimated_size(&self, cost: Cost) -> u64 {
        tier_estimated_size(&self.inner.registry.snapshot(cost))
    }

    fn lock_zone(&self) -> Result<MutexGuard<'_, ZoneState>> {
        let timeout = self.inner.settings.lock_timeout;
        let started = Instant::now();
        loop {
            if self.is_shut_down() {
                return Err(MemoryError::Interrupted {
                    what: "clearing lock",
                });
            }
            if let Some(guard) = self.inner.zone.try_lock_for(LOCK_POLL) {
                return Ok(guard);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(MemoryError::Timeout {
                    what: "clearing lock",
                    waited,
                });
            }
        }
    }

    /// Sample the host, retrying transient failures. `None` only when no
    /// usable reading has ever been taken.
    fn sample(&self, state: &mut ZoneState) -> Option<MemorySample> {
        let mut last_failure = HostError::new("no reading taken");
        let mut inconsistent = None;

        for attempt in 1..=MAX_INTROSPECTION_ATTEMPTS {
            match self.read_sample() {
                Ok(sample) if sample.is_consistent() => {
                    state.last_sample = Some(sample);
                    return Some(sample);
                }
                Ok(sample) => {
                    last_failure = HostError::new(format!(
                        "inconsistent reading: used {} of max {}, pool {} of {}",
                        sample.used, sample.max, sample.pool.used, sample.pool.max
                    ));
                    inconsistent = Some(sample);
                }
                Err(err) => last_failure = err,
            }

            tracing::debug!(
                target: "tidemark.memory",
                attempt,
                error = %last_failure,
                "host memory reading failed; releasing padding and retrying"
            );
            state.padding.release_all();
            std::thread::yield_now();
            std::thread::sleep(Duration::from_millis(u64::from(attempt)));
        }

        let err = MemoryError::Introspection {
            attempts: MAX_INTROSPECTION_ATTEMPTS,
            source: last_failure,
        };
        tracing::error!(target: "tidemark.memory", error = %err, "using best available memory reading");
        *self.inner.last_error.lock() = Some(err);

        state
            .last_sample
            .or_else(|| inconsistent.map(MemorySample::clamped))
            .filter(|sample| sample.max > 0 && sample.pool.max > 0)
    }

    fn read_sample(&self) -> std::result::Result<MemorySample, HostError> {
        let host = &self.inner.host;
        let max = match self.inner.settings.max_memory {
            Some(max) => max,
            None => host.max_memory()?,
        };
        let total = host.total_memory()?;
        let used = host.used_memory()?;
        let pool = host.generational_pool_usage()?.unwrap_or(PoolUsage {
            used,
            committed: total,
            max,
        });
        Ok(MemorySample {
            max,
            total,
            used,
            pool,
        })
    }

    fn ensure_padding(&self, state: &mut ZoneState, max_memory: u64) {
        let settings = &self.inner.settings;
        if state.padding.segment_size() > 0 || settings.padding_margin == 0 {
            return;
        }
        let segment_size = Padding::segment_size_for(max_memory, settings.padding_margin);
        state.padding = Padding::new(segment_size, settings.padding_max_growth_percent);
    }

    fn recompute_thresholds(&self, state: &mut ZoneState, sample: &MemorySample) -> Thresholds {
        let settings = &self.inner.settings;
        let pool_max = settings.tenured_size.unwrap_or(sample.pool.max);
        let reserve = settings
            .reserve_percent
            .unwrap_or_else(|| self.inner.host.collector_reserve_percent());
        let thresholds = Thresholds::compute(
            pool_max,
            settings.tenured_percent,
            reserve,
            settings.safe_zone_lower,
            settings.safe_zone_upper,
        );
        if thresholds.tenured_threshold != state.thresholds.tenured_threshold {
            tracing::debug!(
                target: "tidemark.memory",
                pool_max,
                reserve,
                tenured_threshold = thresholds.tenured_threshold,
                safety_threshold = thresholds.safety_threshold,
                "updated usage threshold"
            );
            self.inner.host.set_usage_threshold(thresholds.tenured_threshold);
        }
        state.thresholds = thresholds;
        thresholds
    }

    /// Full clear of every tier, cheapest first, until `required` bytes are
    /// back. Returns the highest tier touched and the bytes freed.
    fn panic_clear(&self, required: u64) -> (Cost, u64) {
        let mut cleared = 0u64;
        let mut reached = Cost::Lowest;
        for cost in Cost::ALL {
            reached = cost;
            for handler in self.inner.registry.snapshot(cost) {
                let freed = if cost == Cost::Panic {
                    guarded(&*handler, "panic_free_memory", |h| h.panic_free_memory())
                } else {
                    guarded(&*handler, "queued_free_memory", |h| h.queued_free_memory(1.0))
                };
                cleared = cleared.saturating_add(freed);
            }
            if cleared >= required {
                break;
            }
        }
        tracing::warn!(
            target: "tidemark.memory",
            required,
            cleared,
            reached = %reached,
            "panic clear"
        );
        (reached, cleared)
    }

    /// Drain the two cheapest tiers, then clear the rest proportionally to
    /// what is still needed.
    fn incremental_clear(&self, required: u64) -> (Cost, u64) {
        let mut cleared = 0u64;
        let mut reached = Cost::Low;
        for cost in [Cost::Lowest, Cost::Low] {
            for handler in self.inner.registry.snapshot(cost) {
                cleared = cleared.saturating_add(guarded(&*handler, "queued_free_memory", |h| {
                    h.queued_free_memory(1.0)
                }));
            }
        }

        for cost in Cost::MediumLow.and_above() {
            if cleared >= required {
                break;
            }
            let handlers = self.inner.registry.snapshot(cost);
            let tier_size = tier_estimated_size(&handlers);
            if tier_size == 0 {
                continue;
            }
            reached = cost;
            let fraction = threshold::tier_clear_fraction(required - cleared, tier_size);
            for handler in handlers {
                cleared = cleared.saturating_add(guarded(&*handler, "queued_free_memory", |h| {
                    h.queued_free_memory(fraction)
                }));
            }
        }

        tracing::info!(
            target: "tidemark.memory",
            required,
            cleared,
            reached = %reached,
            "incremental clear"
        );
        (reached, cleared)
    }

    fn idle_tidy(&self, state: &mut ZoneState, now: SystemTime) -> u64 {
        let settings = &self.inner.settings;
        let now_secs = epoch_secs(now);
        let mut freed = 0u64;
        let mut idle_freed_any = false;

        for cost in Cost::ALL {
            let handlers = self.inner.registry.snapshot(cost);
            if let Some(max_idle) = settings.max_idle_for(cost) {
                let cutoff = now_secs.saturating_sub(max_idle.as_secs());
                for handler in handlers.iter().filter(|h| h.last_accessed_epoch_secs() < cutoff) {
                    tracing::debug!(
                        target: "tidemark.memory",
                        handler = handler.description(),
                        cost = %cost,
                        "clearing idle handler"
                    );
                    freed = freed.saturating_add(guarded(&**handler, "queued_free_memory", |h| {
                        h.queued_free_memory(1.0)
                    }));
                    idle_freed_any = true;
                }
            }
            for handler in &handlers {
                freed = freed.saturating_add(guarded(&**handler, "tidy_up", |h| h.tidy_up()));
            }
        }

        if idle_freed_any {
            state.idle_clears += 1;
        }
        state.total_cleared_bytes = state.total_cleared_bytes.saturating_add(freed);
        self.inner.registry.prune();
        freed
    }

    fn desired_padding(&self, state: &ZoneState, sample: &MemorySample) -> u64 {
        let settings = &self.inner.settings;
        if settings.padding_margin == 0 {
            return 0;
        }
        let margin = ((sample.max as u128) * (settings.padding_margin as u128) / 100) as u64;
        let floor = ((sample.max as u128) * (settings.min_free_percent as u128) / 100) as u64;
        // Padding is already part of the host's usage figure.
        let real_free = sample.free().saturating_add(state.padding.bytes());
        margin
            .min(state.padding.capacity_bytes())
            .min(real_free.saturating_sub(floor) / 2)
    }

    fn record_clear(&self, state: &mut ZoneState, kind: ClearKind, reached: Cost, cleared: u64) {
        state.total_cleared_bytes = state.total_cleared_bytes.saturating_add(cleared);
        update_levels(state, reached);
        tracing::info!(
            target: "tidemark.memory",
            kind = ?kind,
            reached = %reached,
            cleared,
            "memory cleared"
        );
        self.notify_listeners(reached);
    }

    fn notify_listeners(&self, cost: Cost) {
        let listeners: Vec<Arc<dyn MemoryListener>> = {
            let mut listeners = self.inner.listeners.lock();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        if listeners.is_empty() {
            return;
        }

        let spawned = std::thread::Builder::new()
            .name("tidemark-memory-notify".to_string())
            .spawn(move || {
                for listener in listeners {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        listener.on_memory_cleared(cost)
                    }));
                    if result.is_err() {
                        tracing::error!(
                            target: "tidemark.memory",
                            cost = %cost,
                            "memory listener panicked"
                        );
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(
                target: "tidemark.memory",
                error = %err,
                "failed to spawn listener notification thread"
            );
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("settings", &self.inner.settings)
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}

fn is_new_crossing(state: &ZoneState, collections: u64, settings: &ManagerSettings) -> bool {
    match state.last_incremental {
        None => true,
        Some((collections_then, at)) => {
            collections != collections_then || at.elapsed() >= settings.min_incremental_clear_time
        }
    }
}

fn update_levels(state: &mut ZoneState, reached: Cost) {
    let record = ClearRecord {
        cost: reached,
        at_epoch_secs: epoch_secs(SystemTime::now()),
    };
    state.last_cleared = Some(record);
    if state.high_water.map_or(true, |high| reached >= high.cost) {
        state.high_water = Some(record);
    }
}

fn tier_estimated_size(handlers: &[Arc<dyn MemoryHandler>]) -> u64 {
    handlers.iter().fold(0u64, |total, handler| {
        let size = std::panic::catch_unwind(AssertUnwindSafe(|| handler.estimated_size())).unwrap_or(0);
        total.saturating_add(size)
    })
}

/// Run one handler operation, isolating panics and implausible results so a
/// single misbehaving handler cannot abort a cycle.
pub(crate) fn guarded(
    handler: &dyn MemoryHandler,
    operation: &'static str,
    call: impl FnOnce(&dyn MemoryHandler) -> u64,
) -> u64 {
    match std::panic::catch_unwind(AssertUnwindSafe(|| call(handler))) {
        Ok(freed) if freed > IMPLAUSIBLE_FREED_BYTES => {
            tracing::error!(
                target: "tidemark.memory",
                handler = handler.description(),
                operation,
                freed,
                "handler reported an implausible byte count; treating as zero"
            );
            debug_assert!(
                freed <= IMPLAUSIBLE_FREED_BYTES,
                "{} reported {freed} bytes from {operation}",
                handler.description()
            );
            0
        }
        Ok(freed) => freed,
        Err(_) => {
            tracing::error!(
                target: "tidemark.memory",
                handler = handler.description(),
                operation,
                "memory handler panicked; continuing with remaining handlers"
            );
            0
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 100.0;
    }
    part as f64 * 100.0 / whole as f64
}

pub(crate) fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
