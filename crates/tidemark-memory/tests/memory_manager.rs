use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tidemark_memory::{
    Cost, ManagerSettings, MemoryError, MemoryHandler, MemoryHandlerGroup, MemoryListener,
    MemoryManager, SimulatedHost, Zone,
};

type CallLog = Arc<Mutex<Vec<String>>>;

struct FakeHandler {
    name: String,
    cost: Cost,
    bytes: Mutex<u64>,
    last_accessed: AtomicU64,
    log: CallLog,
}

impl FakeHandler {
    fn new(name: &str, cost: Cost, bytes: u64, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            cost,
            bytes: Mutex::new(bytes),
            last_accessed: AtomicU64::new(tidemark_memory::now_epoch_secs()),
            log: log.clone(),
        })
    }

    fn bytes(&self) -> u64 {
        *self.bytes.lock().unwrap()
    }

    fn set_last_accessed(&self, epoch_secs: u64) {
        self.last_accessed.store(epoch_secs, Ordering::Relaxed);
    }
}

impl MemoryHandler for FakeHandler {
    fn description(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> Cost {
        self.cost
    }

    fn estimated_size(&self) -> u64 {
        self.bytes()
    }

    fn last_accessed_epoch_secs(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    fn queued_free_memory(&self, percentage: f64) -> u64 {
        self.log.lock().unwrap().push(self.name.clone());
        let mut bytes = self.bytes.lock().unwrap();
        let freed = ((*bytes as f64) * percentage).ceil().min(*bytes as f64) as u64;
        *bytes -= freed;
        freed
    }
}

struct PanickingHandler;

impl MemoryHandler for PanickingHandler {
    fn description(&self) -> &str {
        "panicking"
    }

    fn cost(&self) -> Cost {
        Cost::Lowest
    }

    fn estimated_size(&self) -> u64 {
        1_000
    }

    fn last_accessed_epoch_secs(&self) -> u64 {
        0
    }

    fn queued_free_memory(&self, _percentage: f64) -> u64 {
        panic!("handler failure");
    }
}

struct ChannelListener {
    sender: Mutex<mpsc::Sender<Cost>>,
}

impl MemoryListener for ChannelListener {
    fn on_memory_cleared(&self, cost: Cost) {
        let _ = self.sender.lock().unwrap().send(cost);
    }
}

fn quiet_settings() -> ManagerSettings {
    ManagerSettings {
        padding_margin: 0,
        ..ManagerSettings::default()
    }
}

fn manager_with(max: u64, settings: ManagerSettings) -> (Arc<SimulatedHost>, MemoryManager) {
    let host = Arc::new(SimulatedHost::new(max));
    let manager = MemoryManager::new(host.clone(), settings);
    (host, manager)
}

fn position(log: &CallLog, name: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|entry| entry == name)
}

#[test]
fn panic_clear_walks_tiers_cheapest_first() {
    let log = CallLog::default();
    let (host, manager) = manager_with(10_000, quiet_settings());

    let high = FakeHandler::new("high", Cost::High, 400, &log);
    let low = FakeHandler::new("low", Cost::Low, 100, &log);
    let medium = FakeHandler::new("medium", Cost::Medium, 200, &log);
    for handler in [&high, &low, &medium] {
        assert!(manager.register(handler));
    }

    host.set_free_percent(5.0);
    let freed = manager.check_zone().unwrap();

    // 20% of 10_000 minus 500 free is more than everything held.
    assert_eq!(freed, 700);
    let low_at = position(&log, "low").unwrap();
    let medium_at = position(&log, "medium").unwrap();
    let high_at = position(&log, "high").unwrap();
    assert!(low_at < medium_at && medium_at < high_at);
    assert_eq!(low.bytes() + medium.bytes() + high.bytes(), 0);
}

#[test]
fn panic_clear_stops_once_enough_is_reclaimed() {
    let log = CallLog::default();
    let (host, manager) = manager_with(2_000, quiet_settings());

    let low = FakeHandler::new("low", Cost::Low, 100, &log);
    let medium = FakeHandler::new("medium", Cost::Medium, 200, &log);
    let high = FakeHandler::new("high", Cost::High, 400, &log);
    for handler in [&low, &medium, &high] {
        manager.register(handler);
    }

    // 100 bytes free; reaching 20% free needs 300 more.
    host.set_free_percent(5.0);
    let freed = manager.check_zone().unwrap();

    assert_eq!(freed, 300);
    assert_eq!(low.bytes(), 0);
    assert_eq!(medium.bytes(), 0);
    assert_eq!(high.bytes(), 400);
    assert_eq!(position(&log, "high"), None);

    let report = manager.report().unwrap();
    assert_eq!(report.panic_clears, 1);
    assert_eq!(report.last_cleared.map(|r| r.cost), Some(Cost::Medium));
    assert_eq!(report.high_water.map(|r| r.cost), Some(Cost::Medium));
    assert_eq!(report.total_cleared_bytes, 300);
}

#[test]
fn panic_clear_waits_for_a_collection_before_repeating() {
    let log = CallLog::default();
    let (host, manager) = manager_with(2_000, quiet_settings());
    host.set_collect_on_request(false);

    let low = FakeHandler::new("low", Cost::Low, 100, &log);
    manager.register(&low);

    host.set_free_percent(5.0);
    manager.check_zone().unwrap();
    assert_eq!(log.lock().unwrap().len(), 1);

    manager.check_zone().unwrap();
    assert_eq!(log.lock().unwrap().len(), 1, "no collection since last panic");

    host.record_collection();
    manager.check_zone().unwrap();
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn deferred_panic_cycle_still_tidies_idle_handlers_then_collects() {
    let log = CallLog::default();
    let mut settings = quiet_settings();
    settings.idle_tidy_interval = Duration::ZERO;
    settings.max_idle[Cost::Low.level()] = Some(Duration::from_secs(60));
    let (host, manager) = manager_with(2_000, settings);
    host.set_collect_on_request(false);

    let busy = FakeHandler::new("busy", Cost::Low, 100, &log);
    manager.register(&busy);
    host.set_free_percent(5.0);
    manager.check_zone().unwrap();
    assert_eq!(busy.bytes(), 0);

    let idle = FakeHandler::new("idle", Cost::Low, 100, &log);
    idle.set_last_accessed(tidemark_memory::now_epoch_secs() - 3_600);
    manager.register(&idle);

    host.set_collect_on_request(true);
    assert_eq!(manager.check_zone().unwrap(), 100);
    assert_eq!(idle.bytes(), 0);
    let report = manager.report().unwrap();
    assert_eq!(report.panic_clears, 1);
    assert_eq!(report.idle_clears, 1);

    // The deferred cycle requested a collection, so the next one clears again.
    manager.check_zone().unwrap();
    assert_eq!(manager.report().unwrap().panic_clears, 2);
}

#[test]
fn incremental_clear_drains_cheap_tiers_then_clears_proportionally() {
    let log = CallLog::default();
    let (host, manager) = manager_with(1_000, quiet_settings());

    let lowest = FakeHandler::new("lowest", Cost::Lowest, 50, &log);
    let low = FakeHandler::new("low", Cost::Low, 50, &log);
    let medium = FakeHandler::new("medium", Cost::Medium, 400, &log);
    let high = FakeHandler::new("high", Cost::High, 1_000, &log);
    for handler in [&lowest, &low, &medium, &high] {
        manager.register(handler);
    }

    // 85% used crosses the 80% tenured threshold without entering panic.
    host.set_used(850);
    let freed = manager.check_zone().unwrap();

    // Target usage is 60%, so 250 bytes are needed: 100 from the cheap tiers
    // and 150 (37.5%) from the medium tier.
    assert_eq!(freed, 250);
    assert_eq!(lowest.bytes(), 0);
    assert_eq!(low.bytes(), 0);
    assert_eq!(medium.bytes(), 250);
    assert_eq!(high.bytes(), 1_000);
    assert_eq!(host.usage_threshold(), 800);

    // The same crossing is not acted on twice without a collection.
    let calls = log.lock().unwrap().len();
    assert_eq!(manager.check_zone().unwrap(), 0);
    assert_eq!(log.lock().unwrap().len(), calls);

    host.record_collection();
    manager.check_zone().unwrap();
    assert!(log.lock().unwrap().len() > calls);
    assert_eq!(manager.report().unwrap().incremental_clears, 2);
}

#[test]
fn usage_threshold_follows_reserve_percent() {
    let (host, manager) = manager_with(1_000, quiet_settings());
    manager.check_zone().unwrap();
    assert_eq!(host.usage_threshold(), 800);

    let (host, manager) = manager_with(1_000, quiet_settings());
    host.set_reserve_percent(10);
    manager.check_zone().unwrap();
    assert_eq!(host.usage_threshold(), 700);

    let mut settings = quiet_settings();
    settings.apply_properties([("RESERVE_PERCENT", "5")]);
    let (host, manager) = manager_with(1_000, settings);
    host.set_reserve_percent(10);
    manager.check_zone().unwrap();
    assert_eq!(host.usage_threshold(), 750);
}

#[test]
fn misbehaving_handler_does_not_abort_the_cycle() {
    let log = CallLog::default();
    let (host, manager) = manager_with(10_000, quiet_settings());

    let broken = Arc::new(PanickingHandler);
    let medium = FakeHandler::new("medium", Cost::Medium, 200, &log);
    manager.register(&broken);
    manager.register(&medium);

    host.set_free_percent(1.0);
    assert_eq!(manager.check_zone().unwrap(), 200);
    assert_eq!(medium.bytes(), 0);
}

#[test]
fn listeners_are_notified_in_the_background() {
    let log = CallLog::default();
    let (host, manager) = manager_with(2_000, quiet_settings());
    let (sender, receiver) = mpsc::channel();
    let listener = Arc::new(ChannelListener {
        sender: Mutex::new(sender),
    });
    manager.subscribe(&listener);

    let low = FakeHandler::new("low", Cost::Low, 1_000, &log);
    manager.register(&low);

    host.set_free_percent(5.0);
    manager.check_zone().unwrap();

    let cost = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(cost, Cost::Low);
}

#[test]
fn dropped_handlers_are_not_called() {
    let log = CallLog::default();
    let (host, manager) = manager_with(2_000, quiet_settings());

    let kept = FakeHandler::new("kept", Cost::Low, 100, &log);
    let dropped = FakeHandler::new("dropped", Cost::Lowest, 100, &log);
    manager.register(&kept);
    manager.register(&dropped);
    drop(dropped);

    host.set_free_percent(5.0);
    manager.check_zone().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["kept".to_string()]);
    assert_eq!(manager.handlers(Cost::Lowest).len(), 0);
}

#[test]
fn transient_introspection_failures_are_retried() {
    let log = CallLog::default();
    let (host, manager) = manager_with(2_000, quiet_settings());
    let low = FakeHandler::new("low", Cost::Low, 100, &log);
    manager.register(&low);

    host.set_free_percent(5.0);
    host.fail_next(2);
    assert_eq!(manager.check_zone().unwrap(), 100);
    assert!(manager.last_error().is_ok());
}

#[test]
fn exhausted_retries_are_surfaced_on_next_poll() {
    let (host, manager) = manager_with(2_000, quiet_settings());
    host.fail_next(3);

    assert_eq!(manager.check_zone().unwrap(), 0);
    match manager.last_error() {
        Err(MemoryError::Introspection { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected introspection error, got {other:?}"),
    }
    assert!(manager.last_error().is_ok(), "polling clears the error");

    // A later good reading works normally.
    manager.check_zone().unwrap();
    assert!(manager.report().unwrap().sample.is_some());
}

#[test]
fn idle_handlers_are_cleared_per_tier_window() {
    let log = CallLog::default();
    let settings = ManagerSettings::from_properties([("PADDING_MARGIN", "0"), ("MAX_IDLE_LOW", "60")]);
    let (_host, manager) = manager_with(10_000, settings);

    let idle = FakeHandler::new("idle", Cost::Low, 100, &log);
    let busy = FakeHandler::new("busy", Cost::Low, 100, &log);
    let untimed = FakeHandler::new("untimed", Cost::Medium, 100, &log);
    for handler in [&idle, &busy, &untimed] {
        manager.register(handler);
    }

    let now = tidemark_memory::now_epoch_secs();
    idle.set_last_accessed(now - 3_600);
    untimed.set_last_accessed(now - 3_600);

    let freed = manager.tidy_idle(SystemTime::now()).unwrap();
    assert_eq!(freed, 100);
    assert_eq!(idle.bytes(), 0);
    assert_eq!(busy.bytes(), 100);
    assert_eq!(untimed.bytes(), 100);
    assert_eq!(manager.report().unwrap().idle_clears, 1);
}

#[test]
fn clear_memory_stops_at_requested_cost() {
    let log = CallLog::default();
    let (_host, manager) = manager_with(10_000, quiet_settings());
    let low = FakeHandler::new("low", Cost::Low, 100, &log);
    let medium = FakeHandler::new("medium", Cost::Medium, 100, &log);
    let high = FakeHandler::new("high", Cost::High, 100, &log);
    for handler in [&low, &medium, &high] {
        manager.register(handler);
    }

    assert_eq!(manager.clear_memory(Cost::Medium, 0.5).unwrap(), 100);
    assert_eq!(low.bytes(), 50);
    assert_eq!(medium.bytes(), 50);
    assert_eq!(high.bytes(), 100);
}

#[test]
fn groups_register_as_one_handler() {
    let log = CallLog::default();
    let (host, manager) = manager_with(10_000, quiet_settings());
    let first = FakeHandler::new("first", Cost::Low, 100, &log);
    let second = FakeHandler::new("second", Cost::Low, 300, &log);

    let group = MemoryHandlerGroup::new("lookups", Cost::Medium);
    group.add(&first);
    group.add(&second);
    manager.register(&group);

    assert_eq!(manager.estimated_size(Cost::Medium), 400);
    assert_eq!(group.len(), 2);

    host.set_free_percent(5.0);
    assert_eq!(manager.check_zone().unwrap(), 400);
    assert_eq!(first.bytes() + second.bytes(), 0);

    drop(second);
    assert_eq!(group.len(), 1);
}

#[test]
fn group_member_panic_does_not_stop_siblings() {
    let log = CallLog::default();
    let (_host, manager) = manager_with(10_000, quiet_settings());
    let broken = Arc::new(PanickingHandler);
    let good = FakeHandler::new("good", Cost::Low, 500, &log);

    let group = MemoryHandlerGroup::new("mixed", Cost::Low);
    group.add(&broken);
    group.add(&good);
    manager.register(&group);

    assert_eq!(manager.clear_memory(Cost::Low, 1.0).unwrap(), 500);
    assert_eq!(good.bytes(), 0);
    assert_eq!(group.panic_free_memory(), 0);
    assert_eq!(group.len(), 2);
}

#[test]
fn padding_grows_incrementally_and_is_released_when_full() {
    let settings = ManagerSettings {
        padding_margin: 10,
        padding_max_growth_percent: 10,
        ..ManagerSettings::default()
    };
    let (host, manager) = manager_with(1_000_000, settings);

    manager.check_zone().unwrap();
    assert_eq!(manager.report().unwrap().padding_segments, 10);
    manager.check_zone().unwrap();
    manager.check_zone().unwrap();
    let report = manager.report().unwrap();
    assert_eq!(report.padding_segments, 30);
    assert!(report.padding_bytes <= tidemark_memory::MAX_PADDING_SIZE);

    host.set_free_percent(5.0);
    manager.check_zone().unwrap();
    let report = manager.report().unwrap();
    assert_eq!(report.padding_segments, 0);
    assert_eq!(report.zone, Some(Zone::Panic));
}

#[test]
fn report_serializes() {
    let (_host, manager) = manager_with(10_000, quiet_settings());
    manager.check_zone().unwrap();
    let report = manager.report().unwrap();
    assert_eq!(report.zone, Some(Zone::Safe));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["zone"], "safe");
    assert_eq!(json["tiers"].as_array().unwrap().len(), Cost::COUNT);
}

#[test]
fn shutdown_interrupts_cycles() {
    let (_host, manager) = manager_with(10_000, quiet_settings());
    manager.shutdown();
    assert!(matches!(
        manager.check_zone(),
        Err(MemoryError::Interrupted { .. })
    ));
}

#[test]
fn monitor_drives_cycles_until_stopped() {
    let log = CallLog::default();
    let (host, manager) = manager_with(2_000, quiet_settings());
    let (sender, receiver) = mpsc::channel();
    let listener = Arc::new(ChannelListener {
        sender: Mutex::new(sender),
    });
    manager.subscribe(&listener);
    let low = FakeHandler::new("low", Cost::Low, 500, &log);
    manager.register(&low);
    host.set_free_percent(5.0);

    let monitor = manager.spawn_monitor(Duration::from_millis(10)).unwrap();
    assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), Cost::Low);
    assert!(monitor.is_running());
    monitor.stop(Duration::from_secs(5)).unwrap();
    assert_eq!(low.bytes(), 0);
}

#[test]
fn global_handle_installs_and_shuts_down() {
    let (_host, manager) = manager_with(10_000, quiet_settings());
    assert!(tidemark_memory::install_global(manager.clone()).is_none());
    assert!(tidemark_memory::global().is_some());

    let removed = tidemark_memory::uninstall_global().unwrap();
    assert!(removed.is_shut_down());
    assert!(manager.is_shut_down());
    assert!(tidemark_memory::global().is_none());
}
