use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tidemark_cache::{CacheGroup, SecondaryCache};
use tidemark_memory::{Cost, ManagerSettings, MemoryHandler, MemoryManager, SimulatedHost};

struct Module {
    project: &'static str,
}

impl CacheGroup for Module {
    fn cache_group_key(&self) -> String {
        format!("project:{}", self.project)
    }
}

#[derive(Debug, PartialEq)]
struct Outline(Vec<&'static str>);

#[test]
fn children_are_keyed_by_owner_identity_and_type() {
    let cache = SecondaryCache::new("derived");
    let a = Arc::new(String::from("same text"));
    let b = Arc::new(String::from("same text"));
    let builds = AtomicUsize::new(0);

    let first: Arc<Outline> = cache.get_or_insert_with(&a, || {
        builds.fetch_add(1, Ordering::SeqCst);
        Outline(vec!["a"])
    });
    let again: Arc<Outline> = cache.get_or_insert_with(&a, || {
        builds.fetch_add(1, Ordering::SeqCst);
        Outline(vec!["again"])
    });
    let other: Arc<Outline> = cache.get_or_insert_with(&b, || Outline(vec!["b"]));
    let count: Arc<usize> = cache.get_or_insert_with(&a, || 3);

    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(*other, Outline(vec!["b"]));
    assert_eq!(*count, 3);
    assert_eq!(cache.get::<_, Outline>(&a).as_deref(), Some(&Outline(vec!["a"])));
    assert_eq!(cache.get::<_, u8>(&a), None);
    assert_eq!(cache.len(), 2);
}

#[test]
fn dropped_owners_are_forgotten() {
    let cache = SecondaryCache::new("derived");
    let owner = Arc::new(5u64);
    let _: Arc<String> = cache.get_or_insert_with(&owner, || "derived".to_string());
    assert_eq!(cache.len(), 1);

    drop(owner);
    assert_eq!(cache.len(), 0);
    assert!(cache.estimated_size() > 0);
    assert!(cache.tidy_up() > 0);
    assert_eq!(cache.estimated_size(), 0);
}

#[test]
fn groups_share_children_and_clear_together() {
    let cache = SecondaryCache::new("grouped");
    let core = Module { project: "core" };
    let core_tests = Module { project: "core" };
    let web = Module { project: "web" };

    let shared: Arc<Outline> = cache.get_or_insert_for_group(&core, || Outline(vec!["core"]));
    let same: Arc<Outline> = cache.get_or_insert_for_group(&core_tests, || Outline(vec!["other"]));
    let _: Arc<Outline> = cache.get_or_insert_for_group(&web, || Outline(vec!["web"]));
    assert!(Arc::ptr_eq(&shared, &same));
    assert_eq!(cache.len(), 2);

    assert!(cache.clear_group("project:core"));
    assert!(!cache.clear_group("project:core"));
    assert_eq!(cache.get_for_group::<_, Outline>(&core), None);
    assert!(cache.get_for_group::<_, Outline>(&web).is_some());
}

#[test]
fn clear_owner_drops_only_that_owner() {
    let cache = SecondaryCache::new("owners");
    let a = Arc::new(1u8);
    let b = Arc::new(2u8);
    let _: Arc<u32> = cache.get_or_insert_with(&a, || 10);
    let _: Arc<u32> = cache.get_or_insert_with(&b, || 20);

    assert!(cache.clear_owner(&a));
    assert_eq!(cache.get::<_, u32>(&a), None);
    assert_eq!(cache.get::<_, u32>(&b).as_deref(), Some(&20));
}

#[test]
fn memory_manager_clears_everything_at_once() {
    let host = Arc::new(SimulatedHost::new(10_000));
    let manager = MemoryManager::new(
        host,
        ManagerSettings {
            padding_margin: 0,
            ..ManagerSettings::default()
        },
    );
    let cache = SecondaryCache::registered("secondary", &manager);
    assert_eq!(cache.cost(), Cost::MediumLow);

    let owners: Vec<Arc<u32>> = (0..10).map(Arc::new).collect();
    for owner in &owners {
        let _: Arc<u64> = cache.get_or_insert_with(owner, || 1);
    }

    let freed = manager.clear_memory(Cost::MediumLow, 0.1).unwrap();
    assert!(freed > 0);
    assert!(cache.is_empty());
    assert_eq!(cache.queued_free_memory(0.5), 0);
}
