//! Properties that must hold for any hierarchy: key round-trips, expand and
//! collapse symmetry, minimal windows, refresh locality and identity safety.

mod common;

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::Arc;

use horizon_lattice_hierarchy::{
    CallbackDataSource, ChildCount, DispatchMode, EmptyExpandedPolicy, FetchError, FetchTriple,
    HierarchicalDataSource, HierarchicalQuery, HierarchyConfig, HierarchyEngine, HierarchyError,
    TreeDataSource,
};
use parking_lot::Mutex;

use common::{Recording, family, init_tracing, leaves};

#[test]
fn test_keys_round_trip_until_evicted() {
    init_tracing();
    let config = HierarchyConfig::default().cache_capacity(Some(100));
    let mut engine = HierarchyEngine::new(leaves(1000), config).unwrap();
    engine.ensure_loaded(0..50).unwrap();

    let mut seen = HashSet::new();
    for flat in 0..100 {
        let id = *engine.item_at(flat).unwrap();
        let key = engine.key_of(&id).unwrap();
        assert_eq!(engine.identity_of(&key).unwrap(), &id);
        assert!(seen.insert(key), "key reissued for row {flat}");
    }

    let first = engine.key_of(&0).unwrap();
    engine.ensure_loaded(500..550).unwrap();
    assert!(engine.cached_item_count() <= 100);
    assert!(engine.key_of(&0).is_none());
    assert!(matches!(
        engine.identity_of(&first),
        Err(HierarchyError::UnknownKey { .. })
    ));
}

#[test]
fn test_pinned_key_survives_eviction() {
    let config = HierarchyConfig::default().cache_capacity(Some(100));
    let mut engine = HierarchyEngine::new(leaves(1000), config).unwrap();
    engine.ensure_loaded(0..50).unwrap();
    let key = engine.key_of(&0).unwrap();
    engine.pin_key(&key).unwrap();

    engine.ensure_loaded(500..550).unwrap();
    assert_eq!(engine.identity_of(&key).unwrap(), &0);
    assert_eq!(engine.item_at(0), Some(&0));

    engine.unpin_key(&key).unwrap();
    engine.ensure_loaded(600..650).unwrap();
    assert!(engine.identity_of(&key).is_err());
}

fn visible_ids<S: HierarchicalDataSource>(engine: &HierarchyEngine<S>) -> Vec<Option<S::Id>> {
    let total = engine.total_size().unwrap_or(0);
    engine.flatten(0..total).into_iter().map(|row| row.id).collect()
}

#[test]
fn test_expand_then_collapse_restores_flat_view() {
    let mut engine = HierarchyEngine::new(family(), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..20).unwrap();
    engine.expand(&"g0".to_string()).unwrap();
    engine.ensure_loaded(0..20).unwrap();

    let total = engine.total_size();
    let rows = visible_ids(&engine);
    assert_eq!(total, ChildCount::Known(6));

    engine.expand(&"g1".to_string()).unwrap();
    engine.ensure_loaded(0..20).unwrap();
    assert_eq!(engine.total_size(), ChildCount::Known(9));

    engine.collapse(&"g1".to_string());
    assert_eq!(engine.total_size(), total);
    assert_eq!(visible_ids(&engine), rows);
}

#[test]
fn test_windows_are_minimal() {
    let source = Recording::new(leaves(1000));
    let mut engine = HierarchyEngine::with_shared_source(Arc::clone(&source), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..100).unwrap();
    source.take_fetches();

    // Only the uncached tail is fetched, widened forward.
    engine.ensure_loaded(120..180).unwrap();
    assert_eq!(source.take_fetches(), vec![(None, 150, 130)]);

    engine.ensure_loaded(0..280).unwrap();
    assert!(source.take_fetches().is_empty());

    // A single stale row between fresh neighbours is refetched alone.
    engine.refresh_item(&60, false).unwrap();
    engine.ensure_loaded(0..100).unwrap();
    assert_eq!(source.take_fetches(), vec![(None, 60, 1)]);
}

#[test]
fn test_rows_in_flight_are_not_requested_twice() {
    let config = HierarchyConfig::default().dispatch(DispatchMode::Deferred);
    let mut engine = HierarchyEngine::new(leaves(1000), config).unwrap();
    let first = engine.ensure_loaded(0..100).unwrap();
    assert_eq!(
        first.issued,
        vec![FetchTriple::new(None, 0, 50), FetchTriple::new(None, 50, 100)]
    );

    // Scrolling on before anything lands only asks for rows nobody is loading.
    let second = engine.ensure_loaded(100..200).unwrap();
    assert_eq!(second.issued, vec![FetchTriple::new(None, 150, 150)]);
    assert_eq!(second.superseded, 0);
    assert_eq!(engine.in_flight_count(), 3);

    let tasks = engine.take_tasks();
    let mut windows: Vec<Range<usize>> = tasks.iter().map(|task| task.triple().range()).collect();
    windows.sort_by_key(|window| window.start);
    assert_eq!(windows, vec![0..50, 50..150, 150..300]);

    for task in tasks {
        engine.complete(task.run());
    }
    assert_eq!(engine.cached_item_count(), 300);
    assert!(engine.ensure_loaded(100..200).unwrap().issued.is_empty());
}

#[test]
fn test_refresh_item_is_local() {
    let source = Recording::new(family());
    let mut engine = HierarchyEngine::with_shared_source(Arc::clone(&source), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..20).unwrap();
    for id in ["g0", "g1"] {
        engine.expand(&id.to_string()).unwrap();
        engine.ensure_loaded(0..20).unwrap();
    }
    for id in ["g0/d0", "g0/d1"] {
        engine.expand(&id.to_string()).unwrap();
    }
    engine.ensure_loaded(0..300).unwrap();

    let g0 = "g0".to_string();
    let g1 = "g1".to_string();
    let d0 = "g0/d0".to_string();
    let d1 = "g0/d1".to_string();
    assert_eq!(engine.size_of(Some(&d0)), ChildCount::Known(100));
    assert_eq!(engine.size_of(Some(&g0)), ChildCount::Known(203));
    let queries = source.count_queries();

    engine.refresh_item(&d0, false).unwrap();
    assert_eq!(source.count_queries(), queries + 1);
    assert_eq!(engine.size_of(Some(&d1)), ChildCount::Known(100));
    assert_eq!(engine.size_of(Some(&g1)), ChildCount::Known(3));
    assert_eq!(engine.size_of(Some(&g0)), ChildCount::Known(203));
    assert_eq!(engine.total_size(), ChildCount::Known(209));

    // A real change moves the ancestors and nothing else.
    source.inner().remove(&"g0/d0/s99".to_string());
    engine.refresh_item(&d0, false).unwrap();
    assert_eq!(engine.size_of(Some(&d0)), ChildCount::Known(99));
    assert_eq!(engine.size_of(Some(&g0)), ChildCount::Known(202));
    assert_eq!(engine.size_of(Some(&d1)), ChildCount::Known(100));
    assert_eq!(engine.size_of(Some(&g1)), ChildCount::Known(3));
    assert_eq!(engine.total_size(), ChildCount::Known(208));
}

/// A string id hashed like Java's `String.hashCode`, under which "Aa" and "BB" collide.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JavaHashed(String);

impl Hash for JavaHashed {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let code = self
            .0
            .chars()
            .fold(0i32, |acc, c| acc.wrapping_mul(31).wrapping_add(c as i32));
        code.hash(state);
    }
}

fn strings(items: &'static [&'static str]) -> CallbackDataSource<String, JavaHashed> {
    CallbackDataSource::new(
        move |_: &HierarchicalQuery<String>| Ok(ChildCount::Known(items.len())),
        move |query| {
            Ok(items
                .iter()
                .skip(query.offset)
                .take(query.limit)
                .map(|s| s.to_string())
                .collect())
        },
        |_| false,
        |s: &String| JavaHashed(s.clone()),
    )
}

#[test]
fn test_colliding_hashes_get_distinct_keys() {
    let mut engine = HierarchyEngine::new(strings(&["Aa", "BB"]), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..2).unwrap();

    let aa = JavaHashed("Aa".to_string());
    let bb = JavaHashed("BB".to_string());
    let key_aa = engine.key_of(&aa).unwrap();
    let key_bb = engine.key_of(&bb).unwrap();
    assert_ne!(key_aa, key_bb);
    assert_eq!(engine.identity_of(&key_aa).unwrap(), &aa);
    assert_eq!(engine.identity_of(&key_bb).unwrap(), &bb);
    assert_eq!(engine.item_at(1).map(String::as_str), Some("BB"));
}

#[test]
fn test_duplicate_identities_fail_the_fetch() {
    let mut engine = HierarchyEngine::new(strings(&["x", "y", "x"]), HierarchyConfig::default()).unwrap();
    let failed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failed);
    engine
        .signals()
        .fetch_failed
        .connect(move |failure| sink.lock().push(failure.triple.to_string()));

    let report = engine.ensure_loaded(0..3).unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failures[0].error,
        FetchError::IdentityCollision { .. }
    ));
    assert_eq!(engine.cached_item_count(), 0);
    assert_eq!(*failed.lock(), vec!["(root, 0, 3)".to_string()]);
    assert!(matches!(
        report.into_result(),
        Err(HierarchyError::FetchFailed { .. })
    ));
}

fn parent_with_one_child() -> Arc<TreeDataSource<String, String>> {
    let tree = TreeDataSource::new(|s: &String| s.clone());
    tree.add_root("p".to_string());
    tree.add_child(&"p".to_string(), "p/only".to_string());
    tree.add_root("q".to_string());
    Arc::new(tree)
}

#[test]
fn test_empty_expanded_node_collapses_by_default() {
    let source = parent_with_one_child();
    let mut engine = HierarchyEngine::with_shared_source(Arc::clone(&source), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    engine.expand(&"p".to_string()).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    assert_eq!(engine.total_size(), ChildCount::Known(3));

    source.remove(&"p/only".to_string());
    engine.refresh_item(&"p".to_string(), false).unwrap();
    assert!(!engine.is_expanded(&"p".to_string()));
    assert_eq!(engine.total_size(), ChildCount::Known(2));
}

#[test]
fn test_empty_expanded_node_kept_when_configured() {
    let source = Recording::new(TreeDataSource::new(|s: &String| s.clone()));
    source.inner().add_root("p".to_string());
    source.inner().add_child(&"p".to_string(), "p/only".to_string());
    let config = HierarchyConfig::default().empty_expanded_policy(EmptyExpandedPolicy::Keep);
    let mut engine = HierarchyEngine::with_shared_source(Arc::clone(&source), config).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    engine.expand(&"p".to_string()).unwrap();
    engine.ensure_loaded(0..10).unwrap();

    source.inner().remove(&"p/only".to_string());
    engine.refresh_item(&"p".to_string(), false).unwrap();
    source.take_fetches();

    assert!(engine.is_expanded(&"p".to_string()));
    assert_eq!(engine.size_of(Some(&"p".to_string())), ChildCount::ZERO);
    engine.ensure_loaded(0..10).unwrap();
    // The root row is refetched; nothing is requested for the empty parent.
    assert!(source.take_fetches().iter().all(|(parent, _, _)| parent.is_none()));
}
