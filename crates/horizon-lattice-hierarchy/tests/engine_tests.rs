//! Engine behaviour seen through its public API: filtering, path addressing,
//! signals, configuration and sources with unknown counts.

mod common;

use std::sync::Arc;

use horizon_lattice_hierarchy::{
    AnchorOutcome, CallbackDataSource, ChildCount, FlatDataSource, HierarchyConfig,
    HierarchyEngine, HierarchyError, QualifiedId, Resolved, TreeDataSource,
};
use parking_lot::Mutex;

use common::{Person, Recording, family, init_tracing};

fn filtered_family() -> TreeDataSource<Person, String> {
    family().with_filter(|person: &Person, text: &str| person.name.contains(text))
}

#[test]
fn test_filter_reaches_queries_and_keeps_keys() {
    init_tracing();
    let mut engine = HierarchyEngine::new(filtered_family(), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    let key = engine.key_of(&"g1".to_string()).unwrap();

    let resets = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&resets);
    engine.signals().reset.connect(move |_| *sink.lock() += 1);

    engine.set_filter(Some("Granddad 1"));
    assert_eq!(engine.filter(), Some("Granddad 1"));
    assert_eq!(*resets.lock(), 1);
    engine.ensure_loaded(0..10).unwrap();
    assert_eq!(engine.total_size(), ChildCount::Known(1));
    assert_eq!(engine.item_at(0).map(|p| p.id.as_str()), Some("g1"));
    assert!(engine.key_of(&"g0".to_string()).is_none());

    engine.set_filter(None);
    engine.ensure_loaded(0..10).unwrap();
    assert_eq!(engine.total_size(), ChildCount::Known(3));
    let ids: Vec<_> = (0..3)
        .filter_map(|flat| engine.item_at(flat).map(|p| p.id.clone()))
        .collect();
    assert_eq!(ids, vec!["g0", "g1", "g2"]);
    assert_eq!(engine.key_of(&"g1".to_string()), Some(key));
}

#[test]
fn test_resolve_path() {
    let mut engine = HierarchyEngine::new(family(), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    engine.expand(&"g1".to_string()).unwrap();

    let dad = engine
        .resolve_path(&[1, 2])
        .unwrap()
        .ready()
        .map(|person| person.id.clone());
    assert_eq!(dad.as_deref(), Some("g1/d2"));
    assert_eq!(engine.depth_of(&"g1/d2".to_string()), Some(1));
    assert_eq!(engine.depth_of(&"g1".to_string()), Some(0));

    assert!(matches!(
        engine.resolve_path(&[0, 0]),
        Err(HierarchyError::NotExpanded { level: 0, index: 0 })
    ));
    assert!(matches!(
        engine.resolve_path(&[5]),
        Err(HierarchyError::PathOutOfRange { level: 0, index: 5 })
    ));
    assert!(matches!(
        engine.resolve_path(&[1, 3]),
        Err(HierarchyError::PathOutOfRange { level: 1, index: 3 })
    ));
}

#[test]
fn test_signals_follow_expansion() {
    let mut engine = HierarchyEngine::new(family(), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..10).unwrap();

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let loaded = Arc::new(Mutex::new(Vec::new()));
    let toggled = Arc::new(Mutex::new(Vec::new()));
    let signals = engine.signals();
    {
        let sizes = Arc::clone(&sizes);
        signals.size_changed.connect(move |size| sizes.lock().push(*size));
    }
    {
        let loaded = Arc::clone(&loaded);
        signals.rows_loaded.connect(move |rows| loaded.lock().push(rows.clone()));
    }
    {
        let toggled = Arc::clone(&toggled);
        signals
            .expanded
            .connect(move |id| toggled.lock().push(format!("+{id}")));
    }
    {
        let toggled = Arc::clone(&toggled);
        signals
            .collapsed
            .connect(move |id| toggled.lock().push(format!("-{id}")));
    }

    engine.expand(&"g0".to_string()).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    engine.collapse(&"g0".to_string());

    assert_eq!(*sizes.lock(), vec![ChildCount::Known(6), ChildCount::Known(3)]);
    assert_eq!(*loaded.lock(), vec![(Some("g0".to_string()), 0, 3)]);
    assert_eq!(*toggled.lock(), vec!["+g0", "-g0"]);
}

#[test]
fn test_anchor_kept_after_full_refresh() {
    let mut engine = HierarchyEngine::new(family(), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    let restored = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&restored);
    engine
        .signals()
        .anchor_restored
        .connect(move |outcome: &AnchorOutcome<String>| sink.lock().push(outcome.index()));

    engine.refresh_all();
    assert_eq!(engine.restore_anchor().unwrap(), Some(AnchorOutcome::Kept {
        identity: "g0".to_string(),
        index: 0,
    }));
    assert_eq!(*restored.lock(), vec![0]);
    // Settled anchors are not reported twice.
    assert_eq!(engine.restore_anchor().unwrap(), None);
}

#[test]
fn test_unknown_root_count_fixed_by_short_page() {
    let source = Recording::new(CallbackDataSource::new(
        |_| Ok(ChildCount::Unknown),
        |query| Ok(query.range().take_while(|n| *n < 30).map(|n| n as u32).collect()),
        |_| false,
        |n: &u32| *n,
    ));
    let mut engine = HierarchyEngine::with_shared_source(Arc::clone(&source), HierarchyConfig::default()).unwrap();
    assert_eq!(engine.total_size(), ChildCount::Unknown);

    engine.ensure_loaded(0..20).unwrap();
    assert_eq!(source.take_fetches(), vec![(None, 0, 50), (None, 50, 20)]);
    assert_eq!(engine.total_size(), ChildCount::Known(30));
    assert_eq!(engine.item_at(29), Some(&29));
    assert_eq!(engine.resolve(30).unwrap(), Resolved::OutOfRange);
}

#[test]
fn test_last_index_of_unknown_list_is_out_of_range() {
    let source = CallbackDataSource::new(
        |_| Ok(ChildCount::Unknown),
        |query| Ok(query.range().take(5).map(|n| n as u32).collect()),
        |_| false,
        |n: &u32| *n,
    );
    let mut engine = HierarchyEngine::new(source, HierarchyConfig::default()).unwrap();
    assert_eq!(engine.resolve(usize::MAX).unwrap(), Resolved::OutOfRange);
    assert_eq!(engine.resolve_path(&[usize::MAX]).unwrap(), Resolved::OutOfRange);
    assert_eq!(engine.cached_item_count(), 0);
}

/// Two folders that each hold a file named "x".
fn same_named_leaves() -> CallbackDataSource<QualifiedId<&'static str>, QualifiedId<&'static str>> {
    fn children(parent: Option<&QualifiedId<&'static str>>) -> Vec<QualifiedId<&'static str>> {
        match parent {
            None => vec![QualifiedId::root("a"), QualifiedId::root("b")],
            Some(folder) if folder.len() == 1 => vec![folder.child("x")],
            Some(_) => Vec::new(),
        }
    }
    CallbackDataSource::new(
        |query| Ok(ChildCount::Known(children(query.parent.as_ref()).len())),
        |query| {
            Ok(children(query.parent.as_ref())
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .collect())
        },
        |item| item.len() == 1,
        |item: &QualifiedId<&'static str>| item.clone(),
    )
}

#[test]
fn test_qualified_ids_keep_equal_leaves_apart() {
    let mut engine = HierarchyEngine::new(same_named_leaves(), HierarchyConfig::default()).unwrap();
    engine.ensure_loaded(0..10).unwrap();
    engine.expand(&QualifiedId::root("a")).unwrap();
    engine.expand(&QualifiedId::root("b")).unwrap();
    let report = engine.ensure_loaded(0..10).unwrap();
    assert!(report.is_ok());
    assert_eq!(engine.total_size(), ChildCount::Known(4));

    let ax = QualifiedId::root("a").child("x");
    let bx = QualifiedId::root("b").child("x");
    assert_eq!(engine.item_at(1), Some(&ax));
    assert_eq!(engine.item_at(3), Some(&bx));
    assert_ne!(engine.key_of(&ax), engine.key_of(&bx));
    assert_eq!(engine.item_at(3).and_then(|item| item.leaf()), Some(&"x"));
}

#[test]
fn test_flat_source_rows_are_leaves() {
    let names: Vec<String> = (0..20).map(|n| format!("row {n}")).collect();
    let source = Arc::new(FlatDataSource::new(names, |name: &String| name.clone()));
    let config = HierarchyConfig::default().eager_in_memory(true);
    let mut engine = HierarchyEngine::with_shared_source(Arc::clone(&source), config).unwrap();

    let report = engine.ensure_loaded(0..5).unwrap();
    // In-memory sources are fetched in one window.
    assert_eq!(report.issued.len(), 1);
    assert_eq!(engine.cached_item_count(), 20);
    assert!(!engine.expand(&"row 3".to_string()).unwrap());

    source.update("row 3".to_string());
    engine.refresh_item(&"row 3".to_string(), false).unwrap();
    assert!(matches!(
        engine.refresh_item(&"row 99".to_string(), false),
        Err(HierarchyError::UnknownIdentity { .. })
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(HierarchyConfig::from_toml_str("page_size = 0").is_err());
    assert!(HierarchyConfig::from_toml_str("page_size = \"many\"").is_err());

    let config = HierarchyConfig::from_toml_str("page_size = 20\ncache_capacity = 500").unwrap();
    assert_eq!(config.page_size, 20);
    assert_eq!(config.cache_capacity, Some(500));

    let result = HierarchyEngine::new(family(), HierarchyConfig::default().page_size(0));
    assert!(matches!(result, Err(HierarchyError::Config(_))));
}
