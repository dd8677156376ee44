//! The hierarchy engine.
//!
//! [`HierarchyEngine`] presents a lazily loaded tree as a flat list of rows.
//! It owns the window cache, the expansion set, the key mapper and the fetch
//! coordinator, and is driven from a single thread: every method takes
//! `&mut self` or `&self`. Data source calls either run inline or are handed
//! out as [`FetchTask`]s, depending on [`DispatchMode`](crate::DispatchMode).
//!
//! Child counts are queried synchronously when they are first needed; only
//! window fetches go through the dispatcher.

use std::convert::Infallible;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{HierarchyCache, Ingest, IngestOutcome};
use crate::config::{EmptyExpandedPolicy, HierarchyConfig};
use crate::count::ChildCount;
use crate::error::{FetchError, HierarchyError, Result};
use crate::expansion::{self, ExpansionModel, RecursionDepth};
use crate::fetch::{
    self, CompletionOutcome, DiscardReason, FetchCompletion, FetchCoordinator, FetchFailure,
    FetchTask, FetchTriple, Issue, LoadReport, PlanInput,
};
use crate::flatten::{self, FlatEntry};
use crate::key_mapper::{ItemKey, KeyMapper};
use crate::logging::targets;
use crate::refresh::{self, AnchorOutcome, AnchorState, RefreshCoordinator};
use crate::signal::HierarchySignals;
use crate::source::{HierarchicalDataSource, HierarchicalQuery};

/// The state of a flat row.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolved<'a, T> {
    /// The row is loaded; it may be stale and awaiting a refetch.
    Ready(&'a T),
    /// The row exists but its window has not arrived yet.
    Pending,
    /// The row is past the end of the flat view.
    OutOfRange,
}

impl<'a, T> Resolved<'a, T> {
    /// The item, if loaded.
    pub fn ready(self) -> Option<&'a T> {
        match self {
            Self::Ready(item) => Some(item),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// A flat, lazily loaded view over a [`HierarchicalDataSource`].
///
/// # Example
///
/// ```
/// use horizon_lattice_hierarchy::{ChildCount, HierarchyConfig, HierarchyEngine, TreeDataSource};
///
/// let tree = TreeDataSource::new(|name: &String| name.clone());
/// tree.add_root("src".to_string());
/// tree.add_child(&"src".to_string(), "main.rs".to_string());
/// tree.add_root("Cargo.toml".to_string());
///
/// let mut engine = HierarchyEngine::new(tree, HierarchyConfig::default()).unwrap();
/// engine.ensure_loaded(0..10).unwrap();
/// assert_eq!(engine.total_size(), ChildCount::Known(2));
///
/// engine.expand(&"src".to_string()).unwrap();
/// assert_eq!(engine.total_size(), ChildCount::Known(3));
/// assert_eq!(engine.resolve(1).unwrap().ready().map(String::as_str), Some("main.rs"));
/// ```
pub struct HierarchyEngine<S: HierarchicalDataSource> {
    source: Arc<S>,
    config: HierarchyConfig,
    filter: Option<Arc<str>>,
    keys: KeyMapper<S::Id>,
    expansion: ExpansionModel<S::Id>,
    cache: HierarchyCache<S::Item, S::Id>,
    fetch: FetchCoordinator<S>,
    refresh: RefreshCoordinator<S::Id>,
    viewport: Option<Range<usize>>,
    signals: HierarchySignals<S::Id>,
}

impl<S: HierarchicalDataSource> HierarchyEngine<S> {
    /// Create an engine over `source` and query the root count.
    pub fn new(source: S, config: HierarchyConfig) -> Result<Self> {
        Self::with_shared_source(Arc::new(source), config)
    }

    /// Create an engine over a source the application keeps a handle to.
    pub fn with_shared_source(source: Arc<S>, config: HierarchyConfig) -> Result<Self> {
        config.validate()?;
        let fetch = FetchCoordinator::new(config.dispatch)?;
        let mut engine = Self {
            source,
            cache: HierarchyCache::new(config.ttl()),
            config,
            filter: None,
            keys: KeyMapper::new(),
            expansion: ExpansionModel::new(),
            fetch,
            refresh: RefreshCoordinator::new(),
            viewport: None,
            signals: HierarchySignals::new(),
        };
        let count = engine.count_of(&None)?;
        tracing::debug!(target: targets::HIERARCHY, root_count = %count, dispatch = ?engine.config.dispatch, "engine created");
        Ok(engine)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    pub fn signals(&self) -> &HierarchySignals<S::Id> {
        &self.signals
    }

    /// The data source.
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Total number of flat rows, as currently known.
    pub fn total_size(&self) -> ChildCount {
        self.cache.size(&None)
    }

    /// Flat rows contributed by the children of `parent` (`None` for the root).
    pub fn size_of(&self, parent: Option<&S::Id>) -> ChildCount {
        self.cache.size(&parent.cloned())
    }

    /// Depth of a cached item; root children are at depth 0.
    pub fn depth_of(&self, id: &S::Id) -> Option<usize> {
        self.cache.depth_of(id)
    }

    pub fn cached_item_count(&self) -> usize {
        self.cache.len()
    }

    /// Number of live fetch requests.
    pub fn in_flight_count(&self) -> usize {
        self.fetch.in_flight_count()
    }

    pub fn expansion(&self) -> &ExpansionModel<S::Id> {
        &self.expansion
    }

    pub fn is_expanded(&self, id: &S::Id) -> bool {
        self.expansion.is_expanded(id)
    }

    /// The range last passed to [`ensure_loaded`](Self::ensure_loaded).
    pub fn viewport(&self) -> Option<Range<usize>> {
        self.viewport.clone()
    }

    // =========================================================================
    // Reading rows
    // =========================================================================

    /// The loaded item at a flat index, without fetching.
    pub fn item_at(&self, flat: usize) -> Option<&S::Item> {
        let location = flatten::locate(&self.cache, flat)?;
        self.cache.item_at(&location.parent, location.index)
    }

    /// Resolve a flat index, scheduling a fetch if its row is missing or stale.
    ///
    /// A stale row is returned as [`Resolved::Ready`] while it is refetched.
    pub fn resolve(&mut self, flat: usize) -> Result<Resolved<'_, S::Item>> {
        let Some(location) = flatten::locate(&self.cache, flat) else {
            return Ok(Resolved::OutOfRange);
        };
        let Some(end) = flat.checked_add(1) else {
            return Ok(Resolved::OutOfRange);
        };
        if !self.cache.is_slot_fresh(&location.parent, location.index, Instant::now()) {
            self.load(flat..end)?.into_result()?;
        }
        Ok(match flatten::locate(&self.cache, flat) {
            Some(location) => match self.cache.item_at(&location.parent, location.index) {
                Some(item) => Resolved::Ready(item),
                None => Resolved::Pending,
            },
            None => Resolved::OutOfRange,
        })
    }

    /// Resolve a child-index path such as `[2, 0, 5]`.
    ///
    /// Every level but the last must be expanded.
    pub fn resolve_path(&mut self, path: &[usize]) -> Result<Resolved<'_, S::Item>> {
        let location = flatten::resolve_path(&self.cache, path)?;
        let Some(end) = location.index.checked_add(1) else {
            return Ok(Resolved::OutOfRange);
        };
        if !self.cache.is_slot_fresh(&location.parent, location.index, Instant::now()) {
            let mut report = LoadReport::default();
            self.load_span(&location.parent, location.index..end, &mut report);
            self.drain_ready(&mut report);
            report.into_result()?;
        }
        Ok(match self.cache.item_at(&location.parent, location.index) {
            Some(item) => Resolved::Ready(item),
            None => Resolved::Pending,
        })
    }

    /// The rows of a flat range, loaded or not. Does not fetch.
    pub fn flatten(&self, range: Range<usize>) -> Vec<FlatEntry<S::Id>> {
        flatten::rows(&self.cache, range).collect()
    }

    /// Flat index of a cached, visible item.
    pub fn scroll_anchor(&self, id: &S::Id) -> Option<usize> {
        flatten::flat_index_of(&self.cache, id)
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Make sure the rows of a flat range are loaded, or being loaded.
    ///
    /// The range becomes the viewport used for eviction and anchoring. With
    /// inline dispatch the windows are fetched and applied before returning;
    /// otherwise the report lists the windows that were issued. Window
    /// failures are reported, not returned as errors.
    pub fn ensure_loaded(&mut self, range: Range<usize>) -> Result<LoadReport<S::Id>> {
        self.viewport = Some(range.clone());
        self.load(range)
    }

    fn load(&mut self, range: Range<usize>) -> Result<LoadReport<S::Id>> {
        let before = self.total_size();
        self.sync_counts()?;
        debug_assert!(
            self.cache
                .registered_expanded()
                .all(|id| self.expansion.is_expanded(id)),
            "expanded map holds a collapsed identity"
        );

        let mut report = LoadReport::default();
        for segment in flatten::segments(&self.cache, range) {
            self.load_span(&segment.parent, segment.children, &mut report);
        }
        self.drain_ready(&mut report);
        self.evict_if_needed();
        self.notify_size(before);
        Ok(report)
    }

    /// Bring every visible count up to date, parents before children.
    fn sync_counts(&mut self) -> Result<()> {
        let mut stack = vec![None];
        while let Some(parent) = stack.pop() {
            match self.count_of(&parent) {
                Ok(_) => self.apply_empty_policy(&parent),
                Err(error) if parent.is_some() => {
                    tracing::warn!(target: targets::FETCH, ?parent, %error, "child count query failed");
                }
                Err(error) => return Err(error),
            }
            if let Some(state) = self.cache.state(&parent) {
                stack.extend(state.expanded.values().cloned().map(Some));
            }
        }
        Ok(())
    }

    fn load_span(&mut self, parent: &Option<S::Id>, span: Range<usize>, report: &mut LoadReport<S::Id>) {
        let Some(state) = self.cache.state(parent) else {
            return;
        };
        let epoch = state.epoch;
        let input = PlanInput {
            span,
            count: state.count_or_zero(),
            first_load: state.slots.is_empty() && !self.fetch.has_live(parent),
            page_size: self.config.page_size,
            prefetch_pages: self.config.prefetch_pages,
            eager_first_page: self.config.eager_first_page,
            whole_list: self.config.eager_in_memory && self.source.is_in_memory(),
        };
        let now = Instant::now();
        let windows = fetch::plan_windows(&input, |index| {
            self.cache.is_slot_fresh(parent, index, now) || self.fetch.covers(parent, index)
        });
        if windows.is_empty() {
            return;
        }
        let Ok(parent_item) = self.parent_item(parent) else {
            return;
        };

        for window in windows {
            let triple = FetchTriple::new(parent.clone(), window.start, window.len());
            let query = HierarchicalQuery::new(parent_item.clone(), window.start, window.len())
                .with_filter(self.filter.clone());
            match self.fetch.issue(triple.clone(), epoch, query, &self.source) {
                Issue::Issued(_) => report.issued.push(triple),
                Issue::Superseded(_) => {
                    report.issued.push(triple);
                    report.superseded += 1;
                }
                Issue::Attached => report.attached += 1,
            }
        }
    }

    /// Apply whatever completions are available without blocking.
    fn drain_ready(&mut self, report: &mut LoadReport<S::Id>) {
        for completion in self.fetch.ready() {
            let outcome = self.apply_completion(completion);
            report.record(&outcome);
        }
    }

    // =========================================================================
    // Completions
    // =========================================================================

    /// Hand queued fetch tasks to the host (deferred dispatch only).
    ///
    /// Run each task anywhere and pass its result to [`complete`](Self::complete).
    pub fn take_tasks(&mut self) -> Vec<FetchTask<S>> {
        self.fetch.take_tasks()
    }

    /// Apply the result of a fetch task.
    pub fn complete(&mut self, completion: FetchCompletion<S::Id, S::Item>) -> CompletionOutcome<S::Id> {
        let before = self.total_size();
        let outcome = self.apply_completion(completion);
        self.evict_if_needed();
        self.notify_size(before);
        outcome
    }

    /// Apply the completions that have already arrived.
    pub fn process_completions(&mut self) -> LoadReport<S::Id> {
        let before = self.total_size();
        let mut report = LoadReport::default();
        self.drain_ready(&mut report);
        self.evict_if_needed();
        self.notify_size(before);
        report
    }

    /// Apply completions as they arrive until no request is outstanding or
    /// `timeout` has elapsed.
    pub fn wait_for_fetches(&mut self, timeout: Duration) -> LoadReport<S::Id> {
        let deadline = Instant::now() + timeout;
        let before = self.total_size();
        let mut report = LoadReport::default();
        while self.fetch.outstanding() > 0 {
            let Some(completion) = self.fetch.wait(deadline) else {
                break;
            };
            let outcome = self.apply_completion(completion);
            report.record(&outcome);
        }
        self.evict_if_needed();
        self.notify_size(before);
        report
    }

    fn apply_completion(&mut self, completion: FetchCompletion<S::Id, S::Item>) -> CompletionOutcome<S::Id> {
        let request = match self.fetch.finish(completion.request()) {
            Ok(request) => request,
            Err((triple, reason)) => {
                tracing::debug!(target: targets::FETCH, ?triple, ?reason, "discarded completion");
                return CompletionOutcome::Discarded { triple, reason };
            }
        };
        let triple = request.triple;

        let parent_alive = triple.parent.as_ref().is_none_or(|id| self.cache.contains(id));
        if !parent_alive || self.cache.epoch(&triple.parent) != Some(request.epoch) {
            tracing::debug!(target: targets::FETCH, %triple, "discarded completion for a rebuilt parent");
            return CompletionOutcome::Discarded {
                triple: Some(triple),
                reason: DiscardReason::StaleParent,
            };
        }

        let rows = match completion.into_result() {
            Ok(rows) => rows,
            Err(error) => return self.fail(triple, error.into()),
        };
        let returned = rows.len();
        let batch = Ingest {
            parent: triple.parent.clone(),
            offset: triple.offset,
            limit: triple.limit,
            seq: request.seq,
            rows,
        };
        let outcome = match self.cache.ingest(batch, &mut self.keys, &self.expansion, Instant::now()) {
            Ok(outcome) => outcome,
            Err(HierarchyError::IdentityCollision { identity }) => {
                return self.fail(triple, FetchError::IdentityCollision { identity });
            }
            Err(error) => {
                tracing::debug!(target: targets::FETCH, %triple, %error, "discarded completion");
                return CompletionOutcome::Discarded {
                    triple: Some(triple),
                    reason: DiscardReason::StaleParent,
                };
            }
        };

        tracing::debug!(target: targets::FETCH, %triple, returned, written = outcome.written, "applied completion");
        if outcome.written > 0 {
            self.signals
                .rows_loaded
                .emit((triple.parent.clone(), triple.offset, outcome.written));
        }
        self.after_ingest(&triple.parent, outcome);
        CompletionOutcome::Applied { triple, rows: returned }
    }

    /// Query counts for newly loaded expanded items and apply the empty policy.
    fn after_ingest(&mut self, parent: &Option<S::Id>, outcome: IngestOutcome<S::Id>) {
        for id in outcome.needs_count {
            let child = Some(id);
            match self.count_of(&child) {
                Ok(_) => self.apply_empty_policy(&child),
                Err(error) => {
                    tracing::warn!(target: targets::FETCH, parent = ?child, %error, "child count query failed");
                }
            }
        }
        self.apply_empty_policy(parent);
    }

    fn fail(&self, triple: FetchTriple<S::Id>, error: FetchError) -> CompletionOutcome<S::Id> {
        tracing::warn!(target: targets::FETCH, %triple, %error, "fetch failed");
        let failure = FetchFailure { triple, error };
        self.signals.fetch_failed.emit(failure.clone());
        CompletionOutcome::Failed(failure)
    }

    // =========================================================================
    // Expansion
    // =========================================================================

    /// Expand an item. Returns `true` if it was not expanded before.
    ///
    /// An item whose source reports no children stays collapsed.
    pub fn expand(&mut self, id: &S::Id) -> Result<bool> {
        let before = self.total_size();
        let expanded = self.expand_inner(id)?;
        self.notify_size(before);
        Ok(expanded)
    }

    fn expand_inner(&mut self, id: &S::Id) -> Result<bool> {
        if self.expansion.is_expanded(id) {
            return Ok(false);
        }
        if let Some(cached) = self.cache.item(id) {
            if !self.source.has_children(&cached.item) {
                tracing::trace!(target: targets::EXPANSION, ?id, "leaf cannot be expanded");
                return Ok(false);
            }
        }

        self.expansion.expand(id.clone());
        self.cache.register_expanded(id);
        let parent = Some(id.clone());
        if self.cache.contains(id) {
            if let Err(error) = self.count_of(&parent) {
                self.expansion.collapse(id);
                self.cache.unregister_expanded(id);
                return Err(error);
            }
        }
        tracing::debug!(target: targets::EXPANSION, ?id, size = %self.cache.size(&parent), "expanded");
        self.signals.expanded.emit(id.clone());
        self.apply_empty_policy(&parent);
        Ok(true)
    }

    /// Collapse an item. Returns `true` if it was expanded.
    ///
    /// Cached children are kept, so expanding again is immediate; fetches in
    /// flight for them are discarded.
    pub fn collapse(&mut self, id: &S::Id) -> bool {
        if !self.expansion.is_expanded(id) {
            return false;
        }
        let before = self.total_size();
        self.collapse_inner(id);
        self.notify_size(before);
        true
    }

    fn collapse_inner(&mut self, id: &S::Id) {
        // Expanded descendants stay expanded but are hidden, so their fetches go too.
        let hidden = refresh::refresh_targets(&self.cache, &self.expansion, id, true);
        self.expansion.collapse(id);
        self.cache.unregister_expanded(id);
        let mut cancelled = 0;
        for target in hidden {
            let parent = Some(target);
            self.cache.bump_epoch(&parent);
            cancelled += self.fetch.cancel_parent(&parent);
        }
        tracing::debug!(target: targets::EXPANSION, ?id, cancelled, "collapsed");
        self.signals.collapsed.emit(id.clone());
    }

    /// Flip the expansion of an item. Returns the new state.
    pub fn toggle(&mut self, id: &S::Id) -> Result<bool> {
        if self.collapse(id) {
            return Ok(false);
        }
        self.expand(id)?;
        Ok(self.is_expanded(id))
    }

    /// Expand `roots` and, up to `depth`, their descendants.
    ///
    /// `RecursionDepth::Levels(0)` expands only the roots. Enumerating a level
    /// fetches every child, so a parent with an unknown count, or more
    /// children than the configured limit, stops the walk with
    /// [`HierarchyError::UnboundedSubtree`]. Returns the number of items that
    /// were newly expanded.
    pub fn expand_recursively(&mut self, roots: &[S::Id], depth: impl Into<RecursionDepth>) -> Result<usize> {
        let before = self.total_size();
        let mut expanded = 0;
        let result = expansion::walk(roots.to_vec(), depth.into(), |id, descend| {
            if self.expand_inner(id)? {
                expanded += 1;
            }
            if !descend || !self.expansion.is_expanded(id) {
                return Ok(Vec::new());
            }
            self.enumerate_children(id)
        });
        self.notify_size(before);
        tracing::debug!(target: targets::EXPANSION, roots = roots.len(), expanded, "recursive expand");
        result.map(|_| expanded)
    }

    /// All children of an expanded item, fetching them if needed.
    fn enumerate_children(&mut self, id: &S::Id) -> Result<Vec<S::Id>> {
        let parent = Some(id.clone());
        let now = Instant::now();
        if let Some(children) = self.cache.fresh_children(&parent, now) {
            return Ok(children);
        }
        let n = match self.count_of(&parent)? {
            ChildCount::Known(n) if n <= self.config.recursive_expand_limit => n,
            count => return Err(HierarchyError::unbounded(id, count)),
        };
        if n == 0 {
            return Ok(Vec::new());
        }

        let triple = FetchTriple::new(parent.clone(), 0, n);
        let query = HierarchicalQuery::new(self.parent_item(&parent)?, 0, n).with_filter(self.filter.clone());
        let seq = self.fetch.next_seq();
        let items = self
            .source
            .fetch_children(&query)
            .map_err(|error| {
                FetchFailure {
                    triple,
                    error: error.into(),
                }
                .into_error()
            })?;
        let rows: Vec<(S::Id, S::Item)> = items
            .into_iter()
            .map(|item| (self.source.id_of(&item), item))
            .collect();
        let ids: Vec<S::Id> = rows.iter().map(|(id, _)| id.clone()).collect();

        let batch = Ingest {
            parent: parent.clone(),
            offset: 0,
            limit: n,
            seq,
            rows,
        };
        let outcome = self.cache.ingest(batch, &mut self.keys, &self.expansion, now)?;
        if outcome.written > 0 {
            self.signals.rows_loaded.emit((parent.clone(), 0, outcome.written));
        }
        self.after_ingest(&parent, outcome);
        Ok(ids)
    }

    /// Collapse `roots` and, up to `depth`, their cached descendants.
    ///
    /// Never fetches. Returns the number of items that were collapsed.
    pub fn collapse_recursively(&mut self, roots: &[S::Id], depth: impl Into<RecursionDepth>) -> usize {
        let before = self.total_size();
        let mut collapsed = 0;
        let Ok(_) = expansion::walk::<_, Infallible, _>(roots.to_vec(), depth.into(), |id, descend| {
            if self.expansion.is_expanded(id) {
                self.collapse_inner(id);
                collapsed += 1;
            }
            Ok(if descend {
                self.cache.cached_children(&Some(id.clone()))
            } else {
                Vec::new()
            })
        });
        self.notify_size(before);
        collapsed
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Refetch one item and its child windows.
    ///
    /// With `recursive`, expanded cached descendants are refreshed too. Stale
    /// rows keep being served until their refetch lands; nothing outside the
    /// item's subtree is touched.
    pub fn refresh_item(&mut self, id: &S::Id, recursive: bool) -> Result<()> {
        if !self.cache.contains(id) {
            return Err(HierarchyError::unknown_identity(id));
        }
        let before = self.total_size();
        for target in refresh::refresh_targets(&self.cache, &self.expansion, id, recursive) {
            self.cache.mark_item_stale(&target);
            let parent = Some(target.clone());
            if !self.cache.mark_children_stale(&parent) {
                continue;
            }
            self.fetch.cancel_parent(&parent);
            if self.expansion.is_expanded(&target) {
                match self.count_of(&parent) {
                    Ok(_) => self.apply_empty_policy(&parent),
                    Err(error) => {
                        tracing::warn!(target: targets::REFRESH, ?parent, %error, "child count query failed");
                    }
                }
            }
        }
        tracing::debug!(target: targets::REFRESH, ?id, recursive, "refreshed item");
        self.notify_size(before);
        Ok(())
    }

    /// Replace the payload of a cached item with a value the application already has.
    ///
    /// Its key and position are kept; nothing is fetched.
    pub fn refresh_item_with(&mut self, item: S::Item) -> Result<()> {
        let id = self.source.id_of(&item);
        let Some((parent, index)) = self.cache.replace_item(&id, item) else {
            return Err(HierarchyError::unknown_identity(&id));
        };
        tracing::trace!(target: targets::REFRESH, ?id, "replaced item in place");
        self.signals.rows_loaded.emit((parent, index, 1));
        Ok(())
    }

    /// Invalidate everything and remember the first visible row.
    ///
    /// Cached rows stay visible until refetched. Keys survive for identities
    /// that the refetch confirms. Call [`restore_anchor`](Self::restore_anchor)
    /// to find where the view should scroll.
    pub fn refresh_all(&mut self) {
        let index = self.viewport.as_ref().map_or(0, |viewport| viewport.start);
        let identity = flatten::locate(&self.cache, index)
            .and_then(|location| self.cache.slot(&location.parent, location.index))
            .map(|slot| slot.id.clone());
        self.refresh.capture(index, identity);

        self.cache.mark_all_stale();
        let cancelled = self.fetch.cancel_all();
        self.keys.mark_all_unverified();
        tracing::debug!(target: targets::REFRESH, anchor = index, cancelled, "full refresh");
        self.signals.reset.emit(());
    }

    /// Settle the anchor captured by the last full refresh.
    ///
    /// Loads the anchored row first. Returns `None` if no anchor is pending or
    /// its identity is still unconfirmed; call again once more windows have
    /// arrived.
    pub fn restore_anchor(&mut self) -> Result<Option<AnchorOutcome<S::Id>>> {
        let Some(anchor) = self.refresh.anchor().cloned() else {
            return Ok(None);
        };
        self.load(anchor.index..anchor.index.saturating_add(1))?;

        let visible = anchor
            .identity
            .as_ref()
            .and_then(|id| Some((id, flatten::flat_index_of(&self.cache, id)?)));
        let state = match visible {
            Some((id, index)) if self.keys.is_verified(id) => AnchorState::Present(index),
            Some(_) => AnchorState::Pending,
            None => AnchorState::Gone,
        };
        let outcome = self.refresh.settle(state, self.total_size());
        if let Some(outcome) = &outcome {
            tracing::debug!(target: targets::REFRESH, ?outcome, "restored scroll anchor");
            self.signals.anchor_restored.emit(outcome.clone());
        }
        Ok(outcome)
    }

    /// Replace the data source, dropping every cached row, key and expansion.
    pub fn set_data_source(&mut self, source: S) -> Result<()> {
        let before = self.total_size();
        self.source = Arc::new(source);
        self.keys.reset();
        self.expansion.clear();
        self.cache.clear();
        self.fetch.reset();
        self.refresh.clear();
        self.viewport = None;
        self.count_of(&None)?;
        tracing::debug!(target: targets::HIERARCHY, "data source replaced");
        self.signals.reset.emit(());
        self.notify_size(before);
        Ok(())
    }

    /// Set the filter forwarded to every query, then refresh everything.
    pub fn set_filter(&mut self, filter: Option<&str>) {
        self.filter = filter.map(Arc::from);
        tracing::debug!(target: targets::HIERARCHY, filter = ?self.filter, "filter changed");
        self.refresh_all();
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// The key of a cached identity.
    pub fn key_of(&self, id: &S::Id) -> Option<ItemKey> {
        self.keys.key_of(id)
    }

    /// The identity behind a key.
    pub fn identity_of(&self, key: &ItemKey) -> Result<&S::Id> {
        self.keys.get(key)
    }

    /// Keep a key, and its row, alive through eviction and refetches.
    pub fn pin_key(&mut self, key: &ItemKey) -> Result<()> {
        self.keys.pin(key)
    }

    pub fn unpin_key(&mut self, key: &ItemKey) -> Result<()> {
        self.keys.unpin(key)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn parent_item(&self, parent: &Option<S::Id>) -> Result<Option<S::Item>> {
        match parent {
            None => Ok(None),
            Some(id) => self
                .cache
                .item(id)
                .map(|cached| Some(cached.item.clone()))
                .ok_or_else(|| HierarchyError::unknown_identity(id)),
        }
    }

    /// The child count of `parent`, queried if unknown or invalidated.
    fn count_of(&mut self, parent: &Option<S::Id>) -> Result<ChildCount> {
        if let Some(count) = self.cache.fresh_count(parent) {
            return Ok(count);
        }
        let query = HierarchicalQuery::count(self.parent_item(parent)?).with_filter(self.filter.clone());
        let count = self.source.child_count(&query)?;
        if self.cache.set_count(parent, count) {
            tracing::trace!(target: targets::CACHE, ?parent, %count, size = %self.cache.size(parent), "child count changed");
        }
        Ok(count)
    }

    fn apply_empty_policy(&mut self, parent: &Option<S::Id>) {
        let Some(id) = parent else {
            return;
        };
        if self.config.empty_expanded_policy == EmptyExpandedPolicy::Collapse
            && self.expansion.is_expanded(id)
            && self.cache.fresh_count(parent) == Some(ChildCount::ZERO)
        {
            tracing::debug!(target: targets::EXPANSION, ?id, "collapsing expanded item without children");
            self.collapse_inner(id);
        }
    }

    fn notify_size(&self, before: ChildCount) {
        let after = self.total_size();
        if after != before {
            self.signals.size_changed.emit(after);
        }
    }

    /// Evict rows far from the viewport until the cache fits its capacity.
    ///
    /// Expanded items, pinned keys and items with cached children are kept.
    fn evict_if_needed(&mut self) {
        let Some(capacity) = self.config.cache_capacity else {
            return;
        };
        let excess = self.cache.len().saturating_sub(capacity);
        if excess == 0 {
            return;
        }
        let viewport = self.viewport.clone().unwrap_or(0..0);
        let mut candidates: Vec<(usize, S::Id)> = self
            .cache
            .ids()
            .filter(|id| {
                !self.expansion.is_expanded(id)
                    && !self.keys.is_pinned(id)
                    && !self.cache.has_cached_children(id)
            })
            .map(|id| {
                let distance = flatten::flat_index_of(&self.cache, id)
                    .map_or(usize::MAX, |flat| distance_from(flat, &viewport));
                (distance, id.clone())
            })
            .filter(|(distance, _)| *distance > 0)
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let victims: Vec<S::Id> = candidates.into_iter().take(excess).map(|(_, id)| id).collect();
        if !victims.is_empty() {
            self.cache.evict(&victims, &mut self.keys);
        }
    }
}

/// Distance in rows from `flat` to the nearest row of `viewport`; 0 inside it.
fn distance_from(flat: usize, viewport: &Range<usize>) -> usize {
    if flat < viewport.start {
        viewport.start - flat
    } else if flat >= viewport.end {
        flat - viewport.end + 1
    } else {
        0
    }
}

impl<S: HierarchicalDataSource> fmt::Debug for HierarchyEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchyEngine")
            .field("total_size", &self.total_size())
            .field("cached_items", &self.cache.len())
            .field("expanded", &self.expansion.expanded_count())
            .field("keys", &self.keys.len())
            .field("fetch", &self.fetch)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(
    HierarchyEngine<crate::source::TreeDataSource<String, String>>: Send, Sync
);
static_assertions::assert_impl_all!(
    HierarchyEngine<crate::source::CallbackDataSource<u64, u64>>: Send, Sync
);
