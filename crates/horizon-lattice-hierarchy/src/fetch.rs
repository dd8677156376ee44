//! Window planning, in-flight bookkeeping and fetch dispatch.
//!
//! A flat range is turned into per-parent child spans by the flattener; each
//! span is turned into the smallest set of `(parent, offset, limit)` windows
//! covering its unloaded or stale children, widened by prefetch pages. Every
//! window is one [`FetchTask`].
//!
//! The in-flight table guarantees at most one live request per triple. A new
//! request for the same parent and offset with a different limit supersedes
//! the older one: the older result is discarded when it arrives. Results are
//! written with the issue sequence of their request, so a later-issued
//! request wins over an earlier one regardless of arrival order.
//!
//! Tasks run according to the configured [`DispatchMode`]:
//!
//! - `Inline`: on the calling thread, results applied before `ensure_loaded` returns
//! - `Deferred`: queued for the host, see [`HierarchyEngine::take_tasks`](crate::HierarchyEngine::take_tasks)
//! - `ThreadPool`: on a rayon pool, results returned over a channel

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, unbounded};
use rayon::{ThreadPool as RayonThreadPool, ThreadPoolBuilder};
use slotmap::{SlotMap, new_key_type};

use crate::config::DispatchMode;
use crate::count::ChildCount;
use crate::error::{DataSourceError, FetchError, HierarchyError, Result};
use crate::logging::targets;
use crate::source::{HierarchicalDataSource, HierarchicalQuery};

new_key_type! {
    /// Identifies one issued fetch request.
    pub struct RequestId;
}

/// A window of children: `limit` children of `parent` starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTriple<Id> {
    /// The parent, `None` for the root level.
    pub parent: Option<Id>,
    pub offset: usize,
    pub limit: usize,
}

impl<Id> FetchTriple<Id> {
    pub fn new(parent: Option<Id>, offset: usize, limit: usize) -> Self {
        Self {
            parent,
            offset,
            limit,
        }
    }

    /// The child indices covered by the window.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.limit
    }
}

impl<Id: fmt::Debug> fmt::Display for FetchTriple<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "({parent:?}, {}, {})", self.offset, self.limit),
            None => write!(f, "(root, {}, {})", self.offset, self.limit),
        }
    }
}

/// A fetch that produced no rows, tied to its window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure<Id> {
    pub triple: FetchTriple<Id>,
    pub error: FetchError,
}

impl<Id: fmt::Debug> FetchFailure<Id> {
    /// Convert into a crate error.
    pub fn into_error(self) -> HierarchyError {
        HierarchyError::FetchFailed {
            triple: self.triple.to_string(),
            source: self.error,
        }
    }
}

/// Why a completion was dropped without touching the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// A newer request for the same parent and offset replaced it.
    Superseded,
    /// The parent was collapsed or refreshed after the request was issued.
    Cancelled,
    /// The parent was removed from the cache, or its state was rebuilt.
    StaleParent,
    /// The request is not known, e.g. after the data source was replaced.
    UnknownRequest,
}

/// What applying one completion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome<Id> {
    /// Rows were written to the cache.
    Applied { triple: FetchTriple<Id>, rows: usize },
    /// The fetch failed or its rows were rejected.
    Failed(FetchFailure<Id>),
    /// The result arrived for a request that is no longer wanted.
    Discarded {
        triple: Option<FetchTriple<Id>>,
        reason: DiscardReason,
    },
}

/// Summary of the fetch activity caused by one engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport<Id> {
    /// Windows issued to the data source, in issue order.
    pub issued: Vec<FetchTriple<Id>>,
    /// Windows already covered by live requests.
    pub attached: usize,
    /// Live requests replaced by newer ones.
    pub superseded: usize,
    /// Completions written to the cache.
    pub applied: usize,
    /// Completions dropped on arrival.
    pub discarded: usize,
    pub failures: Vec<FetchFailure<Id>>,
}

impl<Id> Default for LoadReport<Id> {
    fn default() -> Self {
        Self {
            issued: Vec::new(),
            attached: 0,
            superseded: 0,
            applied: 0,
            discarded: 0,
            failures: Vec::new(),
        }
    }
}

impl<Id: fmt::Debug> LoadReport<Id> {
    /// Returns `true` if no fetch failed.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn the first failure into an error.
    pub fn into_result(mut self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(self.failures.remove(0).into_error())
        }
    }

    pub(crate) fn record(&mut self, outcome: &CompletionOutcome<Id>)
    where
        Id: Clone,
    {
        match outcome {
            CompletionOutcome::Applied { .. } => self.applied += 1,
            CompletionOutcome::Failed(failure) => self.failures.push(failure.clone()),
            CompletionOutcome::Discarded { .. } => self.discarded += 1,
        }
    }
}

/// A window fetch ready to run.
///
/// Tasks are self-contained: [`run`](Self::run) may be called on any thread.
pub struct FetchTask<S: HierarchicalDataSource> {
    request: RequestId,
    triple: FetchTriple<S::Id>,
    query: HierarchicalQuery<S::Item>,
    source: Arc<S>,
}

impl<S: HierarchicalDataSource> FetchTask<S> {
    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn triple(&self) -> &FetchTriple<S::Id> {
        &self.triple
    }

    /// Call the data source.
    pub fn run(self) -> FetchCompletion<S::Id, S::Item> {
        let result = self.source.fetch_children(&self.query).map(|items| {
            items
                .into_iter()
                .map(|item| (self.source.id_of(&item), item))
                .collect()
        });
        FetchCompletion {
            request: self.request,
            result,
        }
    }
}

impl<S: HierarchicalDataSource> fmt::Debug for FetchTask<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchTask")
            .field("request", &self.request)
            .field("triple", &self.triple)
            .finish_non_exhaustive()
    }
}

/// The result of a [`FetchTask`], to be handed back to the engine.
pub struct FetchCompletion<Id, T> {
    request: RequestId,
    result: std::result::Result<Vec<(Id, T)>, DataSourceError>,
}

impl<Id, T> FetchCompletion<Id, T> {
    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub(crate) fn into_result(self) -> std::result::Result<Vec<(Id, T)>, DataSourceError> {
        self.result
    }
}

impl<Id, T> fmt::Debug for FetchCompletion<Id, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCompletion")
            .field("request", &self.request)
            .field(
                "rows",
                &self.result.as_ref().map(|rows| rows.len()).map_err(|e| e.to_string()),
            )
            .finish()
    }
}

/// Inputs for planning the windows of one parent.
#[derive(Debug, Clone)]
pub(crate) struct PlanInput {
    /// Child indices the caller needs.
    pub(crate) span: Range<usize>,
    pub(crate) count: ChildCount,
    /// Nothing was ever loaded or requested for this parent.
    pub(crate) first_load: bool,
    pub(crate) page_size: usize,
    pub(crate) prefetch_pages: usize,
    pub(crate) eager_first_page: bool,
    /// Fetch the whole child list at once.
    pub(crate) whole_list: bool,
}

/// Plan the windows covering the unloaded or stale children of `input.span`.
///
/// `is_settled` reports whether a child index needs no fetch: it holds a fresh
/// row, or a live request already covers it. Settled rows are never requested
/// again; windows only grow over stale or missing rows.
pub(crate) fn plan_windows(input: &PlanInput, is_settled: impl Fn(usize) -> bool) -> Vec<Range<usize>> {
    let span = input.span.start..input.count.clamp_end(input.span.end);
    if span.is_empty() {
        return Vec::new();
    }

    if input.whole_list {
        if let ChildCount::Known(n) = input.count {
            return stale_runs(0..n, &is_settled);
        }
    }

    if input.first_load && input.eager_first_page && span.start == 0 {
        let first = 0..input.count.clamp_end(input.page_size);
        let second = first.end..input.count.clamp_end(input.page_size + span.len());
        return [first, second].into_iter().filter(|w| !w.is_empty()).collect();
    }

    let mut runs = stale_runs(span, &is_settled);
    let widen = input.page_size.saturating_mul(input.prefetch_pages);
    if let Some(first) = runs.first_mut() {
        let low = first.start.saturating_sub(widen);
        while first.start > low && !is_settled(first.start - 1) {
            first.start -= 1;
        }
    }
    if let Some(last) = runs.last_mut() {
        let high = input.count.clamp_end(last.end.saturating_add(widen));
        while last.end < high && !is_settled(last.end) {
            last.end += 1;
        }
    }
    runs
}

/// Maximal runs of indices in `range` that are not settled.
fn stale_runs(range: Range<usize>, is_settled: &impl Fn(usize) -> bool) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    for index in range {
        if is_settled(index) {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.end == index => run.end += 1,
            _ => runs.push(index..index + 1),
        }
    }
    runs
}

/// How [`FetchCoordinator::issue`] handled a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Issue {
    Issued(RequestId),
    /// Covered by live requests; nothing was sent.
    Attached,
    /// Sent, replacing a live request with the same parent and offset.
    Superseded(RequestId),
}

#[derive(Debug)]
pub(crate) struct Request<Id> {
    pub(crate) triple: FetchTriple<Id>,
    pub(crate) seq: u64,
    pub(crate) epoch: u64,
    dropped: Option<DiscardReason>,
}

enum Dispatcher<S: HierarchicalDataSource> {
    Inline(VecDeque<FetchCompletion<S::Id, S::Item>>),
    Deferred(VecDeque<FetchTask<S>>),
    ThreadPool {
        pool: RayonThreadPool,
        sender: Sender<FetchCompletion<S::Id, S::Item>>,
        receiver: Receiver<FetchCompletion<S::Id, S::Item>>,
    },
}

impl<S: HierarchicalDataSource> Dispatcher<S> {
    fn new(mode: DispatchMode) -> Result<Self> {
        Ok(match mode {
            DispatchMode::Inline => Self::Inline(VecDeque::new()),
            DispatchMode::Deferred => Self::Deferred(VecDeque::new()),
            DispatchMode::ThreadPool { threads } => {
                let mut builder =
                    ThreadPoolBuilder::new().thread_name(|index| format!("hierarchy-fetch-{index}"));
                if let Some(threads) = threads {
                    builder = builder.num_threads(threads);
                }
                let pool = builder
                    .build()
                    .map_err(|e| HierarchyError::ThreadPool(e.to_string()))?;
                let (sender, receiver) = unbounded();
                Self::ThreadPool {
                    pool,
                    sender,
                    receiver,
                }
            }
        })
    }

    fn dispatch(&mut self, task: FetchTask<S>) {
        match self {
            Self::Inline(ready) => ready.push_back(task.run()),
            Self::Deferred(queue) => queue.push_back(task),
            Self::ThreadPool { pool, sender, .. } => {
                let sender = sender.clone();
                pool.spawn(move || {
                    let completion = task.run();
                    if sender.send(completion).is_err() {
                        tracing::trace!(target: targets::FETCH, "engine dropped before fetch completed");
                    }
                });
            }
        }
    }
}

/// The in-flight table and the dispatcher.
pub(crate) struct FetchCoordinator<S: HierarchicalDataSource> {
    requests: SlotMap<RequestId, Request<S::Id>>,
    live: HashMap<FetchTriple<S::Id>, RequestId>,
    next_seq: u64,
    dispatcher: Dispatcher<S>,
}

impl<S: HierarchicalDataSource> FetchCoordinator<S> {
    pub(crate) fn new(mode: DispatchMode) -> Result<Self> {
        Ok(Self {
            requests: SlotMap::with_key(),
            live: HashMap::new(),
            next_seq: 1,
            dispatcher: Dispatcher::new(mode)?,
        })
    }

    /// Take the next issue sequence number.
    pub(crate) fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Issue a window unless live requests already cover it.
    pub(crate) fn issue(
        &mut self,
        triple: FetchTriple<S::Id>,
        epoch: u64,
        query: HierarchicalQuery<S::Item>,
        source: &Arc<S>,
    ) -> Issue {
        if self.live.contains_key(&triple) || self.covered(&triple.parent, triple.range()) {
            tracing::debug!(target: targets::FETCH, %triple, "attached to in-flight request");
            return Issue::Attached;
        }

        let replaced: Vec<FetchTriple<S::Id>> = self
            .live
            .keys()
            .filter(|live| live.parent == triple.parent && live.offset == triple.offset)
            .cloned()
            .collect();
        for old in &replaced {
            if let Some(id) = self.live.remove(old) {
                if let Some(request) = self.requests.get_mut(id) {
                    request.dropped = Some(DiscardReason::Superseded);
                }
                tracing::debug!(target: targets::FETCH, superseded = %old, by = %triple, "superseded request");
            }
        }

        let seq = self.next_seq();
        let request = self.requests.insert(Request {
            triple: triple.clone(),
            seq,
            epoch,
            dropped: None,
        });
        self.live.insert(triple.clone(), request);
        tracing::debug!(target: targets::FETCH, %triple, seq, "issued fetch");
        self.dispatcher.dispatch(FetchTask {
            request,
            triple,
            query,
            source: Arc::clone(source),
        });

        if replaced.is_empty() {
            Issue::Issued(request)
        } else {
            Issue::Superseded(request)
        }
    }

    /// Returns `true` if live requests for `parent` jointly cover `range`.
    pub(crate) fn covered(&self, parent: &Option<S::Id>, range: Range<usize>) -> bool {
        let mut windows: Vec<Range<usize>> = self
            .live
            .keys()
            .filter(|live| &live.parent == parent)
            .map(FetchTriple::range)
            .collect();
        windows.sort_by_key(|window| window.start);
        let mut reached = range.start;
        for window in windows {
            if window.start > reached {
                break;
            }
            reached = reached.max(window.end);
            if reached >= range.end {
                return true;
            }
        }
        range.is_empty()
    }

    /// Returns `true` if a live request for `parent` covers child `index`.
    pub(crate) fn covers(&self, parent: &Option<S::Id>, index: usize) -> bool {
        self.live
            .keys()
            .any(|live| &live.parent == parent && live.range().contains(&index))
    }

    /// Returns `true` if any live request targets `parent`.
    pub(crate) fn has_live(&self, parent: &Option<S::Id>) -> bool {
        self.live.keys().any(|live| &live.parent == parent)
    }

    /// Drop the live requests under `parent`; their results will be discarded.
    pub(crate) fn cancel_parent(&mut self, parent: &Option<S::Id>) -> usize {
        let cancelled: Vec<FetchTriple<S::Id>> = self
            .live
            .keys()
            .filter(|live| &live.parent == parent)
            .cloned()
            .collect();
        for triple in &cancelled {
            self.drop_live(triple, DiscardReason::Cancelled);
        }
        if !cancelled.is_empty() {
            tracing::debug!(target: targets::FETCH, ?parent, cancelled = cancelled.len(), "cancelled requests");
        }
        cancelled.len()
    }

    /// Drop every live request.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let cancelled: Vec<FetchTriple<S::Id>> = self.live.keys().cloned().collect();
        for triple in &cancelled {
            self.drop_live(triple, DiscardReason::Cancelled);
        }
        cancelled.len()
    }

    fn drop_live(&mut self, triple: &FetchTriple<S::Id>, reason: DiscardReason) {
        if let Some(id) = self.live.remove(triple) {
            if let Some(request) = self.requests.get_mut(id) {
                request.dropped = Some(reason);
            }
        }
    }

    /// Forget every request. Results still arriving are unknown requests.
    pub(crate) fn reset(&mut self) {
        self.requests.clear();
        self.live.clear();
        match &mut self.dispatcher {
            Dispatcher::Inline(ready) => ready.clear(),
            Dispatcher::Deferred(queue) => queue.clear(),
            Dispatcher::ThreadPool { .. } => {}
        }
    }

    /// Close the request behind a completion.
    ///
    /// Fails with the reason the result must be discarded.
    pub(crate) fn finish(
        &mut self,
        request: RequestId,
    ) -> std::result::Result<Request<S::Id>, (Option<FetchTriple<S::Id>>, DiscardReason)> {
        let Some(entry) = self.requests.remove(request) else {
            return Err((None, DiscardReason::UnknownRequest));
        };
        if let Some(reason) = entry.dropped {
            return Err((Some(entry.triple), reason));
        }
        if self.live.get(&entry.triple) == Some(&request) {
            self.live.remove(&entry.triple);
        }
        Ok(entry)
    }

    /// Number of live requests.
    pub(crate) fn in_flight_count(&self) -> usize {
        self.live.len()
    }

    /// Requests issued and not yet finished, live or dropped.
    pub(crate) fn outstanding(&self) -> usize {
        self.requests.len()
    }

    /// Hand queued tasks to the host, skipping those already superseded or cancelled.
    pub(crate) fn take_tasks(&mut self) -> Vec<FetchTask<S>> {
        let Dispatcher::Deferred(queue) = &mut self.dispatcher else {
            return Vec::new();
        };
        let mut tasks = Vec::with_capacity(queue.len());
        for task in queue.drain(..) {
            let dropped = self
                .requests
                .get(task.request)
                .is_none_or(|request| request.dropped.is_some());
            if dropped {
                self.requests.remove(task.request);
                tracing::trace!(target: targets::FETCH, triple = %task.triple, "skipped dropped task");
            } else {
                tasks.push(task);
            }
        }
        tasks
    }

    /// Completions that are ready without blocking.
    pub(crate) fn ready(&mut self) -> Vec<FetchCompletion<S::Id, S::Item>> {
        match &mut self.dispatcher {
            Dispatcher::Inline(ready) => ready.drain(..).collect(),
            Dispatcher::Deferred(_) => Vec::new(),
            Dispatcher::ThreadPool { receiver, .. } => receiver.try_iter().collect(),
        }
    }

    /// Block until a thread pool completion arrives or `deadline` passes.
    pub(crate) fn wait(&mut self, deadline: Instant) -> Option<FetchCompletion<S::Id, S::Item>> {
        match &mut self.dispatcher {
            Dispatcher::ThreadPool { receiver, .. } => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                receiver.recv_timeout(timeout).ok()
            }
            Dispatcher::Inline(ready) => ready.pop_front(),
            Dispatcher::Deferred(_) => None,
        }
    }
}

impl<S: HierarchicalDataSource> fmt::Debug for FetchCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.dispatcher {
            Dispatcher::Inline(_) => "inline",
            Dispatcher::Deferred(_) => "deferred",
            Dispatcher::ThreadPool { .. } => "thread_pool",
        };
        f.debug_struct("FetchCoordinator")
            .field("mode", &mode)
            .field("live", &self.live.len())
            .field("outstanding", &self.requests.len())
            .finish()
    }
}
