//! The window cache: per-parent child slots, child counts and subtree sizes.
//!
//! Each parent (the root is the parent `None`) owns a [`ParentState`] holding
//! the child count reported by the source, the cached child slots keyed by
//! child index, and the indices of loaded children that are expanded. An
//! identity lives in at most one slot at a time.
//!
//! The size of a parent is its child count plus the sizes of its expanded,
//! loaded children. It is memoized per parent and recomputed bottom-up along
//! the ancestor chain whenever a count or an expanded set changes; the walk
//! stops at the first ancestor whose size did not move.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::count::ChildCount;
use crate::error::{HierarchyError, Result};
use crate::expansion::ExpansionModel;
use crate::key_mapper::KeyMapper;
use crate::logging::targets;

/// One cached child.
#[derive(Debug, Clone)]
pub(crate) struct Slot<Id> {
    pub(crate) id: Id,
    /// Issue sequence of the request that wrote this slot.
    pub(crate) seq: u64,
    pub(crate) fresh: bool,
    pub(crate) loaded_at: Instant,
}

/// Cached knowledge about the children of one parent.
#[derive(Debug)]
pub(crate) struct ParentState<Id> {
    pub(crate) count: Option<ChildCount>,
    pub(crate) count_stale: bool,
    pub(crate) slots: BTreeMap<usize, Slot<Id>>,
    pub(crate) expanded: BTreeMap<usize, Id>,
    pub(crate) size: ChildCount,
    pub(crate) epoch: u64,
}

impl<Id> ParentState<Id> {
    fn new(epoch: u64) -> Self {
        Self {
            count: None,
            count_stale: false,
            slots: BTreeMap::new(),
            expanded: BTreeMap::new(),
            size: ChildCount::ZERO,
            epoch,
        }
    }

    /// The child count, treating a never-queried count as empty.
    pub(crate) fn count_or_zero(&self) -> ChildCount {
        self.count.unwrap_or(ChildCount::ZERO)
    }
}

/// A cached item and where it sits.
#[derive(Debug, Clone)]
pub(crate) struct CachedItem<T, Id> {
    pub(crate) item: T,
    pub(crate) parent: Option<Id>,
    pub(crate) index: usize,
}

/// A fetched window ready to be written into the cache.
#[derive(Debug)]
pub(crate) struct Ingest<T, Id> {
    pub(crate) parent: Option<Id>,
    pub(crate) offset: usize,
    pub(crate) limit: usize,
    pub(crate) seq: u64,
    pub(crate) rows: Vec<(Id, T)>,
}

/// What an ingestion changed.
#[derive(Debug)]
pub(crate) struct IngestOutcome<Id> {
    /// Rows actually written; older-sequence writes are skipped.
    pub(crate) written: usize,
    pub(crate) size_changed: bool,
    /// Loaded items that are expanded but whose own count is not known yet.
    pub(crate) needs_count: Vec<Id>,
}

#[derive(Debug)]
pub(crate) struct HierarchyCache<T, Id> {
    parents: HashMap<Option<Id>, ParentState<Id>>,
    items: HashMap<Id, CachedItem<T, Id>>,
    next_epoch: u64,
    ttl: Option<Duration>,
}

impl<T, Id> HierarchyCache<T, Id>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    pub(crate) fn new(ttl: Option<Duration>) -> Self {
        let mut cache = Self {
            parents: HashMap::new(),
            items: HashMap::new(),
            next_epoch: 1,
            ttl,
        };
        cache.ensure_state(&None);
        cache
    }

    /// Drop everything, keeping only an empty root.
    pub(crate) fn clear(&mut self) {
        self.parents.clear();
        self.items.clear();
        self.ensure_state(&None);
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub(crate) fn state(&self, parent: &Option<Id>) -> Option<&ParentState<Id>> {
        self.parents.get(parent)
    }

    pub(crate) fn item(&self, id: &Id) -> Option<&CachedItem<T, Id>> {
        self.items.get(id)
    }

    pub(crate) fn contains(&self, id: &Id) -> bool {
        self.items.contains_key(id)
    }

    /// Number of cached items.
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = &Id> {
        self.items.keys()
    }

    /// Flat rows contributed by the children of `parent`.
    pub(crate) fn size(&self, parent: &Option<Id>) -> ChildCount {
        self.parents
            .get(parent)
            .map_or(ChildCount::ZERO, |state| state.size)
    }

    pub(crate) fn count(&self, parent: &Option<Id>) -> Option<ChildCount> {
        self.parents.get(parent).and_then(|state| state.count)
    }

    /// The count of `parent` if it is known and not invalidated.
    pub(crate) fn fresh_count(&self, parent: &Option<Id>) -> Option<ChildCount> {
        self.parents
            .get(parent)
            .filter(|state| !state.count_stale)
            .and_then(|state| state.count)
    }

    pub(crate) fn epoch(&self, parent: &Option<Id>) -> Option<u64> {
        self.parents.get(parent).map(|state| state.epoch)
    }

    pub(crate) fn slot(&self, parent: &Option<Id>, index: usize) -> Option<&Slot<Id>> {
        self.parents.get(parent)?.slots.get(&index)
    }

    /// The loaded item at `index` under `parent`, fresh or stale.
    pub(crate) fn item_at(&self, parent: &Option<Id>, index: usize) -> Option<&T> {
        let slot = self.slot(parent, index)?;
        self.items.get(&slot.id).map(|cached| &cached.item)
    }

    pub(crate) fn is_fresh(&self, slot: &Slot<Id>, now: Instant) -> bool {
        slot.fresh
            && self
                .ttl
                .is_none_or(|ttl| now.saturating_duration_since(slot.loaded_at) < ttl)
    }

    pub(crate) fn is_slot_fresh(&self, parent: &Option<Id>, index: usize, now: Instant) -> bool {
        self.slot(parent, index)
            .is_some_and(|slot| self.is_fresh(slot, now))
    }

    /// Children of `parent` in index order, when every one of them is cached and fresh.
    pub(crate) fn fresh_children(&self, parent: &Option<Id>, now: Instant) -> Option<Vec<Id>> {
        let state = self.parents.get(parent)?;
        if state.count_stale {
            return None;
        }
        let n = state.count?.known()?;
        (0..n)
            .map(|index| {
                state
                    .slots
                    .get(&index)
                    .filter(|slot| self.is_fresh(slot, now))
                    .map(|slot| slot.id.clone())
            })
            .collect()
    }

    /// Cached children of `parent`, fresh or stale.
    pub(crate) fn cached_children(&self, parent: &Option<Id>) -> Vec<Id> {
        self.parents
            .get(parent)
            .map(|state| state.slots.values().map(|slot| slot.id.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn has_cached_children(&self, id: &Id) -> bool {
        self.parents
            .get(&Some(id.clone()))
            .is_some_and(|state| !state.slots.is_empty())
    }

    /// Depth of a cached item; root children are at depth 0.
    pub(crate) fn depth_of(&self, id: &Id) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.items.get(id)?;
        while let Some(parent) = &current.parent {
            current = self.items.get(parent)?;
            depth += 1;
        }
        Some(depth)
    }

    /// Every identity registered as expanded, under any parent.
    pub(crate) fn registered_expanded(&self) -> impl Iterator<Item = &Id> {
        self.parents.values().flat_map(|state| state.expanded.values())
    }

    /// Returns `true` if `id` is registered as expanded in its parent.
    pub(crate) fn is_registered_expanded(&self, id: &Id) -> bool {
        self.items.get(id).is_some_and(|cached| {
            self.parents
                .get(&cached.parent)
                .and_then(|state| state.expanded.get(&cached.index))
                .is_some_and(|registered| registered == id)
        })
    }

    // -------------------------------------------------------------------------
    // Counts, epochs and staleness
    // -------------------------------------------------------------------------

    /// Make sure `parent` has a state, giving new states a fresh epoch.
    pub(crate) fn ensure_state(&mut self, parent: &Option<Id>) {
        if !self.parents.contains_key(parent) {
            let epoch = self.take_epoch();
            self.parents.insert(parent.clone(), ParentState::new(epoch));
        }
    }

    /// Invalidate in-flight fetches under `parent`.
    pub(crate) fn bump_epoch(&mut self, parent: &Option<Id>) {
        let epoch = self.take_epoch();
        if let Some(state) = self.parents.get_mut(parent) {
            state.epoch = epoch;
        }
    }

    fn take_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    /// Record the child count of `parent`. Returns `true` if the size of `parent` changed.
    ///
    /// Rows at or past a known count become stale rather than dropped, so an
    /// identity that reappears at a lower index keeps its key.
    pub(crate) fn set_count(&mut self, parent: &Option<Id>, count: ChildCount) -> bool {
        self.ensure_state(parent);
        let before = self.size(parent);
        if let Some(state) = self.parents.get_mut(parent) {
            state.count = Some(count);
            state.count_stale = false;
            if let ChildCount::Known(n) = count {
                for slot in state.slots.range_mut(n..).map(|(_, slot)| slot) {
                    slot.fresh = false;
                }
                state.expanded.split_off(&n);
            }
        }
        self.recompute_up(parent);
        before != self.size(parent)
    }

    pub(crate) fn mark_item_stale(&mut self, id: &Id) -> bool {
        let Some(cached) = self.items.get(id) else {
            return false;
        };
        match self
            .parents
            .get_mut(&cached.parent)
            .and_then(|state| state.slots.get_mut(&cached.index))
        {
            Some(slot) => {
                slot.fresh = false;
                true
            }
            None => false,
        }
    }

    /// Mark the count and every cached window of `parent` stale and bump its epoch.
    pub(crate) fn mark_children_stale(&mut self, parent: &Option<Id>) -> bool {
        let epoch = self.take_epoch();
        let Some(state) = self.parents.get_mut(parent) else {
            return false;
        };
        state.count_stale = true;
        state.epoch = epoch;
        for slot in state.slots.values_mut() {
            slot.fresh = false;
        }
        true
    }

    pub(crate) fn mark_all_stale(&mut self) {
        let parents: Vec<Option<Id>> = self.parents.keys().cloned().collect();
        for parent in &parents {
            self.mark_children_stale(parent);
        }
        tracing::debug!(target: targets::CACHE, parents = parents.len(), "marked every window stale");
    }

    // -------------------------------------------------------------------------
    // Expansion bookkeeping
    // -------------------------------------------------------------------------

    /// Register a cached `id` in its parent's expanded set.
    ///
    /// Returns `true` if it was not registered before.
    pub(crate) fn register_expanded(&mut self, id: &Id) -> bool {
        let Some(cached) = self.items.get(id) else {
            return false;
        };
        let parent = cached.parent.clone();
        let index = cached.index;
        self.ensure_state(&Some(id.clone()));
        let inserted = match self.parents.get_mut(&parent) {
            Some(state) => state.expanded.insert(index, id.clone()).is_none(),
            None => false,
        };
        self.recompute_up(&parent);
        inserted
    }

    /// Remove `id` from its parent's expanded set.
    pub(crate) fn unregister_expanded(&mut self, id: &Id) -> bool {
        let Some(cached) = self.items.get(id) else {
            return false;
        };
        let parent = cached.parent.clone();
        let index = cached.index;
        let removed = match self.parents.get_mut(&parent) {
            Some(state) if state.expanded.get(&index) == Some(id) => {
                state.expanded.remove(&index);
                true
            }
            _ => false,
        };
        if removed {
            self.recompute_up(&parent);
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Write a fetched window.
    ///
    /// Fails without touching anything when the window repeats an identity or
    /// names an identity that a fresh slot outside the window already holds.
    pub(crate) fn ingest(
        &mut self,
        batch: Ingest<T, Id>,
        keys: &mut KeyMapper<Id>,
        expansion: &ExpansionModel<Id>,
        now: Instant,
    ) -> Result<IngestOutcome<Id>> {
        let Ingest {
            parent,
            offset,
            limit,
            seq,
            rows,
        } = batch;
        if !self.parents.contains_key(&parent) {
            return Err(match &parent {
                Some(id) => HierarchyError::unknown_identity(id),
                None => HierarchyError::unknown_identity(&"root"),
            });
        }
        let end = offset + rows.len();

        let mut batch_ids = HashSet::with_capacity(rows.len());
        for (id, _) in &rows {
            if !batch_ids.insert(id.clone()) {
                tracing::error!(target: targets::CACHE, ?id, ?parent, offset, "identity repeated within one window");
                return Err(HierarchyError::collision(id));
            }
            if let Some(existing) = self.items.get(id) {
                let inside = existing.parent == parent && (offset..end).contains(&existing.index);
                let fresh = self
                    .slot(&existing.parent, existing.index)
                    .is_some_and(|slot| self.is_fresh(slot, now));
                if !inside && fresh {
                    tracing::error!(
                        target: targets::CACHE,
                        ?id,
                        held_by = ?existing.parent,
                        held_at = existing.index,
                        "identity already held by a fresh row"
                    );
                    return Err(HierarchyError::collision(id));
                }
            }
        }

        let mut outcome = IngestOutcome {
            written: 0,
            size_changed: false,
            needs_count: Vec::new(),
        };
        let mut touched = vec![parent.clone()];

        for (k, (id, item)) in rows.into_iter().enumerate() {
            let index = offset + k;

            if let Some(slot) = self.slot(&parent, index) {
                if slot.seq > seq {
                    tracing::trace!(target: targets::CACHE, index, slot_seq = slot.seq, seq, "kept newer row");
                    continue;
                }
                if slot.id != id {
                    let displaced = slot.id.clone();
                    self.remove_slot(&parent, index, &displaced);
                    if !batch_ids.contains(&displaced) {
                        tracing::trace!(target: targets::CACHE, ?displaced, index, "row contradicted by refetch");
                        self.release(&displaced, keys);
                    }
                }
            }

            if let Some(existing) = self.items.get(&id) {
                if existing.parent != parent || existing.index != index {
                    let old_parent = existing.parent.clone();
                    let old_index = existing.index;
                    self.remove_slot(&old_parent, old_index, &id);
                    tracing::trace!(target: targets::CACHE, ?id, from = ?old_parent, old_index, index, "row moved");
                    if old_parent != parent {
                        touched.push(old_parent);
                    }
                }
            }

            keys.key(&id);
            keys.verify(&id);
            let expanded = expansion.is_expanded(&id);
            if expanded
                && self
                    .parents
                    .get(&Some(id.clone()))
                    .is_none_or(|state| state.count.is_none() || state.count_stale)
            {
                outcome.needs_count.push(id.clone());
            }
            self.items.insert(
                id.clone(),
                CachedItem {
                    item,
                    parent: parent.clone(),
                    index,
                },
            );
            if expanded {
                self.ensure_state(&Some(id.clone()));
            }
            if let Some(state) = self.parents.get_mut(&parent) {
                if expanded {
                    state.expanded.insert(index, id.clone());
                }
                state.slots.insert(
                    index,
                    Slot {
                        id,
                        seq,
                        fresh: true,
                        loaded_at: now,
                    },
                );
            }
            outcome.written += 1;
        }

        let short = end - offset < limit;
        // An empty page past the first window says nothing about where the list ends.
        let returned = end > offset || offset == 0;
        match self.count(&parent) {
            Some(ChildCount::Known(count)) if short && count > end => {
                tracing::warn!(
                    target: targets::CACHE,
                    ?parent,
                    count,
                    returned_end = end,
                    "short page below the reported child count; count will be re-queried"
                );
                if let Some(state) = self.parents.get_mut(&parent) {
                    state.count_stale = true;
                }
            }
            Some(ChildCount::Known(count)) if returned && end > count => {
                tracing::warn!(
                    target: targets::CACHE,
                    ?parent,
                    count,
                    returned_end = end,
                    "rows returned past the reported child count"
                );
                outcome.size_changed |= self.set_count(&parent, ChildCount::Known(end));
            }
            Some(ChildCount::Known(_)) => {}
            Some(ChildCount::Unknown) | None if short && returned => {
                tracing::debug!(target: targets::CACHE, ?parent, count = end, "short page fixed an unknown count");
                outcome.size_changed |= self.set_count(&parent, ChildCount::Known(end));
            }
            Some(ChildCount::Unknown) | None => {}
        }

        for parent in &touched {
            let before = self.size(parent);
            self.recompute_up(parent);
            outcome.size_changed |= before != self.size(parent);
        }
        tracing::trace!(target: targets::CACHE, ?parent, offset, written = outcome.written, "ingested window");
        Ok(outcome)
    }

    /// Replace the payload of a cached item in place.
    pub(crate) fn replace_item(&mut self, id: &Id, item: T) -> Option<(Option<Id>, usize)> {
        let cached = self.items.get_mut(id)?;
        cached.item = item;
        Some((cached.parent.clone(), cached.index))
    }

    /// Evict the given items and whatever is cached beneath them.
    pub(crate) fn evict(&mut self, victims: &[Id], keys: &mut KeyMapper<Id>) {
        for id in victims {
            let Some(cached) = self.items.get(id) else {
                continue;
            };
            let parent = cached.parent.clone();
            let index = cached.index;
            self.remove_slot(&parent, index, id);
            self.release(id, keys);
            self.recompute_up(&parent);
        }
        tracing::debug!(target: targets::CACHE, evicted = victims.len(), remaining = self.items.len(), "evicted rows");
    }

    /// Remove the slot at `index` under `parent` if it holds `id`.
    fn remove_slot(&mut self, parent: &Option<Id>, index: usize, id: &Id) {
        if let Some(state) = self.parents.get_mut(parent) {
            if state.slots.get(&index).is_some_and(|slot| &slot.id == id) {
                state.slots.remove(&index);
            }
            if state.expanded.get(&index) == Some(id) {
                state.expanded.remove(&index);
            }
        }
    }

    /// Forget `id` and its cached subtree, releasing keys that are not pinned.
    ///
    /// The caller removes the slot that held `id`.
    fn release(&mut self, id: &Id, keys: &mut KeyMapper<Id>) {
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if let Some(state) = self.parents.remove(&Some(next.clone())) {
                stack.extend(state.slots.into_values().map(|slot| slot.id));
            }
            self.items.remove(&next);
            keys.remove(&next);
        }
    }

    /// Recompute the size of `parent`, then of its ancestors while sizes keep changing.
    fn recompute_up(&mut self, parent: &Option<Id>) {
        let mut current = parent.clone();
        loop {
            let Some(state) = self.parents.get(&current) else {
                break;
            };
            let size = state.expanded.values().fold(state.count_or_zero(), |acc, child| {
                acc + self.size(&Some(child.clone()))
            });
            let Some(state) = self.parents.get_mut(&current) else {
                break;
            };
            if state.size == size {
                break;
            }
            state.size = size;
            current = match current {
                Some(id) => match self.items.get(&id) {
                    Some(cached) => cached.parent.clone(),
                    None => break,
                },
                None => break,
            };
        }
    }
}
