//! Refresh bookkeeping: which parents an item refresh touches, and the scroll
//! anchor that a full refresh tries to preserve.
//!
//! A full refresh keeps serving the stale rows while they are refetched. The
//! viewport's first row is remembered as an anchor; once the refetch has
//! confirmed or contradicted that row's identity, [`AnchorOutcome`] tells the
//! view where to scroll.

use std::fmt::Debug;
use std::hash::Hash;

use crate::cache::HierarchyCache;
use crate::count::ChildCount;
use crate::expansion::ExpansionModel;

/// The first visible row when a full refresh started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollAnchor<Id> {
    pub index: usize,
    /// `None` if the row was not loaded.
    pub identity: Option<Id>,
}

/// Where the view should scroll after a full refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorOutcome<Id> {
    /// The anchored item survived; it now sits at `index`.
    Kept { identity: Id, index: usize },
    /// The anchored item is gone; scroll to the nearest valid row.
    Clamped { index: usize },
}

impl<Id> AnchorOutcome<Id> {
    /// The flat index to scroll to.
    pub fn index(&self) -> usize {
        match self {
            Self::Kept { index, .. } | Self::Clamped { index } => *index,
        }
    }
}

/// What is currently known about the anchored identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnchorState {
    /// Confirmed by a refetch and visible at this flat index.
    Present(usize),
    /// Still cached but not yet confirmed.
    Pending,
    Gone,
}

#[derive(Debug, Default)]
pub(crate) struct RefreshCoordinator<Id> {
    anchor: Option<ScrollAnchor<Id>>,
}

impl<Id: Clone> RefreshCoordinator<Id> {
    pub(crate) fn new() -> Self {
        Self { anchor: None }
    }

    pub(crate) fn capture(&mut self, index: usize, identity: Option<Id>) {
        self.anchor = Some(ScrollAnchor { index, identity });
    }

    pub(crate) fn anchor(&self) -> Option<&ScrollAnchor<Id>> {
        self.anchor.as_ref()
    }

    pub(crate) fn clear(&mut self) {
        self.anchor = None;
    }

    /// Decide the outcome for the captured anchor.
    ///
    /// Returns `None` while the anchored identity is still unconfirmed; the
    /// anchor is kept for a later attempt in that case and dropped otherwise.
    pub(crate) fn settle(&mut self, state: AnchorState, total: ChildCount) -> Option<AnchorOutcome<Id>> {
        let anchor = self.anchor.as_ref()?;
        let outcome = match (&anchor.identity, state) {
            (Some(identity), AnchorState::Present(index)) => AnchorOutcome::Kept {
                identity: identity.clone(),
                index,
            },
            (Some(_), AnchorState::Pending) => return None,
            _ => AnchorOutcome::Clamped {
                index: clamp_index(anchor.index, total),
            },
        };
        self.anchor = None;
        Some(outcome)
    }
}

/// The nearest valid flat index to `index`.
fn clamp_index(index: usize, total: ChildCount) -> usize {
    match total {
        ChildCount::Known(0) => 0,
        ChildCount::Known(n) => index.min(n - 1),
        ChildCount::Unknown => index,
    }
}

/// `id` followed, when `recursive`, by every expanded descendant that has cached children.
pub(crate) fn refresh_targets<T, Id>(
    cache: &HierarchyCache<T, Id>,
    expansion: &ExpansionModel<Id>,
    id: &Id,
    recursive: bool,
) -> Vec<Id>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    let mut targets = vec![id.clone()];
    if !recursive {
        return targets;
    }
    let mut stack = vec![id.clone()];
    while let Some(parent) = stack.pop() {
        for child in cache.cached_children(&Some(parent)) {
            if expansion.is_expanded(&child) {
                targets.push(child.clone());
                stack.push(child);
            }
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::cache::Ingest;
    use crate::key_mapper::KeyMapper;

    #[test]
    fn test_kept_when_present() {
        let mut refresh = RefreshCoordinator::new();
        refresh.capture(500, Some("row 500"));
        assert_eq!(
            refresh.settle(AnchorState::Present(498), ChildCount::Known(999)),
            Some(AnchorOutcome::Kept {
                identity: "row 500",
                index: 498
            })
        );
        assert!(refresh.anchor().is_none());
    }

    #[test]
    fn test_pending_keeps_anchor() {
        let mut refresh = RefreshCoordinator::new();
        refresh.capture(10, Some(1u32));
        assert_eq!(refresh.settle(AnchorState::Pending, ChildCount::Known(20)), None);
        assert!(refresh.anchor().is_some());
    }

    #[test]
    fn test_clamped_when_gone() {
        let mut refresh = RefreshCoordinator::new();
        refresh.capture(500, Some(1u32));
        let outcome = refresh.settle(AnchorState::Gone, ChildCount::Known(100)).unwrap();
        assert_eq!(outcome, AnchorOutcome::Clamped { index: 99 });
        assert_eq!(outcome.index(), 99);

        refresh.capture(5, Some(1));
        assert_eq!(
            refresh.settle(AnchorState::Gone, ChildCount::ZERO),
            Some(AnchorOutcome::Clamped { index: 0 })
        );

        refresh.capture(7, None);
        assert_eq!(
            refresh.settle(AnchorState::Pending, ChildCount::Unknown),
            Some(AnchorOutcome::Clamped { index: 7 })
        );
    }

    #[test]
    fn test_refresh_targets_follow_expanded_descendants() {
        let mut cache = HierarchyCache::<u32, u32>::new(None);
        let mut keys = KeyMapper::new();
        let mut expansion = ExpansionModel::new();
        let now = Instant::now();
        let mut load = |cache: &mut HierarchyCache<u32, u32>, parent: Option<u32>, ids: &[u32], expansion: &ExpansionModel<u32>| {
            cache.set_count(&parent, ChildCount::Known(ids.len()));
            cache
                .ingest(
                    Ingest {
                        parent,
                        offset: 0,
                        limit: ids.len(),
                        seq: 1,
                        rows: ids.iter().map(|id| (*id, *id)).collect(),
                    },
                    &mut keys,
                    expansion,
                    now,
                )
                .unwrap();
        };

        expansion.expand(1);
        expansion.expand(11);
        load(&mut cache, None, &[1, 2], &expansion);
        load(&mut cache, Some(1), &[11, 12], &expansion);
        load(&mut cache, Some(11), &[111], &expansion);

        assert_eq!(refresh_targets(&cache, &expansion, &1, false), vec![1]);
        assert_eq!(refresh_targets(&cache, &expansion, &1, true), vec![1, 11]);
    }
}
