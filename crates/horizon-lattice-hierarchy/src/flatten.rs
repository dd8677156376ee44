//! Mapping between flat row indices and positions in the tree.
//!
//! The flat view is a depth-first, pre-order walk of the expanded part of the
//! tree. Every function here reads the cache only: positions whose rows are
//! not loaded are still located (they carry no identity yet), and positions
//! behind a subtree of unknown size are unreachable until the size is known.

use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Range;

use crate::cache::HierarchyCache;
use crate::count::ChildCount;
use crate::error::{HierarchyError, Result};

/// A position in the tree: child `index` of `parent`, `depth` levels below the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location<Id> {
    /// The parent, `None` at the root level.
    pub parent: Option<Id>,
    /// Index among the parent's children.
    pub index: usize,
    /// Root children have depth 0.
    pub depth: usize,
}

/// One row of the flattened view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry<Id> {
    pub flat_index: usize,
    pub parent: Option<Id>,
    pub child_index: usize,
    pub depth: usize,
    /// `None` while the row is not loaded.
    pub id: Option<Id>,
}

/// The children of one parent that fall inside a flat range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment<Id> {
    pub(crate) parent: Option<Id>,
    pub(crate) children: Range<usize>,
}

/// Find the tree position of flat row `flat`.
pub(crate) fn locate<T, Id>(cache: &HierarchyCache<T, Id>, flat: usize) -> Option<Location<Id>>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    let mut parent = None;
    let mut depth = 0;
    let mut remaining = flat;

    'levels: loop {
        let state = cache.state(&parent)?;
        let mut cursor = 0;
        for (&index, child) in &state.expanded {
            let plain = index - cursor;
            if remaining < plain {
                return Some(Location {
                    parent,
                    index: cursor + remaining,
                    depth,
                });
            }
            remaining -= plain;
            if remaining == 0 {
                return Some(Location { parent, index, depth });
            }
            remaining -= 1;

            let child = Some(child.clone());
            match cache.size(&child) {
                ChildCount::Known(size) if remaining >= size => remaining -= size,
                _ => {
                    parent = child;
                    depth += 1;
                    continue 'levels;
                }
            }
            cursor = index + 1;
        }

        let index = cursor + remaining;
        return state
            .count_or_zero()
            .contains(index)
            .then_some(Location { parent, index, depth });
    }
}

/// The position following `location` in flat order.
fn advance<T, Id>(cache: &HierarchyCache<T, Id>, location: &Location<Id>) -> Option<Location<Id>>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    if let Some(child) = cache
        .state(&location.parent)
        .and_then(|state| state.expanded.get(&location.index))
    {
        let child = Some(child.clone());
        if cache.size(&child) != ChildCount::ZERO {
            return Some(Location {
                parent: child,
                index: 0,
                depth: location.depth + 1,
            });
        }
    }

    let mut parent = location.parent.clone();
    let mut index = location.index + 1;
    let mut depth = location.depth;
    loop {
        let count = cache
            .state(&parent)
            .map_or(ChildCount::ZERO, |state| state.count_or_zero());
        if count.contains(index) {
            return Some(Location { parent, index, depth });
        }
        let id = parent?;
        let cached = cache.item(&id)?;
        index = cached.index + 1;
        parent = cached.parent.clone();
        depth = depth.saturating_sub(1);
    }
}

/// Iterator over the rows of a flat range.
pub(crate) struct Rows<'a, T, Id> {
    cache: &'a HierarchyCache<T, Id>,
    next: Option<Location<Id>>,
    flat: usize,
    end: usize,
}

impl<T, Id> Iterator for Rows<'_, T, Id>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    type Item = FlatEntry<Id>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.flat >= self.end {
            return None;
        }
        let location = self.next.take()?;
        self.next = advance(self.cache, &location);
        let id = self
            .cache
            .slot(&location.parent, location.index)
            .map(|slot| slot.id.clone());
        let entry = FlatEntry {
            flat_index: self.flat,
            parent: location.parent,
            child_index: location.index,
            depth: location.depth,
            id,
        };
        self.flat += 1;
        Some(entry)
    }
}

pub(crate) fn rows<T, Id>(cache: &HierarchyCache<T, Id>, range: Range<usize>) -> Rows<'_, T, Id>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    Rows {
        cache,
        next: locate(cache, range.start),
        flat: range.start,
        end: range.end,
    }
}

/// Per-parent spans of child indices covered by a flat range, in first-visit order.
///
/// The rows between two runs of the same parent are that parent's expanded
/// children, so each parent gets one span.
pub(crate) fn segments<T, Id>(cache: &HierarchyCache<T, Id>, range: Range<usize>) -> Vec<Segment<Id>>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    let mut segments: Vec<Segment<Id>> = Vec::new();
    for row in rows(cache, range) {
        match segments.iter_mut().find(|segment| segment.parent == row.parent) {
            Some(segment) => {
                segment.children.start = segment.children.start.min(row.child_index);
                segment.children.end = segment.children.end.max(row.child_index + 1);
            }
            None => segments.push(Segment {
                parent: row.parent,
                children: row.child_index..row.child_index + 1,
            }),
        }
    }
    segments
}

/// Flat index of child `index` of `parent`.
///
/// `None` if an ancestor is collapsed or an earlier sibling subtree has an unknown size.
pub(crate) fn flat_index_at<T, Id>(cache: &HierarchyCache<T, Id>, parent: &Option<Id>, index: usize) -> Option<usize>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    let mut flat = 0usize;
    let mut parent = parent.clone();
    let mut index = index;
    loop {
        let state = cache.state(&parent)?;
        if !state.count_or_zero().contains(index) {
            return None;
        }
        flat += index;
        for child in state.expanded.range(..index).map(|(_, child)| child) {
            flat += cache.size(&Some(child.clone())).known()?;
        }
        let Some(id) = parent else {
            return Some(flat);
        };
        if !cache.is_registered_expanded(&id) {
            return None;
        }
        let cached = cache.item(&id)?;
        flat += 1;
        index = cached.index;
        parent = cached.parent.clone();
    }
}

/// Flat index of a cached item.
pub(crate) fn flat_index_of<T, Id>(cache: &HierarchyCache<T, Id>, id: &Id) -> Option<usize>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    let cached = cache.item(id)?;
    flat_index_at(cache, &cached.parent, cached.index)
}

/// Resolve a path of per-level child indices, top-down.
///
/// Every level but the last must name a loaded, expanded child. Nothing is
/// expanded or fetched here.
pub(crate) fn resolve_path<T, Id>(cache: &HierarchyCache<T, Id>, path: &[usize]) -> Result<Location<Id>>
where
    T: Clone,
    Id: Clone + Eq + Hash + Debug,
{
    let Some((&last, ancestors)) = path.split_last() else {
        return Err(HierarchyError::PathOutOfRange { level: 0, index: 0 });
    };
    let mut parent = None;
    for (level, &index) in ancestors.iter().enumerate() {
        let state = cache
            .state(&parent)
            .ok_or(HierarchyError::NotExpanded { level, index })?;
        if !state.count_or_zero().contains(index) {
            return Err(HierarchyError::PathOutOfRange { level, index });
        }
        match state.expanded.get(&index) {
            Some(child) => parent = Some(child.clone()),
            None => return Err(HierarchyError::NotExpanded { level, index }),
        }
    }

    let level = ancestors.len();
    let in_range = cache
        .state(&parent)
        .is_some_and(|state| state.count_or_zero().contains(last));
    if !in_range {
        return Err(HierarchyError::PathOutOfRange { level, index: last });
    }
    Ok(Location {
        parent,
        index: last,
        depth: level,
    })
}
