//! Which items are expanded.
//!
//! Expansion is tracked by identity, not by position, so it survives
//! refreshes, eviction and moves: an item that reappears after a refetch is
//! still expanded.

use std::collections::HashSet;
use std::collections::hash_set;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// How far a recursive expand or collapse reaches below its roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecursionDepth {
    /// Descend this many levels; `Levels(0)` touches only the roots.
    Levels(usize),
    /// No depth limit.
    Unbounded,
}

impl RecursionDepth {
    /// The depth left for the children of a node, or `None` if the walk stops here.
    pub fn descend(self) -> Option<Self> {
        match self {
            Self::Levels(0) => None,
            Self::Levels(n) => Some(Self::Levels(n - 1)),
            Self::Unbounded => Some(Self::Unbounded),
        }
    }
}

impl From<usize> for RecursionDepth {
    fn from(levels: usize) -> Self {
        Self::Levels(levels)
    }
}

/// The set of expanded identities.
#[derive(Debug, Clone)]
pub struct ExpansionModel<Id> {
    expanded: HashSet<Id>,
}

impl<Id> Default for ExpansionModel<Id> {
    fn default() -> Self {
        Self {
            expanded: HashSet::new(),
        }
    }
}

impl<Id: Eq + Hash> ExpansionModel<Id> {
    /// Create a model with nothing expanded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` expanded. Returns `false` if it already was.
    pub fn expand(&mut self, id: Id) -> bool {
        self.expanded.insert(id)
    }

    /// Mark `id` collapsed. Returns `false` if it already was.
    pub fn collapse(&mut self, id: &Id) -> bool {
        self.expanded.remove(id)
    }

    pub fn is_expanded(&self, id: &Id) -> bool {
        self.expanded.contains(id)
    }

    /// Number of expanded identities.
    pub fn expanded_count(&self) -> usize {
        self.expanded.len()
    }

    /// Collapse everything.
    pub fn clear(&mut self) {
        self.expanded.clear();
    }

    pub fn iter(&self) -> hash_set::Iter<'_, Id> {
        self.expanded.iter()
    }
}

impl<'a, Id> IntoIterator for &'a ExpansionModel<Id> {
    type Item = &'a Id;
    type IntoIter = hash_set::Iter<'a, Id>;

    fn into_iter(self) -> Self::IntoIter {
        self.expanded.iter()
    }
}

/// Pre-order walk over `roots` and their descendants, limited by `depth`.
///
/// `visit` is called once per node with `true` when the walk continues below
/// it; the children it returns are walked next (and ignored otherwise). The
/// walk keeps its own stack, so deep hierarchies cannot overflow the call
/// stack, and a node reached twice is visited once.
///
/// Returns the number of visited nodes.
pub(crate) fn walk<N, E, F>(roots: Vec<N>, depth: RecursionDepth, mut visit: F) -> Result<usize, E>
where
    N: Clone + Eq + Hash,
    F: FnMut(&N, bool) -> Result<Vec<N>, E>,
{
    let mut stack: Vec<(N, RecursionDepth)> = roots.into_iter().rev().map(|node| (node, depth)).collect();
    let mut seen = HashSet::new();
    let mut visited = 0;

    while let Some((node, remaining)) = stack.pop() {
        if !seen.insert(node.clone()) {
            continue;
        }
        let below = remaining.descend();
        let children = visit(&node, below.is_some())?;
        visited += 1;
        if let Some(below) = below {
            stack.extend(children.into_iter().rev().map(|child| (child, below)));
        }
    }
    Ok(visited)
}
