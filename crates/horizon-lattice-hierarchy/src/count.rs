//! Child counts and subtree sizes that may be unbounded.
//!
//! A data source is allowed to answer "I don't know" when asked how many
//! children a parent has (an endless feed, a backend without cheap counts).
//! [`ChildCount`] makes that case a closed variant instead of a magic number,
//! so every place that adds sizes together has to decide what `Unknown` means.

use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// The number of children of a parent, or the number of flat rows in a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildCount {
    /// An exact count.
    Known(usize),
    /// The source cannot tell; only bounded windows may be requested.
    Unknown,
}

impl ChildCount {
    /// A known count of zero.
    pub const ZERO: Self = Self::Known(0);

    /// Returns the exact value, if known.
    #[inline]
    pub fn known(self) -> Option<usize> {
        match self {
            Self::Known(n) => Some(n),
            Self::Unknown => None,
        }
    }

    /// Returns `true` if the count is exact.
    #[inline]
    pub fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Returns `true` if the count is known to be zero.
    #[inline]
    pub fn is_empty(self) -> bool {
        matches!(self, Self::Known(0))
    }

    /// Returns `true` if `index` lies inside the counted range.
    ///
    /// Every index is considered inside an unknown range.
    #[inline]
    pub fn contains(self, index: usize) -> bool {
        match self {
            Self::Known(n) => index < n,
            Self::Unknown => true,
        }
    }

    /// Clamps `end` to the count. Unknown counts leave `end` untouched.
    #[inline]
    pub fn clamp_end(self, end: usize) -> usize {
        match self {
            Self::Known(n) => end.min(n),
            Self::Unknown => end,
        }
    }

    /// Returns the exact value or `fallback` when unknown.
    #[inline]
    pub fn unwrap_or(self, fallback: usize) -> usize {
        self.known().unwrap_or(fallback)
    }
}

impl Default for ChildCount {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<usize> for ChildCount {
    fn from(n: usize) -> Self {
        Self::Known(n)
    }
}

impl Add for ChildCount {
    type Output = Self;

    /// Unknown is absorbing; known values saturate.
    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Self::Known(a), Self::Known(b)) => Self::Known(a.saturating_add(b)),
            _ => Self::Unknown,
        }
    }
}

impl Add<usize> for ChildCount {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        self + Self::Known(rhs)
    }
}

impl std::iter::Sum for ChildCount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, c| acc + c)
    }
}

impl fmt::Display for ChildCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(n) => write!(f, "{n}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
