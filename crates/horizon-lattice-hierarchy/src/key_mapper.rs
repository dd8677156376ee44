//! Stable opaque keys for item identities.
//!
//! The rendering layer addresses rows by [`ItemKey`] rather than by identity,
//! so identities never leave the engine. Keys are allocated from a counter and
//! are never handed out twice by the same mapper, which makes key recycling
//! unobservable: a consumer that holds a key for a dropped identity gets
//! [`HierarchyError::UnknownKey`], never somebody else's row.
//!
//! Lookups go through `Eq`, not through the identity's hash value, so two
//! unequal identities whose hashes collide still receive distinct keys.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{HierarchyError, Result};
use crate::logging::targets;

/// An opaque token addressing one known item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey(Arc<str>);

impl ItemKey {
    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

#[derive(Debug)]
struct KeyEntry<Id> {
    id: Id,
    verified: bool,
    pins: usize,
}

/// Bidirectional identity/key bookkeeping.
#[derive(Debug)]
pub struct KeyMapper<Id> {
    by_id: HashMap<Id, ItemKey>,
    by_key: HashMap<ItemKey, KeyEntry<Id>>,
    next_key: u64,
}

impl<Id> Default for KeyMapper<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> KeyMapper<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug,
{
    /// Create an empty mapper.
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_key: HashMap::new(),
            next_key: 1,
        }
    }

    /// Returns the key for `id`, allocating one on first sight.
    ///
    /// Idempotent for as long as `id` stays known.
    pub fn key(&mut self, id: &Id) -> ItemKey {
        if let Some(key) = self.by_id.get(id) {
            return key.clone();
        }
        let key = ItemKey(Arc::from(format!("{:x}", self.next_key)));
        self.next_key += 1;
        debug_assert!(
            !self.by_key.contains_key(&key),
            "key {key} allocated twice"
        );
        self.by_id.insert(id.clone(), key.clone());
        self.by_key.insert(
            key.clone(),
            KeyEntry {
                id: id.clone(),
                verified: true,
                pins: 0,
            },
        );
        tracing::trace!(target: targets::KEYS, %key, ?id, "allocated key");
        key
    }

    /// Returns the key for `id` without allocating.
    pub fn key_of(&self, id: &Id) -> Option<ItemKey> {
        self.by_id.get(id).cloned()
    }

    /// Returns `true` if `key` currently maps to an identity.
    pub fn has(&self, key: &ItemKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Returns the identity behind `key`.
    pub fn get(&self, key: &ItemKey) -> Result<&Id> {
        self.by_key
            .get(key)
            .map(|entry| &entry.id)
            .ok_or_else(|| HierarchyError::UnknownKey {
                key: key.to_string(),
            })
    }

    /// Returns `true` if `id` has a key.
    pub fn contains(&self, id: &Id) -> bool {
        self.by_id.contains_key(id)
    }

    /// Drop the key of `id`.
    ///
    /// Pinned keys are kept; returns `true` only if a key was actually dropped.
    pub fn remove(&mut self, id: &Id) -> bool {
        let Some(key) = self.by_id.get(id) else {
            return false;
        };
        if self.by_key.get(key).is_some_and(|entry| entry.pins > 0) {
            return false;
        }
        if let Some(key) = self.by_id.remove(id) {
            self.by_key.remove(&key);
            tracing::trace!(target: targets::KEYS, %key, ?id, "released key");
        }
        true
    }

    /// Keep `key` alive across eviction until a matching [`unpin`](Self::unpin).
    ///
    /// Pins nest.
    pub fn pin(&mut self, key: &ItemKey) -> Result<()> {
        let entry = self.entry_mut(key)?;
        entry.pins += 1;
        Ok(())
    }

    /// Release one pin on `key`.
    pub fn unpin(&mut self, key: &ItemKey) -> Result<()> {
        let entry = self.entry_mut(key)?;
        entry.pins = entry.pins.saturating_sub(1);
        Ok(())
    }

    /// Returns `true` if `id`'s key is pinned.
    pub fn is_pinned(&self, id: &Id) -> bool {
        self.by_id
            .get(id)
            .and_then(|key| self.by_key.get(key))
            .is_some_and(|entry| entry.pins > 0)
    }

    /// Mark every identity as unverified.
    ///
    /// Keys stay valid; a later fetch either confirms an identity with
    /// [`verify`](Self::verify) or contradicts it and the key is removed.
    pub fn mark_all_unverified(&mut self) {
        for entry in self.by_key.values_mut() {
            entry.verified = false;
        }
    }

    /// Confirm that `id` is still present. Returns `false` if it has no key.
    pub fn verify(&mut self, id: &Id) -> bool {
        match self.by_id.get(id).and_then(|key| self.by_key.get_mut(key)) {
            Some(entry) => {
                entry.verified = true;
                true
            }
            None => false,
        }
    }

    /// Returns `true` if `id` has a key that was confirmed since the last full refresh.
    pub fn is_verified(&self, id: &Id) -> bool {
        self.by_id
            .get(id)
            .and_then(|key| self.by_key.get(key))
            .is_some_and(|entry| entry.verified)
    }

    /// Identities whose keys are still unverified.
    pub fn unverified(&self) -> Vec<Id> {
        self.by_key
            .values()
            .filter(|entry| !entry.verified)
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Forget every identity, pinned or not.
    ///
    /// The key counter is not rewound, so keys from before the reset stay unknown.
    pub fn reset(&mut self) {
        self.by_id.clear();
        self.by_key.clear();
    }

    /// Number of known identities.
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.by_id.len(), self.by_key.len(), "key mapping is not a bijection");
        self.by_id.len()
    }

    /// Returns `true` if no identity is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_mut(&mut self, key: &ItemKey) -> Result<&mut KeyEntry<Id>> {
        self.by_key
            .get_mut(key)
            .ok_or_else(|| HierarchyError::UnknownKey {
                key: key.to_string(),
            })
    }
}
