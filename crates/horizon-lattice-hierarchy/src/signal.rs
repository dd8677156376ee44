//! Change notification for consumers of the engine.
//!
//! The rendering layer that consumes the engine is told about newly loaded
//! rows, size changes, expand/collapse and failed fetches through
//! [`HierarchySignals`]. Each notification is a [`Signal`]: a list of
//! connected slots invoked synchronously, in connection order, on the thread
//! that drives the engine.
//!
//! # Example
//!
//! ```
//! use horizon_lattice_hierarchy::Signal;
//!
//! let rows_loaded = Signal::<(usize, usize)>::new();
//! let id = rows_loaded.connect(|(first, count)| {
//!     println!("rows {first}..{} are ready", first + count);
//! });
//! rows_loaded.emit((0, 50));
//! rows_loaded.disconnect(id);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::count::ChildCount;
use crate::fetch::FetchFailure;
use crate::refresh::AnchorOutcome;

new_key_type! {
    /// Identifies one slot connected to a [`Signal`].
    pub struct ConnectionId;
}

type Slot<Args> = Arc<dyn Fn(&Args) + Send + Sync>;

/// A signal with any number of connected slots.
pub struct Signal<Args> {
    connections: Mutex<SlotMap<ConnectionId, Slot<Args>>>,
    blocked: AtomicBool,
}

impl<Args> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args> Signal<Args> {
    /// Create a signal with no connections.
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(SlotMap::with_key()),
            blocked: AtomicBool::new(false),
        }
    }

    /// Connect a slot. Returns an id usable with [`disconnect`](Self::disconnect).
    pub fn connect<F>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.connections.lock().insert(Arc::new(slot))
    }

    /// Disconnect a slot. Returns `false` if the id was not connected.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(id).is_some()
    }

    /// Disconnect every slot.
    pub fn disconnect_all(&self) {
        self.connections.lock().clear();
    }

    /// Number of connected slots.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Suppress (or re-enable) emission.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Whether emission is currently suppressed.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Invoke every connected slot with `args`.
    ///
    /// Slots are collected before any of them runs, so a slot may connect or
    /// disconnect on the same signal without deadlocking.
    pub fn emit(&self, args: Args) {
        if self.is_blocked() {
            return;
        }
        let slots: Vec<Slot<Args>> = self.connections.lock().values().cloned().collect();
        for slot in slots {
            slot(&args);
        }
    }
}

impl<Args> std::fmt::Debug for Signal<Args> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("connections", &self.connection_count())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

/// Notifications emitted by a [`HierarchyEngine`](crate::HierarchyEngine).
///
/// Parents are given as `Option<Id>`, `None` standing for the root.
pub struct HierarchySignals<Id> {
    /// Rows were written into the cache.
    /// Args: (parent, first child index, number of rows)
    pub rows_loaded: Signal<(Option<Id>, usize, usize)>,

    /// The total number of flat rows changed.
    pub size_changed: Signal<ChildCount>,

    /// An item was expanded.
    pub expanded: Signal<Id>,

    /// An item was collapsed, explicitly or by the empty-node policy.
    pub collapsed: Signal<Id>,

    /// A window fetch failed.
    pub fetch_failed: Signal<FetchFailure<Id>>,

    /// Every cached size and window was invalidated.
    pub reset: Signal<()>,

    /// The scroll anchor captured by a full refresh was resolved.
    pub anchor_restored: Signal<AnchorOutcome<Id>>,
}

impl<Id> Default for HierarchySignals<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> HierarchySignals<Id> {
    /// Create a set of unconnected signals.
    pub fn new() -> Self {
        Self {
            rows_loaded: Signal::new(),
            size_changed: Signal::new(),
            expanded: Signal::new(),
            collapsed: Signal::new(),
            fetch_failed: Signal::new(),
            reset: Signal::new(),
            anchor_restored: Signal::new(),
        }
    }
}

impl<Id> std::fmt::Debug for HierarchySignals<Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchySignals").finish_non_exhaustive()
    }
}
