//! Per-atom runtime state.
//!
//! The store keeps two maps keyed by [`AtomId`]: one with the mutable
//! bookkeeping for every atom it has ever touched ([`AtomState`]), and one
//! that exists only while an atom is mounted ([`MountedState`]). Mounting
//! pins the descriptor with a strong reference; unmounted state holds only a
//! weak one, so dropped descriptors can be swept by
//! [`Store::collect_garbage`](super::Store::collect_garbage).

use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};

use crate::atom::{AtomCore, AtomId, ListenerId, OnUnmount, Value};
use crate::error::EvalError;

/// The outcome of an atom's most recent evaluation: exactly one of a value
/// or a cached evaluation error.
pub(crate) type AtomResult = Result<Value, EvalError>;

/// A change-notification callback.
pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

/// Mutable bookkeeping for one atom, created on first access.
pub(crate) struct AtomState {
    /// Descriptor backing this state. Weak: the store does not own
    /// unmounted descriptors.
    pub(crate) atom: Weak<AtomCore>,

    /// Last evaluation outcome; `None` means never evaluated.
    pub(crate) result: Option<AtomResult>,

    /// Monotonic change counter. Bumped exactly when the value changes
    /// observably or evaluation produces an error; never on a recompute
    /// that yields an equal value.
    pub(crate) epoch: u64,

    /// Atoms read during the most recent evaluation, mapped to the epoch
    /// observed at read time. Cleared and rebuilt on every recompute.
    pub(crate) deps: IndexMap<AtomId, u64>,

    /// Registered change listeners, in subscription order.
    pub(crate) listeners: IndexMap<ListenerId, Listener>,
}

impl AtomState {
    pub(crate) fn new(atom: Weak<AtomCore>) -> Self {
        Self {
            atom,
            result: None,
            epoch: 0,
            deps: IndexMap::new(),
            listeners: IndexMap::new(),
        }
    }
}

/// Bookkeeping that exists only while an atom is mounted.
pub(crate) struct MountedState {
    /// Mounting pins the descriptor.
    pub(crate) atom: Arc<AtomCore>,

    /// Mounted atoms this one currently depends on.
    pub(crate) deps: IndexSet<AtomId>,

    /// Mounted atoms that currently depend on this one.
    pub(crate) dependents: IndexSet<AtomId>,

    /// Cleanup hook produced by the descriptor's `on_mount` callback.
    pub(crate) on_unmount: Option<OnUnmount>,
}

impl MountedState {
    pub(crate) fn new(atom: Arc<AtomCore>, deps: IndexSet<AtomId>) -> Self {
        Self { atom, deps, dependents: IndexSet::new(), on_unmount: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::PrimitiveAtom;

    #[test]
    fn fresh_state_has_no_result() {
        let atom = PrimitiveAtom::primitive(0);
        let state = AtomState::new(Arc::downgrade(atom.core()));
        assert!(state.result.is_none());
        assert_eq!(state.epoch, 0);
        assert!(state.deps.is_empty());
        assert!(state.listeners.is_empty());
    }

    #[test]
    fn mounted_state_pins_descriptor() {
        let atom = PrimitiveAtom::primitive(0);
        let weak = Arc::downgrade(atom.core());
        let mounted = MountedState::new(atom.core().clone(), IndexSet::new());
        drop(atom);
        // The strong reference in the mounted record keeps the core alive.
        assert!(weak.upgrade().is_some());
        drop(mounted);
        assert!(weak.upgrade().is_none());
    }
}
