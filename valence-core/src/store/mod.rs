//! The reactive store.
//!
//! A [`Store`] holds the runtime state of every atom it has touched: cached
//! values, change counters, the dependency graph discovered at read time,
//! and the mounted subgraph that change notifications flow through.
//!
//! # Locking
//!
//! All store state lives behind one reentrant lock, so the store is `Send +
//! Sync` and callbacks that re-enter the store from the thread that is
//! already holding it (a listener calling [`Store::set`], say) just work.
//! The interior `RefCell` borrow is always released before user callbacks
//! run; only the outer lock is held across them.
//!
//! # Flushing
//!
//! Writes invalidate eagerly and recompute in one topological pass, then
//! deliver listener and lifecycle callbacks until the store is quiescent:
//! callbacks that perform further writes have those folded into the same
//! flush rather than starting a nested one. Reads never flush.

mod engine;
mod scheduler;
mod state;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, error};

use crate::atom::{
    AnyAtom, Atom, AtomCore, AtomValue, BoxedValue, ListenerId, PrimitiveAtom, Value, WritableAtom,
};
use crate::error::StoreError;

pub use engine::{Getter, Setter};

use engine::StoreInner;
use state::Listener;

/// Shared interior of a store; `Store` handles are cheap clones of this.
pub(crate) struct StoreShared {
    pub(crate) cell: ReentrantMutex<RefCell<StoreInner>>,
}

/// A lazy, dependency-tracking value store.
///
/// Cloning a `Store` yields another handle to the same store. Independent
/// stores never share atom state, even for the same descriptors.
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<StoreShared>| StoreShared {
            cell: ReentrantMutex::new(RefCell::new(StoreInner::new(weak.clone()))),
        });
        Self { shared }
    }

    /// Read an atom's current value, computing it (and anything it depends
    /// on) if needed. Repeated reads without intervening changes return the
    /// cached value without re-running any read function.
    pub fn get<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T, StoreError> {
        let value = self.get_raw(atom.as_any())?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or(StoreError::TypeMismatch)
    }

    /// Erased variant of [`Store::get`].
    pub fn get_raw(&self, atom: &AnyAtom) -> Result<Value, StoreError> {
        let guard = self.shared.cell.lock();
        let mut inner = guard.borrow_mut();
        let (result, _) = inner.read_atom_state(atom.core());
        result.map_err(|err| err.into_store_error())
    }

    /// Write a writable atom and deliver the resulting notifications.
    ///
    /// Primitives store the argument directly; derived writables run their
    /// write function, which may fan out to any number of atoms. All atoms
    /// changed by the write are recomputed in one pass before listeners run.
    pub fn set<T, A, R>(&self, atom: &WritableAtom<T, A, R>, arg: A) -> Result<R, StoreError>
    where
        T: AtomValue,
        A: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let out = self.set_erased(atom.core(), Box::new(arg))?;
        out.downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| StoreError::TypeMismatch)
    }

    /// Write through an erased handle. Fails with [`StoreError::ReadOnly`]
    /// if the descriptor has no write capability.
    pub fn set_raw(&self, atom: &AnyAtom, arg: BoxedValue) -> Result<BoxedValue, StoreError> {
        self.set_erased(atom.core(), arg)
    }

    fn set_erased(
        &self,
        core: &Arc<AtomCore>,
        arg: BoxedValue,
    ) -> Result<BoxedValue, StoreError> {
        let deliver;
        let out = {
            let guard = self.shared.cell.lock();
            let mut inner = guard.borrow_mut();
            let out = inner.write_atom_state(core, arg)?;
            // A write from inside a listener folds into the running flush.
            deliver = !inner.flushing;
            if deliver {
                inner.recompute_invalidated();
            }
            out
        };
        if deliver {
            self.flush();
        }
        Ok(out)
    }

    /// Read-modify-write a primitive atom in one step.
    pub fn update<T, F>(&self, atom: &PrimitiveAtom<T>, f: F) -> Result<(), StoreError>
    where
        T: AtomValue,
        F: FnOnce(&T) -> T,
    {
        let current = self.get(atom)?;
        self.set(atom, f(&current))
    }

    /// Subscribe to changes of an atom's value.
    ///
    /// Mounts the atom (and, transitively, its dependencies), which switches
    /// the whole subgraph from lazy revalidation to push invalidation and
    /// runs any `on_mount` hooks. The listener fires after every flush in
    /// which the atom's value changed; it receives no arguments and should
    /// read the store for current values. Dropping the returned
    /// [`Subscription`] removes the listener and unmounts whatever is no
    /// longer referenced.
    pub fn sub<F>(&self, atom: impl AsRef<AnyAtom>, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let core = atom.as_ref().core().clone();
        let listener_id = ListenerId::new();
        {
            let guard = self.shared.cell.lock();
            let mut inner = guard.borrow_mut();
            inner.mount_atom(&core);
            inner.ensure_state(&core);
            let state = inner
                .states
                .get_mut(&core.id())
                .expect("state exists after mount");
            let listener: Listener = Arc::new(listener);
            state.listeners.insert(listener_id, listener);
        }
        debug!(atom = %core.id(), label = core.label().unwrap_or(""), "subscribed");
        // Mount hooks enqueued above are delivered now.
        self.flush();
        Subscription {
            shared: Arc::downgrade(&self.shared),
            atom: core,
            listener_id,
            active: AtomicBool::new(true),
        }
    }

    /// Whether the atom is currently mounted in this store.
    pub fn is_mounted(&self, atom: impl AsRef<AnyAtom>) -> bool {
        let guard = self.shared.cell.lock();
        let inner = guard.borrow();
        inner.mounted.contains_key(&atom.as_ref().id())
    }

    /// Drop cached state for atoms whose descriptors no longer exist
    /// anywhere. Returns the number of entries removed.
    pub fn collect_garbage(&self) -> usize {
        let guard = self.shared.cell.lock();
        let mut inner = guard.borrow_mut();
        let before = inner.states.len();
        let StoreInner { states, mounted, .. } = &mut *inner;
        states.retain(|id, state| {
            mounted.contains_key(id) || state.atom.upgrade().is_some()
        });
        before - inner.states.len()
    }

    /// Deliver pending callbacks until the store is quiescent.
    ///
    /// Each batch runs listeners of changed atoms, then unmount hooks, then
    /// mount hooks; writes performed by callbacks extend the same flush.
    /// A panicking callback does not stop delivery: remaining callbacks
    /// still run, and the panic is re-raised once the store is quiescent.
    fn flush(&self) {
        let guard = self.shared.cell.lock();
        {
            let mut inner = guard.borrow_mut();
            if inner.flushing {
                return;
            }
            inner.flushing = true;
        }

        let mut panics: Vec<Box<dyn std::any::Any + Send>> = Vec::new();
        loop {
            let batch = {
                let mut inner = guard.borrow_mut();
                inner.recompute_invalidated();
                inner.drain_callbacks()
            };
            if batch.is_empty() {
                break;
            }
            for callback in batch {
                // Borrow released: callbacks may re-enter the store.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                    error!("store callback panicked during flush");
                    panics.push(payload);
                }
            }
        }

        guard.borrow_mut().flushing = false;
        match panics.len() {
            0 => {}
            1 => panic::resume_unwind(panics.into_iter().next().expect("one payload")),
            n => panic!("{n} store callbacks panicked during flush"),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.shared.cell.lock();
        let inner = guard.borrow();
        f.debug_struct("Store")
            .field("atoms", &inner.states.len())
            .field("mounted", &inner.mounted.len())
            .finish()
    }
}

/// Handle for one registered listener. Dropping it unsubscribes.
pub struct Subscription {
    shared: Weak<StoreShared>,
    atom: Arc<AtomCore>,
    listener_id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the listener and unmount whatever it alone kept mounted.
    /// Idempotent; a no-op once the store itself is gone.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let store = Store { shared };
        {
            let guard = store.shared.cell.lock();
            let mut inner = guard.borrow_mut();
            if let Some(state) = inner.states.get_mut(&self.atom.id()) {
                state.listeners.shift_remove(&self.listener_id);
            }
            inner.unmount_atom(self.atom.id());
        }
        // Deliver any unmount hooks released above.
        store.flush();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("atom", &self.atom.id())
            .field("active", &self.active.load(Ordering::Acquire))
            .finish()
    }
}

/// Erased setter bound to one atom and one store, handed to mount hooks.
pub struct RawSetSelf {
    shared: Weak<StoreShared>,
    atom: Arc<AtomCore>,
}

impl RawSetSelf {
    pub(crate) fn new(shared: Weak<StoreShared>, atom: Arc<AtomCore>) -> Self {
        Self { shared, atom }
    }

    /// Write the bound atom with an erased argument.
    pub fn set_raw(&self, arg: BoxedValue) -> Result<BoxedValue, StoreError> {
        let shared = self.shared.upgrade().ok_or(StoreError::StoreGone)?;
        let store = Store { shared };
        store.set_erased(&self.atom, arg)
    }
}

impl std::fmt::Debug for RawSetSelf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSetSelf").field("atom", &self.atom.id()).finish()
    }
}

/// Typed setter bound to one atom and one store.
///
/// Passed to `on_mount` hooks so they can feed values into the atom for as
/// long as it stays mounted.
pub struct SetSelf<A = (), R = ()> {
    raw: RawSetSelf,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> SetSelf<A, R>
where
    A: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    pub(crate) fn from_raw(raw: RawSetSelf) -> Self {
        Self { raw, _marker: PhantomData }
    }

    /// Write the bound atom. Fails with [`StoreError::StoreGone`] once the
    /// store has been dropped.
    pub fn set(&self, arg: A) -> Result<R, StoreError> {
        let out = self.raw.set_raw(Box::new(arg))?;
        out.downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| StoreError::TypeMismatch)
    }
}

impl<A, R> std::fmt::Debug for SetSelf<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetSelf").field("atom", &self.raw.atom.id()).finish()
    }
}

static DEFAULT_STORE: OnceLock<Store> = OnceLock::new();

/// The process-wide default store, created on first use.
pub fn default_store() -> &'static Store {
    DEFAULT_STORE.get_or_init(Store::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_read_returns_initial_value() {
        let store = Store::new();
        let count = PrimitiveAtom::primitive(7);
        assert_eq!(store.get(&count).unwrap(), 7);
    }

    #[test]
    fn set_then_get() {
        let store = Store::new();
        let count = PrimitiveAtom::primitive(0);
        store.set(&count, 42).unwrap();
        assert_eq!(store.get(&count).unwrap(), 42);
    }

    #[test]
    fn stores_are_independent() {
        let a = Store::new();
        let b = Store::new();
        let count = PrimitiveAtom::primitive(0);
        a.set(&count, 1).unwrap();
        assert_eq!(a.get(&count).unwrap(), 1);
        assert_eq!(b.get(&count).unwrap(), 0);
    }

    #[test]
    fn cloned_store_shares_state() {
        let a = Store::new();
        let b = a.clone();
        let count = PrimitiveAtom::primitive(0);
        a.set(&count, 9).unwrap();
        assert_eq!(b.get(&count).unwrap(), 9);
    }

    #[test]
    fn default_store_is_a_singleton() {
        let a = default_store();
        let b = default_store();
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
    }

    #[test]
    fn derived_atom_is_read_only() {
        let store = Store::new();
        let derived = Atom::derived(|_| Ok(1));
        let err = store.set_raw(derived.as_any(), Box::new(2)).unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
    }

    #[test]
    fn update_applies_function_to_current_value() {
        let store = Store::new();
        let count = PrimitiveAtom::primitive(10);
        store.update(&count, |n| n * 2).unwrap();
        assert_eq!(store.get(&count).unwrap(), 20);
    }

    #[test]
    fn collect_garbage_sweeps_dropped_descriptors() {
        let store = Store::new();
        let keep = PrimitiveAtom::primitive(1);
        let drop_me = PrimitiveAtom::primitive(2);
        store.get(&keep).unwrap();
        store.get(&drop_me).unwrap();
        drop(drop_me);
        assert_eq!(store.collect_garbage(), 1);
        assert_eq!(store.get(&keep).unwrap(), 1);
    }
}
