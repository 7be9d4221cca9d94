//! Store engine: read path, write path, and mount lifecycle.
//!
//! Everything here operates on [`StoreInner`], the single-threaded core that
//! lives behind the store's lock. The engine never invokes user callbacks
//! directly; listeners and lifecycle hooks are only ever *enqueued* here and
//! delivered by the flush loop in the parent module, after the interior
//! borrow has been released.
//!
//! # How a read works
//!
//! 1. If the atom has a cached result, is mounted, and has not been
//!    invalidated since it was computed, return the cache.
//!
//! 2. If it has a cached result but is unmounted or invalidated, re-read
//!    each recorded dependency and compare the epoch it reports now with
//!    the epoch observed when the cache was built. If every dependency is
//!    unchanged the cache is still valid and no recompute happens.
//!
//! 3. Otherwise recompute: clear the recorded dependencies, run the read
//!    function with a [`Getter`] that records every atom it touches, and
//!    bump the epoch only if the outcome changed observably.
//!
//! # How a write works
//!
//! A write to a primitive stores the value directly, bumps its epoch on
//!    change, marks it in the pending change set, and flags every mounted
//! transitive dependent as invalidated at its current epoch without
//! recomputing anything. Custom write functions run with a [`Setter`] whose
//! `get` is the full read path and whose `set` recurses into other atoms'
//! write functions, so writes can fan out arbitrarily. Recomputation happens
//! afterwards, in one topological pass (see the scheduler module).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use smallvec::{smallvec, SmallVec};
use tracing::trace;

use crate::atom::{AnyAtom, Atom, AtomCore, AtomId, AtomValue, BoxedValue, ReadKind, Value, WritableAtom, WriteKind};
use crate::error::{EvalError, StoreError};

use super::state::{AtomResult, AtomState, MountedState};
use super::{RawSetSelf, StoreShared};

/// Deferred lifecycle or listener callback, delivered by the flush loop.
pub(crate) type FlushCallback = Box<dyn FnOnce() + Send>;

/// The mutable core of a store. All mutation funnels through here while the
/// store's lock is held.
pub(crate) struct StoreInner {
    /// Runtime state for every atom this store has touched.
    pub(crate) states: HashMap<AtomId, AtomState>,

    /// Mount records for atoms currently reachable from a subscription.
    pub(crate) mounted: HashMap<AtomId, MountedState>,

    /// Atom -> epoch at which it was marked stale. An atom is invalidated
    /// iff its entry equals its current epoch.
    pub(crate) invalidated: HashMap<AtomId, u64>,

    /// Atoms whose value changed in the current batch, in change order.
    pub(crate) changed: IndexSet<AtomId>,

    /// `on_mount` hooks waiting for the next flush.
    pub(crate) mount_callbacks: Vec<FlushCallback>,

    /// Unmount hooks waiting for the next flush.
    pub(crate) unmount_callbacks: Vec<FlushCallback>,

    /// True while the flush loop is draining callbacks; reentrant writes
    /// fold their work into the running cycle instead of nesting.
    pub(crate) flushing: bool,

    /// Back-reference to the shared store, for hooks that re-enter it.
    pub(crate) shared: Weak<StoreShared>,
}

impl StoreInner {
    pub(crate) fn new(shared: Weak<StoreShared>) -> Self {
        Self {
            states: HashMap::new(),
            mounted: HashMap::new(),
            invalidated: HashMap::new(),
            changed: IndexSet::new(),
            mount_callbacks: Vec::new(),
            unmount_callbacks: Vec::new(),
            flushing: false,
            shared,
        }
    }

    pub(crate) fn ensure_state(&mut self, atom: &Arc<AtomCore>) {
        self.states
            .entry(atom.id())
            .or_insert_with(|| AtomState::new(Arc::downgrade(atom)));
    }

    /// Look a descriptor back up by ID: the mount record pins it, otherwise
    /// the weak reference in its state may still be live.
    pub(crate) fn resolve(&self, id: AtomId) -> Option<Arc<AtomCore>> {
        if let Some(mounted) = self.mounted.get(&id) {
            return Some(mounted.atom.clone());
        }
        self.states.get(&id).and_then(|state| state.atom.upgrade())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Return the atom's current result and epoch, recomputing only when
    /// the cache can no longer be proven valid.
    pub(crate) fn read_atom_state(&mut self, atom: &Arc<AtomCore>) -> (AtomResult, u64) {
        let id = atom.id();
        self.ensure_state(atom);

        let snapshot = self.states.get(&id).and_then(|state| {
            state.result.clone().map(|result| {
                let deps: SmallVec<[(AtomId, u64); 8]> =
                    state.deps.iter().map(|(&dep, &epoch)| (dep, epoch)).collect();
                (result, state.epoch, deps)
            })
        });

        if let Some((result, epoch, deps)) = snapshot {
            let mounted_and_fresh = self.mounted.contains_key(&id)
                && self.invalidated.get(&id) != Some(&epoch);
            if mounted_and_fresh {
                return (result, epoch);
            }
            // Unmounted or invalidated: the cache is still valid if every
            // recorded dependency reports the epoch we saw last time.
            if self.deps_unchanged(id, &deps) {
                return (result, epoch);
            }
        }

        self.recompute(atom)
    }

    fn deps_unchanged(&mut self, id: AtomId, deps: &[(AtomId, u64)]) -> bool {
        for &(dep_id, seen) in deps {
            if dep_id == id {
                continue;
            }
            let Some(dep) = self.resolve(dep_id) else {
                return false;
            };
            let (_, epoch) = self.read_atom_state(&dep);
            if epoch != seen {
                return false;
            }
        }
        true
    }

    fn recompute(&mut self, atom: &Arc<AtomCore>) -> (AtomResult, u64) {
        let id = atom.id();
        trace!(atom = %id, label = atom.label().unwrap_or(""), "recompute");

        let (prev_result, prev_epoch) = {
            let state = self
                .states
                .get_mut(&id)
                .expect("state created before recompute");
            let prev = (state.result.clone(), state.epoch);
            state.deps.clear();
            prev
        };

        let outcome: AtomResult = match &atom.read {
            ReadKind::Derived(read) => {
                let read = read.clone();
                let mut getter = Getter { inner: self, atom: atom.clone() };
                read(&mut getter)
            }
            ReadKind::Primitive => match prev_result.clone() {
                Some(result) => result,
                None => match atom.init.clone() {
                    Some(value) => Ok(value),
                    None => Err(atom.uninitialized_error()),
                },
            },
        };

        let (new_result, bumped) = match outcome {
            Ok(value) => {
                let unchanged = matches!(&prev_result, Some(Ok(prev))
                    if Arc::ptr_eq(prev, &value) || (atom.eq)(prev.as_ref(), value.as_ref()));
                (Ok(value), !unchanged)
            }
            // An error outcome always counts as a change.
            Err(err) => (Err(err), true),
        };
        let epoch = if bumped { prev_epoch + 1 } else { prev_epoch };

        {
            let state = self
                .states
                .get_mut(&id)
                .expect("state survives recompute");
            state.result = Some(new_result.clone());
            state.epoch = epoch;
        }

        // An invalidated atom whose recompute actually changed something
        // joins the pending change set so the scheduler revisits its
        // dependents.
        if bumped && self.invalidated.get(&id) == Some(&prev_epoch) {
            self.changed.insert(id);
        }
        if self.mounted.contains_key(&id) {
            self.mount_dependencies(atom);
        }

        (new_result, epoch)
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Run an atom's write capability with an erased argument.
    pub(crate) fn write_atom_state(
        &mut self,
        atom: &Arc<AtomCore>,
        arg: BoxedValue,
    ) -> Result<BoxedValue, StoreError> {
        match &atom.write {
            WriteKind::ReadOnly => Err(StoreError::ReadOnly),
            WriteKind::SelfValue => {
                let value: Value = Arc::from(arg);
                self.set_atom_value(atom, value);
                Ok(Box::new(()))
            }
            WriteKind::Custom(write) => {
                let write = write.clone();
                let mut setter = Setter { inner: self, atom: atom.clone() };
                write(&mut setter, arg)
            }
        }
    }

    /// Store a value into an atom directly, bypassing any read function.
    fn set_atom_value(&mut self, atom: &Arc<AtomCore>, value: Value) {
        let id = atom.id();
        self.ensure_state(atom);
        let changed = {
            let state = self
                .states
                .get_mut(&id)
                .expect("state created before write");
            let unchanged = matches!(&state.result, Some(Ok(prev))
                if Arc::ptr_eq(prev, &value) || (atom.eq)(prev.as_ref(), value.as_ref()));
            state.result = Some(Ok(value));
            if !unchanged {
                state.epoch += 1;
            }
            !unchanged
        };
        trace!(atom = %id, label = atom.label().unwrap_or(""), changed, "write");
        if changed {
            self.changed.insert(id);
            self.invalidate_dependents(id);
        }
        if self.mounted.contains_key(&id) {
            self.mount_dependencies(atom);
        }
    }

    /// Flag every mounted transitive dependent as stale at its current
    /// epoch, without recomputing anything yet.
    fn invalidate_dependents(&mut self, id: AtomId) {
        let mut stack: SmallVec<[AtomId; 16]> = SmallVec::new();
        let mut seen: IndexSet<AtomId> = IndexSet::new();
        if let Some(mounted) = self.mounted.get(&id) {
            stack.extend(mounted.dependents.iter().copied());
        }
        while let Some(dependent) = stack.pop() {
            if !seen.insert(dependent) {
                continue;
            }
            if let Some(epoch) = self.states.get(&dependent).map(|s| s.epoch) {
                self.invalidated.insert(dependent, epoch);
            }
            if let Some(mounted) = self.mounted.get(&dependent) {
                stack.extend(mounted.dependents.iter().copied());
            }
        }
    }

    // ------------------------------------------------------------------
    // Mount lifecycle
    // ------------------------------------------------------------------

    /// Mount an atom and, first, everything it depends on. Idempotent.
    pub(crate) fn mount_atom(&mut self, atom: &Arc<AtomCore>) {
        if self.mounted.contains_key(&atom.id()) {
            return;
        }
        // Recompute to discover the current dependency set.
        let _ = self.read_atom_state(atom);

        // Explicit work-list: dependencies are mounted before the atoms
        // that rely on them.
        let mut stack: SmallVec<[(Arc<AtomCore>, bool); 8]> = smallvec![(atom.clone(), false)];
        while let Some((core, deps_done)) = stack.pop() {
            let id = core.id();
            if self.mounted.contains_key(&id) {
                continue;
            }
            let dep_ids: SmallVec<[AtomId; 8]> = self
                .states
                .get(&id)
                .map(|s| s.deps.keys().copied().filter(|dep| *dep != id).collect())
                .unwrap_or_default();
            if deps_done {
                trace!(atom = %id, label = core.label().unwrap_or(""), "mount");
                for dep in &dep_ids {
                    if let Some(mounted) = self.mounted.get_mut(dep) {
                        mounted.dependents.insert(id);
                    }
                }
                let deps: IndexSet<AtomId> = dep_ids.into_iter().collect();
                self.mounted.insert(id, MountedState::new(core.clone(), deps));
                if core.on_mount.is_some() {
                    self.enqueue_mount_hook(&core);
                }
            } else {
                stack.push((core, true));
                for dep_id in dep_ids {
                    if self.mounted.contains_key(&dep_id) {
                        continue;
                    }
                    if let Some(dep) = self.resolve(dep_id) {
                        stack.push((dep, false));
                    }
                }
            }
        }
    }

    fn enqueue_mount_hook(&mut self, core: &Arc<AtomCore>) {
        let Some(hook) = core.on_mount.clone() else {
            return;
        };
        let shared = self.shared.clone();
        let core = core.clone();
        self.mount_callbacks.push(Box::new(move || {
            let setter = RawSetSelf::new(shared.clone(), core.clone());
            let Some(on_unmount) = hook(setter) else {
                return;
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let guard = shared.cell.lock();
            let mut inner = guard.borrow_mut();
            match inner.mounted.get_mut(&core.id()) {
                Some(mounted) => mounted.on_unmount = Some(on_unmount),
                // Unmounted again before the hook ran: deliver the cleanup
                // in this same flush cycle.
                None => inner.unmount_callbacks.push(on_unmount),
            }
        }));
    }

    /// Attempt to unmount an atom, cascading to dependencies that become
    /// unreferenced. A no-op while the atom still has listeners or a
    /// mounted dependent that lists it as a dependency.
    pub(crate) fn unmount_atom(&mut self, id: AtomId) {
        let mut stack: SmallVec<[AtomId; 8]> = smallvec![id];
        while let Some(id) = stack.pop() {
            if !self.can_unmount(id) {
                continue;
            }
            let Some(mounted) = self.mounted.remove(&id) else {
                continue;
            };
            trace!(atom = %id, label = mounted.atom.label().unwrap_or(""), "unmount");
            if let Some(on_unmount) = mounted.on_unmount {
                self.unmount_callbacks.push(on_unmount);
            }
            for dep in mounted.deps.iter().copied() {
                if let Some(dep_mounted) = self.mounted.get_mut(&dep) {
                    dep_mounted.dependents.shift_remove(&id);
                }
                stack.push(dep);
            }
        }
    }

    fn can_unmount(&self, id: AtomId) -> bool {
        let Some(mounted) = self.mounted.get(&id) else {
            return false;
        };
        let has_listeners = self
            .states
            .get(&id)
            .map_or(false, |state| !state.listeners.is_empty());
        if has_listeners {
            return false;
        }
        !mounted.dependents.iter().any(|dependent| {
            self.mounted
                .get(dependent)
                .map_or(false, |m| m.deps.contains(&id))
        })
    }

    /// Reconcile a mounted atom's edge set with the dependencies recorded
    /// by its latest evaluation: mount and link new dependencies, unlink
    /// and try to unmount stale ones.
    fn mount_dependencies(&mut self, atom: &Arc<AtomCore>) {
        let id = atom.id();
        if !self.mounted.contains_key(&id) {
            return;
        }
        let current: IndexSet<AtomId> = self
            .states
            .get(&id)
            .map(|s| s.deps.keys().copied().filter(|dep| *dep != id).collect())
            .unwrap_or_default();
        let previous: IndexSet<AtomId> = self
            .mounted
            .get(&id)
            .map(|m| m.deps.clone())
            .unwrap_or_default();

        let added: SmallVec<[AtomId; 8]> = current.difference(&previous).copied().collect();
        for dep in added {
            if let Some(core) = self.resolve(dep) {
                self.mount_atom(&core);
                if let Some(dep_mounted) = self.mounted.get_mut(&dep) {
                    dep_mounted.dependents.insert(id);
                }
                if let Some(mounted) = self.mounted.get_mut(&id) {
                    mounted.deps.insert(dep);
                }
            }
        }

        let removed: SmallVec<[AtomId; 8]> = previous.difference(&current).copied().collect();
        for dep in removed {
            if let Some(mounted) = self.mounted.get_mut(&id) {
                mounted.deps.shift_remove(&dep);
            }
            if let Some(dep_mounted) = self.mounted.get_mut(&dep) {
                dep_mounted.dependents.shift_remove(&id);
            }
            self.unmount_atom(dep);
        }
    }

    // ------------------------------------------------------------------
    // Flush support
    // ------------------------------------------------------------------

    /// Drain one batch of pending work in delivery order: listeners of
    /// changed atoms first, then unmount hooks, then mount hooks.
    pub(crate) fn drain_callbacks(&mut self) -> Vec<FlushCallback> {
        let mut batch: Vec<FlushCallback> = Vec::new();
        let changed: SmallVec<[AtomId; 8]> = self.changed.drain(..).collect();
        for id in changed {
            if let Some(state) = self.states.get(&id) {
                for listener in state.listeners.values() {
                    let listener = listener.clone();
                    batch.push(Box::new(move || listener()));
                }
            }
        }
        batch.extend(self.unmount_callbacks.drain(..));
        batch.extend(self.mount_callbacks.drain(..));
        batch
    }
}

/// Read access handed to derived atoms' read functions.
///
/// Every read through a `Getter` is recorded as a dependency of the atom
/// being evaluated.
pub struct Getter<'a> {
    inner: &'a mut StoreInner,
    atom: Arc<AtomCore>,
}

impl Getter<'_> {
    /// Read another atom's current value, recording it as a dependency.
    pub fn get<T: AtomValue>(&mut self, atom: &Atom<T>) -> Result<T, EvalError> {
        let value = self.get_value(atom.core())?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| atom.core().type_mismatch_error())
    }

    /// Erased variant of [`Getter::get`].
    pub fn get_raw(&mut self, atom: &AnyAtom) -> Result<Value, EvalError> {
        self.get_value(atom.core())
    }

    fn get_value(&mut self, core: &Arc<AtomCore>) -> Result<Value, EvalError> {
        let self_id = self.atom.id();
        if core.id() == self_id {
            // Self-reference: serve the current result, or the descriptor's
            // initial value on the very first evaluation.
            if let Some(state) = self.inner.states.get(&self_id) {
                if let Some(result) = state.result.clone() {
                    return result;
                }
            }
            let init = core
                .init
                .clone()
                .ok_or_else(|| core.uninitialized_error())?;
            if let Some(state) = self.inner.states.get_mut(&self_id) {
                state.result = Some(Ok(init.clone()));
            }
            return Ok(init);
        }

        let dep_id = core.id();
        let (result, epoch) = self.inner.read_atom_state(core);
        if let Some(state) = self.inner.states.get_mut(&self_id) {
            state.deps.insert(dep_id, epoch);
        }
        if let Some(mounted) = self.inner.mounted.get_mut(&dep_id) {
            mounted.dependents.insert(self_id);
        }
        result
    }
}

/// Read-write access handed to write functions.
pub struct Setter<'a> {
    inner: &'a mut StoreInner,
    atom: Arc<AtomCore>,
}

impl Setter<'_> {
    /// Read an atom's current value through the full read path, so writers
    /// always observe up-to-date values.
    pub fn get<T: AtomValue>(&mut self, atom: &Atom<T>) -> Result<T, EvalError> {
        let (result, _) = self.inner.read_atom_state(atom.core());
        let value = result?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| atom.core().type_mismatch_error())
    }

    /// Write an atom. Writing the atom whose write function is currently
    /// running stores the value directly; writing any other atom recurses
    /// into that atom's own write function.
    pub fn set<T, A, R>(&mut self, atom: &WritableAtom<T, A, R>, arg: A) -> Result<R, StoreError>
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

    fn set_erased(
        &mut self,
        target: &Arc<AtomCore>,
        arg: BoxedValue,
    ) -> Result<BoxedValue, StoreError> {
        if target.id() == self.atom.id() {
            let value: Value = Arc::from(arg);
            self.inner.set_atom_value(target, value);
            Ok(Box::new(()))
        } else {
            self.inner.write_atom_state(target, arg)
        }
    }
}
