//! Atom descriptors.
//!
//! A descriptor is the immutable, stateless identity of one node in the
//! dependency graph: how to compute its value and, optionally, how to accept
//! writes. Descriptors hold no runtime value; all mutable bookkeeping lives
//! in the store, keyed by [`AtomId`].
//!
//! Three handle types share the same underlying descriptor:
//!
//! - [`AnyAtom`] is the type-erased handle used by subscription and
//!   introspection APIs.
//! - [`Atom<T>`] adds the value type for reads.
//! - [`WritableAtom<T, A, R>`] adds write capability: argument type `A` and
//!   writer result type `R`. [`PrimitiveAtom<T>`] is the common
//!   `WritableAtom<T, T, ()>` case whose write simply replaces the value.
//!
//! Cloning any handle preserves identity: the clones refer to the same graph
//! node, and the same descriptor used with two stores has two independent
//! runtime states.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{EvalError, StoreError};
use crate::store::{Getter, RawSetSelf, SetSelf, Setter};

use super::id::AtomId;

/// A stored atom value.
pub type Value = Arc<dyn Any + Send + Sync>;

/// An erased write argument or writer result.
pub type BoxedValue = Box<dyn Any + Send + Sync>;

/// Cleanup hook returned by an `on_mount` callback; runs when the atom is
/// unmounted.
pub type OnUnmount = Box<dyn FnOnce() + Send>;

/// Marker trait for types an atom can hold.
///
/// `Clone` lets readers take the value out of the store, `PartialEq` drives
/// change detection, and `Send + Sync + 'static` lets values live in a store
/// shared across threads.
pub trait AtomValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> AtomValue for T {}

pub(crate) type ReadFn =
    Arc<dyn Fn(&mut Getter<'_>) -> Result<Value, EvalError> + Send + Sync>;

pub(crate) type WriteFn =
    Arc<dyn Fn(&mut Setter<'_>, BoxedValue) -> Result<BoxedValue, StoreError> + Send + Sync>;

pub(crate) type MountFn = Arc<dyn Fn(RawSetSelf) -> Option<OnUnmount> + Send + Sync>;

/// Change-detection function, monomorphized per value type.
pub(crate) type EqFn = fn(&dyn Any, &dyn Any) -> bool;

fn value_eq<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Read capability of a descriptor.
pub(crate) enum ReadKind {
    /// The value comes from the initial value and direct writes; there is no
    /// read function and no dependencies.
    Primitive,
    /// The value is computed from other atoms.
    Derived(ReadFn),
}

/// Write capability of a descriptor.
pub(crate) enum WriteKind {
    ReadOnly,
    /// The write argument replaces the stored value directly.
    SelfValue,
    /// A custom write function runs with read and write access to the store.
    Custom(WriteFn),
}

/// The shared, immutable core of a descriptor.
pub(crate) struct AtomCore {
    id: AtomId,
    label: Option<&'static str>,
    pub(crate) read: ReadKind,
    pub(crate) write: WriteKind,
    pub(crate) init: Option<Value>,
    pub(crate) eq: EqFn,
    pub(crate) on_mount: Option<MountFn>,
}

impl AtomCore {
    pub(crate) fn id(&self) -> AtomId {
        self.id
    }

    pub(crate) fn label(&self) -> Option<&'static str> {
        self.label
    }

    pub(crate) fn uninitialized_error(&self) -> EvalError {
        EvalError::uninitialized(self.label, self.id.raw())
    }

    pub(crate) fn type_mismatch_error(&self) -> EvalError {
        EvalError::type_mismatch(self.label, self.id.raw())
    }
}

impl fmt::Debug for AtomCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("writable", &!matches!(self.write, WriteKind::ReadOnly))
            .finish()
    }
}

/// A type-erased atom handle.
///
/// Compared and hashed by identity, never by value.
pub struct AnyAtom {
    core: Arc<AtomCore>,
}

impl AnyAtom {
    pub(crate) fn from_core(core: Arc<AtomCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<AtomCore> {
        &self.core
    }

    /// The atom's unique identity.
    pub fn id(&self) -> AtomId {
        self.core.id
    }

    /// The debug label, if one was set.
    pub fn label(&self) -> Option<&'static str> {
        self.core.label
    }

    /// Capability check: does this descriptor accept writes?
    pub fn is_writable(&self) -> bool {
        !matches!(self.core.write, WriteKind::ReadOnly)
    }
}

impl Clone for AnyAtom {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core) }
    }
}

impl PartialEq for AnyAtom {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for AnyAtom {}

impl std::hash::Hash for AnyAtom {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.core.id.hash(state);
    }
}

impl fmt::Debug for AnyAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.fmt(f)
    }
}

impl AsRef<AnyAtom> for AnyAtom {
    fn as_ref(&self) -> &AnyAtom {
        self
    }
}

/// A typed read handle for an atom holding a `T`.
pub struct Atom<T> {
    any: AnyAtom,
    _marker: PhantomData<fn() -> T>,
}

impl<T: AtomValue> Atom<T> {
    /// Create a derived atom computed from other atoms.
    ///
    /// The read function runs lazily: on first access, and again only when
    /// one of the atoms it read may have changed. Dependencies are recorded
    /// automatically from the [`Getter`] calls the function makes.
    pub fn derived<F>(read: F) -> Self
    where
        F: Fn(&mut Getter<'_>) -> Result<T, EvalError> + Send + Sync + 'static,
    {
        let read: ReadFn = Arc::new(move |getter| read(getter).map(|v| Arc::new(v) as Value));
        Self::from_core(Arc::new(AtomCore {
            id: AtomId::new(),
            label: None,
            read: ReadKind::Derived(read),
            write: WriteKind::ReadOnly,
            init: None,
            eq: value_eq::<T>,
            on_mount: None,
        }))
    }

    /// Attach a debug label, used by `Debug` output and trace events.
    ///
    /// Must be called before the atom is cloned or handed to a store.
    pub fn with_label(mut self, label: &'static str) -> Self {
        Arc::get_mut(&mut self.any.core)
            .expect("with_label must be called before the atom is shared")
            .label = Some(label);
        self
    }
}

impl<T> Atom<T> {
    pub(crate) fn from_core(core: Arc<AtomCore>) -> Self {
        Self { any: AnyAtom::from_core(core), _marker: PhantomData }
    }

    pub(crate) fn core(&self) -> &Arc<AtomCore> {
        self.any.core()
    }

    /// The atom's unique identity.
    pub fn id(&self) -> AtomId {
        self.any.id()
    }

    /// The debug label, if one was set.
    pub fn label(&self) -> Option<&'static str> {
        self.any.label()
    }

    /// The erased handle for this atom.
    pub fn as_any(&self) -> &AnyAtom {
        &self.any
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self { any: self.any.clone(), _marker: PhantomData }
    }
}

impl<T> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.any == other.any
    }
}

impl<T> Eq for Atom<T> {}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.any.fmt(f)
    }
}

impl<T> AsRef<AnyAtom> for Atom<T> {
    fn as_ref(&self) -> &AnyAtom {
        &self.any
    }
}

/// A typed read-write handle: value type `T`, write argument `A`, writer
/// result `R`.
pub struct WritableAtom<T, A = T, R = ()> {
    atom: Atom<T>,
    _marker: PhantomData<fn(A) -> R>,
}

/// A writable atom whose write replaces the stored value.
pub type PrimitiveAtom<T> = WritableAtom<T, T, ()>;

impl<T: AtomValue> PrimitiveAtom<T> {
    /// Create a primitive atom with an initial value.
    pub fn primitive(init: T) -> Self {
        Self::from_atom(Atom::from_core(Arc::new(AtomCore {
            id: AtomId::new(),
            label: None,
            read: ReadKind::Primitive,
            write: WriteKind::SelfValue,
            init: Some(Arc::new(init)),
            eq: value_eq::<T>,
            on_mount: None,
        })))
    }
}

impl<T, A, R> WritableAtom<T, A, R>
where
    T: AtomValue,
    A: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Create a writable derived atom with a custom write function.
    ///
    /// The write function may read any atom through its [`Setter`] and write
    /// any writable atom, including atoms other than this one.
    pub fn derived<FR, FW>(read: FR, write: FW) -> Self
    where
        FR: Fn(&mut Getter<'_>) -> Result<T, EvalError> + Send + Sync + 'static,
        FW: Fn(&mut Setter<'_>, A) -> Result<R, StoreError> + Send + Sync + 'static,
    {
        let read: ReadFn = Arc::new(move |getter| read(getter).map(|v| Arc::new(v) as Value));
        let write: WriteFn = Arc::new(move |setter, arg| {
            let arg = arg.downcast::<A>().map_err(|_| StoreError::TypeMismatch)?;
            let out = write(setter, *arg)?;
            Ok(Box::new(out) as BoxedValue)
        });
        Self::from_atom(Atom::from_core(Arc::new(AtomCore {
            id: AtomId::new(),
            label: None,
            read: ReadKind::Derived(read),
            write: WriteKind::Custom(write),
            init: None,
            eq: value_eq::<T>,
            on_mount: None,
        })))
    }

    /// Register a lifecycle hook that runs when the atom becomes mounted
    /// (gains its first listener, directly or transitively).
    ///
    /// The hook receives a setter bound to this atom and the mounting store.
    /// Any closure it returns runs when the atom is unmounted again. Must be
    /// called before the atom is cloned or handed to a store.
    pub fn on_mount<F>(mut self, hook: F) -> Self
    where
        F: Fn(SetSelf<A, R>) -> Option<OnUnmount> + Send + Sync + 'static,
    {
        let hook: MountFn = Arc::new(move |raw| hook(SetSelf::from_raw(raw)));
        Arc::get_mut(&mut self.atom.any.core)
            .expect("on_mount must be called before the atom is shared")
            .on_mount = Some(hook);
        self
    }

    /// Attach a debug label, used by `Debug` output and trace events.
    ///
    /// Must be called before the atom is cloned or handed to a store.
    pub fn with_label(mut self, label: &'static str) -> Self {
        Arc::get_mut(&mut self.atom.any.core)
            .expect("with_label must be called before the atom is shared")
            .label = Some(label);
        self
    }
}

impl<T, A, R> WritableAtom<T, A, R> {
    fn from_atom(atom: Atom<T>) -> Self {
        Self { atom, _marker: PhantomData }
    }

    /// The read handle for this atom.
    pub fn as_atom(&self) -> &Atom<T> {
        &self.atom
    }
}

impl<T, A, R> Clone for WritableAtom<T, A, R> {
    fn clone(&self) -> Self {
        Self { atom: self.atom.clone(), _marker: PhantomData }
    }
}

impl<T, A, R> Deref for WritableAtom<T, A, R> {
    type Target = Atom<T>;

    fn deref(&self) -> &Atom<T> {
        &self.atom
    }
}

impl<T, A, R> fmt::Debug for WritableAtom<T, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.atom.fmt(f)
    }
}

impl<T, A, R> AsRef<AnyAtom> for WritableAtom<T, A, R> {
    fn as_ref(&self) -> &AnyAtom {
        self.atom.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_have_unique_ids() {
        let a = PrimitiveAtom::primitive(0);
        let b = PrimitiveAtom::primitive(0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn clones_share_identity() {
        let a = PrimitiveAtom::primitive(1);
        let b = a.clone();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.as_any(), b.as_any());
    }

    #[test]
    fn capability_check() {
        let primitive = PrimitiveAtom::primitive(0);
        let derived = Atom::derived(|_| Ok(0));
        assert!(primitive.as_any().is_writable());
        assert!(!derived.as_any().is_writable());
    }

    #[test]
    fn labels_show_up_in_debug_output() {
        let atom = PrimitiveAtom::primitive(0).with_label("count");
        assert_eq!(atom.label(), Some("count"));
        assert!(format!("{atom:?}").contains("count"));
    }

    #[test]
    fn writable_atom_derefs_to_read_handle() {
        let atom = PrimitiveAtom::primitive(5);
        let read: &Atom<i32> = &atom;
        assert_eq!(read.id(), atom.as_atom().id());
    }
}
