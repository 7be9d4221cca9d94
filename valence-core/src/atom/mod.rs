//! Atom Descriptors
//!
//! This module implements the descriptor layer of the store: immutable,
//! stateless descriptions of graph nodes. A descriptor says how an atom's
//! value is obtained (a stored primitive value or a pure function of other
//! atoms) and whether it accepts writes; it never holds a runtime value.
//!
//! # Concepts
//!
//! ## Primitive atoms
//!
//! A primitive atom carries an initial value and accepts direct writes. It
//! is the externally settable leaf of the dependency graph.
//!
//! ## Derived atoms
//!
//! A derived atom computes its value from other atoms through a read
//! function. Reads performed through the function's [`Getter`] argument are
//! recorded as dependencies, so the store knows exactly which changes can
//! affect the atom. A derived atom may additionally carry a write function,
//! which can fan writes out to any writable atom.
//!
//! ## Identity
//!
//! Descriptors are compared by identity, never structurally: cloning a
//! handle yields the same graph node, and the same descriptor used with two
//! stores has two fully independent runtime states.
//!
//! [`Getter`]: crate::store::Getter

mod descriptor;
mod id;

pub use descriptor::{
    AnyAtom, Atom, AtomValue, BoxedValue, OnUnmount, PrimitiveAtom, Value, WritableAtom,
};
pub use id::{AtomId, ListenerId};

pub(crate) use descriptor::{AtomCore, ReadKind, WriteKind};
