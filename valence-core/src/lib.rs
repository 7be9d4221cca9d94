//! # Valence
//!
//! A lazy, dependency-tracking value store built from small composable units
//! called atoms.
//!
//! Atoms are immutable descriptors: a [`PrimitiveAtom`] holds a settable
//! value, a derived [`Atom`] computes one from other atoms, and a
//! [`WritableAtom`] adds a custom write function on top. The [`Store`] owns
//! all runtime state, so the same descriptors can back any number of
//! independent stores.
//!
//! Reads are pulled lazily and memoized; writes push invalidation through
//! the subscribed part of the graph, recompute affected atoms once each in
//! dependency order, and then notify listeners. Atoms nobody subscribes to
//! cost nothing until read.
//!
//! ```
//! use valence_core::{Atom, PrimitiveAtom, Store};
//!
//! let celsius = PrimitiveAtom::primitive(0.0_f64);
//! let fahrenheit = {
//!     let celsius = celsius.clone();
//!     Atom::derived(move |get| Ok(get.get(&celsius)? * 9.0 / 5.0 + 32.0))
//! };
//!
//! let store = Store::new();
//! assert_eq!(store.get(&fahrenheit).unwrap(), 32.0);
//!
//! store.set(&celsius, 100.0).unwrap();
//! assert_eq!(store.get(&fahrenheit).unwrap(), 212.0);
//! ```

pub mod atom;
pub mod error;
pub mod store;

pub use atom::{
    AnyAtom, Atom, AtomId, AtomValue, BoxedValue, OnUnmount, PrimitiveAtom, Value, WritableAtom,
};
pub use error::{EvalError, StoreError, UninitializedAtom};
pub use store::{default_store, Getter, SetSelf, Setter, Store, Subscription};
