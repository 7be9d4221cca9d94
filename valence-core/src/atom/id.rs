//! Identity handles.
//!
//! Atoms are identity-compared: two descriptors are the same node of the
//! graph iff they share an [`AtomId`]. IDs come from process-wide atomic
//! counters, so cloned handles keep their identity and freshly constructed
//! descriptors never collide.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for an atom descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u64);

impl AtomId {
    /// Generate a new unique atom ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom#{}", self.0)
    }
}

/// Unique identifier for a registered listener.
///
/// Handed out by [`Store::sub`](crate::store::Store::sub) so a subscription
/// can later remove exactly the listener it added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
