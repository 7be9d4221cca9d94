//! Error types for the store.
//!
//! Two layers of errors exist:
//!
//! - [`EvalError`] is produced *inside* atom evaluation. It is cheaply
//!   cloneable because the store caches it exactly like a value: a derived
//!   atom whose read function fails keeps that error until a dependency
//!   change causes a successful recompute, and every reader observes the
//!   same cached error in the meantime.
//!
//! - [`StoreError`] is the public operation error returned by
//!   [`Store`](crate::store::Store) methods. Evaluation errors surface
//!   through it as [`StoreError::Eval`].

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// An error raised during atom evaluation.
///
/// Wraps an arbitrary error value behind an `Arc` so the store can cache it
/// in an atom's state slot and hand out clones to every reader.
#[derive(Clone)]
pub struct EvalError {
    inner: Arc<dyn Error + Send + Sync>,
}

impl EvalError {
    /// Wrap an existing error.
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self { inner: Arc::new(err) }
    }

    /// Create an error from a plain message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::new(Message(msg.into()))
    }

    /// Check whether the wrapped error is of type `E`.
    pub fn is<E: Error + 'static>(&self) -> bool {
        self.inner.downcast_ref::<E>().is_some()
    }

    /// Borrow the wrapped error as `E`, if it has that type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    pub(crate) fn uninitialized(label: Option<&'static str>, id: u64) -> Self {
        let name = match label {
            Some(label) => label.to_string(),
            None => format!("atom#{id}"),
        };
        Self::new(UninitializedAtom(name))
    }

    pub(crate) fn type_mismatch(label: Option<&'static str>, id: u64) -> Self {
        let name = label.map(str::to_string).unwrap_or_else(|| format!("atom#{id}"));
        Self::msg(format!("value of `{name}` has an unexpected type"))
    }

    /// Convert to the public operation error, surfacing descriptor
    /// misconfiguration as its own variant.
    pub(crate) fn into_store_error(self) -> StoreError {
        if self.is::<UninitializedAtom>() {
            StoreError::Uninitialized
        } else {
            StoreError::Eval(self)
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl fmt::Debug for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EvalError").field(&self.inner).finish()
    }
}

impl Error for EvalError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.inner)
    }
}

/// A derived atom was read through a self-reference before it had either a
/// computed value or an initial value. This indicates a descriptor
/// misconfiguration, not a transient condition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("derived atom `{0}` read before initialization")]
pub struct UninitializedAtom(pub(crate) String);

/// Plain-message evaluation error.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// Errors returned by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The atom's read function failed; the error is cached until a
    /// dependency change causes a successful recompute.
    #[error("atom evaluation failed: {0}")]
    Eval(#[from] EvalError),

    /// `set` was invoked on a descriptor without write capability.
    #[error("atom is not writable")]
    ReadOnly,

    /// A derived atom was read via self-reference with no computed value
    /// and no initial value.
    #[error("derived atom read before initialization")]
    Uninitialized,

    /// A value or writer result did not have the expected type. Only
    /// reachable through the type-erased surface.
    #[error("atom value has an unexpected type")]
    TypeMismatch,

    /// A bound setter outlived its store.
    #[error("store no longer exists")]
    StoreGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_error_displays_message() {
        let err = EvalError::msg("division by zero");
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn eval_error_clone_shares_inner() {
        let err = EvalError::msg("boom");
        let clone = err.clone();
        assert_eq!(err.to_string(), clone.to_string());
    }

    #[test]
    fn uninitialized_maps_to_its_own_variant() {
        let err = EvalError::uninitialized(Some("answer"), 0);
        assert!(err.is::<UninitializedAtom>());
        assert!(matches!(err.into_store_error(), StoreError::Uninitialized));
    }

    #[test]
    fn plain_errors_map_to_eval_variant() {
        let err = EvalError::msg("boom");
        assert!(!err.is::<UninitializedAtom>());
        assert!(matches!(err.into_store_error(), StoreError::Eval(_)));
    }

    #[test]
    fn downcast_recovers_wrapped_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("custom")]
        struct Custom(i32);

        let err = EvalError::new(Custom(7));
        assert_eq!(err.downcast_ref::<Custom>().map(|c| c.0), Some(7));
    }
}
