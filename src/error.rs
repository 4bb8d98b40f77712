//! Crate-wide error type.
//!
//! Input and validation errors abort the current statement. Resource events
//! that can be downgraded (the HNSW build arena overflowing its budget) are
//! emitted as a `tracing::warn!` notice instead and never reach this type.

use thiserror::Error;

/// Error raised by vector operations and index engines.
#[derive(Debug, Error)]
pub enum VexError {
    /// Operation between vectors of unequal dimension, or against an index
    /// built for a different dimension.
    #[error("different vector dimensions {expected} and {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Malformed literal, non-finite element, or parameter out of range.
    #[error("invalid input: {0}")]
    BadInput(String),

    /// Arithmetic produced a non-finite result.
    #[error("overflow in {0}")]
    Overflow(&'static str),

    /// Operation the engine does not support (oversized indexed dimension,
    /// L1 distance with an index, distance kind not bound to the index).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The host requested cancellation; all page latches have been released.
    #[error("operation interrupted")]
    Interrupted,

    /// Maintenance memory is insufficient for a mandatory structure.
    #[error("insufficient maintenance memory: need {needed} bytes, budget is {budget}")]
    Resource { needed: usize, budget: usize },

    /// Corrupt or inconsistent on-page state.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VexError>;

impl VexError {
    /// Shorthand for a `BadInput` with a formatted message.
    pub(crate) fn bad_input(msg: impl Into<String>) -> Self {
        VexError::BadInput(msg.into())
    }

    /// Shorthand for an `Unsupported` with a formatted message.
    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        VexError::Unsupported(msg.into())
    }
}
