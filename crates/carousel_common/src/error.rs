//! Centralised error handling for the Carousel platform.
//!
//! All crates depend on `carousel_common::error::{CoreError, Result}`
//! instead of rolling their own error types, so errors cross service
//! boundaries without re-mapping. Variants are intentionally broad: the
//! four public kinds carry a stable machine code for the transport layer,
//! everything else collapses to a generic internal error at the boundary.

use thiserror::Error;

use crate::types::Amount;

/// A convenient `Result` alias tied to [`CoreError`].
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Top-level domain error.
///
/// `NotFound`, `Conflict`, `Validation` and `InsufficientFunds` are the
/// public kinds: terminal for the caller (except a `Conflict` on an
/// in-flight idempotent operation, which may be retried after a delay).
/// `Storage` and `Internal` never leak their message outward.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Requested entity could not be found in storage.
    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong state for the requested transition, or a concurrent operation
    /// holds the resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid input or business-rule violation (e.g. a non-increasing
    /// raise).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A debit was attempted beyond the spendable balance. Carries the
    /// exact numbers so the caller can surface them.
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    /// Storage-layer failure (connection loss, corrupted row, ...).
    #[error("storage error: {0}")]
    Storage(String),

    /// Generic catch-all for failures we don't categorise yet.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{entity} {id}"))
    }

    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::Storage(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Human-readable message safe to show a caller. Internal kinds are
    /// masked; the full detail stays in logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) | Self::Internal(_) => "internal error".to_owned(),
            other => other.to_string(),
        }
    }

    /// Whether the caller is expected to succeed by simply retrying later.
    /// Only a conflict (in-flight idempotent operation, lost write race)
    /// qualifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
