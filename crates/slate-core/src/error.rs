//! Error types for Navy Slate
//!
//! Provides the failure taxonomy shared by every layer:
//! - Remote failures from the hosted backend
//! - Caller-side precondition failures (raised before any network call)
//! - Local mirror corruption (always downgraded to a cache miss)
//! - Sync cycle failures (retried, then deferred to the next tick)

use crate::entity::{EntityKind, Points};
use serde::{Deserialize, Serialize};

/// Structured error returned by the backend (`{code, message}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({})", .code.as_deref().unwrap_or("no code"))]
pub struct RemoteError {
    /// Backend error code, e.g. `23514` for a check-constraint violation
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl RemoteError {
    /// Error with a code
    #[inline]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Connectivity failure (no response from the backend)
    #[inline]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(codes::NETWORK, message)
    }

    /// Classify the failure from its code
    #[must_use]
    pub fn kind(&self) -> RemoteFailureKind {
        match self.code.as_deref() {
            Some(codes::NETWORK) | Some(codes::TIMEOUT) => RemoteFailureKind::Network,
            Some(codes::UNAUTHORIZED) | Some(codes::FORBIDDEN) | Some(codes::JWT_EXPIRED) => {
                RemoteFailureKind::Unauthorized
            }
            Some(codes::NOT_FOUND) | Some(codes::NO_ROWS) => RemoteFailureKind::NotFound,
            Some(codes::CHECK_VIOLATION) | Some(codes::UNIQUE_VIOLATION)
            | Some(codes::FOREIGN_KEY_VIOLATION) => RemoteFailureKind::Constraint,
            Some(codes::DECODE) => RemoteFailureKind::Decode,
            _ => RemoteFailureKind::Other,
        }
    }
}

/// Well-known backend error codes
pub mod codes {
    /// Transport failure, no response
    pub const NETWORK: &str = "network";
    /// Request timed out
    pub const TIMEOUT: &str = "timeout";
    /// Missing or invalid session
    pub const UNAUTHORIZED: &str = "401";
    /// Row-level security rejection
    pub const FORBIDDEN: &str = "42501";
    /// Session token expired
    pub const JWT_EXPIRED: &str = "PGRST301";
    /// Requested row does not exist
    pub const NOT_FOUND: &str = "404";
    /// `single()` matched no rows
    pub const NO_ROWS: &str = "PGRST116";
    /// Check constraint violated (e.g. negative balance)
    pub const CHECK_VIOLATION: &str = "23514";
    /// Unique constraint violated
    pub const UNIQUE_VIOLATION: &str = "23505";
    /// Foreign key violated
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    /// Response row could not be decoded
    pub const DECODE: &str = "decode";
}

/// Coarse classification of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteFailureKind {
    /// Network or timeout
    Network,
    /// Authorization rejected
    Unauthorized,
    /// Constraint violated server-side
    Constraint,
    /// Row not found
    NotFound,
    /// Response could not be decoded
    Decode,
    /// Anything else
    Other,
}

/// Caller-side precondition failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Balance below the cost of the operation
    #[error("insufficient points: need {required}, have {available}")]
    InsufficientPoints { required: Points, available: Points },

    /// Reward has nothing left to redeem
    #[error("{title} is out of stock")]
    OutOfStock { title: String },

    /// Task already completed as often as its frequency allows
    #[error("{title} has already been completed for this period")]
    FrequencyExhausted { title: String },

    /// Target record is not in the cache
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    /// Any other invalid input
    #[error("{0}")]
    Invalid(String),
}

/// Main error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SlateError {
    /// Network, authorization or constraint failure from the backend
    #[error("remote operation failed: {0}")]
    RemoteOperationFailed(#[from] RemoteError),

    /// Precondition not met; no cache write or network call happened
    #[error("validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    /// Malformed data read from the local mirror or preference store
    #[error("cache corruption in {key}: {reason}")]
    CacheCorruption { key: String, reason: String },

    /// A scheduled reconciliation exhausted its retries
    #[error("sync cycle failed after {attempts} attempts: {last_error}")]
    SyncCycleFailed { attempts: u32, last_error: String },

    /// The fetch this caller was waiting on was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl SlateError {
    /// Create cache corruption error
    #[inline]
    pub fn corruption(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheCorruption {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying later could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteOperationFailed(remote) => remote.kind() == RemoteFailureKind::Network,
            Self::SyncCycleFailed { .. } | Self::Cancelled => true,
            _ => false,
        }
    }

    /// Whether the backend was never contacted
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationFailed(_))
    }

    /// Short text suitable for a toast
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::RemoteOperationFailed(remote) => match remote.kind() {
                RemoteFailureKind::Network => "You appear to be offline. Please try again.".into(),
                RemoteFailureKind::Unauthorized => "Your session has expired. Please sign in again.".into(),
                _ => remote.message.clone(),
            },
            Self::ValidationFailed(validation) => validation.to_string(),
            Self::SyncCycleFailed { .. } => "Could not refresh your data. Will retry shortly.".into(),
            Self::CacheCorruption { .. } | Self::Cancelled => String::new(),
            Self::Config(message) => message.clone(),
        }
    }
}

/// Result type alias for slate operations
pub type SlateResult<T> = Result<T, SlateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_kinds() {
        assert_eq!(RemoteError::network("down").kind(), RemoteFailureKind::Network);
        assert_eq!(
            RemoteError::new(codes::CHECK_VIOLATION, "points must be >= 0").kind(),
            RemoteFailureKind::Constraint
        );
        assert_eq!(
            RemoteError::new(codes::FORBIDDEN, "rls").kind(),
            RemoteFailureKind::Unauthorized
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(SlateError::from(RemoteError::network("x")).is_retryable());
        assert!(!SlateError::from(RemoteError::new(codes::CHECK_VIOLATION, "x")).is_retryable());
        assert!(!SlateError::from(ValidationError::Invalid("x".into())).is_retryable());
    }

    #[test]
    fn validation_display() {
        let err = SlateError::from(ValidationError::InsufficientPoints {
            required: 50,
            available: 30,
        });
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "validation failed: insufficient points: need 50, have 30"
        );
    }

    #[test]
    fn user_message_for_constraint_uses_server_text() {
        let err = SlateError::from(RemoteError::new(codes::CHECK_VIOLATION, "balance too low"));
        assert_eq!(err.user_message(), "balance too low");
    }
}
