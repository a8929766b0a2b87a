//! Error types for session-arbiter.

use thiserror::Error;

use crate::operation::InterruptReason;

/// Main error type for session-arbiter operations.
///
/// These are the *recoverable* failures of the registry. Invariant
/// violations (double release, redeeming a mismatched kill token,
/// destroying a slot with live waiters) are programming errors and
/// panic instead of being reported through this enum.
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// Kill or lookup against a session id that was never created.
    #[error("no such session: {0}")]
    NoSuchSession(String),

    /// Hierarchical checkout requested while child sessions are
    /// administratively disabled.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A blocking checkout wait was interrupted externally.
    #[error("operation interrupted: {0}")]
    Interrupted(InterruptReason),

    /// The operation already holds a checkout and is not inside the
    /// nested direct-call exception.
    #[error("operation already holds a checked-out session")]
    AlreadyCheckedOut,

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

/// Convenience Result type for session-arbiter operations.
pub type Result<T> = std::result::Result<T, ArbiterError>;
