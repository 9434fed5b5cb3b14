//! Workspace-wide error type.

use thiserror::Error;

/// Error types covering encoding, privilege transitions, and scheduling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FskError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller supplied an empty buffer or an out-of-range parameter.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The OS refused an effective user/group identifier change.
    ///
    /// Subsequent privilege state cannot be trusted; callers are expected
    /// to terminate the process.
    #[error("cannot {action}: {reason}")]
    IdentityChange {
        /// What was attempted, e.g. "set euid to 1000".
        action: String,
        /// OS error description.
        reason: String,
    },

    /// Querying the current scheduler state failed.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Restoring scheduler or identity state on exit from real-time mode failed.
    #[error("restore failed: {0}")]
    Restore(String),

    /// Signal level sink rejected a transition.
    #[error("sink error: {0}")]
    Sink(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl FskError {
    /// Returns true if the process must not continue after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IdentityChange { .. })
    }
}

/// Convenience type alias for FSK operations.
pub type FskResult<T> = Result<T, FskError>;
