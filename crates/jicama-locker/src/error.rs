//! Error types shared by all locker implementations

use thiserror::Error;

/// Error type for locker operations
#[derive(Debug, Error)]
pub enum LockerError {
    /// The caller's cancellation token fired while a lock attempt was in flight.
    #[error("lock attempt cancelled by caller")]
    Cancelled,

    /// `unlock` or `stop` aborted an in-flight attempt for the same key.
    #[error("lock attempt cancelled by locker")]
    LockerCancelled,

    /// The key is neither held nor being attempted by this member.
    #[error("unknown key '{0}'")]
    UnknownKey(String),

    /// Session renewal terminally failed; the lock must be treated as lost.
    #[error("lock renewal lost: {0}")]
    RenewalLost(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LockerError>;
