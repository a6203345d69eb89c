//! Error types for session coordination

use thiserror::Error;

/// Errors surfaced by session operations
///
/// Per-worker failures (send/receive errors on one connection) are contained
/// by demoting the worker and never reach the caller; only session-level
/// violations do.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A synchronous submission was attempted while a query is in flight
    #[error("session is not idle, cannot submit synchronous query")]
    NotIdle,

    /// The session has not started up or has been closed
    #[error("session is not valid")]
    InvalidSession,

    /// A worker with the same host and ordinal is already registered
    #[error("worker already registered: {0}")]
    WorkerAlreadyRegistered(String),

    /// No worker with the given id is known
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// No query matches the given reference or sequence number
    #[error("query not found: {0}")]
    QueryNotFound(String),

    /// An operation needed active workers but none are left
    #[error("no active workers available")]
    NoActiveWorkers,

    /// Connection establishment or handshake failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Send or receive failed on an established connection
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent something the protocol state does not allow
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// True when the error condemns a single connection rather than the
    /// session: the affected worker is demoted and the session carries on
    pub fn is_worker_fault(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionFailed(_)
                | SessionError::Transport(_)
                | SessionError::Protocol(_)
        )
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
