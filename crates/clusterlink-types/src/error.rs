//! Shared error types for clusterlink.

use thiserror::Error;

/// What callers of the cluster agent see when they ask for a channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// No event-loop connection is currently usable. Retry later.
    #[error("No connections available")]
    NoConnectionsAvailable,

    /// The agent is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Whether the caller should simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoConnectionsAvailable)
    }
}

/// Alias for results using [`ClusterError`].
pub type ClusterResult<T> = Result<T, ClusterError>;
