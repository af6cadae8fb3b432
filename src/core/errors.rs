//! Agent and session errors
//!
//! `AgentError` describes one failed attempt of the external agent and feeds
//! the retry loop; `SessionError` covers tab ids, admission and lookups, and
//! maps onto gateway status codes. Storage and startup failures stay `anyhow`.

use thiserror::Error;

/// A single failed attempt of the external CLI agent
///
/// Every variant is transient from the invoker's point of view: the turn is
/// retried until the attempt budget runs out.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The child process could not be started
    #[error("Failed to spawn agent: {0}")]
    Spawn(#[from] std::io::Error),

    /// The child exited with a non-success status
    #[error("Agent exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    /// The child succeeded but printed nothing
    #[error("Agent produced no output")]
    EmptyOutput,

    /// The reply carries the agent's own execution-error marker
    #[error("Agent reported an execution error: {0}")]
    ExecutionError(String),

    /// The attempt hit the configured hard timeout
    #[error("Agent timed out after {0}s")]
    Timeout(u64),
}

/// Errors related to session management
#[derive(Debug, Error)]
pub enum SessionError {
    /// Tab id is empty after canonicalization
    #[error("Invalid tab id: {0:?}")]
    InvalidTabId(String),

    /// Registry is full and eviction could not free a slot
    #[error("Maximum number of sessions reached")]
    CapacityReached,

    /// No session is bound to the tab
    #[error("Session not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message_is_user_facing() {
        assert_eq!(
            SessionError::CapacityReached.to_string(),
            "Maximum number of sessions reached"
        );
    }

    #[test]
    fn test_exit_error_display() {
        let err = AgentError::Exit {
            code: Some(2),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Agent exited with status Some(2): boom");
    }
}
