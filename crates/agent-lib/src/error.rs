//! Error types for the agent runtime.
//!
//! The taxonomy mirrors how failures propagate: transport and protocol
//! problems are retried or dropped by the long-lived loops that hit them,
//! while scheduling and execution failures surface as terminal job results
//! with the matching state.

use std::time::Duration;

use thiserror::Error;

use crate::models::State;

/// Result type alias using the agent's error type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised by the agent runtime and by command execution.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Network failure talking to a controller or store; retried with backoff.
    #[error("transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed command or result JSON; logged and dropped, never retried.
    #[error("protocol decode failed: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Rejected command arguments; surfaced as an ERROR job result.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A second live command reused an id.
    #[error("duplicate command id '{0}'")]
    DuplicateId(String),

    /// No factory registered for the command name.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Execution exceeded the command's max_time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Execution was interrupted by a kill.
    #[error("execution canceled")]
    Canceled,

    /// Execution ran but failed (non-zero exit, probe failure, ...).
    #[error("execution failed: {0}")]
    Execution(String),

    /// Invariant violation inside the runtime; the affected command fails,
    /// the runtime does not.
    #[error("internal: {0}")]
    Internal(String),
}

impl AgentError {
    /// Creates a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Creates an execution error.
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution(reason.into())
    }

    /// The terminal job-result state this error maps to.
    pub fn state(&self) -> State {
        match self {
            AgentError::DuplicateId(_) => State::DuplicateId,
            AgentError::UnknownCommand(_) => State::UnknownCmd,
            AgentError::Timeout(_) => State::Timeout,
            AgentError::Canceled => State::Killed,
            _ => State::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_result_states() {
        assert_eq!(
            AgentError::DuplicateId("a".into()).state(),
            State::DuplicateId
        );
        assert_eq!(
            AgentError::UnknownCommand("nope".into()).state(),
            State::UnknownCmd
        );
        assert_eq!(
            AgentError::Timeout(Duration::from_secs(1)).state(),
            State::Timeout
        );
        assert_eq!(AgentError::Canceled.state(), State::Killed);
        assert_eq!(AgentError::validation("bad root").state(), State::Error);
    }

    #[test]
    fn messages_are_lowercase_and_actionable() {
        let msg = AgentError::validation("root plist is required").to_string();
        assert!(msg.starts_with("validation failed"));
        assert!(msg.contains("root plist"));
    }
}
