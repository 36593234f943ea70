//! Typed error hierarchy for the workflow engine.
//!
//! Two top-level enums cover the two boundaries callers can observe:
//! - `EngineError`: configuration errors and caller misuse surfaced by `WorkflowEngine`
//! - `InvokeError`: per-attempt agent failures, folded into `AgentOutcome.error`

use crate::engine::state::RunStatus;
use thiserror::Error;

/// Errors surfaced by the workflow engine to its operator.
///
/// Agent failures and validation shortfalls never appear here; they are
/// recovered into `NeedsRevision` transitions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workflow has no enabled phases")]
    EmptyPhaseGraph,

    #[error("Phase '{phase}' references unknown agent '{agent}'")]
    UnknownAgent { phase: String, agent: String },

    #[error("Phase '{0}' is defined more than once")]
    DuplicatePhase(String),

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Cannot {operation} while run is {status}")]
    InvalidState {
        operation: &'static str,
        status: RunStatus,
    },

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Run {0} is locked by another process")]
    RunLocked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Fatal at `start()`: the workflow itself is malformed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyPhaseGraph
                | EngineError::UnknownAgent { .. }
                | EngineError::DuplicatePhase(_)
        )
    }

    /// The operation was not valid for the run as it stands; state is unchanged.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidState { .. }
                | EngineError::UnknownPhase(_)
                | EngineError::RunNotFound(_)
                | EngineError::RunLocked(_)
        )
    }
}

/// Errors from a single agent invocation attempt.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Failed to spawn agent command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent command timed out after {secs} seconds")]
    TimedOut { secs: u64 },

    #[error("Agent command exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Agent '{0}' has no command configured")]
    MissingCommand(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InvokeError {
    /// Exit code reported by the process, if it ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            InvokeError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}
