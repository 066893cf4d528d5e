//! Failures the bridge reports back to the operator.

use thiserror::Error;

use crate::session::SessionError;
use crate::tmux::TmuxError;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Policy rejection. Not retryable.
    #[error("command blocked: {reason}")]
    Validation { reason: String },

    #[error("nothing pending for confirmation")]
    ConfirmationMismatch,

    #[error("no tmux session is available")]
    SessionUnavailable,

    /// The tmux process exceeded its bound and was killed.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("execution failed: {diagnostic}")]
    ExecutionFailure { diagnostic: String },

    /// Text reached the pane but the submit key did not.
    #[error("command typed but not submitted: {diagnostic}")]
    PartialDelivery { diagnostic: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BridgeError::Io {
            context: context.into(),
            source,
        }
    }

    /// Short tag used in audit entries and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Validation { .. } => "validation",
            BridgeError::ConfirmationMismatch => "confirmation_mismatch",
            BridgeError::SessionUnavailable => "session_unavailable",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::ExecutionFailure { .. } => "execution_failure",
            BridgeError::PartialDelivery { .. } => "partial_delivery",
            BridgeError::Io { .. } => "io",
        }
    }
}

impl From<TmuxError> for BridgeError {
    fn from(error: TmuxError) -> Self {
        match error {
            TmuxError::Timeout { operation, secs } => BridgeError::Timeout { operation, secs },
            TmuxError::Failed { stderr, .. } => BridgeError::ExecutionFailure { diagnostic: stderr },
            TmuxError::Spawn(source) => BridgeError::io("failed to run tmux", source),
        }
    }
}

impl From<SessionError> for BridgeError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Tmux(inner) => inner.into(),
            other => BridgeError::ExecutionFailure {
                diagnostic: other.to_string(),
            },
        }
    }
}
