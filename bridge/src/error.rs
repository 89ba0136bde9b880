//! Error taxonomy shared by both sides of the bridge

use crate::protocol::{CorrelationId, Failure, FailureKind};

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Every failure a caller of the bridge can observe.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Executable not on PATH, or the PATH entry is not a regular file.
    #[error("can't resolve the path requested: {command}")]
    NotFound { command: String },

    /// The OS refused to create the process.
    #[error("spawn failed: {detail}")]
    Spawn { detail: String },

    /// The process ran and exited with a failure status.
    #[error("{detail}")]
    Execution { detail: String },

    /// No settlement (and no progress, when watched) within the window.
    #[error("cmd-{mode}-timeout: {command}")]
    Timeout {
        mode: String,
        command: String,
        expected: bool,
    },

    /// The transport closed while the call was outstanding, twice.
    #[error("transport disconnected while a call was outstanding")]
    Disconnected,

    #[error("couldn't find process to kill with ID: {0}")]
    UnknownProcess(CorrelationId),

    /// Killed through the dispatcher before it settled.
    #[error("process with ID {0} was killed")]
    Killed(CorrelationId),

    #[error("no working directory given and no default configured")]
    MissingWorkingDirectory,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }

    /// True for timeouts the caller declared as expected.
    pub fn is_expected(&self) -> bool {
        matches!(self, BridgeError::Timeout { expected: true, .. })
    }

    pub(crate) fn from_failure(failure: Failure, command: &str) -> Self {
        match failure.kind {
            FailureKind::NotFound => BridgeError::NotFound {
                command: command.to_string(),
            },
            FailureKind::Spawn => BridgeError::Spawn {
                detail: failure.message,
            },
            FailureKind::Execution => BridgeError::Execution {
                detail: failure.message,
            },
            FailureKind::UnknownProcess => BridgeError::Transport(failure.message),
        }
    }
}

impl From<BridgeError> for Failure {
    fn from(err: BridgeError) -> Self {
        let kind = match &err {
            BridgeError::NotFound { .. } => FailureKind::NotFound,
            BridgeError::Spawn { .. } | BridgeError::Io(_) => FailureKind::Spawn,
            BridgeError::UnknownProcess(_) => FailureKind::UnknownProcess,
            _ => FailureKind::Execution,
        };
        Failure {
            kind,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_round_trip_keeps_kind() {
        let failure: Failure = BridgeError::NotFound {
            command: "git".into(),
        }
        .into();
        assert_eq!(failure.kind, FailureKind::NotFound);
        assert!(failure.message.contains("git"));

        let back = BridgeError::from_failure(failure, "git");
        assert!(matches!(back, BridgeError::NotFound { .. }));
    }

    #[test]
    fn test_execution_message_is_the_detail() {
        let err = BridgeError::from_failure(
            Failure {
                kind: FailureKind::Execution,
                message: "fatal: not a git repository".into(),
            },
            "git",
        );
        assert_eq!(err.to_string(), "fatal: not a git repository");
    }

    #[test]
    fn test_expected_timeout() {
        let err = BridgeError::Timeout {
            mode: "spawn".into(),
            command: "git fetch".into(),
            expected: true,
        };
        assert!(err.is_timeout());
        assert!(err.is_expected());
        assert_eq!(err.to_string(), "cmd-spawn-timeout: git fetch");
        assert!(!BridgeError::Disconnected.is_timeout());
    }
}
