//! Error taxonomy shared by every layer of the core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{ClaimToken, Phase, RejectionReason, TaskId, TaskStatus};

/// Operational classification of an error.
///
/// - Transient: retry with backoff (`LockTimeout`, `BreakerOpen`, `Timeout`)
/// - Lifecycle: a normal task outcome, not a system failure
/// - Caller: rejected at the boundary, nothing was applied
/// - Fatal: must be reported, never bypassed
/// - Infrastructure: storage / io failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Lifecycle,
    Caller,
    Fatal,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("lock `{resource}` not acquired after {attempts} attempts")]
    LockTimeout { resource: String, attempts: u32 },

    #[error("claim on {task_id} is no longer valid")]
    StaleClaim {
        task_id: TaskId,
        token: Option<ClaimToken>,
    },

    #[error("circuit breaker `{key}` is open (retry in {retry_after:?})")]
    BreakerOpen { key: String, retry_after: Duration },

    #[error("quality gate rejected {task_id} at phase {phase}: {}", join_reasons(.reasons))]
    GateRejected {
        task_id: TaskId,
        phase: Phase,
        reasons: Vec<RejectionReason>,
    },

    #[error("{task_id} exhausted its retries")]
    RetriesExhausted { task_id: TaskId },

    #[error("path {path} resolves outside the trusted root through a symlink")]
    SymlinkViolation { path: PathBuf },

    #[error("invalid task spec: {0}")]
    InvalidSpec(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("transition `{event}` not allowed from status {from}")]
    InvalidTransition { from: TaskStatus, event: String },

    #[error("delegate failed: {0}")]
    Delegate(String),

    #[error("operation `{0}` timed out")]
    Timeout(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

fn join_reasons(reasons: &[RejectionReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::LockTimeout { .. }
            | CoreError::BreakerOpen { .. }
            | CoreError::Timeout(_)
            | CoreError::Delegate(_) => ErrorKind::Transient,
            CoreError::StaleClaim { .. }
            | CoreError::GateRejected { .. }
            | CoreError::RetriesExhausted { .. } => ErrorKind::Lifecycle,
            CoreError::InvalidSpec(_)
            | CoreError::InvalidConfig(_)
            | CoreError::TaskNotFound(_)
            | CoreError::InvalidTransition { .. } => ErrorKind::Caller,
            CoreError::SymlinkViolation { .. } => ErrorKind::Fatal,
            CoreError::Storage(_)
            | CoreError::Io(_)
            | CoreError::Serialization(_)
            | CoreError::Other(_) => ErrorKind::Infrastructure,
        }
    }

    /// Only transient errors may be retried on the same lease.
    /// `StaleClaim` never is: the task has to be claimed again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        CoreError::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        CoreError::Other(format!("blocking task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let err = CoreError::LockTimeout {
            resource: "tasks".into(),
            attempts: 4,
        };
        assert!(err.is_retryable());

        let err = CoreError::BreakerOpen {
            key: "gate:plan".into(),
            retry_after: Duration::from_secs(1),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn stale_claim_and_symlink_are_never_retried() {
        let stale = CoreError::StaleClaim {
            task_id: TaskId::from_ulid(ulid::Ulid::new()),
            token: None,
        };
        assert!(!stale.is_retryable());
        assert_eq!(stale.kind(), ErrorKind::Lifecycle);

        let violation = CoreError::SymlinkViolation {
            path: PathBuf::from("/tmp/x"),
        };
        assert_eq!(violation.kind(), ErrorKind::Fatal);
        assert!(!violation.is_retryable());
    }
}
