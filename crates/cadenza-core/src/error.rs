// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the replay engine and for workflow code.
//!
//! Two layers exist:
//!
//! - [`TaskError`] ends the current task attempt. The surrounding worker maps
//!   it to a server-facing cause with [`TaskError::failed_cause`].
//! - [`WorkflowError`] is a typed failure payload produced by workflow code,
//!   activities or timers. It flows through futures and becomes the terminal
//!   state of an execution.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::Payload;

/// Reason recorded when a coroutine fault fails the workflow.
pub const PANIC_ERROR_REASON: &str = "cadenzaInternal:Panic";

/// Reason recorded for canceled operations.
pub const CANCELED_ERROR_REASON: &str = "cadenzaInternal:Canceled";

/// Reason recorded for a workflow failed by the nondeterminism policy.
pub const NONDETERMINISM_FAIL_REASON: &str = "NonDeterministicWorkflowPolicyFailWorkflow";

/// Which timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutType {
    /// Time from start to close elapsed.
    StartToClose,
    /// Time from schedule to start elapsed.
    ScheduleToStart,
    /// Time from schedule to close elapsed.
    ScheduleToClose,
    /// Heartbeat interval elapsed.
    Heartbeat,
}

impl fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutType::StartToClose => "StartToClose",
            TimeoutType::ScheduleToStart => "ScheduleToStart",
            TimeoutType::ScheduleToClose => "ScheduleToClose",
            TimeoutType::Heartbeat => "Heartbeat",
        };
        f.write_str(name)
    }
}

/// Failure produced by workflow code, activities or timers.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum WorkflowError {
    /// Application-defined failure identified by its reason.
    #[error("{reason}")]
    Application {
        /// Error type name.
        reason: String,
        /// Optional encoded details.
        details: Option<Payload>,
    },

    /// The operation was canceled.
    #[error("canceled")]
    Canceled {
        /// Optional encoded details.
        details: Option<Payload>,
    },

    /// A timeout fired.
    #[error("timeout: {0}")]
    Timeout(TimeoutType),

    /// Workflow asked to restart itself as a new run.
    #[error("continue as new: {workflow_type}")]
    ContinueAsNew {
        /// Workflow type for the new run.
        workflow_type: String,
        /// Input for the new run.
        input: Payload,
    },

    /// Workflow code panicked and the panic policy fails the workflow.
    #[error("workflow panic: {message}")]
    Panic {
        /// Panic message.
        message: String,
        /// Captured stack.
        stack: String,
    },
}

impl WorkflowError {
    /// Application failure with the given reason.
    pub fn application(reason: impl Into<String>, details: Option<Payload>) -> Self {
        WorkflowError::Application {
            reason: reason.into(),
            details,
        }
    }

    /// Cancellation without details.
    pub fn canceled() -> Self {
        WorkflowError::Canceled { details: None }
    }

    /// Error type name, matched against non-retryable error lists.
    pub fn reason(&self) -> String {
        match self {
            WorkflowError::Application { reason, .. } => reason.clone(),
            WorkflowError::Canceled { .. } => CANCELED_ERROR_REASON.to_string(),
            WorkflowError::Timeout(kind) => format!("cadenzaInternal:Timeout {kind}"),
            WorkflowError::ContinueAsNew { .. } => "cadenzaInternal:ContinueAsNew".to_string(),
            WorkflowError::Panic { .. } => PANIC_ERROR_REASON.to_string(),
        }
    }

    /// Encoded details attached to the failure, if any.
    pub fn details(&self) -> Option<Payload> {
        match self {
            WorkflowError::Application { details, .. } | WorkflowError::Canceled { details } => {
                details.clone()
            }
            WorkflowError::Panic { message, stack } => {
                Payload::encode(&format!("{message}\n{stack}")).ok()
            }
            WorkflowError::Timeout(_) | WorkflowError::ContinueAsNew { .. } => None,
        }
    }

    /// Whether this failure is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkflowError::Canceled { .. })
    }
}

/// Classification of a nondeterminism failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NondeterminismKind {
    /// A historical event has no corresponding replayed command.
    MissingCommand,
    /// A replayed command has no corresponding historical event.
    ExtraCommand,
    /// The next command and next event differ in type or fields.
    Mismatch,
    /// Workflow code asked for replay state that history does not contain.
    IllegalState,
}

/// Replay diverged from history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("nondeterministic workflow: {message}")]
pub struct NondeterminismError {
    /// Classification.
    pub kind: NondeterminismKind,
    /// Human readable description.
    pub message: String,
}

impl NondeterminismError {
    /// Create a classified nondeterminism error.
    pub fn new(kind: NondeterminismKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Cause reported to the server when a task attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskFailedCause {
    /// Replay diverged from history.
    NonDeterministicError,
    /// Any other worker-side failure.
    WorkflowWorkerUnhandledFailure,
}

/// Errors that end the current task attempt.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Replay diverged from history.
    #[error(transparent)]
    Nondeterminism(#[from] NondeterminismError),

    /// Unhandled fault inside workflow code.
    #[error("workflow panic in coroutine {coroutine}: {message}")]
    Panic {
        /// Name of the faulting coroutine.
        coroutine: String,
        /// Panic message.
        message: String,
        /// Stack captured at the panic site.
        stack: String,
    },

    /// A coroutine did not yield back within the deadlock timeout.
    #[error("potential deadlock detected: coroutine {coroutine} did not yield in {timeout:?}")]
    Deadlock {
        /// Name of the stuck coroutine.
        coroutine: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// Missing or out-of-order history events.
    #[error("history integrity error: {0}")]
    HistoryIntegrity(String),

    /// The history page source failed.
    #[error("history page source error: {0}")]
    PageSource(String),

    /// No workflow function is known for the task's workflow type.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// The task heartbeat callback failed.
    #[error("task heartbeat failed: {0}")]
    Heartbeat(String),

    /// Engine invariant violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Server-facing cause for a failed task.
    pub fn failed_cause(&self) -> TaskFailedCause {
        match self {
            TaskError::Nondeterminism(_) => TaskFailedCause::NonDeterministicError,
            _ => TaskFailedCause::WorkflowWorkerUnhandledFailure,
        }
    }

    /// Stable error code for logs and failure payloads.
    pub fn error_code(&self) -> &'static str {
        match self {
            TaskError::Nondeterminism(_) => "NONDETERMINISM",
            TaskError::Panic { .. } => "WORKFLOW_PANIC",
            TaskError::Deadlock { .. } => "POTENTIAL_DEADLOCK",
            TaskError::HistoryIntegrity(_) => "HISTORY_INTEGRITY",
            TaskError::PageSource(_) => "PAGE_SOURCE",
            TaskError::UnknownWorkflowType(_) => "UNKNOWN_WORKFLOW_TYPE",
            TaskError::Heartbeat(_) => "HEARTBEAT_FAILED",
            TaskError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error is a captured coroutine fault.
    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panic { .. })
    }
}

/// Type alias for engine results.
pub type Result<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_cause_mapping() {
        let err: TaskError =
            NondeterminismError::new(NondeterminismKind::ExtraCommand, "extra").into();
        assert_eq!(err.failed_cause(), TaskFailedCause::NonDeterministicError);

        let err = TaskError::Deadlock {
            coroutine: "root".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            err.failed_cause(),
            TaskFailedCause::WorkflowWorkerUnhandledFailure
        );
        assert_eq!(err.error_code(), "POTENTIAL_DEADLOCK");
    }

    #[test]
    fn test_nondeterminism_display() {
        let err = NondeterminismError::new(NondeterminismKind::Mismatch, "bad command");
        assert_eq!(err.to_string(), "nondeterministic workflow: bad command");
    }

    #[test]
    fn test_workflow_error_reason() {
        let err = WorkflowError::application("BadInput", None);
        assert_eq!(err.reason(), "BadInput");
        assert_eq!(WorkflowError::canceled().reason(), CANCELED_ERROR_REASON);
        assert!(WorkflowError::canceled().is_canceled());
        assert_eq!(
            WorkflowError::Timeout(TimeoutType::ScheduleToClose).reason(),
            "cadenzaInternal:Timeout ScheduleToClose"
        );
    }

    #[test]
    fn test_workflow_error_serde() {
        let err = WorkflowError::application("Oops", Some(Payload::from("x")));
        let json = serde_json::to_string(&err).unwrap();
        let back: WorkflowError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
