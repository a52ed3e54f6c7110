// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands emitted by workflow code.
//!
//! Each command type becomes exactly one event type once the server
//! accepts it; the matcher relies on that pairing.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::event::EventType;
use crate::payload::Payload;

/// Kind of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    ScheduleActivityTask,
    RequestCancelActivityTask,
    StartTimer,
    CancelTimer,
    RecordMarker,
    CompleteWorkflowExecution,
    FailWorkflowExecution,
    CancelWorkflowExecution,
    ContinueAsNewWorkflowExecution,
    SignalExternalWorkflowExecution,
    RequestCancelExternalWorkflowExecution,
    UpsertWorkflowSearchAttributes,
}

impl CommandType {
    /// Event type recorded when this command is accepted.
    pub fn event_type(self) -> EventType {
        match self {
            CommandType::ScheduleActivityTask => EventType::ActivityTaskScheduled,
            CommandType::RequestCancelActivityTask => EventType::ActivityTaskCancelRequested,
            CommandType::StartTimer => EventType::TimerStarted,
            CommandType::CancelTimer => EventType::TimerCanceled,
            CommandType::RecordMarker => EventType::MarkerRecorded,
            CommandType::CompleteWorkflowExecution => EventType::WorkflowExecutionCompleted,
            CommandType::FailWorkflowExecution => EventType::WorkflowExecutionFailed,
            CommandType::CancelWorkflowExecution => EventType::WorkflowExecutionCanceled,
            CommandType::ContinueAsNewWorkflowExecution => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            CommandType::SignalExternalWorkflowExecution => {
                EventType::SignalExternalWorkflowExecutionInitiated
            }
            CommandType::RequestCancelExternalWorkflowExecution => {
                EventType::RequestCancelExternalWorkflowExecutionInitiated
            }
            CommandType::UpsertWorkflowSearchAttributes => {
                EventType::UpsertWorkflowSearchAttributes
            }
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An intent produced by workflow code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ScheduleActivityTask {
        activity_id: String,
        activity_type: String,
        task_list: String,
        input: Payload,
    },
    RequestCancelActivityTask {
        activity_id: String,
    },
    StartTimer {
        timer_id: String,
        start_to_fire_timeout_ms: u64,
    },
    CancelTimer {
        timer_id: String,
    },
    RecordMarker {
        marker_name: String,
        details: Payload,
    },
    CompleteWorkflowExecution {
        result: Option<Payload>,
    },
    FailWorkflowExecution {
        reason: String,
        details: Option<Payload>,
    },
    CancelWorkflowExecution {
        details: Option<Payload>,
    },
    ContinueAsNewWorkflowExecution {
        workflow_type: String,
        input: Payload,
    },
    SignalExternalWorkflowExecution {
        /// Target domain; `None` means the workflow's own domain.
        domain: Option<String>,
        workflow_id: String,
        run_id: Option<String>,
        signal_name: String,
        input: Payload,
        control: String,
    },
    RequestCancelExternalWorkflowExecution {
        domain: Option<String>,
        workflow_id: String,
        run_id: Option<String>,
        control: String,
    },
    UpsertWorkflowSearchAttributes {
        search_attributes: BTreeMap<String, Payload>,
    },
}

impl Command {
    /// Command type.
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::ScheduleActivityTask { .. } => CommandType::ScheduleActivityTask,
            Command::RequestCancelActivityTask { .. } => CommandType::RequestCancelActivityTask,
            Command::StartTimer { .. } => CommandType::StartTimer,
            Command::CancelTimer { .. } => CommandType::CancelTimer,
            Command::RecordMarker { .. } => CommandType::RecordMarker,
            Command::CompleteWorkflowExecution { .. } => CommandType::CompleteWorkflowExecution,
            Command::FailWorkflowExecution { .. } => CommandType::FailWorkflowExecution,
            Command::CancelWorkflowExecution { .. } => CommandType::CancelWorkflowExecution,
            Command::ContinueAsNewWorkflowExecution { .. } => {
                CommandType::ContinueAsNewWorkflowExecution
            }
            Command::SignalExternalWorkflowExecution { .. } => {
                CommandType::SignalExternalWorkflowExecution
            }
            Command::RequestCancelExternalWorkflowExecution { .. } => {
                CommandType::RequestCancelExternalWorkflowExecution
            }
            Command::UpsertWorkflowSearchAttributes { .. } => {
                CommandType::UpsertWorkflowSearchAttributes
            }
        }
    }

    /// Whether the command closes the workflow execution.
    pub fn is_close_command(&self) -> bool {
        matches!(
            self,
            Command::CompleteWorkflowExecution { .. }
                | Command::FailWorkflowExecution { .. }
                | Command::CancelWorkflowExecution { .. }
                | Command::ContinueAsNewWorkflowExecution { .. }
        )
    }

    /// Name of the marker, for marker commands.
    pub fn marker_name(&self) -> Option<&str> {
        match self {
            Command::RecordMarker { marker_name, .. } => Some(marker_name),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_type())?;
        match self {
            Command::ScheduleActivityTask {
                activity_id,
                activity_type,
                ..
            } => write!(f, "(activity_id={activity_id}, activity_type={activity_type})"),
            Command::RequestCancelActivityTask { activity_id } => {
                write!(f, "(activity_id={activity_id})")
            }
            Command::StartTimer { timer_id, .. } | Command::CancelTimer { timer_id } => {
                write!(f, "(timer_id={timer_id})")
            }
            Command::RecordMarker { marker_name, .. } => write!(f, "(marker_name={marker_name})"),
            Command::SignalExternalWorkflowExecution {
                workflow_id,
                signal_name,
                ..
            } => write!(f, "(workflow_id={workflow_id}, signal_name={signal_name})"),
            Command::RequestCancelExternalWorkflowExecution { workflow_id, .. } => {
                write!(f, "(workflow_id={workflow_id})")
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_event_pairing() {
        let command = Command::StartTimer {
            timer_id: "0".to_string(),
            start_to_fire_timeout_ms: 10,
        };
        assert_eq!(command.command_type().event_type(), EventType::TimerStarted);
        assert!(!command.is_close_command());
        assert_eq!(command.to_string(), "StartTimer(timer_id=0)");
        assert!(Command::CompleteWorkflowExecution { result: None }.is_close_command());
    }
}
