// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History events.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TimeoutType;
use crate::payload::Payload;

/// Kind of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionSignaled,
    WorkflowExecutionCancelRequested,
    WorkflowTaskScheduled,
    WorkflowTaskStarted,
    WorkflowTaskCompleted,
    WorkflowTaskTimedOut,
    WorkflowTaskFailed,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCancelRequested,
    RequestCancelActivityTaskFailed,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    CancelTimerFailed,
    MarkerRecorded,
    SignalExternalWorkflowExecutionInitiated,
    SignalExternalWorkflowExecutionFailed,
    ExternalWorkflowExecutionSignaled,
    RequestCancelExternalWorkflowExecutionInitiated,
    RequestCancelExternalWorkflowExecutionFailed,
    ExternalWorkflowExecutionCancelRequested,
    UpsertWorkflowSearchAttributes,
}

impl EventType {
    /// Whether events of this type are recorded as the direct result of a
    /// command sent by the worker.
    pub fn is_command_event(self) -> bool {
        matches!(
            self,
            EventType::ActivityTaskScheduled
                | EventType::ActivityTaskCancelRequested
                | EventType::RequestCancelActivityTaskFailed
                | EventType::TimerStarted
                | EventType::TimerCanceled
                | EventType::CancelTimerFailed
                | EventType::MarkerRecorded
                | EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionCanceled
                | EventType::WorkflowExecutionContinuedAsNew
                | EventType::SignalExternalWorkflowExecutionInitiated
                | EventType::RequestCancelExternalWorkflowExecutionInitiated
                | EventType::UpsertWorkflowSearchAttributes
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed attributes of a history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: Payload,
        /// Workflow task timeout in milliseconds (0 = worker default).
        task_timeout_ms: u64,
        attempt: u32,
    },
    WorkflowExecutionCompleted {
        result: Option<Payload>,
    },
    WorkflowExecutionFailed {
        reason: String,
        details: Option<Payload>,
    },
    WorkflowExecutionCanceled {
        details: Option<Payload>,
    },
    WorkflowExecutionContinuedAsNew {
        workflow_type: String,
        input: Payload,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Payload,
    },
    WorkflowExecutionCancelRequested {
        cause: String,
    },
    WorkflowTaskScheduled,
    WorkflowTaskStarted,
    WorkflowTaskCompleted {
        binary_checksum: Option<String>,
    },
    WorkflowTaskTimedOut,
    WorkflowTaskFailed {
        cause: String,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        task_list: String,
        input: Payload,
    },
    ActivityTaskStarted {
        scheduled_event_id: i64,
        attempt: u32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        result: Option<Payload>,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        reason: String,
        details: Option<Payload>,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        timeout_type: TimeoutType,
    },
    ActivityTaskCancelRequested {
        activity_id: String,
    },
    RequestCancelActivityTaskFailed {
        activity_id: String,
        cause: String,
    },
    ActivityTaskCanceled {
        scheduled_event_id: i64,
        details: Option<Payload>,
    },
    TimerStarted {
        timer_id: String,
        start_to_fire_timeout_ms: u64,
    },
    TimerFired {
        timer_id: String,
    },
    TimerCanceled {
        timer_id: String,
    },
    CancelTimerFailed {
        timer_id: String,
        cause: String,
    },
    MarkerRecorded {
        marker_name: String,
        details: Payload,
    },
    SignalExternalWorkflowExecutionInitiated {
        domain: String,
        workflow_id: String,
        run_id: Option<String>,
        signal_name: String,
        input: Payload,
        control: String,
    },
    SignalExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        cause: String,
    },
    ExternalWorkflowExecutionSignaled {
        initiated_event_id: i64,
    },
    RequestCancelExternalWorkflowExecutionInitiated {
        domain: String,
        workflow_id: String,
        run_id: Option<String>,
        control: String,
    },
    RequestCancelExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        cause: String,
    },
    ExternalWorkflowExecutionCancelRequested {
        initiated_event_id: i64,
    },
    UpsertWorkflowSearchAttributes {
        search_attributes: BTreeMap<String, Payload>,
    },
}

impl EventAttributes {
    /// Event type of these attributes.
    pub fn event_type(&self) -> EventType {
        use EventAttributes as A;
        match self {
            A::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            A::WorkflowExecutionCompleted { .. } => EventType::WorkflowExecutionCompleted,
            A::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            A::WorkflowExecutionCanceled { .. } => EventType::WorkflowExecutionCanceled,
            A::WorkflowExecutionContinuedAsNew { .. } => EventType::WorkflowExecutionContinuedAsNew,
            A::WorkflowExecutionSignaled { .. } => EventType::WorkflowExecutionSignaled,
            A::WorkflowExecutionCancelRequested { .. } => {
                EventType::WorkflowExecutionCancelRequested
            }
            A::WorkflowTaskScheduled => EventType::WorkflowTaskScheduled,
            A::WorkflowTaskStarted => EventType::WorkflowTaskStarted,
            A::WorkflowTaskCompleted { .. } => EventType::WorkflowTaskCompleted,
            A::WorkflowTaskTimedOut => EventType::WorkflowTaskTimedOut,
            A::WorkflowTaskFailed { .. } => EventType::WorkflowTaskFailed,
            A::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            A::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            A::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            A::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            A::ActivityTaskTimedOut { .. } => EventType::ActivityTaskTimedOut,
            A::ActivityTaskCancelRequested { .. } => EventType::ActivityTaskCancelRequested,
            A::RequestCancelActivityTaskFailed { .. } => {
                EventType::RequestCancelActivityTaskFailed
            }
            A::ActivityTaskCanceled { .. } => EventType::ActivityTaskCanceled,
            A::TimerStarted { .. } => EventType::TimerStarted,
            A::TimerFired { .. } => EventType::TimerFired,
            A::TimerCanceled { .. } => EventType::TimerCanceled,
            A::CancelTimerFailed { .. } => EventType::CancelTimerFailed,
            A::MarkerRecorded { .. } => EventType::MarkerRecorded,
            A::SignalExternalWorkflowExecutionInitiated { .. } => {
                EventType::SignalExternalWorkflowExecutionInitiated
            }
            A::SignalExternalWorkflowExecutionFailed { .. } => {
                EventType::SignalExternalWorkflowExecutionFailed
            }
            A::ExternalWorkflowExecutionSignaled { .. } => {
                EventType::ExternalWorkflowExecutionSignaled
            }
            A::RequestCancelExternalWorkflowExecutionInitiated { .. } => {
                EventType::RequestCancelExternalWorkflowExecutionInitiated
            }
            A::RequestCancelExternalWorkflowExecutionFailed { .. } => {
                EventType::RequestCancelExternalWorkflowExecutionFailed
            }
            A::ExternalWorkflowExecutionCancelRequested { .. } => {
                EventType::ExternalWorkflowExecutionCancelRequested
            }
            A::UpsertWorkflowSearchAttributes { .. } => EventType::UpsertWorkflowSearchAttributes,
        }
    }
}

/// An immutable entry of the durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic id, starting at 1.
    pub event_id: i64,
    /// When the server recorded the event.
    pub timestamp: DateTime<Utc>,
    /// Typed attributes.
    pub attributes: EventAttributes,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_id: i64, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            timestamp: Utc::now(),
            attributes,
        }
    }

    /// Set the event timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Event type.
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }

    /// Whether the event records the result of a worker command.
    pub fn is_command_event(&self) -> bool {
        self.event_type().is_command_event()
    }

    /// Name of the marker, for marker events.
    pub fn marker_name(&self) -> Option<&str> {
        match &self.attributes {
            EventAttributes::MarkerRecorded { marker_name, .. } => Some(marker_name),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use EventAttributes as A;
        write!(f, "{}#{}", self.event_type(), self.event_id)?;
        match &self.attributes {
            A::ActivityTaskScheduled {
                activity_id,
                activity_type,
                ..
            } => write!(f, "(activity_id={activity_id}, activity_type={activity_type})"),
            A::TimerStarted { timer_id, .. }
            | A::TimerFired { timer_id }
            | A::TimerCanceled { timer_id } => write!(f, "(timer_id={timer_id})"),
            A::MarkerRecorded { marker_name, .. } => write!(f, "(marker_name={marker_name})"),
            A::ActivityTaskCancelRequested { activity_id } => {
                write!(f, "(activity_id={activity_id})")
            }
            A::SignalExternalWorkflowExecutionInitiated {
                workflow_id,
                signal_name,
                ..
            } => write!(f, "(workflow_id={workflow_id}, signal_name={signal_name})"),
            A::RequestCancelExternalWorkflowExecutionInitiated { workflow_id, .. } => {
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
    fn test_command_event_classification() {
        assert!(EventType::ActivityTaskScheduled.is_command_event());
        assert!(EventType::MarkerRecorded.is_command_event());
        assert!(EventType::RequestCancelActivityTaskFailed.is_command_event());
        assert!(EventType::CancelTimerFailed.is_command_event());
        assert!(!EventType::ActivityTaskCompleted.is_command_event());
        assert!(!EventType::WorkflowTaskStarted.is_command_event());
    }

    #[test]
    fn test_event_display() {
        let event = Event::new(
            5,
            EventAttributes::TimerStarted {
                timer_id: "1".to_string(),
                start_to_fire_timeout_ms: 1000,
            },
        );
        assert_eq!(event.to_string(), "TimerStarted#5(timer_id=1)");
        assert_eq!(event.marker_name(), None);
    }
}
