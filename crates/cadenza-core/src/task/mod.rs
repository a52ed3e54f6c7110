// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow task processing.
//!
//! A [`WorkflowTask`] carries the history a worker must replay to produce
//! the next set of commands. [`TaskHandler`] turns it into a
//! [`TaskCompletion`], heartbeating through [`TaskHeartbeat`] while local
//! activities are still running.

mod handler;
mod local_activity;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, TaskError, TaskFailedCause, WorkflowError};
use crate::history::{Command, Event, EventType, PageSource};
use crate::payload::Payload;
use crate::workflow::WorkflowExecution;

pub use handler::TaskHandler;
pub use local_activity::{
    LocalActivityFn, LocalActivityResult, LocalActivityTask, LocalActivityTunnel,
    LocalActivityWorker,
};

/// Query to answer instead of making progress.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowQuery {
    pub query_type: String,
    pub args: Payload,
}

/// A workflow task polled from the server.
#[derive(Clone)]
pub struct WorkflowTask {
    pub domain: String,
    pub task_list: String,
    pub execution: WorkflowExecution,
    pub workflow_type: String,
    /// Started event id of the last completed workflow task (0 if none).
    pub previous_started_event_id: i64,
    /// Started event id of this task.
    pub started_event_id: i64,
    pub attempt: u32,
    /// First page of history.
    pub history: Vec<Event>,
    /// Remaining pages. Also used to refetch the full history when a
    /// cached execution cannot continue from a partial one.
    pub page_source: Option<Arc<dyn PageSource>>,
    pub query: Option<WorkflowQuery>,
}

impl WorkflowTask {
    /// Whether the history starts at the beginning of the execution.
    pub fn is_full_history(&self) -> bool {
        self.history.first().is_some_and(|event| {
            event.event_id == 1 && event.event_type() == EventType::WorkflowExecutionStarted
        })
    }

    pub fn is_query(&self) -> bool {
        self.query.is_some()
    }
}

impl std::fmt::Debug for WorkflowTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowTask")
            .field("domain", &self.domain)
            .field("execution", &self.execution)
            .field("workflow_type", &self.workflow_type)
            .field("previous_started_event_id", &self.previous_started_event_id)
            .field("started_event_id", &self.started_event_id)
            .field("events", &self.history.len())
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

/// Commands produced by a successfully processed task.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTask {
    pub commands: Vec<Command>,
    /// Ask the server for a new task right away; set while local activities
    /// are still running.
    pub force_new_task: bool,
    pub binary_checksum: Option<String>,
    /// Whether later tasks of this execution may be sent to this worker.
    pub sticky: bool,
}

/// Task that could not be processed.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedTask {
    pub cause: TaskFailedCause,
    pub message: String,
}

/// Response to a workflow task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCompletion {
    Completed(CompletedTask),
    Failed(FailedTask),
    QueryAnswered(std::result::Result<Payload, WorkflowError>),
}

impl TaskCompletion {
    pub fn failed(err: &TaskError) -> Self {
        TaskCompletion::Failed(FailedTask {
            cause: err.failed_cause(),
            message: err.to_string(),
        })
    }

    pub fn commands(&self) -> &[Command] {
        match self {
            TaskCompletion::Completed(completed) => &completed.commands,
            _ => &[],
        }
    }
}

/// Sends an intermediate completion while the task is still being worked on.
#[async_trait]
pub trait TaskHeartbeat: Send + Sync {
    /// Returns the follow-up task to continue with, or `None` when the
    /// server has nothing more for this worker.
    async fn heartbeat(&self, completion: TaskCompletion) -> Result<Option<WorkflowTask>>;
}

/// Asks the server to stop routing an execution to this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetStickiness {
    pub domain: String,
    pub execution: WorkflowExecution,
}
