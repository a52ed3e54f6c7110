// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow-facing API.
//!
//! Workflow code runs inside coroutines and talks to the engine through a
//! [`WorkflowContext`]. Every call either reads replay state or records a
//! [`Command`](crate::history::Command); the event handler feeds history
//! events back into the same state.

mod context;
pub(crate) mod environment;
pub(crate) mod handler;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::payload::Payload;
use crate::retry::RetryPolicy;

pub use context::{Timer, WorkflowContext};

/// Version returned by `get_version` for code paths that predate the change.
pub const DEFAULT_VERSION: i64 = -1;

/// Built-in query returning the parked position of every coroutine.
pub const STACK_TRACE_QUERY: &str = "__stack_trace";

/// Identity of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Static information about the running workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInfo {
    pub execution: WorkflowExecution,
    pub workflow_type: String,
    pub domain: String,
    pub task_list: String,
    /// Workflow task start-to-close timeout.
    pub task_timeout: Duration,
    pub attempt: u32,
    pub binary_checksum: Option<String>,
    pub search_attributes: BTreeMap<String, Payload>,
}

/// Workflow entry point.
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowContext, Payload) -> Result<Payload, WorkflowError> + Send + Sync>;

/// Query handler registered by workflow code.
pub type QueryHandler = Arc<dyn Fn(Payload) -> Result<Payload, WorkflowError> + Send + Sync>;

/// Looks up workflow entry points by type name.
pub trait WorkflowResolver: Send + Sync {
    fn resolve(&self, workflow_type: &str) -> Option<WorkflowFn>;
}

impl WorkflowResolver for HashMap<String, WorkflowFn> {
    fn resolve(&self, workflow_type: &str) -> Option<WorkflowFn> {
        self.get(workflow_type).cloned()
    }
}

/// Options for a server-side activity.
#[derive(Debug, Clone, Default)]
pub struct ActivityOptions {
    /// Explicit activity id; generated when unset.
    pub activity_id: Option<String>,
    /// Task list to schedule on; the workflow's own when unset.
    pub task_list: Option<String>,
}

/// Options for an in-process local activity.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalActivityOptions {
    /// Deadline for one attempt (zero disables it).
    pub schedule_to_close_timeout: Duration,
    /// Retry policy; no retries when unset.
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for LocalActivityOptions {
    fn default() -> Self {
        Self {
            schedule_to_close_timeout: Duration::from_secs(10),
            retry_policy: None,
        }
    }
}

/// Result of a local activity attempt as seen by workflow code.
#[derive(Debug, Clone)]
pub(crate) struct LocalActivityOutcome {
    pub(crate) result: Result<Payload, WorkflowError>,
    pub(crate) attempt: u32,
    /// Set when the next attempt must wait on a durable timer.
    pub(crate) backoff: Option<Duration>,
}
