// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process execution of local activities.
//!
//! Workflow code schedules local activities; the task loop hands them to a
//! [`LocalActivityTunnel`] once the workflow task has been processed, and a
//! [`LocalActivityWorker`] runs each attempt and reports the result back on
//! the channel carried by the task.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coroutine::panic::payload_message;
use crate::error::{TimeoutType, WorkflowError};
use crate::payload::Payload;
use crate::workflow::LocalActivityOptions;

/// Local activity implementation.
pub type LocalActivityFn =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, WorkflowError>> + Send + Sync>;

/// One attempt of a local activity.
#[derive(Clone)]
pub struct LocalActivityTask {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Payload,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub options: LocalActivityOptions,
    pub scheduled_at: DateTime<Utc>,
    /// Deadline after which no retry is attempted.
    pub expiration: Option<DateTime<Utc>>,
    pub(crate) function: LocalActivityFn,
    pub(crate) result_tx: Option<mpsc::Sender<LocalActivityResult>>,
}

impl fmt::Debug for LocalActivityTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalActivityTask")
            .field("activity_id", &self.activity_id)
            .field("activity_type", &self.activity_type)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Outcome of one local activity attempt.
#[derive(Debug)]
pub struct LocalActivityResult {
    pub task: LocalActivityTask,
    pub result: Result<Payload, WorkflowError>,
    /// Backoff the workflow must wait on a durable timer before retrying.
    pub(crate) backoff: Option<Duration>,
}

/// Bounded queue feeding the local activity worker.
#[derive(Clone)]
pub struct LocalActivityTunnel {
    tx: mpsc::Sender<LocalActivityTask>,
}

impl LocalActivityTunnel {
    /// Create a tunnel and the receiving end consumed by a worker.
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<LocalActivityTask>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx }, rx)
    }

    /// Queue a task without waiting. A full or closed queue hands the task
    /// back.
    pub fn send_task(&self, task: LocalActivityTask) -> Result<(), LocalActivityTask> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                debug!(activity_id = %task.activity_id, "Local activity queue is full");
                Err(task)
            }
            Err(TrySendError::Closed(task)) => {
                warn!(activity_id = %task.activity_id, "Local activity worker is gone");
                Err(task)
            }
        }
    }
}

/// Runs local activity attempts.
pub struct LocalActivityWorker;

impl LocalActivityWorker {
    /// Start a worker on the current runtime.
    ///
    /// The worker stops when `shutdown` is cancelled or every tunnel is
    /// dropped.
    pub fn spawn(queue_size: usize, shutdown: CancellationToken) -> (LocalActivityTunnel, JoinHandle<()>) {
        let (tunnel, mut rx) = LocalActivityTunnel::new(queue_size);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Local activity worker shutting down");
                        break;
                    }
                    task = rx.recv() => match task {
                        Some(task) => {
                            tokio::spawn(execute(task));
                        }
                        None => break,
                    }
                }
            }
        });
        (tunnel, handle)
    }
}

/// Run one attempt and report its result.
pub(crate) async fn execute(task: LocalActivityTask) {
    debug!(
        activity_id = %task.activity_id,
        activity_type = %task.activity_type,
        attempt = task.attempt,
        "Executing local activity"
    );
    let attempt = AssertUnwindSafe((task.function)(task.input.clone())).catch_unwind();
    let timeout = task.options.schedule_to_close_timeout;
    let outcome = if timeout.is_zero() {
        Ok(attempt.await)
    } else {
        tokio::time::timeout(timeout, attempt).await
    };
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(WorkflowError::Panic {
            message: payload_message(panic.as_ref()),
            stack: String::new(),
        }),
        Err(_) => Err(WorkflowError::Timeout(TimeoutType::ScheduleToClose)),
    };
    let Some(result_tx) = task.result_tx.clone() else {
        warn!(activity_id = %task.activity_id, "Local activity has no result channel");
        return;
    };
    let activity_id = task.activity_id.clone();
    if result_tx
        .send(LocalActivityResult {
            task,
            result,
            backoff: None,
        })
        .await
        .is_err()
    {
        debug!(activity_id = %activity_id, "Workflow task finished before local activity result arrived");
    }
}
