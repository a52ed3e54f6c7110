// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow task processing loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use super::{LocalActivityTunnel, ResetStickiness, TaskCompletion, TaskHeartbeat, WorkflowTask};
use crate::config::WorkerConfig;
use crate::error::{Result, TaskError};
use crate::execution::{ExecutionContext, LocalActivityDispatch, StickyCache};
use crate::workflow::WorkflowResolver;

/// Processes workflow tasks, keeping replay state of recent executions in a
/// sticky cache.
pub struct TaskHandler {
    config: Arc<WorkerConfig>,
    resolver: Arc<dyn WorkflowResolver>,
    tunnel: Option<LocalActivityTunnel>,
    cache: StickyCache,
}

impl TaskHandler {
    pub fn new(config: WorkerConfig, resolver: Arc<dyn WorkflowResolver>) -> Self {
        let cache = StickyCache::new(config.sticky_cache_size, None);
        Self {
            config: Arc::new(config),
            resolver,
            tunnel: None,
            cache,
        }
    }

    /// Run local activities through `tunnel`.
    pub fn with_local_activity_tunnel(mut self, tunnel: LocalActivityTunnel) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Report executions evicted from the sticky cache while still running.
    pub fn with_reset_notifier(mut self, notifier: mpsc::UnboundedSender<ResetStickiness>) -> Self {
        self.cache = StickyCache::new(self.config.sticky_cache_size, Some(notifier));
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Number of executions in the sticky cache.
    pub fn cached_executions(&self) -> usize {
        self.cache.len()
    }

    pub fn is_cached(&self, run_id: &str) -> bool {
        self.cache.contains(run_id)
    }

    /// Process a workflow task and produce its response.
    ///
    /// Processing failures are reported as [`TaskCompletion::Failed`]. While
    /// local activities run past the heartbeat deadline, intermediate
    /// completions go through `heartbeat`; `Ok(None)` means the heartbeat
    /// ended the task. Only heartbeat failures are returned as errors.
    #[instrument(skip_all, fields(workflow_id = %task.execution.workflow_id, run_id = %task.execution.run_id))]
    pub async fn process_workflow_task(
        &self,
        task: WorkflowTask,
        heartbeat: &dyn TaskHeartbeat,
    ) -> Result<Option<TaskCompletion>> {
        let context = match self.get_or_create_context(&task) {
            Ok(context) => context,
            Err(err) => {
                error!(error = %err, code = err.error_code(), "Failed to prepare workflow task");
                return Ok(Some(TaskCompletion::failed(&err)));
            }
        };
        let cacheable = !(task.is_query() && task.is_full_history());

        let (results_tx, mut results_rx) = mpsc::channel(self.config.local_activity_queue_size.max(1));
        let (retry_tx, mut retry_rx) = mpsc::channel(self.config.local_activity_queue_size.max(1));
        let dispatch = self
            .tunnel
            .clone()
            .map(|tunnel| LocalActivityDispatch { tunnel, results_tx });

        let mut guard = context.lock().await;
        let mut task = task;
        let mut started = Instant::now();
        let mut outcome = guard.process_workflow_task(&task, dispatch.clone()).await;
        loop {
            match outcome {
                Ok(Some(completion)) => {
                    guard.unlock(false, cacheable, &self.cache).await;
                    return Ok(Some(completion));
                }
                Err(err) => {
                    error!(error = %err, code = err.error_code(), "Workflow task failed");
                    guard.unlock(true, cacheable, &self.cache).await;
                    return Ok(Some(TaskCompletion::failed(&err)));
                }
                Ok(None) => {}
            }

            let task_timeout = guard.task_timeout().unwrap_or(self.config.default_task_timeout);
            let deadline = started + task_timeout.mul_f64(self.config.task_heartbeat_ratio);
            let heartbeat_due = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => true,
                Some(retry) = retry_rx.recv() => {
                    outcome = guard.retry_local_activity(retry, dispatch.as_ref()).map(|()| None);
                    false
                }
                Some(result) = results_rx.recv() => {
                    outcome = guard
                        .process_local_activity_result(result, &retry_tx, dispatch.clone())
                        .await;
                    false
                }
            };
            if !heartbeat_due {
                continue;
            }

            debug!("Local activities still running, heartbeating workflow task");
            let completion = match guard.heartbeat_completion(dispatch.clone()).await {
                Ok(completion) => completion,
                Err(err) => {
                    outcome = Err(err);
                    continue;
                }
            };
            match heartbeat.heartbeat(completion).await {
                Ok(Some(next)) => {
                    task = next;
                    started = Instant::now();
                    outcome = guard.process_workflow_task(&task, dispatch.clone()).await;
                }
                Ok(None) => {
                    guard.unlock(false, cacheable, &self.cache).await;
                    return Ok(None);
                }
                Err(err) => {
                    let err = TaskError::Heartbeat(err.to_string());
                    warn!(error = %err, "Workflow task heartbeat failed");
                    guard.unlock(true, cacheable, &self.cache).await;
                    return Err(err);
                }
            }
        }
    }

    fn get_or_create_context(&self, task: &WorkflowTask) -> Result<ExecutionContext> {
        // Queries over a full history replay into a throwaway context.
        if !(task.is_query() && task.is_full_history())
            && let Some(context) = self.cache.get(&task.execution.run_id)
        {
            debug!("Sticky cache hit");
            return Ok(context);
        }
        debug!("Sticky cache miss, creating execution context");
        let workflow_fn = self
            .resolver
            .resolve(&task.workflow_type)
            .ok_or_else(|| TaskError::UnknownWorkflowType(task.workflow_type.clone()))?;
        Ok(ExecutionContext::new(task, workflow_fn, Arc::clone(&self.config)))
    }
}
