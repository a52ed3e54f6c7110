// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution context of one workflow run.
//!
//! The context owns the event handler (and with it the coroutine
//! dispatcher) of a run. Workflow tasks lock it for their whole duration;
//! dispatcher activations block the calling thread, so they run on the
//! blocking pool with the lock guard moved along.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, info, warn};

use crate::config::{NonDeterminismPolicy, PanicPolicy, WorkerConfig};
use crate::error::{NONDETERMINISM_FAIL_REASON, Result, TaskError, WorkflowError};
use crate::history::iterator::is_replay_event;
use crate::history::markers::LOCAL_ACTIVITY_MARKER;
use crate::history::{Command, CommandEvents, Event, EventAttributes, History, match_replay_with_history};
use crate::payload::Payload;
use crate::task::{
    CompletedTask, LocalActivityResult, LocalActivityTask, LocalActivityTunnel, ResetStickiness,
    TaskCompletion, WorkflowQuery, WorkflowTask,
};
use crate::workflow::handler::EventHandler;
use crate::workflow::{WorkflowExecution, WorkflowFn, WorkflowInfo};

/// Where freshly scheduled local activities go and where their results
/// come back.
#[derive(Clone)]
pub(crate) struct LocalActivityDispatch {
    pub(crate) tunnel: LocalActivityTunnel,
    pub(crate) results_tx: mpsc::Sender<LocalActivityResult>,
}

pub(crate) struct ExecutionState {
    domain: String,
    execution: WorkflowExecution,
    workflow_fn: WorkflowFn,
    config: Arc<WorkerConfig>,
    /// `None` until the first task and after the state was cleared.
    handler: Option<EventHandler>,
    previous_started_event_id: i64,
    task_timeout: Duration,
    completed: bool,
}

impl ExecutionState {
    fn handler_mut(&mut self) -> Result<&mut EventHandler> {
        self.handler
            .as_mut()
            .ok_or_else(|| TaskError::Internal("execution state was cleared".to_string()))
    }

    fn has_pending_local_activities(&self) -> bool {
        self.handler
            .as_ref()
            .is_some_and(|handler| handler.completion().is_none() && handler.has_pending_local_activities())
    }

    fn create_handler(&mut self, task: &WorkflowTask, first: &Event) -> Result<()> {
        let EventAttributes::WorkflowExecutionStarted {
            task_list,
            task_timeout_ms,
            attempt,
            ..
        } = &first.attributes
        else {
            return Err(TaskError::HistoryIntegrity(format!(
                "first history event is {first}, expected WorkflowExecutionStarted"
            )));
        };
        self.task_timeout = match task_timeout_ms {
            0 => self.config.default_task_timeout,
            ms => Duration::from_millis(*ms),
        };
        let info = WorkflowInfo {
            execution: self.execution.clone(),
            workflow_type: task.workflow_type.clone(),
            domain: self.domain.clone(),
            task_list: task_list.clone(),
            task_timeout: self.task_timeout,
            attempt: *attempt,
            binary_checksum: self.config.binary_checksum.clone(),
            search_attributes: BTreeMap::new(),
        };
        self.handler = Some(EventHandler::new(
            info,
            Arc::clone(&self.workflow_fn),
            self.config.deadlock_detection_timeout,
        ));
        self.previous_started_event_id = 0;
        self.completed = false;
        Ok(())
    }

    /// Apply one batch: look-ahead markers first, then the batch events,
    /// then local activity results. Returns the commands produced while
    /// replaying and the command events of the batch.
    fn apply_batch(&mut self, batch: CommandEvents, previous_started_event_id: i64) -> Result<(Vec<Command>, Vec<Event>)> {
        let handler = self.handler_mut()?;
        let (local_activity_markers, markers): (Vec<Event>, Vec<Event>) = batch
            .markers
            .iter()
            .cloned()
            .partition(|marker| marker.marker_name() == Some(LOCAL_ACTIVITY_MARKER));

        for marker in &markers {
            handler.process_event(marker, true)?;
        }

        let mut respond_events = Vec::new();
        for event in &batch.events {
            if event.is_command_event() {
                respond_events.push(event.clone());
            }
            // Applied as look-ahead of the previous batch.
            if event.marker_name().is_some() {
                continue;
            }
            handler.process_event(event, is_replay_event(event, previous_started_event_id))?;
        }

        for marker in &local_activity_markers {
            if let EventAttributes::MarkerRecorded { details, .. } = &marker.attributes {
                handler.process_local_activity_marker(details)?;
            }
        }

        let replay_commands = if batch.is_replay(previous_started_event_id) {
            handler.take_commands()
        } else {
            Vec::new()
        };
        Ok((replay_commands, respond_events))
    }

    /// Turn a processing failure into a workflow completion when the
    /// configured policy asks for it.
    fn apply_failure_policy(&mut self, err: TaskError) -> Result<()> {
        let result = match &err {
            TaskError::Nondeterminism(nondeterminism)
                if self.config.nondeterminism_policy == NonDeterminismPolicy::FailWorkflow =>
            {
                Err(WorkflowError::application(
                    NONDETERMINISM_FAIL_REASON,
                    Payload::encode(&nondeterminism.to_string()).ok(),
                ))
            }
            TaskError::Panic { message, stack, .. }
                if self.config.panic_policy == PanicPolicy::FailWorkflow =>
            {
                Err(WorkflowError::Panic {
                    message: message.clone(),
                    stack: stack.clone(),
                })
            }
            _ => return Err(err),
        };
        warn!(
            workflow_id = %self.execution.workflow_id,
            run_id = %self.execution.run_id,
            error = %err,
            "Failing workflow execution"
        );
        self.handler_mut()?.complete(result);
        Ok(())
    }

    fn complete_task(
        &mut self,
        query: Option<WorkflowQuery>,
        wait: bool,
        dispatch: Option<LocalActivityDispatch>,
    ) -> Result<Option<TaskCompletion>> {
        let binary_checksum = self.config.binary_checksum.clone();
        let sticky = !self.config.sticky_cache_disabled();
        let handler = self.handler_mut()?;
        if let Some(query) = query {
            return Ok(Some(TaskCompletion::QueryAnswered(
                handler.query(&query.query_type, query.args),
            )));
        }

        let completion = handler.completion();
        let pending = completion.is_none() && handler.has_pending_local_activities();
        if pending {
            let Some(dispatch) = dispatch else {
                return Err(TaskError::Internal(
                    "local activities were scheduled but no local activity worker is configured".to_string(),
                ));
            };
            for mut task in handler.take_unstarted_local_activities() {
                task.result_tx = Some(dispatch.results_tx.clone());
                if let Err(task) = dispatch.tunnel.send_task(task) {
                    handler.requeue_local_activity(&task.activity_id);
                }
            }
            if wait {
                return Ok(None);
            }
        }

        let mut commands = handler.take_commands();
        if let Some(result) = completion {
            commands.push(close_command(result));
            self.completed = true;
        }
        Ok(Some(TaskCompletion::Completed(CompletedTask {
            commands,
            force_new_task: pending,
            binary_checksum,
            sticky,
        })))
    }

    fn clear(&mut self) {
        if let Some(mut handler) = self.handler.take() {
            handler.close();
        }
        self.previous_started_event_id = 0;
    }

    fn evict(&mut self, notifier: Option<&mpsc::UnboundedSender<ResetStickiness>>) {
        if self.handler.is_some() && !self.completed {
            info!(
                workflow_id = %self.execution.workflow_id,
                run_id = %self.execution.run_id,
                "Evicting workflow execution from sticky cache"
            );
            if let Some(notifier) = notifier {
                let _ = notifier.send(ResetStickiness {
                    domain: self.domain.clone(),
                    execution: self.execution.clone(),
                });
            }
        }
        self.clear();
    }
}

/// Command closing the execution with `result`.
fn close_command(result: std::result::Result<Payload, WorkflowError>) -> Command {
    match result {
        Ok(result) => Command::CompleteWorkflowExecution {
            result: Some(result),
        },
        Err(WorkflowError::Canceled { details }) => Command::CancelWorkflowExecution { details },
        Err(WorkflowError::ContinueAsNew {
            workflow_type,
            input,
        }) => Command::ContinueAsNewWorkflowExecution {
            workflow_type,
            input,
        },
        Err(err) => Command::FailWorkflowExecution {
            reason: err.reason(),
            details: err.details(),
        },
    }
}

/// Shared handle to the state of one workflow run.
#[derive(Clone)]
pub(crate) struct ExecutionContext {
    run_id: String,
    state: Arc<Mutex<ExecutionState>>,
}

impl ExecutionContext {
    pub(crate) fn new(task: &WorkflowTask, workflow_fn: WorkflowFn, config: Arc<WorkerConfig>) -> Self {
        let task_timeout = config.default_task_timeout;
        Self {
            run_id: task.execution.run_id.clone(),
            state: Arc::new(Mutex::new(ExecutionState {
                domain: task.domain.clone(),
                execution: task.execution.clone(),
                workflow_fn,
                config,
                handler: None,
                previous_started_event_id: 0,
                task_timeout,
                completed: false,
            })),
        }
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) async fn lock(&self) -> ExecutionGuard {
        ExecutionGuard {
            context: self.clone(),
            guard: Some(Arc::clone(&self.state).lock_owned().await),
        }
    }

    /// Clear the state once no task holds it, asking the server to stop
    /// routing the run here if it is still live.
    pub(crate) fn evict(&self, notifier: Option<mpsc::UnboundedSender<ResetStickiness>>) {
        let state = Arc::clone(&self.state);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || state.blocking_lock().evict(notifier.as_ref()));
            }
            Err(_) => match state.try_lock() {
                Ok(mut state) => state.evict(notifier.as_ref()),
                Err(_) => warn!(run_id = %self.run_id, "Execution busy outside a runtime, skipping eviction"),
            },
        }
    }
}

/// Exclusive access to an execution for the duration of a workflow task.
pub(crate) struct ExecutionGuard {
    context: ExecutionContext,
    /// Taken while the state is on the blocking pool; lost if that panics.
    guard: Option<OwnedMutexGuard<ExecutionState>>,
}

impl ExecutionGuard {
    fn state(&mut self) -> Result<&mut ExecutionState> {
        self.guard
            .as_deref_mut()
            .ok_or_else(|| TaskError::Internal("execution state lost".to_string()))
    }

    async fn run_blocking<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ExecutionState) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| TaskError::Internal("execution state lost".to_string()))?;
        let (guard, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut guard);
            (guard, result)
        })
        .await
        .map_err(|e| TaskError::Internal(format!("execution task failed: {e}")))?;
        self.guard = Some(guard);
        result
    }

    /// Workflow task timeout of the run.
    pub(crate) fn task_timeout(&self) -> Option<Duration> {
        self.guard.as_ref().map(|state| state.task_timeout)
    }

    /// Replay the task's history and produce its completion.
    ///
    /// Returns `None` while local activities scheduled by the task are
    /// still running.
    pub(crate) async fn process_workflow_task(
        &mut self,
        task: &WorkflowTask,
        dispatch: Option<LocalActivityDispatch>,
    ) -> Result<Option<TaskCompletion>> {
        if let Err(err) = self.replay(task).await {
            self.state()?.apply_failure_policy(err)?;
        }
        self.run_blocking({
            let query = task.query.clone();
            move |state| state.complete_task(query, true, dispatch)
        })
        .await
    }

    async fn replay(&mut self, task: &WorkflowTask) -> Result<()> {
        let Some((events, full_history)) = self.prepare(task).await? else {
            return Ok(());
        };
        let previous_started_event_id = task.previous_started_event_id;
        let mut history = History::new(
            events,
            task.page_source.clone(),
            task.started_event_id,
            previous_started_event_id,
        );

        let mut replay_commands = Vec::new();
        let mut respond_events = Vec::new();
        loop {
            let batch = history.next_command_events().await?;
            if batch.is_empty() {
                break;
            }
            let (commands, events) = self
                .run_blocking(move |state| state.apply_batch(batch, previous_started_event_id))
                .await?;
            replay_commands.extend(commands);
            respond_events.extend(events);
        }

        let state = self.state()?;
        state.previous_started_event_id = task.started_event_id;
        let workflow_done = state
            .handler
            .as_ref()
            .is_some_and(|handler| handler.completion().is_some());
        if full_history && !task.is_query() && !workflow_done {
            match_replay_with_history(&replay_commands, &respond_events, state.config.strict_replay)?;
        }
        Ok(())
    }

    /// Decide which events to replay, resetting or rebuilding the state
    /// when the cached one cannot continue from this task.
    ///
    /// Returns `None` for a query that can be answered from cached state,
    /// otherwise the first history page and whether it starts the run.
    async fn prepare(&mut self, task: &WorkflowTask) -> Result<Option<(Vec<Event>, bool)>> {
        let state = self.state()?;
        if state.handler.is_some() {
            if task.is_query() && !task.is_full_history() {
                return Ok(None);
            }
            let first_event_id = task.history.first().map(|event| event.event_id);
            if !task.is_full_history() && first_event_id == Some(state.previous_started_event_id + 1) {
                return Ok(Some((task.history.clone(), false)));
            }
            debug!(
                run_id = %task.execution.run_id,
                previous_started_event_id = state.previous_started_event_id,
                first_event_id = ?first_event_id,
                "Cached execution state cannot continue from this task, replaying from the start"
            );
            self.run_blocking(|state| {
                state.clear();
                Ok(())
            })
            .await?;
        }

        let events = if task.is_full_history() {
            task.history.clone()
        } else {
            let source = task.page_source.as_ref().ok_or_else(|| {
                TaskError::HistoryIntegrity(format!(
                    "partial history for run {} and no page source to load the rest",
                    task.execution.run_id
                ))
            })?;
            source.reset().await;
            source.next_page().await?
        };
        let first = events.first().ok_or_else(|| {
            TaskError::HistoryIntegrity(format!("empty history for run {}", task.execution.run_id))
        })?;
        if first.event_id != 1 {
            return Err(TaskError::HistoryIntegrity(format!(
                "history of run {} starts at event {}",
                task.execution.run_id, first.event_id
            )));
        }
        self.state()?.create_handler(task, first)?;
        Ok(Some((events, true)))
    }

    /// Apply a local activity result, or schedule a retry within this task
    /// when its backoff is short enough.
    pub(crate) async fn process_local_activity_result(
        &mut self,
        mut result: LocalActivityResult,
        retry_tx: &mpsc::Sender<LocalActivityTask>,
        dispatch: Option<LocalActivityDispatch>,
    ) -> Result<Option<TaskCompletion>> {
        let task_timeout = self.state()?.task_timeout;
        let backoff = match (&result.result, &result.task.options.retry_policy) {
            (Err(err), Some(policy)) => policy.next_backoff(
                result.task.attempt,
                Some(err),
                Utc::now(),
                result.task.expiration,
            ),
            _ => None,
        };
        if let Some(backoff) = backoff {
            if backoff <= task_timeout {
                debug!(
                    activity_id = %result.task.activity_id,
                    attempt = result.task.attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying local activity"
                );
                let retry_tx = retry_tx.clone();
                let task = result.task;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = retry_tx.send(task).await;
                });
                return Ok(None);
            }
            result.backoff = Some(backoff);
        }

        if let Err(err) = self
            .run_blocking(move |state| state.handler_mut()?.process_local_activity_result(result))
            .await
        {
            self.state()?.apply_failure_policy(err)?;
        }
        self.run_blocking(move |state| state.complete_task(None, true, dispatch))
            .await
    }

    /// Hand a retried local activity attempt back to the worker.
    pub(crate) fn retry_local_activity(
        &mut self,
        mut task: LocalActivityTask,
        dispatch: Option<&LocalActivityDispatch>,
    ) -> Result<()> {
        let handler = self.state()?.handler_mut()?;
        if !handler.is_local_activity_pending(&task.activity_id) {
            return Ok(());
        }
        let Some(dispatch) = dispatch else {
            return Err(TaskError::Internal(
                "local activity retry without a local activity worker".to_string(),
            ));
        };
        task.attempt += 1;
        let activity_id = task.activity_id.clone();
        let attempt = task.attempt;
        match dispatch.tunnel.send_task(task) {
            Ok(()) => handler.set_local_activity_attempt(&activity_id, attempt),
            Err(_) => handler.requeue_local_activity(&activity_id),
        }
        Ok(())
    }

    /// Completion sent with a heartbeat: everything recorded so far, with a
    /// request for a new task while local activities are still running.
    pub(crate) async fn heartbeat_completion(
        &mut self,
        dispatch: Option<LocalActivityDispatch>,
    ) -> Result<TaskCompletion> {
        self.run_blocking(move |state| state.complete_task(None, false, dispatch))
            .await?
            .ok_or_else(|| TaskError::Internal("heartbeat produced no completion".to_string()))
    }

    /// Release the execution, keeping it in `cache` only if a later task
    /// can continue from it.
    pub(crate) async fn unlock(mut self, failed: bool, cacheable: bool, cache: &super::StickyCache) {
        let run_id = self.context.run_id.clone();
        let keep = match self.state() {
            Ok(state) => {
                !failed
                    && cacheable
                    && !cache.is_disabled()
                    && !state.completed
                    && state.handler.is_some()
                    && !state.has_pending_local_activities()
            }
            Err(_) => false,
        };
        if !keep {
            if self.guard.is_some() {
                let _ = self
                    .run_blocking(|state| {
                        state.clear();
                        Ok(())
                    })
                    .await;
            }
            drop(self);
            cache.remove(&run_id);
            return;
        }
        let context = self.context.clone();
        drop(self);
        if !cache.contains(&run_id) {
            cache.put(context);
        }
    }
}
