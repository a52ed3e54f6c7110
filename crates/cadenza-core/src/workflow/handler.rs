// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Applies history events to workflow state and drives the dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::context::WorkflowContext;
use super::environment::WorkflowEnvironment;
use super::{LocalActivityOutcome, STACK_TRACE_QUERY, WorkflowFn, WorkflowInfo};
use crate::coroutine::Dispatcher;
use crate::error::{NondeterminismError, NondeterminismKind, Result, TaskError, WorkflowError};
use crate::history::markers::{
    LOCAL_ACTIVITY_MARKER, LocalActivityMarker, MUTABLE_SIDE_EFFECT_MARKER,
    MutableSideEffectMarker, SIDE_EFFECT_MARKER, SideEffectMarker, VERSION_MARKER, VersionMarker,
    encode_marker,
};
use crate::history::{Command, Event, EventAttributes};
use crate::payload::Payload;
use crate::task::{LocalActivityResult, LocalActivityTask};

/// Event handler of one workflow execution.
pub(crate) struct EventHandler {
    env: Arc<WorkflowEnvironment>,
    dispatcher: Dispatcher,
    workflow_fn: WorkflowFn,
    /// Local time at which the current workflow task started.
    task_started_at: Instant,
}

impl EventHandler {
    pub(crate) fn new(info: WorkflowInfo, workflow_fn: WorkflowFn, deadlock_timeout: Duration) -> Self {
        Self {
            env: Arc::new(WorkflowEnvironment::new(info)),
            dispatcher: Dispatcher::new(deadlock_timeout),
            workflow_fn,
            task_started_at: Instant::now(),
        }
    }

    /// Apply one history event.
    pub(crate) fn process_event(&mut self, event: &Event, replaying: bool) -> Result<()> {
        use EventAttributes as A;
        self.env.lock().replaying = replaying;
        match &event.attributes {
            A::WorkflowExecutionStarted { input, .. } => self.start(input.clone()),
            A::WorkflowTaskStarted => {
                self.env.lock().current_time = event.timestamp;
                self.task_started_at = Instant::now();
                self.dispatcher.execute_until_all_blocked()?;
            }
            A::ActivityTaskScheduled { activity_id, .. } => {
                self.env
                    .lock()
                    .scheduled_activities
                    .insert(event.event_id, activity_id.clone());
            }
            A::ActivityTaskCompleted {
                scheduled_event_id,
                result,
            } => self.resolve_activity(*scheduled_event_id, Ok(result.clone().unwrap_or_default())),
            A::ActivityTaskFailed {
                scheduled_event_id,
                reason,
                details,
            } => self.resolve_activity(
                *scheduled_event_id,
                Err(WorkflowError::application(reason.clone(), details.clone())),
            ),
            A::ActivityTaskTimedOut {
                scheduled_event_id,
                timeout_type,
            } => self.resolve_activity(*scheduled_event_id, Err(WorkflowError::Timeout(*timeout_type))),
            A::ActivityTaskCanceled {
                scheduled_event_id,
                details,
            } => self.resolve_activity(
                *scheduled_event_id,
                Err(WorkflowError::Canceled {
                    details: details.clone(),
                }),
            ),
            A::TimerFired { timer_id } => {
                let settable = self.env.lock().timers.remove(timer_id);
                if let Some(settable) = settable {
                    settable.set(());
                }
            }
            A::MarkerRecorded {
                marker_name,
                details,
            } => self.handle_marker(event.event_id, marker_name, details)?,
            A::WorkflowExecutionSignaled { signal_name, input } => {
                let channel = self.env.lock().signal_channel(signal_name);
                if !channel.send_async(input.clone()) {
                    warn!(signal = %signal_name, "Signal channel is full, dropping signal");
                }
            }
            A::WorkflowExecutionCancelRequested { .. } => {
                let channel = {
                    let mut state = self.env.lock();
                    state.cancel_requested = true;
                    state.cancel_channel.clone()
                };
                channel.close();
            }
            A::SignalExternalWorkflowExecutionInitiated { control, .. }
            | A::RequestCancelExternalWorkflowExecutionInitiated { control, .. } => {
                self.env
                    .lock()
                    .initiated_external
                    .insert(event.event_id, control.clone());
            }
            A::ExternalWorkflowExecutionSignaled { initiated_event_id }
            | A::ExternalWorkflowExecutionCancelRequested { initiated_event_id } => {
                self.resolve_external(*initiated_event_id, Ok(()));
            }
            A::SignalExternalWorkflowExecutionFailed {
                initiated_event_id,
                cause,
            }
            | A::RequestCancelExternalWorkflowExecutionFailed {
                initiated_event_id,
                cause,
            } => self.resolve_external(
                *initiated_event_id,
                Err(WorkflowError::application(cause.clone(), None)),
            ),
            A::UpsertWorkflowSearchAttributes { search_attributes } => {
                self.env
                    .lock()
                    .info
                    .search_attributes
                    .extend(search_attributes.clone());
            }
            A::WorkflowExecutionCompleted { .. }
            | A::WorkflowExecutionFailed { .. }
            | A::WorkflowExecutionCanceled { .. }
            | A::WorkflowExecutionContinuedAsNew { .. }
            | A::WorkflowTaskScheduled
            | A::WorkflowTaskCompleted { .. }
            | A::WorkflowTaskTimedOut
            | A::WorkflowTaskFailed { .. }
            | A::ActivityTaskStarted { .. }
            | A::ActivityTaskCancelRequested { .. }
            | A::RequestCancelActivityTaskFailed { .. }
            | A::TimerStarted { .. }
            | A::TimerCanceled { .. }
            | A::CancelTimerFailed { .. } => {}
        }
        Ok(())
    }

    fn start(&mut self, input: Payload) {
        let env = Arc::clone(&self.env);
        let workflow_fn = Arc::clone(&self.workflow_fn);
        self.dispatcher.new_coroutine("root", move |ctx| {
            let result = workflow_fn(WorkflowContext::new(ctx, Arc::clone(&env)), input);
            env.lock().completion = Some(result);
        });
    }

    fn resolve_activity(&mut self, scheduled_event_id: i64, result: std::result::Result<Payload, WorkflowError>) {
        let settable = {
            let mut state = self.env.lock();
            let Some(activity_id) = state.scheduled_activities.remove(&scheduled_event_id) else {
                warn!(scheduled_event_id, "Result for an activity that was never scheduled");
                return;
            };
            state.activities.remove(&activity_id)
        };
        // Canceled activities were resolved when the cancel was requested.
        if let Some(settable) = settable {
            settable.set_result(result);
        }
    }

    fn resolve_external(&mut self, initiated_event_id: i64, result: std::result::Result<(), WorkflowError>) {
        let settable = {
            let mut state = self.env.lock();
            state
                .initiated_external
                .remove(&initiated_event_id)
                .and_then(|control| state.external_calls.remove(&control))
        };
        match settable {
            Some(settable) => settable.set_result(result),
            None => warn!(initiated_event_id, "Result for an unknown external workflow request"),
        }
    }

    fn handle_marker(&mut self, event_id: i64, marker_name: &str, details: &Payload) -> Result<()> {
        let corrupt = |e: serde_json::Error| {
            TaskError::HistoryIntegrity(format!("corrupt {marker_name} marker in event {event_id}: {e}"))
        };
        let mut state = self.env.lock();
        match marker_name {
            SIDE_EFFECT_MARKER => {
                let marker: SideEffectMarker = details.decode().map_err(corrupt)?;
                state
                    .side_effect_results
                    .insert(marker.side_effect_id, marker.result);
            }
            VERSION_MARKER => {
                let marker: VersionMarker = details.decode().map_err(corrupt)?;
                state.versions.insert(marker.change_id, marker.version);
            }
            MUTABLE_SIDE_EFFECT_MARKER => {
                let marker: MutableSideEffectMarker = details.decode().map_err(corrupt)?;
                state.mutable_side_effects.insert(marker.id, marker.result);
            }
            // Applied after the batch by process_local_activity_marker.
            LOCAL_ACTIVITY_MARKER => {}
            other => {
                return Err(TaskError::HistoryIntegrity(format!(
                    "unknown marker name {other} in event {event_id}"
                )));
            }
        }
        Ok(())
    }

    /// Apply a local activity result marker, from history or from a fresh
    /// result, and resume workflow code.
    pub(crate) fn process_local_activity_marker(&mut self, details: &Payload) -> Result<()> {
        let marker: LocalActivityMarker = details.decode().map_err(|e| {
            TaskError::HistoryIntegrity(format!("corrupt {LOCAL_ACTIVITY_MARKER} marker: {e}"))
        })?;
        let settable = {
            let mut state = self.env.lock();
            let Some(pending) = state.local_activities.get(&marker.activity_id) else {
                return Ok(());
            };
            if !marker.activity_type.is_empty() && marker.activity_type != pending.task.activity_type {
                return Err(NondeterminismError::new(
                    NondeterminismKind::IllegalState,
                    format!(
                        "code executed local activity {}, but history recorded {}",
                        pending.task.activity_type, marker.activity_type
                    ),
                )
                .into());
            }
            state.commands.push(Command::RecordMarker {
                marker_name: LOCAL_ACTIVITY_MARKER.to_string(),
                details: details.clone(),
            });
            state
                .unstarted_local_activities
                .retain(|id| *id != marker.activity_id);
            state.current_time = marker.replay_time;
            state
                .local_activities
                .remove(&marker.activity_id)
                .map(|pending| pending.settable)
        };
        if let Some(settable) = settable {
            let result = match marker.error {
                Some(error) => Err(error),
                None => Ok(marker.result.unwrap_or_default()),
            };
            settable.set(LocalActivityOutcome {
                result,
                attempt: marker.attempt,
                backoff: marker.backoff_ms.map(Duration::from_millis),
            });
        }
        self.dispatcher.execute_until_all_blocked()
    }

    /// Record a local activity result produced by the worker.
    pub(crate) fn process_local_activity_result(&mut self, result: LocalActivityResult) -> Result<()> {
        let LocalActivityResult {
            task,
            result,
            backoff,
        } = result;
        let replay_time = {
            let state = self.env.lock();
            if !state.local_activities.contains_key(&task.activity_id) {
                debug!(activity_id = %task.activity_id, "Dropping result of a local activity that is no longer pending");
                return Ok(());
            }
            let elapsed = chrono::Duration::from_std(self.task_started_at.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());
            state.current_time + elapsed
        };
        let (result, error) = match result {
            Ok(payload) => (Some(payload), None),
            Err(error) => (None, Some(error)),
        };
        let details = encode_marker(&LocalActivityMarker {
            activity_id: task.activity_id,
            activity_type: task.activity_type,
            result,
            backoff_ms: backoff.filter(|_| error.is_some()).map(|b| b.as_millis() as u64),
            error,
            attempt: task.attempt,
            replay_time,
        });
        self.process_local_activity_marker(&details)
    }

    /// Commands recorded since the last call.
    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.env.lock().commands)
    }

    pub(crate) fn completion(&self) -> Option<std::result::Result<Payload, WorkflowError>> {
        self.env.lock().completion.clone()
    }

    /// Record a terminal result decided outside workflow code.
    pub(crate) fn complete(&mut self, result: std::result::Result<Payload, WorkflowError>) {
        self.env.lock().completion = Some(result);
    }

    pub(crate) fn has_pending_local_activities(&self) -> bool {
        !self.env.lock().local_activities.is_empty()
    }

    pub(crate) fn is_local_activity_pending(&self, activity_id: &str) -> bool {
        self.env.lock().local_activities.contains_key(activity_id)
    }

    /// Local activities not yet handed to the worker; they are considered
    /// started once taken.
    pub(crate) fn take_unstarted_local_activities(&mut self) -> Vec<LocalActivityTask> {
        let mut state = self.env.lock();
        let ids = std::mem::take(&mut state.unstarted_local_activities);
        ids.iter()
            .filter_map(|id| state.local_activities.get(id).map(|pending| pending.task.clone()))
            .collect()
    }

    /// Put a local activity back in the unstarted set.
    pub(crate) fn requeue_local_activity(&mut self, activity_id: &str) {
        let mut state = self.env.lock();
        if state.local_activities.contains_key(activity_id)
            && !state.unstarted_local_activities.iter().any(|id| id == activity_id)
        {
            state.unstarted_local_activities.push(activity_id.to_string());
        }
    }

    /// Record the attempt of a retry that reached the worker.
    pub(crate) fn set_local_activity_attempt(&mut self, activity_id: &str, attempt: u32) {
        if let Some(pending) = self.env.lock().local_activities.get_mut(activity_id) {
            pending.task.attempt = attempt;
        }
    }

    /// Answer a query against the current state.
    pub(crate) fn query(&self, query_type: &str, args: Payload) -> std::result::Result<Payload, WorkflowError> {
        if query_type == STACK_TRACE_QUERY {
            return Payload::encode(&self.dispatcher.stack_trace())
                .map_err(|e| WorkflowError::application("QueryFailed", Payload::encode(&e.to_string()).ok()));
        }
        let handler = self.env.lock().query_handlers.get(query_type).cloned();
        match handler {
            Some(handler) => handler(args),
            None => {
                let known: Vec<String> = {
                    let state = self.env.lock();
                    let mut known: Vec<String> = state.query_handlers.keys().cloned().collect();
                    known.sort();
                    known
                };
                Err(WorkflowError::application(
                    format!("unknown query type {query_type}, known types: {known:?}"),
                    None,
                ))
            }
        }
    }

    /// Force every coroutine to exit.
    pub(crate) fn close(&mut self) {
        self.dispatcher.close();
    }
}
