// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow context: the API workflow code is written against.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::environment::{PendingLocalActivity, WorkflowEnvironment};
use super::{
    ActivityOptions, LocalActivityOptions, LocalActivityOutcome, QueryHandler, STACK_TRACE_QUERY,
    WorkflowInfo, DEFAULT_VERSION,
};
use crate::coroutine::panic::illegal_state;
use crate::coroutine::{Channel, Context, Future, new_future};
use crate::error::WorkflowError;
use crate::history::Command;
use crate::history::markers::{
    CHANGE_VERSION_SEARCH_ATTRIBUTE, MUTABLE_SIDE_EFFECT_MARKER, MutableSideEffectMarker,
    SIDE_EFFECT_MARKER, SideEffectMarker, VERSION_MARKER, VersionMarker, encode_marker,
};
use crate::payload::Payload;
use crate::task::{LocalActivityFn, LocalActivityTask};

/// A durable timer.
#[derive(Debug, Clone)]
pub struct Timer {
    /// Timer id, `None` for zero-length timers that never reach the server.
    pub id: Option<String>,
    /// Resolves when the timer fires, or with a cancellation error.
    pub future: Future<()>,
}

/// Handle passed to workflow code.
///
/// Dereferences to the coroutine [`Context`], so it can be handed to
/// channels, futures and selectors directly.
#[derive(Clone)]
pub struct WorkflowContext {
    ctx: Context,
    env: Arc<WorkflowEnvironment>,
}

impl Deref for WorkflowContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

impl WorkflowContext {
    pub(crate) fn new(ctx: Context, env: Arc<WorkflowEnvironment>) -> Self {
        Self { ctx, env }
    }

    /// Start a named workflow coroutine.
    pub fn go<F>(&self, name: impl Into<String>, body: F)
    where
        F: FnOnce(WorkflowContext) + Send + 'static,
    {
        let env = Arc::clone(&self.env);
        self.ctx
            .spawn(name, move |ctx| body(WorkflowContext::new(ctx, env)));
    }

    /// Workflow information.
    pub fn info(&self) -> WorkflowInfo {
        self.env.lock().info.clone()
    }

    /// Deterministic workflow time.
    pub fn now(&self) -> DateTime<Utc> {
        self.env.lock().current_time
    }

    /// Whether the code is currently replaying recorded history.
    pub fn is_replaying(&self) -> bool {
        self.env.lock().replaying
    }

    /// Schedule an activity on the server.
    ///
    /// # Panics
    ///
    /// Panics when an activity with the same id is still running.
    pub fn execute_activity(
        &self,
        activity_type: impl Into<String>,
        input: Payload,
        options: ActivityOptions,
    ) -> Future<Payload> {
        let (future, settable) = new_future();
        let mut state = self.env.lock();
        let activity_id = options.activity_id.unwrap_or_else(|| state.next_id());
        if state.activities.contains_key(&activity_id) {
            drop(state);
            panic!("activity {activity_id} is already scheduled");
        }
        let task_list = options
            .task_list
            .unwrap_or_else(|| state.info.task_list.clone());
        state.activities.insert(activity_id.clone(), settable);
        state.commands.push(Command::ScheduleActivityTask {
            activity_id,
            activity_type: activity_type.into(),
            task_list,
            input,
        });
        future
    }

    /// Cancel a running activity. Its future resolves as canceled.
    pub fn request_cancel_activity(&self, activity_id: &str) {
        let settable = {
            let mut state = self.env.lock();
            let Some(settable) = state.activities.remove(activity_id) else {
                return;
            };
            let unsent = state.remove_unsent(|command| {
                matches!(command, Command::ScheduleActivityTask { activity_id: id, .. } if id == activity_id)
            });
            if !unsent {
                state.commands.push(Command::RequestCancelActivityTask {
                    activity_id: activity_id.to_string(),
                });
            }
            settable
        };
        settable.set_error(WorkflowError::canceled());
    }

    /// Run a function in-process, recording its result in history.
    ///
    /// Retries follow the policy in `options`: short backoffs happen inside
    /// the current workflow task, longer ones on a durable timer.
    pub fn execute_local_activity(
        &self,
        activity_type: impl Into<String>,
        function: LocalActivityFn,
        input: Payload,
        options: LocalActivityOptions,
    ) -> Future<Payload> {
        let (future, settable) = new_future();
        let activity_type = activity_type.into();
        let name = format!("local-activity-{activity_type}");
        self.go(name, move |ctx| {
            let scheduled_at = ctx.now();
            let expiration = options
                .retry_policy
                .as_ref()
                .and_then(|policy| policy.expiration(scheduled_at));
            let mut attempt = 1;
            loop {
                let pending = ctx.schedule_local_activity(LocalActivityTask {
                    activity_id: String::new(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    attempt,
                    options: options.clone(),
                    scheduled_at,
                    expiration,
                    function: Arc::clone(&function),
                    result_tx: None,
                });
                let outcome = match pending.get(&ctx) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        settable.set_error(err);
                        return;
                    }
                };
                if let (Err(_), Some(backoff)) = (&outcome.result, outcome.backoff) {
                    debug!(
                        activity_type = %activity_type,
                        attempt = outcome.attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying local activity after durable timer"
                    );
                    if let Err(err) = ctx.sleep(backoff) {
                        settable.set_error(err);
                        return;
                    }
                    attempt = outcome.attempt + 1;
                    continue;
                }
                settable.set_result(outcome.result);
                return;
            }
        });
        future
    }

    fn schedule_local_activity(&self, mut task: LocalActivityTask) -> Future<LocalActivityOutcome> {
        let (future, settable) = new_future();
        let mut state = self.env.lock();
        task.activity_id = state.next_local_activity_id();
        let activity_id = task.activity_id.clone();
        state
            .local_activities
            .insert(activity_id.clone(), PendingLocalActivity { task, settable });
        state.unstarted_local_activities.push(activity_id);
        future
    }

    /// Create a durable timer.
    pub fn new_timer(&self, duration: Duration) -> Timer {
        if duration.is_zero() {
            return Timer {
                id: None,
                future: Future::ready(Ok(())),
            };
        }
        let (future, settable) = new_future();
        let mut state = self.env.lock();
        let timer_id = state.next_id();
        state.timers.insert(timer_id.clone(), settable);
        state.commands.push(Command::StartTimer {
            timer_id: timer_id.clone(),
            start_to_fire_timeout_ms: (duration.as_millis() as u64).max(1),
        });
        Timer {
            id: Some(timer_id),
            future,
        }
    }

    /// Cancel a timer. Its future resolves as canceled.
    pub fn cancel_timer(&self, timer: &Timer) {
        let Some(timer_id) = &timer.id else {
            return;
        };
        let settable = {
            let mut state = self.env.lock();
            let Some(settable) = state.timers.remove(timer_id) else {
                return;
            };
            let unsent = state.remove_unsent(|command| {
                matches!(command, Command::StartTimer { timer_id: id, .. } if id == timer_id)
            });
            if !unsent {
                state.commands.push(Command::CancelTimer {
                    timer_id: timer_id.clone(),
                });
            }
            settable
        };
        settable.set_error(WorkflowError::canceled());
    }

    /// Block the calling coroutine on a durable timer.
    pub fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        self.new_timer(duration).future.get(self)
    }

    /// Run `f` once and record its result; replays return the recorded value.
    pub fn side_effect(&self, f: impl FnOnce() -> Payload) -> Payload {
        let (side_effect_id, recorded) = {
            let mut state = self.env.lock();
            state.next_side_effect_id += 1;
            let id = state.next_side_effect_id;
            let recorded = if state.replaying {
                let recorded = state.side_effect_results.get(&id).cloned();
                if recorded.is_none() {
                    let known: Vec<i64> = state.side_effect_results.keys().copied().collect();
                    drop(state);
                    illegal_state(format!(
                        "no recorded result for side effect {id}, known side effects {known:?}"
                    ));
                }
                recorded
            } else {
                None
            };
            (id, recorded)
        };
        let result = recorded.unwrap_or_else(f);
        let details = encode_marker(&SideEffectMarker {
            side_effect_id,
            result: result.clone(),
        });
        self.env.lock().commands.push(Command::RecordMarker {
            marker_name: SIDE_EFFECT_MARKER.to_string(),
            details,
        });
        result
    }

    /// Value that is recomputed on every execution but only recorded when it
    /// changes.
    pub fn mutable_side_effect(&self, id: &str, f: impl FnOnce() -> Payload) -> Payload {
        let (recorded, replaying) = {
            let state = self.env.lock();
            (state.mutable_side_effects.get(id).cloned(), state.replaying)
        };
        match recorded {
            Some(recorded) if replaying => return recorded,
            None if replaying => illegal_state(format!(
                "mutable side effect {id} has no corresponding event in history"
            )),
            _ => {}
        }
        let value = f();
        if recorded.as_ref() == Some(&value) {
            return value;
        }
        let details = encode_marker(&MutableSideEffectMarker {
            id: id.to_string(),
            result: value.clone(),
        });
        let mut state = self.env.lock();
        state.commands.push(Command::RecordMarker {
            marker_name: MUTABLE_SIDE_EFFECT_MARKER.to_string(),
            details,
        });
        state.mutable_side_effects.insert(id.to_string(), value.clone());
        value
    }

    /// Version of the code path guarded by `change_id`.
    ///
    /// New executions get `max_supported` and record it; replays return the
    /// recorded version, or [`DEFAULT_VERSION`] when none was recorded.
    pub fn get_version(&self, change_id: &str, min_supported: i64, max_supported: i64) -> i64 {
        let (version, record) = {
            let state = self.env.lock();
            match state.versions.get(change_id) {
                Some(version) => (*version, false),
                None if state.replaying => (DEFAULT_VERSION, false),
                None => (max_supported, true),
            }
        };
        if version < min_supported || version > max_supported {
            illegal_state(format!(
                "version {version} of change {change_id} is outside the supported range [{min_supported}, {max_supported}]"
            ));
        }

        let mut state = self.env.lock();
        state.versions.insert(change_id.to_string(), version);
        if record {
            state.commands.push(Command::RecordMarker {
                marker_name: VERSION_MARKER.to_string(),
                details: encode_marker(&VersionMarker {
                    change_id: change_id.to_string(),
                    version,
                }),
            });
            let changes: Vec<String> = state
                .versions
                .iter()
                .map(|(id, version)| format!("{id}-{version}"))
                .collect();
            let mut search_attributes = BTreeMap::new();
            search_attributes.insert(
                CHANGE_VERSION_SEARCH_ATTRIBUTE.to_string(),
                encode_marker(&changes),
            );
            state
                .info
                .search_attributes
                .extend(search_attributes.clone());
            state
                .commands
                .push(Command::UpsertWorkflowSearchAttributes { search_attributes });
        }
        version
    }

    /// Buffered channel receiving signals named `name`.
    pub fn signal_channel(&self, name: &str) -> Channel<Payload> {
        self.env.lock().signal_channel(name)
    }

    /// Signal another workflow. Resolves once the server delivered it.
    pub fn signal_external_workflow(
        &self,
        domain: Option<&str>,
        workflow_id: &str,
        run_id: Option<&str>,
        signal_name: &str,
        input: Payload,
    ) -> Future<()> {
        let (future, settable) = new_future();
        let mut state = self.env.lock();
        let control = state.next_id();
        state.external_calls.insert(control.clone(), settable);
        state.commands.push(Command::SignalExternalWorkflowExecution {
            domain: domain.map(str::to_string),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.map(str::to_string),
            signal_name: signal_name.to_string(),
            input,
            control,
        });
        future
    }

    /// Ask the server to cancel another workflow.
    pub fn request_cancel_external_workflow(
        &self,
        domain: Option<&str>,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Future<()> {
        let (future, settable) = new_future();
        let mut state = self.env.lock();
        let control = state.next_id();
        state.external_calls.insert(control.clone(), settable);
        state
            .commands
            .push(Command::RequestCancelExternalWorkflowExecution {
                domain: domain.map(str::to_string),
                workflow_id: workflow_id.to_string(),
                run_id: run_id.map(str::to_string),
                control,
            });
        future
    }

    /// Add or replace search attributes of this execution.
    pub fn upsert_search_attributes(
        &self,
        search_attributes: BTreeMap<String, Payload>,
    ) -> Result<(), WorkflowError> {
        if search_attributes.is_empty() {
            return Err(WorkflowError::application("EmptySearchAttributes", None));
        }
        if search_attributes.contains_key(CHANGE_VERSION_SEARCH_ATTRIBUTE) {
            return Err(WorkflowError::application(
                format!("{CHANGE_VERSION_SEARCH_ATTRIBUTE} is a reserved search attribute"),
                None,
            ));
        }
        let mut state = self.env.lock();
        state
            .info
            .search_attributes
            .extend(search_attributes.clone());
        state
            .commands
            .push(Command::UpsertWorkflowSearchAttributes { search_attributes });
        Ok(())
    }

    /// Register the handler answering `query_type`.
    pub fn set_query_handler(
        &self,
        query_type: &str,
        handler: QueryHandler,
    ) -> Result<(), WorkflowError> {
        if query_type == STACK_TRACE_QUERY {
            return Err(WorkflowError::application(
                format!("{STACK_TRACE_QUERY} is a reserved query type"),
                None,
            ));
        }
        self.env
            .lock()
            .query_handlers
            .insert(query_type.to_string(), handler);
        Ok(())
    }

    /// Channel closed when cancellation of this workflow is requested.
    pub fn cancel_channel(&self) -> Channel<()> {
        self.env.lock().cancel_channel.clone()
    }

    /// Whether cancellation of this workflow was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.env.lock().cancel_requested
    }

    /// Error that, returned from the workflow function, restarts it as a new
    /// run.
    pub fn continue_as_new(&self, workflow_type: impl Into<String>, input: Payload) -> WorkflowError {
        WorkflowError::ContinueAsNew {
            workflow_type: workflow_type.into(),
            input,
        }
    }
}
