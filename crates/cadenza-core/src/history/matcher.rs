// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nondeterminism detection.
//!
//! Replayed commands are merge-walked against the command events of the
//! history. Version and mutable side effect markers are exempt on both
//! sides, since replay legitimately omits them.

use super::command::Command;
use super::event::{Event, EventAttributes};
use super::markers::{
    CHANGE_VERSION_SEARCH_ATTRIBUTE, MUTABLE_SIDE_EFFECT_MARKER, REPLAY_DOMAIN, VERSION_MARKER,
};
use crate::error::{NondeterminismError, NondeterminismKind};

/// Check that `commands` reproduce the command events in `events`.
///
/// Commands and events are always matched on type plus identity: activity
/// id and unqualified type, timer id, marker name, signal or cancel target.
/// In strict mode payloads are compared as well: activity task list and
/// input, timer timeout, marker details, close command results and upserted
/// search attributes.
pub fn match_replay_with_history(
    commands: &[Command],
    events: &[Event],
    strict: bool,
) -> Result<(), NondeterminismError> {
    let mut ci = 0;
    let mut ei = 0;

    while ei < events.len() || ci < commands.len() {
        let mut event = None;
        if let Some(candidate) = events.get(ei) {
            if is_change_version_upsert_pair(events, ei) {
                ei += 2;
                continue;
            }
            if is_exempt_marker(candidate.marker_name()) {
                ei += 1;
                continue;
            }
            event = Some(candidate);
        }

        let mut command = None;
        if let Some(candidate) = commands.get(ci) {
            if is_exempt_marker(candidate.marker_name()) {
                ci += 1;
                continue;
            }
            command = Some(candidate);
        }

        match (command, event) {
            (None, Some(event)) => {
                return Err(NondeterminismError::new(
                    NondeterminismKind::MissingCommand,
                    format!("missing replay command for {event}"),
                ));
            }
            (Some(command), None) => {
                return Err(NondeterminismError::new(
                    NondeterminismKind::ExtraCommand,
                    format!("extra replay command for {command}"),
                ));
            }
            (Some(command), Some(event)) => {
                if !is_command_match_event(command, event, strict) {
                    return Err(NondeterminismError::new(
                        NondeterminismKind::Mismatch,
                        format!("history event is {event}, replay command is {command}"),
                    ));
                }
            }
            (None, None) => {}
        }
        ci += 1;
        ei += 1;
    }
    Ok(())
}

fn is_exempt_marker(marker_name: Option<&str>) -> bool {
    matches!(
        marker_name,
        Some(VERSION_MARKER) | Some(MUTABLE_SIDE_EFFECT_MARKER)
    )
}

/// A version marker immediately followed by the search attribute upsert it
/// produced.
fn is_change_version_upsert_pair(events: &[Event], index: usize) -> bool {
    if events[index].marker_name() != Some(VERSION_MARKER) {
        return false;
    }
    matches!(
        events.get(index + 1).map(|event| &event.attributes),
        Some(EventAttributes::UpsertWorkflowSearchAttributes { search_attributes })
            if search_attributes.contains_key(CHANGE_VERSION_SEARCH_ATTRIBUTE)
    )
}

/// Type name without its package qualification.
fn last_part_of_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Whether the command and event domains differ in a way that matters.
fn domains_differ(command_domain: Option<&str>, event_domain: &str) -> bool {
    match command_domain {
        None | Some("") => false,
        Some(_) if event_domain.starts_with(REPLAY_DOMAIN) => false,
        Some(domain) => domain != event_domain,
    }
}

/// Whether a single command produced the given event. See
/// [`match_replay_with_history`] for what `strict` adds.
pub fn is_command_match_event(command: &Command, event: &Event, strict: bool) -> bool {
    use EventAttributes as A;
    match (command, &event.attributes) {
        (
            Command::ScheduleActivityTask {
                activity_id,
                activity_type,
                task_list,
                input,
            },
            A::ActivityTaskScheduled {
                activity_id: event_activity_id,
                activity_type: event_activity_type,
                task_list: event_task_list,
                input: event_input,
            },
        ) => {
            activity_id == event_activity_id
                && last_part_of_name(activity_type) == last_part_of_name(event_activity_type)
                && (!strict || (task_list == event_task_list && input == event_input))
        }
        (
            Command::RequestCancelActivityTask { activity_id },
            A::ActivityTaskCancelRequested {
                activity_id: event_activity_id,
            }
            | A::RequestCancelActivityTaskFailed {
                activity_id: event_activity_id,
                ..
            },
        ) => activity_id == event_activity_id,
        (
            Command::StartTimer {
                timer_id,
                start_to_fire_timeout_ms,
            },
            A::TimerStarted {
                timer_id: event_timer_id,
                start_to_fire_timeout_ms: event_timeout,
            },
        ) => timer_id == event_timer_id && (!strict || start_to_fire_timeout_ms == event_timeout),
        (
            Command::CancelTimer { timer_id },
            A::TimerCanceled {
                timer_id: event_timer_id,
            }
            | A::CancelTimerFailed {
                timer_id: event_timer_id,
                ..
            },
        ) => timer_id == event_timer_id,
        (
            Command::RecordMarker {
                marker_name,
                details,
            },
            A::MarkerRecorded {
                marker_name: event_marker_name,
                details: event_details,
            },
        ) => marker_name == event_marker_name && (!strict || details == event_details),
        (
            Command::CompleteWorkflowExecution { result },
            A::WorkflowExecutionCompleted {
                result: event_result,
            },
        ) => !strict || result == event_result,
        (
            Command::FailWorkflowExecution { reason, details },
            A::WorkflowExecutionFailed {
                reason: event_reason,
                details: event_details,
            },
        ) => !strict || (reason == event_reason && details == event_details),
        (
            Command::CancelWorkflowExecution { details },
            A::WorkflowExecutionCanceled {
                details: event_details,
            },
        ) => !strict || details == event_details,
        (
            Command::ContinueAsNewWorkflowExecution {
                workflow_type,
                input,
            },
            A::WorkflowExecutionContinuedAsNew {
                workflow_type: event_workflow_type,
                input: event_input,
            },
        ) => !strict || (workflow_type == event_workflow_type && input == event_input),
        (
            Command::SignalExternalWorkflowExecution {
                domain,
                workflow_id,
                signal_name,
                ..
            },
            A::SignalExternalWorkflowExecutionInitiated {
                domain: event_domain,
                workflow_id: event_workflow_id,
                signal_name: event_signal_name,
                ..
            },
        ) => {
            !domains_differ(domain.as_deref(), event_domain)
                && workflow_id == event_workflow_id
                && signal_name == event_signal_name
        }
        (
            Command::RequestCancelExternalWorkflowExecution {
                domain,
                workflow_id,
                run_id,
                ..
            },
            A::RequestCancelExternalWorkflowExecutionInitiated {
                domain: event_domain,
                workflow_id: event_workflow_id,
                run_id: event_run_id,
                ..
            },
        ) => {
            !domains_differ(domain.as_deref(), event_domain)
                && workflow_id == event_workflow_id
                && run_id == event_run_id
        }
        (
            Command::UpsertWorkflowSearchAttributes { search_attributes },
            A::UpsertWorkflowSearchAttributes {
                search_attributes: event_attributes,
            },
        ) => !strict || search_attributes == event_attributes,
        _ => false,
    }
}
