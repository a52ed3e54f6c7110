// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow API tests.
//!
//! Exercise timers, versioning, cancellation and continue-as-new through
//! the task handler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cadenza_core::history::markers::{CHANGE_VERSION_SEARCH_ATTRIBUTE, VERSION_MARKER};
use cadenza_core::history::{Command, CommandType, EventAttributes};
use cadenza_core::task::CompletedTask;
use cadenza_core::workflow::DEFAULT_VERSION;
use cadenza_core::{
    Payload, TaskCompletion, TaskHandler, WorkerConfig, WorkflowContext, WorkflowError, WorkflowFn,
};
use common::{HistoryBuilder, RecordingHeartbeat, resolver, workflow_task};

async fn run_first_task(handler: &TaskHandler, history: &HistoryBuilder) -> Option<TaskCompletion> {
    handler
        .process_workflow_task(workflow_task("run-1", 0, history.events()), &RecordingHeartbeat::default())
        .await
        .unwrap()
}

fn completed(completion: Option<TaskCompletion>) -> CompletedTask {
    match completion {
        Some(TaskCompletion::Completed(completed)) => completed,
        other => panic!("expected a completed task, got {other:?}"),
    }
}

#[tokio::test]
async fn test_timer_fires_on_next_task() {
    let workflow: WorkflowFn = Arc::new(|ctx: WorkflowContext, _input: Payload| {
        ctx.sleep(Duration::from_secs(5))?;
        Ok(Payload::from("woke"))
    });
    let handler = TaskHandler::new(WorkerConfig::new(), resolver(workflow));
    let mut history = HistoryBuilder::started(Payload::empty());
    let first_started = history.task();

    let first = completed(run_first_task(&handler, &history).await);
    assert_eq!(
        first.commands,
        vec![Command::StartTimer {
            timer_id: "0".to_string(),
            start_to_fire_timeout_ms: 5000,
        }]
    );

    history.task_completed();
    history.timer_started("0", 5000);
    history.timer_fired("0");
    history.task();
    let completion = handler
        .process_workflow_task(
            workflow_task("run-1", first_started, history.events_from(first_started + 1)),
            &RecordingHeartbeat::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        completed(completion).commands,
        vec![Command::CompleteWorkflowExecution {
            result: Some(Payload::from("woke")),
        }]
    );
}

#[tokio::test]
async fn test_unsent_timer_cancel_drops_command() {
    let workflow: WorkflowFn = Arc::new(|ctx: WorkflowContext, _input: Payload| {
        let timer = ctx.new_timer(Duration::from_secs(10));
        ctx.cancel_timer(&timer);
        match timer.future.get(&ctx) {
            Err(err) if err.is_canceled() => Ok(Payload::from("canceled")),
            other => other.map(|()| Payload::from("fired")),
        }
    });
    let handler = TaskHandler::new(WorkerConfig::new(), resolver(workflow));
    let mut history = HistoryBuilder::started(Payload::empty());
    history.task();

    let commands = completed(run_first_task(&handler, &history).await).commands;
    assert_eq!(
        commands,
        vec![Command::CompleteWorkflowExecution {
            result: Some(Payload::from("canceled")),
        }]
    );
}

fn versioned_workflow() -> WorkflowFn {
    Arc::new(|ctx: WorkflowContext, _input: Payload| {
        let version = ctx.get_version("new-step", DEFAULT_VERSION, 1);
        Payload::encode(&version).map_err(|e| WorkflowError::application(e.to_string(), None))
    })
}

#[tokio::test]
async fn test_get_version_records_marker_for_new_execution() {
    let handler = TaskHandler::new(WorkerConfig::new(), resolver(versioned_workflow()));
    let mut history = HistoryBuilder::started(Payload::empty());
    history.task();

    let commands = completed(run_first_task(&handler, &history).await).commands;
    let types: Vec<CommandType> = commands.iter().map(Command::command_type).collect();
    assert_eq!(
        types,
        vec![
            CommandType::RecordMarker,
            CommandType::UpsertWorkflowSearchAttributes,
            CommandType::CompleteWorkflowExecution,
        ]
    );
    assert_eq!(commands[0].marker_name(), Some(VERSION_MARKER));
    match &commands[1] {
        Command::UpsertWorkflowSearchAttributes { search_attributes } => {
            let changes: Vec<String> = search_attributes[CHANGE_VERSION_SEARCH_ATTRIBUTE].decode().unwrap();
            assert_eq!(changes, vec!["new-step-1".to_string()]);
        }
        other => panic!("unexpected command {other}"),
    }
    assert_eq!(
        commands[2],
        Command::CompleteWorkflowExecution {
            result: Some(Payload::encode(&1i64).unwrap()),
        }
    );
}

#[tokio::test]
async fn test_get_version_defaults_for_old_history() {
    let config = WorkerConfig::new().with_sticky_cache_size(0);
    let handler = TaskHandler::new(config, resolver(versioned_workflow()));
    let mut history = HistoryBuilder::started(Payload::empty());
    let started = history.task();

    let completion = handler
        .process_workflow_task(workflow_task("run-1", started, history.events()), &RecordingHeartbeat::default())
        .await
        .unwrap();

    assert_eq!(
        completed(completion).commands,
        vec![Command::CompleteWorkflowExecution {
            result: Some(Payload::encode(&DEFAULT_VERSION).unwrap()),
        }]
    );
}

#[tokio::test]
async fn test_cancel_request_closes_cancel_channel() {
    let workflow: WorkflowFn = Arc::new(|ctx: WorkflowContext, _input: Payload| {
        ctx.cancel_channel().receive(&ctx);
        assert!(ctx.is_cancel_requested());
        Err(WorkflowError::canceled())
    });
    let handler = TaskHandler::new(WorkerConfig::new(), resolver(workflow));
    let mut history = HistoryBuilder::started(Payload::empty());
    let first_started = history.task();
    assert!(completed(run_first_task(&handler, &history).await).commands.is_empty());

    history.task_completed();
    history.add(EventAttributes::WorkflowExecutionCancelRequested {
        cause: "user".to_string(),
    });
    history.task();
    let completion = handler
        .process_workflow_task(
            workflow_task("run-1", first_started, history.events_from(first_started + 1)),
            &RecordingHeartbeat::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        completed(completion).commands,
        vec![Command::CancelWorkflowExecution { details: None }]
    );
}

#[tokio::test]
async fn test_continue_as_new() {
    let workflow: WorkflowFn = Arc::new(|ctx: WorkflowContext, input: Payload| {
        Err(ctx.continue_as_new("next-workflow", input))
    });
    let handler = TaskHandler::new(WorkerConfig::new(), resolver(workflow));
    let mut history = HistoryBuilder::started(Payload::from("state"));
    history.task();

    assert_eq!(
        completed(run_first_task(&handler, &history).await).commands,
        vec![Command::ContinueAsNewWorkflowExecution {
            workflow_type: "next-workflow".to_string(),
            input: Payload::from("state"),
        }]
    );
    assert!(!handler.is_cached("run-1"));
}

#[tokio::test]
async fn test_blocking_workflow_code_is_a_deadlock() {
    let workflow: WorkflowFn = Arc::new(|_ctx: WorkflowContext, _input: Payload| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(Payload::empty())
    });
    let config = WorkerConfig::new().with_deadlock_detection_timeout(Duration::from_millis(50));
    let handler = TaskHandler::new(config, resolver(workflow));
    let mut history = HistoryBuilder::started(Payload::empty());
    history.task();

    match run_first_task(&handler, &history).await {
        Some(TaskCompletion::Failed(failed)) => {
            assert!(failed.message.contains("potential deadlock"), "{}", failed.message);
        }
        other => panic!("expected a failed task, got {other:?}"),
    }
}
