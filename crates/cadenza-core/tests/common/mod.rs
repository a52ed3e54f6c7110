// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cadenza-core integration tests.
//!
//! Provides a history builder, an in-memory page source, a recording
//! heartbeat and helpers to build workflow tasks.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use cadenza_core::history::{Event, EventAttributes, PageSource};
use cadenza_core::task::{TaskCompletion, TaskHeartbeat, WorkflowTask};
use cadenza_core::workflow::{WorkflowExecution, WorkflowFn, WorkflowResolver};
use cadenza_core::{Payload, Result};

pub const WORKFLOW_TYPE: &str = "test-workflow";
pub const TASK_LIST: &str = "test-task-list";

/// Builds a history with consecutive event ids.
pub struct HistoryBuilder {
    events: Vec<Event>,
}

impl HistoryBuilder {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Start a history with `WorkflowExecutionStarted`.
    pub fn started(input: Payload) -> Self {
        let mut builder = Self::new();
        builder.add(EventAttributes::WorkflowExecutionStarted {
            workflow_type: WORKFLOW_TYPE.to_string(),
            task_list: TASK_LIST.to_string(),
            input,
            task_timeout_ms: 10_000,
            attempt: 1,
        });
        builder
    }

    pub fn next_id(&self) -> i64 {
        self.events.len() as i64 + 1
    }

    pub fn add(&mut self, attributes: EventAttributes) -> i64 {
        let id = self.next_id();
        self.events.push(Event::new(id, attributes));
        id
    }

    /// Append scheduled and started workflow task events; returns the
    /// started event id.
    pub fn task(&mut self) -> i64 {
        self.add(EventAttributes::WorkflowTaskScheduled);
        self.add(EventAttributes::WorkflowTaskStarted)
    }

    pub fn task_completed(&mut self) -> i64 {
        self.add(EventAttributes::WorkflowTaskCompleted {
            binary_checksum: None,
        })
    }

    pub fn activity_scheduled(&mut self, activity_id: &str, activity_type: &str) -> i64 {
        self.add(EventAttributes::ActivityTaskScheduled {
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            task_list: TASK_LIST.to_string(),
            input: Payload::empty(),
        })
    }

    pub fn activity_completed(&mut self, scheduled_event_id: i64, result: Payload) -> i64 {
        self.add(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id,
            result: Some(result),
        })
    }

    pub fn timer_started(&mut self, timer_id: &str, timeout_ms: u64) -> i64 {
        self.add(EventAttributes::TimerStarted {
            timer_id: timer_id.to_string(),
            start_to_fire_timeout_ms: timeout_ms,
        })
    }

    pub fn timer_fired(&mut self, timer_id: &str) -> i64 {
        self.add(EventAttributes::TimerFired {
            timer_id: timer_id.to_string(),
        })
    }

    pub fn marker(&mut self, marker_name: &str, details: Payload) -> i64 {
        self.add(EventAttributes::MarkerRecorded {
            marker_name: marker_name.to_string(),
            details,
        })
    }

    pub fn signal(&mut self, signal_name: &str, input: Payload) -> i64 {
        self.add(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.to_string(),
            input,
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.clone()
    }

    /// Events from `first_event_id` on.
    pub fn events_from(&self, first_event_id: i64) -> Vec<Event> {
        self.events
            .iter()
            .filter(|event| event.event_id >= first_event_id)
            .cloned()
            .collect()
    }
}

/// In-memory page source serving fixed pages.
pub struct FakePageSource {
    pages: Vec<Vec<Event>>,
    next: Mutex<usize>,
}

impl FakePageSource {
    pub fn new(pages: Vec<Vec<Event>>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            next: Mutex::new(0),
        })
    }

    /// Serve `events` in pages of `page_size`.
    pub fn paged(events: Vec<Event>, page_size: usize) -> Arc<Self> {
        Self::new(events.chunks(page_size).map(<[Event]>::to_vec).collect())
    }

    /// Skip the first page, as a task carrying it would.
    pub fn skip_first(self: Arc<Self>) -> Arc<Self> {
        *self.next.lock().unwrap() = 1;
        self
    }
}

#[async_trait]
impl PageSource for FakePageSource {
    async fn has_next_page(&self) -> bool {
        *self.next.lock().unwrap() < self.pages.len()
    }

    async fn next_page(&self) -> Result<Vec<Event>> {
        let mut next = self.next.lock().unwrap();
        let page = self.pages.get(*next).cloned().unwrap_or_default();
        *next += 1;
        Ok(page)
    }

    async fn reset(&self) {
        *self.next.lock().unwrap() = 0;
    }
}

/// Heartbeat that records completions and returns queued follow-up tasks.
#[derive(Default)]
pub struct RecordingHeartbeat {
    pub completions: Mutex<Vec<TaskCompletion>>,
    pub responses: Mutex<Vec<WorkflowTask>>,
}

impl RecordingHeartbeat {
    pub fn count(&self) -> usize {
        self.completions.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskHeartbeat for RecordingHeartbeat {
    async fn heartbeat(&self, completion: TaskCompletion) -> Result<Option<WorkflowTask>> {
        self.completions.lock().unwrap().push(completion);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(None)
        } else {
            Ok(Some(responses.remove(0)))
        }
    }
}

/// Resolver with a single workflow registered under [`WORKFLOW_TYPE`].
pub fn resolver(workflow_fn: WorkflowFn) -> Arc<dyn WorkflowResolver> {
    let mut workflows: HashMap<String, WorkflowFn> = HashMap::new();
    workflows.insert(WORKFLOW_TYPE.to_string(), workflow_fn);
    Arc::new(workflows)
}

/// A workflow task over `history`, started at its last event.
pub fn workflow_task(run_id: &str, previous_started_event_id: i64, history: Vec<Event>) -> WorkflowTask {
    let started_event_id = history.last().map_or(0, |event| event.event_id);
    WorkflowTask {
        domain: "default".to_string(),
        task_list: TASK_LIST.to_string(),
        execution: WorkflowExecution::new("workflow-1", run_id),
        workflow_type: WORKFLOW_TYPE.to_string(),
        previous_started_event_id,
        started_event_id,
        attempt: 1,
        history,
        page_source: None,
        query: None,
    }
}
