// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Paged history iteration and command-event batching.
//!
//! History is consumed one workflow task at a time. A batch ends at a
//! `WorkflowTaskStarted` event unless that task attempt timed out or failed,
//! in which case the attempt is folded into the following batch. Task
//! scheduled/timed-out/failed events never reach the caller.
//!
//! [`History::next_command_events`] looks one batch ahead: the markers it
//! returns belong to the *following* batch, because those markers were
//! recorded by the decision made in response to the current one and must be
//! applied before the current batch's events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::event::{Event, EventAttributes, EventType};
use crate::error::{Result, TaskError};

/// Source of additional history pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Whether another page is available.
    async fn has_next_page(&self) -> bool;

    /// Fetch the next page.
    async fn next_page(&self) -> Result<Vec<Event>>;

    /// Rewind to the first page of the history.
    async fn reset(&self);
}

/// One batch of history plus the markers recorded in response to it.
#[derive(Debug, Clone, Default)]
pub struct CommandEvents {
    /// Events of this batch, markers included.
    pub events: Vec<Event>,
    /// Marker events of the following batch.
    pub markers: Vec<Event>,
    /// Binary checksum recorded when this batch's task completed.
    pub binary_checksum: Option<String>,
}

impl CommandEvents {
    /// Whether iteration is finished.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether the batch was already processed by an earlier task.
    pub fn is_replay(&self, previous_started_event_id: i64) -> bool {
        self.events
            .last()
            .is_some_and(|event| is_replay_event(event, previous_started_event_id))
    }
}

/// Whether an event was already observed by workflow code in an earlier task.
pub(crate) fn is_replay_event(event: &Event, previous_started_event_id: i64) -> bool {
    event.event_id <= previous_started_event_id || event.is_command_event()
}

/// Iterator over the history of one workflow task.
pub struct History {
    loaded: Vec<Event>,
    index: usize,
    page_source: Option<Arc<dyn PageSource>>,
    last_event_id: i64,
    previous_started_event_id: i64,
    next_event_id: i64,
    binary_checksum: Option<String>,
    next: Option<Vec<Event>>,
}

impl History {
    /// Create an iterator over `first_page`.
    ///
    /// `last_event_id` is the started event id of the task (zero when
    /// unbounded); more pages are pulled from `page_source` on demand.
    pub fn new(
        first_page: Vec<Event>,
        page_source: Option<Arc<dyn PageSource>>,
        last_event_id: i64,
        previous_started_event_id: i64,
    ) -> Self {
        let next_event_id = first_page.first().map_or(1, |event| event.event_id);
        Self {
            loaded: first_page,
            index: 0,
            page_source,
            last_event_id,
            previous_started_event_id,
            next_event_id,
            binary_checksum: None,
            next: None,
        }
    }

    /// Id of the next event to be consumed.
    pub fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// Whether the event was already observed by workflow code.
    pub fn is_replay_event(&self, event: &Event) -> bool {
        is_replay_event(event, self.previous_started_event_id)
    }

    /// Whether another batch remains after the last one returned.
    pub fn has_next_command_events(&self) -> bool {
        self.next.as_ref().is_some_and(|next| !next.is_empty())
            || self.index != self.loaded.len()
    }

    /// Next batch of events. An empty batch ends the iteration.
    pub async fn next_command_events(&mut self) -> Result<CommandEvents> {
        if self.next.is_none() {
            let (events, _) = self.next_batch().await?;
            self.next = Some(events);
        }
        let events = self.next.take().unwrap_or_default();
        let binary_checksum = self.binary_checksum.clone();
        let mut markers = Vec::new();
        if !events.is_empty() {
            let (next, next_markers) = self.next_batch().await?;
            self.next = Some(next);
            markers = next_markers;
        } else {
            self.next = Some(Vec::new());
        }
        Ok(CommandEvents {
            events,
            markers,
            binary_checksum,
        })
    }

    async fn has_more_pages(&self) -> bool {
        match &self.page_source {
            Some(source) => source.has_next_page().await,
            None => false,
        }
    }

    async fn load_more(&mut self) -> Result<()> {
        let Some(source) = &self.page_source else {
            return Ok(());
        };
        let page = source.next_page().await?;
        debug!(events = page.len(), "Loaded history page");
        self.loaded.extend(page);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<(Vec<Event>, Vec<Event>)> {
        let mut events = Vec::new();
        let mut markers = Vec::new();

        loop {
            while self.index == self.loaded.len() {
                if !self.has_more_pages().await {
                    self.verify_all_events_processed()?;
                    self.shrink();
                    return Ok((events, markers));
                }
                self.load_more().await?;
            }

            let event = &self.loaded[self.index];
            if event.event_id != self.next_event_id {
                return Err(TaskError::HistoryIntegrity(format!(
                    "missing history events, expected next event id {} but received {}",
                    self.next_event_id, event.event_id
                )));
            }
            self.next_event_id += 1;

            match event.event_type() {
                EventType::WorkflowTaskStarted => {
                    let (failed, checksum) = self.is_next_task_failed().await?;
                    if !failed {
                        self.binary_checksum = checksum;
                        events.push(self.loaded[self.index].clone());
                        self.index += 1;
                        self.shrink();
                        return Ok((events, markers));
                    }
                }
                EventType::WorkflowTaskScheduled
                | EventType::WorkflowTaskTimedOut
                | EventType::WorkflowTaskFailed => {}
                EventType::MarkerRecorded => {
                    markers.push(event.clone());
                    events.push(event.clone());
                }
                _ => events.push(event.clone()),
            }
            self.index += 1;
        }
    }

    /// Inspect the event after the current `WorkflowTaskStarted`.
    async fn is_next_task_failed(&mut self) -> Result<(bool, Option<String>)> {
        let next_index = self.index + 1;
        if next_index >= self.loaded.len() && self.has_more_pages().await {
            self.load_more().await?;
        }
        let Some(next) = self.loaded.get(next_index) else {
            return Ok((false, None));
        };
        match &next.attributes {
            EventAttributes::WorkflowTaskTimedOut | EventAttributes::WorkflowTaskFailed { .. } => {
                Ok((true, None))
            }
            EventAttributes::WorkflowTaskCompleted { binary_checksum } => {
                Ok((false, binary_checksum.clone()))
            }
            _ => Ok((false, None)),
        }
    }

    fn verify_all_events_processed(&self) -> Result<()> {
        if self.last_event_id > 0 && self.next_event_id <= self.last_event_id {
            return Err(TaskError::HistoryIntegrity(format!(
                "premature end of stream, expected last event id {} but no more events after event id {}",
                self.last_event_id,
                self.next_event_id - 1
            )));
        }
        if self.last_event_id > 0 && self.next_event_id != self.last_event_id + 1 {
            warn!(
                last_event_id = self.last_event_id,
                next_event_id = self.next_event_id,
                "Processed events past the expected last event id"
            );
        }
        Ok(())
    }

    fn shrink(&mut self) {
        if self.index > 0 {
            self.loaded.drain(..self.index);
            self.index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    fn started(id: i64) -> Event {
        Event::new(
            id,
            EventAttributes::WorkflowExecutionStarted {
                workflow_type: "wf".into(),
                task_list: "tl".into(),
                input: Payload::empty(),
                task_timeout_ms: 1000,
                attempt: 1,
            },
        )
    }

    fn task_events(first: i64) -> Vec<Event> {
        vec![
            Event::new(first, EventAttributes::WorkflowTaskScheduled),
            Event::new(first + 1, EventAttributes::WorkflowTaskStarted),
        ]
    }

    #[tokio::test]
    async fn test_single_batch() {
        let mut events = vec![started(1)];
        events.extend(task_events(2));
        let mut history = History::new(events, None, 3, 0);

        let batch = history.next_command_events().await.unwrap();
        let ids: Vec<i64> = batch.events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(!batch.is_replay(0));

        let end = history.next_command_events().await.unwrap();
        assert!(end.is_empty());
    }

    #[tokio::test]
    async fn test_gap_is_integrity_error() {
        let events = vec![started(1), Event::new(3, EventAttributes::WorkflowTaskStarted)];
        let mut history = History::new(events, None, 3, 0);
        let err = history.next_command_events().await.unwrap_err();
        assert!(matches!(err, TaskError::HistoryIntegrity(_)));
    }
}
