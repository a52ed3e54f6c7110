// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State shared between workflow code and the event handler.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{LocalActivityOutcome, QueryHandler, WorkflowInfo};
use crate::coroutine::{Channel, Settable, lock};
use crate::error::WorkflowError;
use crate::history::Command;
use crate::payload::Payload;
use crate::task::LocalActivityTask;

/// Buffer size of signal channels.
pub(crate) const SIGNAL_CHANNEL_CAPACITY: usize = 100_000;

pub(crate) struct PendingLocalActivity {
    pub(crate) task: LocalActivityTask,
    pub(crate) settable: Settable<LocalActivityOutcome>,
}

pub(crate) struct EnvState {
    pub(crate) info: WorkflowInfo,
    pub(crate) commands: Vec<Command>,
    next_id: u64,
    pub(crate) next_side_effect_id: i64,
    next_local_activity_id: u64,

    /// Unresolved activities by activity id.
    pub(crate) activities: HashMap<String, Settable<Payload>>,
    /// Activity id by scheduled event id.
    pub(crate) scheduled_activities: HashMap<i64, String>,
    pub(crate) timers: HashMap<String, Settable<()>>,
    /// Signal and cancel requests to other workflows, by control id.
    pub(crate) external_calls: HashMap<String, Settable<()>>,
    /// Control id by initiated event id.
    pub(crate) initiated_external: HashMap<i64, String>,

    pub(crate) signal_channels: HashMap<String, Channel<Payload>>,
    pub(crate) query_handlers: HashMap<String, QueryHandler>,

    pub(crate) versions: BTreeMap<String, i64>,
    pub(crate) side_effect_results: BTreeMap<i64, Payload>,
    pub(crate) mutable_side_effects: HashMap<String, Payload>,

    pub(crate) local_activities: HashMap<String, PendingLocalActivity>,
    /// Local activities not yet handed to the worker, in scheduling order.
    pub(crate) unstarted_local_activities: Vec<String>,

    pub(crate) cancel_requested: bool,
    pub(crate) cancel_channel: Channel<()>,
    pub(crate) replaying: bool,
    pub(crate) current_time: DateTime<Utc>,
    pub(crate) completion: Option<Result<Payload, WorkflowError>>,
}

impl EnvState {
    /// Next id for activities, timers and external requests.
    pub(crate) fn next_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    pub(crate) fn next_local_activity_id(&mut self) -> String {
        self.next_local_activity_id += 1;
        self.next_local_activity_id.to_string()
    }

    pub(crate) fn signal_channel(&mut self, name: &str) -> Channel<Payload> {
        self.signal_channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(format!("signal-{name}"), SIGNAL_CHANNEL_CAPACITY))
            .clone()
    }

    /// Drop the unsent command matching `predicate`. Returns whether one was
    /// found.
    pub(crate) fn remove_unsent(&mut self, predicate: impl Fn(&Command) -> bool) -> bool {
        match self.commands.iter().position(predicate) {
            Some(index) => {
                self.commands.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Per-execution workflow state.
pub(crate) struct WorkflowEnvironment {
    state: Mutex<EnvState>,
}

impl WorkflowEnvironment {
    pub(crate) fn new(info: WorkflowInfo) -> Self {
        Self {
            state: Mutex::new(EnvState {
                info,
                commands: Vec::new(),
                next_id: 0,
                next_side_effect_id: 0,
                next_local_activity_id: 0,
                activities: HashMap::new(),
                scheduled_activities: HashMap::new(),
                timers: HashMap::new(),
                external_calls: HashMap::new(),
                initiated_external: HashMap::new(),
                signal_channels: HashMap::new(),
                query_handlers: HashMap::new(),
                versions: BTreeMap::new(),
                side_effect_results: BTreeMap::new(),
                mutable_side_effects: HashMap::new(),
                local_activities: HashMap::new(),
                unstarted_local_activities: Vec::new(),
                cancel_requested: false,
                cancel_channel: Channel::new("cancel", 0),
                replaying: false,
                current_time: Utc::now(),
                completion: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EnvState> {
        lock(&self.state)
    }
}
