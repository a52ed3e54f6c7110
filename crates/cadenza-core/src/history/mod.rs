// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable history: events, commands, batching and replay matching.

pub mod command;
pub mod event;
pub mod iterator;
pub mod markers;
pub mod matcher;

pub use command::{Command, CommandType};
pub use event::{Event, EventAttributes, EventType};
pub use iterator::{CommandEvents, History, PageSource};
pub use matcher::{is_command_match_event, match_replay_with_history};
