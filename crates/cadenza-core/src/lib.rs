// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza Core - Deterministic Replay Engine
//!
//! This crate is the worker-side core of a durable workflow client. Workflow
//! code is written as plain blocking functions; the engine runs it inside
//! deterministic coroutines and rebuilds its state by replaying the
//! execution's event history on every workflow task.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Worker (polls workflow tasks)                │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ WorkflowTask
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  TaskHandler                                                 │
//! │  sticky cache ─► ExecutionContext ─► heartbeat / LA results  │
//! └──────────────────────────────────────────────────────────────┘
//!          │ History batches                    │ LocalActivityTask
//!          ▼                                    ▼
//! ┌─────────────────────────────┐   ┌────────────────────────────┐
//! │  EventHandler + Dispatcher  │   │  LocalActivityWorker       │
//! │  (workflow coroutines)      │   │  (timeouts, panics)        │
//! └─────────────────────────────┘   └────────────────────────────┘
//!          │ replay commands
//!          ▼
//! ┌─────────────────────────────┐
//! │  Nondeterminism detection   │
//! └─────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`coroutine`] | Dispatcher, channels, futures, selector, wait group |
//! | [`history`] | Events, commands, batching iterator, replay matcher |
//! | [`workflow`] | Workflow-facing API ([`WorkflowContext`]) |
//! | [`task`] | Task processing loop and local activities |
//! | [`retry`] | Retry policy and backoff computation |
//! | [`config`] | Worker configuration |
//!
//! # Determinism
//!
//! Exactly one coroutine runs at a time and coroutines are resumed in
//! creation order, so the same history always produces the same commands.
//! Commands produced while replaying are compared against the command
//! events recorded in history; a divergence is handled according to
//! [`NonDeterminismPolicy`].

pub mod config;
pub mod coroutine;
pub mod error;
mod execution;
pub mod history;
pub mod payload;
pub mod retry;
pub mod task;
pub mod telemetry;
pub mod workflow;

pub use config::{NonDeterminismPolicy, PanicPolicy, WorkerConfig};
pub use coroutine::{Channel, Context, Dispatcher, Future, Selector, Settable, WaitGroup, new_future};
pub use error::{NondeterminismError, NondeterminismKind, Result, TaskError, WorkflowError};
pub use payload::Payload;
pub use retry::RetryPolicy;
pub use task::{
    TaskCompletion, TaskHandler, TaskHeartbeat, WorkflowQuery, WorkflowTask,
};
pub use workflow::{WorkflowContext, WorkflowExecution, WorkflowFn, WorkflowInfo};
