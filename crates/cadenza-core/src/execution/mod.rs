// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution replay state and the sticky cache that keeps it between
//! workflow tasks.

mod cache;
mod context;

pub(crate) use cache::StickyCache;
pub(crate) use context::{ExecutionContext, LocalActivityDispatch};
