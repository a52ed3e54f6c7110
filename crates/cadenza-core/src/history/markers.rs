// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Marker names and the data recorded in marker details.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::payload::Payload;

/// Marker recording the version chosen for a change id.
pub const VERSION_MARKER: &str = "Version";
/// Marker recording a side effect result.
pub const SIDE_EFFECT_MARKER: &str = "SideEffect";
/// Marker recording a mutable side effect value.
pub const MUTABLE_SIDE_EFFECT_MARKER: &str = "MutableSideEffect";
/// Marker recording a local activity result.
pub const LOCAL_ACTIVITY_MARKER: &str = "LocalActivity";

/// Search attribute listing the change versions of an execution.
pub const CHANGE_VERSION_SEARCH_ATTRIBUTE: &str = "CadenzaChangeVersion";

/// Placeholder domain used by replay tooling; never compared.
pub const REPLAY_DOMAIN: &str = "ReplayDomain";

/// Details of a [`VERSION_MARKER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub change_id: String,
    pub version: i64,
}

/// Details of a [`SIDE_EFFECT_MARKER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectMarker {
    pub side_effect_id: i64,
    pub result: Payload,
}

/// Details of a [`MUTABLE_SIDE_EFFECT_MARKER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableSideEffectMarker {
    pub id: String,
    pub result: Payload,
}

/// Details of a [`LOCAL_ACTIVITY_MARKER`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalActivityMarker {
    pub activity_id: String,
    pub activity_type: String,
    pub result: Option<Payload>,
    pub error: Option<WorkflowError>,
    /// Attempt that produced this result (1-based).
    pub attempt: u32,
    /// Backoff to wait before the next attempt, when the retry did not fit
    /// in the task timeout and workflow code must schedule it.
    pub backoff_ms: Option<u64>,
    pub replay_time: DateTime<Utc>,
}

/// Encode marker details.
pub fn encode_marker<T: Serialize>(data: &T) -> Payload {
    // Marker types contain only strings, integers and payload bytes.
    Payload::encode(data).unwrap_or_default()
}
