// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber initialization for workers embedding the engine.
//!
//! # Usage
//!
//! ```rust,ignore
//! cadenza_core::telemetry::init_subscriber();
//! // ... poll and process tasks ...
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives (default: "info")

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber.
///
/// This function sets up the tracing subscriber with:
/// - A fmt layer that writes to stderr
/// - An EnvFilter that respects `RUST_LOG` (default: info)
///
/// Returns `false` when a global subscriber was already installed, which
/// lets tests call it from every case.
pub fn init_subscriber() -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::Registry::default()
        .with(fmt)
        .with(filter)
        .try_init()
        .is_ok()
}
