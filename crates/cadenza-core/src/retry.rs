// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy for local activities.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// Exponential backoff retry policy.
///
/// The delay before retrying after attempt `n` (1-based) is
/// `initial_interval * backoff_coefficient^(n-1)`, capped at
/// `maximum_interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_interval: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_coefficient: f64,
    /// Upper bound for a single delay.
    pub maximum_interval: Option<Duration>,
    /// Total attempts allowed, including the first (0 = unlimited).
    pub maximum_attempts: u32,
    /// Retries stop once the next attempt would start after
    /// schedule time plus this interval.
    pub expiration_interval: Option<Duration>,
    /// Error reasons that are never retried.
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: None,
            maximum_attempts: 0,
            expiration_interval: None,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given initial interval and coefficient.
    pub fn new(initial_interval: Duration, backoff_coefficient: f64) -> Self {
        Self {
            initial_interval,
            backoff_coefficient,
            ..Self::default()
        }
    }

    /// Set the maximum interval.
    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    /// Set the expiration interval.
    pub fn with_expiration_interval(mut self, interval: Duration) -> Self {
        self.expiration_interval = Some(interval);
        self
    }

    /// Add a non-retryable error reason.
    pub fn with_non_retryable_error(mut self, reason: impl Into<String>) -> Self {
        self.non_retryable_error_types.push(reason.into());
        self
    }

    /// Absolute deadline for retries of work scheduled at `scheduled_at`.
    pub fn expiration(&self, scheduled_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(self.expiration_interval?).ok()?;
        scheduled_at.checked_add_signed(interval)
    }

    /// Delay before the next attempt after `attempt` failed with `error`.
    ///
    /// Returns `None` when no retry should happen.
    pub fn next_backoff(
        &self,
        attempt: u32,
        error: Option<&WorkflowError>,
        now: DateTime<Utc>,
        expiration: Option<DateTime<Utc>>,
    ) -> Option<Duration> {
        let error = error?;
        if error.is_canceled() {
            return None;
        }
        if self.maximum_attempts > 0 && attempt >= self.maximum_attempts {
            return None;
        }
        let reason = error.reason();
        if self.non_retryable_error_types.iter().any(|r| *r == reason) {
            return None;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let backoff = match Duration::try_from_secs_f64(seconds) {
            Ok(backoff) if !backoff.is_zero() => backoff,
            // Overflow or underflow.
            _ => self.maximum_interval?,
        };
        let backoff = match self.maximum_interval {
            Some(maximum) if backoff > maximum => maximum,
            _ => backoff,
        };

        if let Some(expiration) = expiration {
            let next = chrono::Duration::from_std(backoff)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay));
            match next {
                Some(next) if next <= expiration => {}
                _ => return None,
            }
        }
        Some(backoff)
    }
}
