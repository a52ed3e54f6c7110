// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker configuration for the replay engine.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What to do when workflow code panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicPolicy {
    /// Fail the task and keep failing it until the code is fixed.
    #[default]
    BlockWorkflow,
    /// Fail the workflow execution permanently.
    FailWorkflow,
}

/// What to do when replay diverges from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonDeterminismPolicy {
    /// Fail the task with the nondeterminism cause.
    #[default]
    BlockWorkflow,
    /// Fail the workflow execution permanently.
    FailWorkflow,
}

fn parse_policy(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "block" | "block_workflow" => Some(false),
        "fail" | "fail_workflow" => Some(true),
        _ => None,
    }
}

impl FromStr for PanicPolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match parse_policy(s) {
            Some(true) => Ok(PanicPolicy::FailWorkflow),
            Some(false) => Ok(PanicPolicy::BlockWorkflow),
            None => Err(()),
        }
    }
}

impl FromStr for NonDeterminismPolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match parse_policy(s) {
            Some(true) => Ok(NonDeterminismPolicy::FailWorkflow),
            Some(false) => Ok(NonDeterminismPolicy::BlockWorkflow),
            None => Err(()),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// Tunables for task processing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of cached executions (0 disables sticky caching).
    pub sticky_cache_size: usize,
    /// How long a coroutine may run before it is declared deadlocked.
    pub deadlock_detection_timeout: Duration,
    /// Fraction of the task timeout after which a task with pending
    /// local activities is heartbeated.
    pub task_heartbeat_ratio: f64,
    /// Reaction to workflow panics.
    pub panic_policy: PanicPolicy,
    /// Reaction to nondeterminism.
    pub nondeterminism_policy: NonDeterminismPolicy,
    /// Capacity of the local activity dispatch queue.
    pub local_activity_queue_size: usize,
    /// Compare completion payloads when matching replayed commands.
    pub strict_replay: bool,
    /// Binary checksum reported with completions.
    pub binary_checksum: Option<String>,
    /// Task timeout used when the start event does not carry one.
    pub default_task_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConfig {
    /// Configuration with default values.
    pub fn new() -> Self {
        Self {
            sticky_cache_size: 10_000,
            deadlock_detection_timeout: Duration::from_millis(1_000),
            task_heartbeat_ratio: 0.8,
            panic_policy: PanicPolicy::BlockWorkflow,
            nondeterminism_policy: NonDeterminismPolicy::BlockWorkflow,
            local_activity_queue_size: 1_000,
            strict_replay: false,
            binary_checksum: None,
            default_task_timeout: Duration::from_millis(10_000),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `CADENZA_STICKY_CACHE_SIZE` - Cached executions (default: 10000, zero or negative disables)
    /// - `CADENZA_DEADLOCK_DETECTION_TIMEOUT_MS` - Deadlock timeout (default: 1000)
    /// - `CADENZA_TASK_HEARTBEAT_RATIO` - Heartbeat point as a fraction of the task timeout (default: 0.8)
    /// - `CADENZA_PANIC_POLICY` - `block` or `fail` (default: block)
    /// - `CADENZA_NONDETERMINISM_POLICY` - `block` or `fail` (default: block)
    /// - `CADENZA_LOCAL_ACTIVITY_QUEUE_SIZE` - Local activity queue capacity (default: 1000)
    /// - `CADENZA_STRICT_REPLAY` - Strict command matching (default: false)
    /// - `CADENZA_BINARY_CHECKSUM` - Checksum reported with completions (default: unset)
    /// - `CADENZA_DEFAULT_TASK_TIMEOUT_MS` - Fallback task timeout (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();

        let sticky_cache_size = match env::var("CADENZA_STICKY_CACHE_SIZE") {
            Ok(v) => v
                .parse::<i64>()
                .map_err(|_| {
                    ConfigError::Invalid("CADENZA_STICKY_CACHE_SIZE", "must be an integer")
                })?
                .max(0) as usize,
            Err(_) => defaults.sticky_cache_size,
        };

        let deadlock_detection_timeout = match env::var("CADENZA_DEADLOCK_DETECTION_TIMEOUT_MS") {
            Ok(v) => match v.parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::Invalid(
                        "CADENZA_DEADLOCK_DETECTION_TIMEOUT_MS",
                        "must be a positive number of milliseconds",
                    ));
                }
            },
            Err(_) => defaults.deadlock_detection_timeout,
        };

        let task_heartbeat_ratio = match env::var("CADENZA_TASK_HEARTBEAT_RATIO") {
            Ok(v) => match v.parse::<f64>() {
                Ok(r) if r > 0.0 && r <= 1.0 => r,
                _ => {
                    return Err(ConfigError::Invalid(
                        "CADENZA_TASK_HEARTBEAT_RATIO",
                        "must be a number in (0, 1]",
                    ));
                }
            },
            Err(_) => defaults.task_heartbeat_ratio,
        };

        let panic_policy = match env::var("CADENZA_PANIC_POLICY") {
            Ok(v) => v.parse().map_err(|_| {
                ConfigError::Invalid("CADENZA_PANIC_POLICY", "must be 'block' or 'fail'")
            })?,
            Err(_) => defaults.panic_policy,
        };

        let nondeterminism_policy = match env::var("CADENZA_NONDETERMINISM_POLICY") {
            Ok(v) => v.parse().map_err(|_| {
                ConfigError::Invalid("CADENZA_NONDETERMINISM_POLICY", "must be 'block' or 'fail'")
            })?,
            Err(_) => defaults.nondeterminism_policy,
        };

        let local_activity_queue_size = match env::var("CADENZA_LOCAL_ACTIVITY_QUEUE_SIZE") {
            Ok(v) => match v.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid(
                        "CADENZA_LOCAL_ACTIVITY_QUEUE_SIZE",
                        "must be a positive integer",
                    ));
                }
            },
            Err(_) => defaults.local_activity_queue_size,
        };

        let strict_replay = env::var("CADENZA_STRICT_REPLAY")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.strict_replay);

        let binary_checksum = env::var("CADENZA_BINARY_CHECKSUM")
            .ok()
            .filter(|v| !v.is_empty());

        let default_task_timeout = env::var("CADENZA_DEFAULT_TASK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.default_task_timeout);

        Ok(Self {
            sticky_cache_size,
            deadlock_detection_timeout,
            task_heartbeat_ratio,
            panic_policy,
            nondeterminism_policy,
            local_activity_queue_size,
            strict_replay,
            binary_checksum,
            default_task_timeout,
        })
    }

    /// Whether sticky caching is disabled.
    pub fn sticky_cache_disabled(&self) -> bool {
        self.sticky_cache_size == 0
    }

    /// Set the sticky cache size.
    pub fn with_sticky_cache_size(mut self, size: usize) -> Self {
        self.sticky_cache_size = size;
        self
    }

    /// Set the deadlock detection timeout.
    pub fn with_deadlock_detection_timeout(mut self, timeout: Duration) -> Self {
        self.deadlock_detection_timeout = timeout;
        self
    }

    /// Set the heartbeat ratio.
    pub fn with_task_heartbeat_ratio(mut self, ratio: f64) -> Self {
        self.task_heartbeat_ratio = ratio;
        self
    }

    /// Set the panic policy.
    pub fn with_panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    /// Set the nondeterminism policy.
    pub fn with_nondeterminism_policy(mut self, policy: NonDeterminismPolicy) -> Self {
        self.nondeterminism_policy = policy;
        self
    }

    /// Set the local activity queue capacity.
    pub fn with_local_activity_queue_size(mut self, size: usize) -> Self {
        self.local_activity_queue_size = size;
        self
    }

    /// Enable strict replay matching.
    pub fn with_strict_replay(mut self, strict: bool) -> Self {
        self.strict_replay = strict;
        self
    }

    /// Set the binary checksum.
    pub fn with_binary_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.binary_checksum = Some(checksum.into());
        self
    }

    /// Set the fallback task timeout.
    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "CADENZA_STICKY_CACHE_SIZE",
        "CADENZA_DEADLOCK_DETECTION_TIMEOUT_MS",
        "CADENZA_TASK_HEARTBEAT_RATIO",
        "CADENZA_PANIC_POLICY",
        "CADENZA_NONDETERMINISM_POLICY",
        "CADENZA_LOCAL_ACTIVITY_QUEUE_SIZE",
        "CADENZA_STRICT_REPLAY",
        "CADENZA_BINARY_CHECKSUM",
        "CADENZA_DEFAULT_TASK_TIMEOUT_MS",
    ];

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::new();

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.sticky_cache_size, 10_000);
        assert_eq!(config.deadlock_detection_timeout, Duration::from_secs(1));
        assert_eq!(config.task_heartbeat_ratio, 0.8);
        assert_eq!(config.panic_policy, PanicPolicy::BlockWorkflow);
        assert_eq!(config.local_activity_queue_size, 1_000);
        assert!(!config.strict_replay);
        assert!(config.binary_checksum.is_none());
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CADENZA_STICKY_CACHE_SIZE", "25");
        guard.set("CADENZA_DEADLOCK_DETECTION_TIMEOUT_MS", "250");
        guard.set("CADENZA_PANIC_POLICY", "fail");
        guard.set("CADENZA_NONDETERMINISM_POLICY", "FAIL_WORKFLOW");
        guard.set("CADENZA_STRICT_REPLAY", "true");
        guard.set("CADENZA_BINARY_CHECKSUM", "build-42");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.sticky_cache_size, 25);
        assert_eq!(config.deadlock_detection_timeout, Duration::from_millis(250));
        assert_eq!(config.panic_policy, PanicPolicy::FailWorkflow);
        assert_eq!(
            config.nondeterminism_policy,
            NonDeterminismPolicy::FailWorkflow
        );
        assert!(config.strict_replay);
        assert_eq!(config.binary_checksum.as_deref(), Some("build-42"));
    }

    #[test]
    fn test_negative_cache_size_disables_caching() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CADENZA_STICKY_CACHE_SIZE", "-5");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.sticky_cache_size, 0);
        assert!(config.sticky_cache_disabled());
    }

    #[test]
    fn test_invalid_heartbeat_ratio() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CADENZA_TASK_HEARTBEAT_RATIO", "1.5");

        let err = WorkerConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CADENZA_TASK_HEARTBEAT_RATIO", _)
        ));
    }

    #[test]
    fn test_invalid_panic_policy() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CADENZA_PANIC_POLICY", "explode");

        let err = WorkerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CADENZA_PANIC_POLICY", _)));
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new()
            .with_sticky_cache_size(0)
            .with_deadlock_detection_timeout(Duration::from_millis(50))
            .with_panic_policy(PanicPolicy::FailWorkflow)
            .with_binary_checksum("abc");

        assert!(config.sticky_cache_disabled());
        assert_eq!(config.deadlock_detection_timeout, Duration::from_millis(50));
        assert_eq!(config.panic_policy, PanicPolicy::FailWorkflow);
        assert_eq!(config.binary_checksum.as_deref(), Some("abc"));
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(invalid.to_string(), "invalid value for MY_VAR: must be a number");
    }
}
