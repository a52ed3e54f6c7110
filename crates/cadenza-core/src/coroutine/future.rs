// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-assignment futures for coroutine code.
//!
//! A [`Future`] is resolved exactly once through its [`Settable`]. Waiting
//! parks the coroutine on a private channel that is closed on resolution.

use std::fmt;
use std::sync::{Arc, Mutex};

use super::{Channel, Context, lock};
use crate::error::WorkflowError;

struct FutureState<T> {
    value: Option<Result<T, WorkflowError>>,
    chained: Vec<Settable<T>>,
}

struct FutureShared<T> {
    state: Mutex<FutureState<T>>,
    channel: Channel<()>,
}

/// Read side of a single-assignment value.
pub struct Future<T> {
    shared: Arc<FutureShared<T>>,
}

/// Write side of a [`Future`].
pub struct Settable<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Settable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = lock(&self.shared.state).value.is_some();
        f.debug_struct("Future").field("ready", &ready).finish()
    }
}

/// Create an unresolved future and its settable.
pub fn new_future<T: Clone + Send + 'static>() -> (Future<T>, Settable<T>) {
    let shared = Arc::new(FutureShared {
        state: Mutex::new(FutureState {
            value: None,
            chained: Vec::new(),
        }),
        channel: Channel::new("future", 0),
    });
    (
        Future {
            shared: Arc::clone(&shared),
        },
        Settable { shared },
    )
}

impl<T: Clone + Send + 'static> Future<T> {
    /// A future that is already resolved.
    pub fn ready(result: Result<T, WorkflowError>) -> Self {
        let (future, settable) = new_future();
        settable.set_result(result);
        future
    }

    /// Wait for the value, parking the coroutine until it is set.
    pub fn get(&self, ctx: &Context) -> Result<T, WorkflowError> {
        loop {
            if let Some(result) = lock(&self.shared.state).value.clone() {
                return result;
            }
            // The backing channel only ever closes.
            let _ = self.shared.channel.receive(ctx);
        }
    }

    /// The value if already resolved.
    pub fn try_get(&self) -> Option<Result<T, WorkflowError>> {
        lock(&self.shared.state).value.clone()
    }

    /// Whether the future is resolved.
    pub fn is_ready(&self) -> bool {
        lock(&self.shared.state).value.is_some()
    }

    pub(crate) fn channel(&self) -> &Channel<()> {
        &self.shared.channel
    }
}

impl<T: Clone + Send + 'static> Settable<T> {
    /// Resolve with a value.
    pub fn set(&self, value: T) {
        self.set_result(Ok(value));
    }

    /// Resolve with an error.
    pub fn set_error(&self, error: WorkflowError) {
        self.set_result(Err(error));
    }

    /// Resolve with a result and propagate it to chained settables.
    ///
    /// # Panics
    ///
    /// Panics when the future is already resolved.
    pub fn set_result(&self, result: Result<T, WorkflowError>) {
        let chained = {
            let mut state = lock(&self.shared.state);
            if state.value.is_some() {
                drop(state);
                panic!("future already set");
            }
            state.value = Some(result.clone());
            std::mem::take(&mut state.chained)
        };
        self.shared.channel.close();
        for settable in chained {
            settable.set_result(result.clone());
        }
    }

    /// Resolve this future with whatever `other` resolves to.
    ///
    /// # Panics
    ///
    /// Panics when this future is already resolved.
    pub fn chain(&self, other: &Future<T>) {
        if lock(&self.shared.state).value.is_some() {
            panic!("future already set");
        }
        let resolved = {
            let mut state = lock(&other.shared.state);
            match &state.value {
                Some(result) => Some(result.clone()),
                None => {
                    state.chained.push(self.clone());
                    None
                }
            }
        };
        if let Some(result) = resolved {
            self.set_result(result);
        }
    }

    /// Whether the future is resolved.
    pub fn is_ready(&self) -> bool {
        lock(&self.shared.state).value.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_try_get() {
        let (future, settable) = new_future::<u32>();
        assert!(!future.is_ready());
        assert!(future.try_get().is_none());
        settable.set(5);
        assert!(future.is_ready());
        assert_eq!(future.try_get(), Some(Ok(5)));
        assert!(future.channel().is_closed());
    }

    #[test]
    #[should_panic(expected = "future already set")]
    fn test_double_set_panics() {
        let (_future, settable) = new_future::<u32>();
        settable.set(1);
        settable.set(2);
    }

    #[test]
    fn test_chain_resolves_transitively() {
        let (source, source_settable) = new_future::<String>();
        let (middle, middle_settable) = new_future::<String>();
        let (last, last_settable) = new_future::<String>();
        middle_settable.chain(&source);
        last_settable.chain(&middle);
        assert!(!last.is_ready());

        source_settable.set_error(WorkflowError::canceled());
        assert_eq!(middle.try_get(), Some(Err(WorkflowError::canceled())));
        assert_eq!(last.try_get(), Some(Err(WorkflowError::canceled())));
    }

    #[test]
    fn test_chain_to_ready_future() {
        let ready = Future::ready(Ok(9u8));
        let (future, settable) = new_future::<u8>();
        settable.chain(&ready);
        assert_eq!(future.try_get(), Some(Ok(9)));
    }
}
