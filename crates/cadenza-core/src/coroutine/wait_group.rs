// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Counter that lets one coroutine wait for a group of others.

use std::sync::{Arc, Mutex};

use super::future::new_future;
use super::{Context, Future, Settable, lock};

struct WaitGroupState {
    count: i64,
    waiting: bool,
    future: Future<()>,
    settable: Settable<()>,
}

/// Waits for a collection of coroutines to finish.
#[derive(Clone)]
pub struct WaitGroup {
    state: Arc<Mutex<WaitGroupState>>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    /// Create a wait group with a zero counter.
    pub fn new() -> Self {
        let (future, settable) = new_future();
        Self {
            state: Arc::new(Mutex::new(WaitGroupState {
                count: 0,
                waiting: false,
                future,
                settable,
            })),
        }
    }

    /// Add `delta` to the counter, releasing the waiter when it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics when the counter would go negative.
    pub fn add(&self, delta: i64) {
        let release = {
            let mut state = lock(&self.state);
            state.count += delta;
            if state.count < 0 {
                drop(state);
                panic!("negative WaitGroup counter");
            }
            if state.count > 0 || !state.waiting || state.settable.is_ready() {
                None
            } else {
                Some(state.settable.clone())
            }
        };
        if let Some(settable) = release {
            settable.set(());
        }
    }

    /// Decrement the counter by one.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Current counter value.
    pub fn count(&self) -> i64 {
        lock(&self.state).count
    }

    /// Park until the counter reaches zero.
    ///
    /// # Panics
    ///
    /// Panics when another coroutine is already waiting.
    pub fn wait(&self, ctx: &Context) {
        let future = {
            let mut state = lock(&self.state);
            if state.count <= 0 {
                return;
            }
            if state.waiting {
                drop(state);
                panic!("WaitGroup is reused before previous Wait has returned");
            }
            state.waiting = true;
            state.future.clone()
        };
        let _ = future.get(ctx);
        let mut state = lock(&self.state);
        let (future, settable) = new_future();
        state.future = future;
        state.settable = settable;
        state.waiting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::Dispatcher;
    use std::time::Duration;

    #[test]
    fn test_wait_blocks_until_counter_reaches_zero() {
        let d = Dispatcher::new(Duration::from_secs(1));
        let wg = WaitGroup::new();
        wg.add(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let (waiter, waiter_log) = (wg.clone(), Arc::clone(&log));
        d.new_coroutine("waiter", move |ctx| {
            waiter.wait(&ctx);
            lock(&waiter_log).push("waited");
        });
        for name in ["a", "b"] {
            let (worker, worker_log) = (wg.clone(), Arc::clone(&log));
            d.new_coroutine(name, move |_| {
                lock(&worker_log).push(name);
                worker.done();
            });
        }

        d.execute_until_all_blocked().unwrap();
        assert_eq!(*lock(&log), vec!["a", "b", "waited"]);
        assert_eq!(wg.count(), 0);
        assert!(d.is_done());
    }

    #[test]
    fn test_add_and_done() {
        let wg = WaitGroup::new();
        wg.add(2);
        wg.done();
        assert_eq!(wg.count(), 1);
        wg.done();
        assert_eq!(wg.count(), 0);
    }

    #[test]
    #[should_panic(expected = "negative WaitGroup counter")]
    fn test_negative_counter_panics() {
        let wg = WaitGroup::new();
        wg.done();
    }
}
