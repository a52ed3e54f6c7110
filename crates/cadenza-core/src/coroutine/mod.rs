// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic cooperative scheduler.
//!
//! Every coroutine runs on its own OS thread, but only one of them runs at a
//! time. The [`Dispatcher`] hands a resume token to each live coroutine in
//! creation order and waits for it to report that it is about to block
//! again. Because activation follows creation order and coroutines are only
//! created by already running coroutines, the same inputs always produce the
//! same interleaving.
//!
//! ```text
//!   Dispatcher                         coroutine thread
//!   ----------                         ----------------
//!   unblock.send(resume) ───────────▶ recv() returns, runs until it blocks
//!   about_to_block.recv_timeout ◀──── send(()) then recv() again
//! ```
//!
//! The blocking primitives built on top of this live in the submodules:
//! [`Channel`], [`Future`]/[`Settable`], [`Selector`] and [`WaitGroup`].

pub mod channel;
pub mod future;
pub(crate) mod panic;
pub mod selector;
pub mod wait_group;

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::{Result, TaskError};

pub use channel::Channel;
pub use future::{Future, Settable, new_future};
pub use selector::Selector;
pub use wait_group::WaitGroup;

use self::panic::CoroutineExit;

/// Lock a mutex, ignoring poisoning.
///
/// Coroutine faults unwind through user code and are reported separately, so
/// a poisoned lock carries no additional information.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work handed to a parked coroutine: called with its name and status.
/// Returns `true` when the coroutine should stay parked afterwards.
type UnblockFn = Box<dyn FnOnce(&str, &str) -> bool + Send>;

struct CoroutineShared {
    name: String,
    closed: AtomicBool,
    kept_blocked: AtomicBool,
    blocked: AtomicBool,
    failure: Mutex<Option<TaskError>>,
}

impl CoroutineShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Coroutine side of the handoff.
struct CoroutineLink {
    shared: Arc<CoroutineShared>,
    unblock: Mutex<Receiver<UnblockFn>>,
    about_to_block: SyncSender<()>,
}

/// Dispatcher side of the handoff.
struct CoroutineHandle {
    shared: Arc<CoroutineShared>,
    unblock: SyncSender<UnblockFn>,
    about_to_block: Mutex<Receiver<()>>,
}

impl CoroutineHandle {
    /// Resume the coroutine and wait until it blocks again.
    fn call(&self, timeout: Duration) -> Result<()> {
        let resume: UnblockFn = Box::new(|_, _| false);
        if self.unblock.send(resume).is_err() {
            self.shared.closed.store(true, Ordering::SeqCst);
            return Ok(());
        }
        match lock(&self.about_to_block).recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.closed.store(true, Ordering::SeqCst);
                error!(
                    coroutine = %self.shared.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Coroutine did not yield in time, potential deadlock"
                );
                Err(TaskError::Deadlock {
                    coroutine: self.shared.name.clone(),
                    timeout,
                })
            }
        }
    }

    fn exit(&self) {
        let exit: UnblockFn = Box::new(|_, _| std::panic::resume_unwind(Box::new(CoroutineExit)));
        let _ = self.unblock.send(exit);
    }
}

impl CoroutineLink {
    /// Park until the dispatcher hands over the next piece of work.
    fn initial_yield(&self, status: &str) {
        loop {
            let next = lock(&self.unblock).recv();
            let Ok(work) = next else {
                std::panic::resume_unwind(Box::new(CoroutineExit));
            };
            if !work(&self.shared.name, status) {
                return;
            }
            // Diagnostic work keeps the coroutine parked; report back as blocked.
            let _ = self.about_to_block.send(());
        }
    }

    fn yield_now(&self, status: &str) {
        if self.shared.blocked.load(Ordering::SeqCst) {
            panic!("trying to block on coroutine {} which is already blocked, most likely a wrong context is used", self.shared.name);
        }
        self.shared.blocked.store(true, Ordering::SeqCst);
        let _ = self.about_to_block.send(());
        self.initial_yield(status);
        self.shared.kept_blocked.store(true, Ordering::SeqCst);
        self.shared.blocked.store(false, Ordering::SeqCst);
    }
}

struct DispatcherState {
    coroutines: Vec<Arc<CoroutineHandle>>,
    sequence: u64,
    executing: bool,
    closed: bool,
}

struct DispatcherCore {
    state: Mutex<DispatcherState>,
    deadlock_timeout: Duration,
}

impl DispatcherCore {
    fn new_coroutine<F>(core: &Arc<Self>, name: String, body: F) -> Context
    where
        F: FnOnce(Context) + Send + 'static,
    {
        panic::install_hook();

        let (unblock_tx, unblock_rx) = mpsc::sync_channel::<UnblockFn>(0);
        let (block_tx, block_rx) = mpsc::sync_channel::<()>(1);
        let shared = Arc::new(CoroutineShared {
            name,
            closed: AtomicBool::new(false),
            kept_blocked: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        {
            let mut state = lock(&core.state);
            state.sequence += 1;
            state.coroutines.push(Arc::new(CoroutineHandle {
                shared: Arc::clone(&shared),
                unblock: unblock_tx,
                about_to_block: Mutex::new(block_rx),
            }));
        }

        let context = Context {
            link: Arc::new(CoroutineLink {
                shared: Arc::clone(&shared),
                unblock: Mutex::new(unblock_rx),
                about_to_block: block_tx,
            }),
            dispatcher: Arc::downgrade(core),
        };

        let spawned = context.clone();
        let started = thread::Builder::new()
            .name(format!("coroutine-{}", shared.name))
            .spawn(move || run_coroutine(spawned, body));
        if let Err(e) = started {
            error!(coroutine = %shared.name, error = %e, "Failed to start coroutine thread");
            *lock(&shared.failure) = Some(TaskError::Internal(format!(
                "failed to start coroutine {}: {e}",
                shared.name
            )));
            shared.closed.store(true, Ordering::SeqCst);
        }
        context
    }
}

fn run_coroutine<F>(context: Context, body: F)
where
    F: FnOnce(Context) + Send + 'static,
{
    panic::mark_coroutine_thread();
    let link = Arc::clone(&context.link);
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
        context.link.initial_yield("created");
        body(context);
    }));
    if let Err(payload) = outcome
        && let Some(failure) = panic::failure_from_payload(&link.shared.name, payload)
    {
        error!(coroutine = %link.shared.name, error = %failure, "Coroutine failed");
        *lock(&link.shared.failure) = Some(failure);
    }
    link.shared.closed.store(true, Ordering::SeqCst);
    let _ = link.about_to_block.try_send(());
}

/// Deterministic scheduler owning a set of coroutines.
///
/// One dispatcher exists per workflow execution. Dropping it closes it.
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
}

impl Dispatcher {
    /// Create a dispatcher with the given per-activation deadlock timeout.
    pub fn new(deadlock_timeout: Duration) -> Self {
        Self {
            core: Arc::new(DispatcherCore {
                state: Mutex::new(DispatcherState {
                    coroutines: Vec::new(),
                    sequence: 0,
                    executing: false,
                    closed: false,
                }),
                deadlock_timeout,
            }),
        }
    }

    /// Register a new coroutine. It stays parked until the next
    /// [`execute_until_all_blocked`](Self::execute_until_all_blocked).
    pub fn new_coroutine<F>(&self, name: impl Into<String>, body: F) -> Context
    where
        F: FnOnce(Context) + Send + 'static,
    {
        DispatcherCore::new_coroutine(&self.core, name.into(), body)
    }

    /// Run every coroutine until all of them are blocked without progress
    /// or finished.
    ///
    /// Returns the first coroutine failure, or a deadlock error when a
    /// coroutine does not yield within the deadlock timeout.
    pub fn execute_until_all_blocked(&self) -> Result<()> {
        {
            let mut state = lock(&self.core.state);
            if state.closed {
                return Err(TaskError::Internal("dispatcher is closed".to_string()));
            }
            if state.executing {
                return Err(TaskError::Internal(
                    "execute_until_all_blocked called while already executing".to_string(),
                ));
            }
            state.executing = true;
        }
        let result = self.sweep();
        lock(&self.core.state).executing = false;
        result
    }

    fn sweep(&self) -> Result<()> {
        let mut all_blocked = false;
        while !all_blocked {
            all_blocked = true;
            let last_sequence = lock(&self.core.state).sequence;
            let mut index = 0;
            loop {
                let handle = match lock(&self.core.state).coroutines.get(index) {
                    Some(handle) => Arc::clone(handle),
                    None => break,
                };
                if !handle.shared.is_closed() {
                    handle.call(self.core.deadlock_timeout)?;
                }
                if handle.shared.is_closed() {
                    lock(&self.core.state).coroutines.remove(index);
                    if let Some(failure) = lock(&handle.shared.failure).take() {
                        return Err(failure);
                    }
                    all_blocked = false;
                } else {
                    all_blocked =
                        all_blocked && handle.shared.kept_blocked.load(Ordering::SeqCst);
                    index += 1;
                }
            }
            let state = lock(&self.core.state);
            all_blocked = all_blocked && last_sequence == state.sequence;
            if state.coroutines.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Whether every coroutine has finished.
    pub fn is_done(&self) -> bool {
        lock(&self.core.state).coroutines.is_empty()
    }

    /// Number of live coroutines.
    pub fn coroutine_count(&self) -> usize {
        lock(&self.core.state).coroutines.len()
    }

    /// Force every live coroutine to exit. Idempotent.
    pub fn close(&self) {
        let handles = {
            let mut state = lock(&self.core.state);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.coroutines)
        };
        debug!(coroutines = handles.len(), "Closing dispatcher");
        for handle in handles {
            if !handle.shared.is_closed() {
                handle.exit();
            }
        }
    }

    /// Report where each live coroutine is parked.
    pub fn stack_trace(&self) -> String {
        let handles = lock(&self.core.state).coroutines.clone();
        let mut traces = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.shared.is_closed() {
                continue;
            }
            let (trace_tx, trace_rx) = mpsc::sync_channel::<String>(1);
            let work: UnblockFn = Box::new(move |name, status| {
                let trace = format!(
                    "coroutine {name} [{status}]:\n{}",
                    Backtrace::force_capture()
                );
                let _ = trace_tx.send(trace);
                true
            });
            if handle.unblock.send(work).is_err() {
                continue;
            }
            let _ = lock(&handle.about_to_block).recv_timeout(self.core.deadlock_timeout);
            if let Ok(trace) = trace_rx.recv_timeout(self.core.deadlock_timeout) {
                traces.push(trace);
            }
        }
        traces.join("\n\n")
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle given to code running inside a coroutine.
///
/// Blocking primitives take a `&Context` to know which coroutine to park.
#[derive(Clone)]
pub struct Context {
    link: Arc<CoroutineLink>,
    dispatcher: Weak<DispatcherCore>,
}

impl Context {
    /// Name of the coroutine this context belongs to.
    pub fn name(&self) -> &str {
        &self.link.shared.name
    }

    /// Start a sibling coroutine on the same dispatcher.
    ///
    /// # Panics
    ///
    /// Panics when the owning dispatcher is gone; inside a coroutine this is
    /// reported as a coroutine fault.
    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> Context
    where
        F: FnOnce(Context) + Send + 'static,
    {
        let Some(core) = self.dispatcher.upgrade() else {
            panic!("dispatcher of coroutine {} is gone", self.name());
        };
        DispatcherCore::new_coroutine(&core, name.into(), body)
    }

    /// Park the calling coroutine until the next activation.
    pub(crate) fn yield_now(&self, status: &str) {
        self.link.yield_now(status);
    }

    /// Record that the coroutine made progress since its last activation.
    pub(crate) fn unblocked(&self) {
        self.link.shared.kept_blocked.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Duration::from_secs(1))
    }

    #[test]
    fn test_runs_to_completion() {
        let d = dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        d.new_coroutine("root", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        d.execute_until_all_blocked().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(d.is_done());
    }

    #[test]
    fn test_spawned_coroutines_run_in_same_pass() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let root_log = Arc::clone(&log);
        d.new_coroutine("root", move |ctx| {
            lock(&root_log).push("root");
            let child_log = Arc::clone(&root_log);
            ctx.spawn("child", move |_| lock(&child_log).push("child"));
        });
        d.execute_until_all_blocked().unwrap();
        assert_eq!(*lock(&log), vec!["root", "child"]);
        assert!(d.is_done());
    }

    #[test]
    fn test_unbuffered_rendezvous_in_one_sweep() {
        let d = dispatcher();
        let ch: Channel<u32> = Channel::new("rendezvous", 0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let (sender, sender_log) = (ch.clone(), Arc::clone(&log));
        d.new_coroutine("x", move |ctx| {
            sender.send(&ctx, 7);
            lock(&sender_log).push("x sent".to_string());
        });
        let receiver_log = Arc::clone(&log);
        d.new_coroutine("y", move |ctx| {
            let value = ch.receive(&ctx);
            lock(&receiver_log).push(format!("y got {value:?}"));
        });

        d.execute_until_all_blocked().unwrap();
        assert_eq!(*lock(&log), vec!["y got Some(7)", "x sent"]);
        assert!(d.is_done());
    }

    #[test]
    fn test_activation_follows_creation_order() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channels = Vec::new();
        for name in ["a", "b", "c"] {
            let ch: Channel<u32> = Channel::new(name, 0);
            channels.push(ch.clone());
            let log = Arc::clone(&log);
            d.new_coroutine(name, move |ctx| {
                while ch.receive(&ctx).is_some() {
                    lock(&log).push(name);
                }
            });
        }

        d.execute_until_all_blocked().unwrap();
        for ch in channels.iter().rev() {
            assert!(ch.send_async(1));
        }
        d.execute_until_all_blocked().unwrap();
        assert_eq!(*lock(&log), vec!["a", "b", "c"]);

        for ch in &channels {
            ch.close();
        }
        d.execute_until_all_blocked().unwrap();
        assert!(d.is_done());
    }

    #[test]
    fn test_blocking_coroutine_is_a_deadlock() {
        let d = Dispatcher::new(Duration::from_millis(20));
        d.new_coroutine("sleeper", |_| thread::sleep(Duration::from_millis(200)));
        match d.execute_until_all_blocked() {
            Err(TaskError::Deadlock { coroutine, .. }) => assert_eq!(coroutine, "sleeper"),
            other => panic!("expected a deadlock, got {other:?}"),
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let d = dispatcher();
        d.new_coroutine("faulty", |_| panic!("boom"));
        let err = d.execute_until_all_blocked().unwrap_err();
        match err {
            TaskError::Panic {
                coroutine, message, ..
            } => {
                assert_eq!(coroutine, "faulty");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_close_releases_parked_coroutines() {
        struct ExitGuard(mpsc::Sender<&'static str>, &'static str);
        impl Drop for ExitGuard {
            fn drop(&mut self) {
                let _ = self.0.send(self.1);
            }
        }

        let d = dispatcher();
        let (exit_tx, exit_rx) = mpsc::channel();
        for name in ["first", "second"] {
            let ch: Channel<u32> = Channel::new(name, 0);
            let guard = ExitGuard(exit_tx.clone(), name);
            d.new_coroutine(name, move |ctx| {
                let _guard = guard;
                ch.receive(&ctx);
                unreachable!("closed dispatcher resumed {name}");
            });
        }
        d.execute_until_all_blocked().unwrap();
        assert_eq!(d.coroutine_count(), 2);

        d.close();
        let mut exited = vec![
            exit_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            exit_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        ];
        exited.sort_unstable();
        assert_eq!(exited, vec!["first", "second"]);
        assert_eq!(d.coroutine_count(), 0);
        assert!(matches!(
            d.execute_until_all_blocked(),
            Err(TaskError::Internal(_))
        ));
    }

    #[test]
    fn test_closed_dispatcher_rejects_execution() {
        let d = dispatcher();
        d.close();
        d.close();
        assert!(matches!(
            d.execute_until_all_blocked(),
            Err(TaskError::Internal(_))
        ));
    }
}
