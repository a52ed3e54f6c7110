// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capture of faults raised inside coroutine threads.
//!
//! A process-wide panic hook records a backtrace for panics on coroutine
//! threads and keeps them off stderr; panics elsewhere go to the previously
//! installed hook. The coroutine runner turns the unwound payload into a
//! [`TaskError`].

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic;
use std::sync::Once;

use crate::error::{NondeterminismError, NondeterminismKind, TaskError};

/// Unwind payload used to force a parked coroutine to exit.
pub(crate) struct CoroutineExit;

/// Unwind payload raised when workflow code requests replay state that the
/// history does not contain.
pub(crate) struct IllegalState(pub(crate) String);

thread_local! {
    static IN_COROUTINE: Cell<bool> = const { Cell::new(false) };
    static LAST_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

pub(crate) fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_COROUTINE.with(Cell::get) {
                if info.payload().is::<CoroutineExit>() {
                    return;
                }
                let stack = Backtrace::force_capture().to_string();
                LAST_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            } else {
                previous(info);
            }
        }));
    });
}

pub(crate) fn mark_coroutine_thread() {
    IN_COROUTINE.with(|flag| flag.set(true));
}

fn take_stack() -> String {
    LAST_STACK
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default()
}

pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Abort the current coroutine with a nondeterminism failure.
pub(crate) fn illegal_state(message: String) -> ! {
    panic::panic_any(IllegalState(message))
}

/// Convert an unwound coroutine payload into a task error.
///
/// Returns `None` for a forced exit, which is not a failure.
pub(crate) fn failure_from_payload(
    coroutine: &str,
    payload: Box<dyn Any + Send>,
) -> Option<TaskError> {
    if payload.is::<CoroutineExit>() {
        return None;
    }
    let stack = take_stack();
    match payload.downcast::<IllegalState>() {
        Ok(state) => Some(
            NondeterminismError::new(NondeterminismKind::IllegalState, state.0).into(),
        ),
        Err(payload) => Some(TaskError::Panic {
            coroutine: coroutine.to_string(),
            message: payload_message(payload.as_ref()),
            stack,
        }),
    }
}
