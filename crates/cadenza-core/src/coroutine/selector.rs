// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Select-style multiplexing over channels and futures.
//!
//! Cases are checked in declaration order. The first ready case runs
//! without parking. Otherwise every case registers a callback and the first
//! callback to fire wins; the rest are deregistered before `select`
//! returns, so long-lived channels do not accumulate stale callbacks.

use std::any::Any;
use std::sync::{Arc, Mutex};

use super::channel::{AcceptFn, Delivery, Receipt, ReceiveFn};
use super::{Channel, Context, Future, lock};

type Boxed = Box<dyn Any + Send>;

enum Slot {
    Open,
    Fired {
        index: usize,
        more: bool,
        value: Option<Boxed>,
    },
    Sealed,
}

type SlotRef = Arc<Mutex<Slot>>;

/// Mark the slot as consumed, returning a callback hit if one happened.
fn seal(slot: &SlotRef) -> Option<(usize, bool, Option<Boxed>)> {
    match std::mem::replace(&mut *lock(slot), Slot::Sealed) {
        Slot::Fired { index, more, value } => Some((index, more, value)),
        Slot::Open | Slot::Sealed => None,
    }
}

/// Record a callback hit unless another case already fired.
fn try_fire(slot: &SlotRef, index: usize, more: bool, value: Option<Boxed>) -> bool {
    let mut current = lock(slot);
    if !matches!(*current, Slot::Open) {
        return false;
    }
    *current = Slot::Fired { index, more, value };
    true
}

enum CasePoll {
    Ready { more: bool, value: Option<Boxed> },
    Registered(u64),
    Idle,
}

trait SelectCase {
    fn poll(&mut self, slot: &SlotRef, index: usize) -> CasePoll;
    fn cancel(&self, registration: u64);
    fn fire(&mut self, more: bool, value: Option<Boxed>);
    fn restore(&self, value: Boxed);
    fn is_ready(&self) -> bool;
}

struct ReceiveCase<'a, T> {
    channel: Channel<T>,
    callback: Box<dyn FnMut(Option<T>) + 'a>,
}

impl<T: Send + 'static> SelectCase for ReceiveCase<'_, T> {
    fn poll(&mut self, slot: &SlotRef, index: usize) -> CasePoll {
        let slot = Arc::clone(slot);
        let callback: ReceiveFn<T> = Box::new(move |value, more| {
            let boxed = value.take().map(|v| Box::new(v) as Boxed);
            try_fire(&slot, index, more, boxed)
        });
        match self.channel.receive_async_impl(Some(callback)) {
            Receipt::Value(value) => CasePoll::Ready {
                more: true,
                value: Some(Box::new(value)),
            },
            Receipt::Closed => CasePoll::Ready {
                more: false,
                value: None,
            },
            Receipt::Pending(Some(id)) => CasePoll::Registered(id),
            Receipt::Pending(None) => CasePoll::Idle,
        }
    }

    fn cancel(&self, registration: u64) {
        self.channel.remove_receive_callback(registration);
    }

    fn fire(&mut self, more: bool, value: Option<Boxed>) {
        let value = if more {
            value.and_then(|v| v.downcast::<T>().ok()).map(|v| *v)
        } else {
            None
        };
        (self.callback)(value);
    }

    fn restore(&self, value: Boxed) {
        if let Ok(value) = value.downcast::<T>() {
            self.channel.shared().push_back_prefetched(*value);
        }
    }

    fn is_ready(&self) -> bool {
        self.channel.can_receive_without_blocking()
    }
}

struct SendCase<'a, T> {
    channel: Channel<T>,
    value: T,
    callback: Box<dyn FnMut() + 'a>,
}

impl<T: Clone + Send + 'static> SelectCase for SendCase<'_, T> {
    fn poll(&mut self, slot: &SlotRef, index: usize) -> CasePoll {
        let slot = Arc::clone(slot);
        let accept: AcceptFn = Box::new(move || try_fire(&slot, index, true, None));
        match self.channel.send_async_impl(self.value.clone(), Some(accept)) {
            Delivery::Delivered => CasePoll::Ready {
                more: true,
                value: None,
            },
            Delivery::Pending(Some(id)) => CasePoll::Registered(id),
            Delivery::Pending(None) => CasePoll::Idle,
        }
    }

    fn cancel(&self, registration: u64) {
        self.channel.remove_send_callback(registration);
    }

    fn fire(&mut self, _more: bool, _value: Option<Boxed>) {
        (self.callback)();
    }

    fn restore(&self, _value: Boxed) {}

    fn is_ready(&self) -> bool {
        self.channel.can_send_without_blocking()
    }
}

struct FutureCase<'a, T> {
    future: Future<T>,
    callback: Box<dyn FnMut(&Future<T>) + 'a>,
}

impl<T: Clone + Send + 'static> SelectCase for FutureCase<'_, T> {
    fn poll(&mut self, slot: &SlotRef, index: usize) -> CasePoll {
        if self.future.is_ready() {
            return CasePoll::Ready {
                more: false,
                value: None,
            };
        }
        let slot = Arc::clone(slot);
        let callback: ReceiveFn<()> =
            Box::new(move |_value, more| try_fire(&slot, index, more, None));
        match self.future.channel().receive_async_impl(Some(callback)) {
            Receipt::Value(()) | Receipt::Closed => CasePoll::Ready {
                more: false,
                value: None,
            },
            Receipt::Pending(Some(id)) => CasePoll::Registered(id),
            Receipt::Pending(None) => CasePoll::Idle,
        }
    }

    fn cancel(&self, registration: u64) {
        self.future.channel().remove_receive_callback(registration);
    }

    fn fire(&mut self, _more: bool, _value: Option<Boxed>) {
        (self.callback)(&self.future);
    }

    fn restore(&self, _value: Boxed) {}

    fn is_ready(&self) -> bool {
        self.future.is_ready()
    }
}

/// Waits on several channels and futures at once.
///
/// Case callbacks may borrow from the enclosing scope; they run on the
/// selecting coroutine.
pub struct Selector<'a> {
    name: String,
    cases: Vec<Box<dyn SelectCase + 'a>>,
    default: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a> Selector<'a> {
    /// Create an empty selector.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cases: Vec::new(),
            default: None,
        }
    }

    /// Add a receive case. The callback gets `None` once the channel is
    /// closed.
    pub fn add_receive<T, F>(&mut self, channel: &Channel<T>, callback: F) -> &mut Self
    where
        T: Send + 'static,
        F: FnMut(Option<T>) + 'a,
    {
        self.cases.push(Box::new(ReceiveCase {
            channel: channel.clone(),
            callback: Box::new(callback),
        }));
        self
    }

    /// Add a send case.
    pub fn add_send<T, F>(&mut self, channel: &Channel<T>, value: T, callback: F) -> &mut Self
    where
        T: Clone + Send + 'static,
        F: FnMut() + 'a,
    {
        self.cases.push(Box::new(SendCase {
            channel: channel.clone(),
            value,
            callback: Box::new(callback),
        }));
        self
    }

    /// Add a case that fires once the future is resolved.
    pub fn add_future<T, F>(&mut self, future: &Future<T>, callback: F) -> &mut Self
    where
        T: Clone + Send + 'static,
        F: FnMut(&Future<T>) + 'a,
    {
        self.cases.push(Box::new(FutureCase {
            future: future.clone(),
            callback: Box::new(callback),
        }));
        self
    }

    /// Add a case that runs when no other case is immediately ready.
    pub fn add_default<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut() + 'a,
    {
        self.default = Some(Box::new(callback));
        self
    }

    /// Whether any case is ready right now. Has no side effects.
    pub fn has_pending(&self) -> bool {
        self.cases.iter().any(|case| case.is_ready())
    }

    /// Run exactly one ready case, parking until one becomes ready.
    pub fn select(&mut self, ctx: &Context) {
        let slot: SlotRef = Arc::new(Mutex::new(Slot::Open));
        let mut registrations: Vec<(usize, u64)> = Vec::new();
        let mut immediate = None;
        for (index, case) in self.cases.iter_mut().enumerate() {
            match case.poll(&slot, index) {
                CasePoll::Ready { more, value } => {
                    immediate = Some((index, more, value));
                    break;
                }
                CasePoll::Registered(id) => registrations.push((index, id)),
                CasePoll::Idle => {}
            }
        }

        if let Some((index, more, value)) = immediate {
            self.abandon(&slot, &registrations);
            ctx.unblocked();
            self.cases[index].fire(more, value);
            return;
        }

        let fired_early = matches!(*lock(&slot), Slot::Fired { .. });
        if !fired_early && self.default.is_some() {
            self.abandon(&slot, &registrations);
            if let Some(default) = self.default.as_mut() {
                default();
            }
            return;
        }

        let status = format!("blocked on {}.select", self.name);
        loop {
            if matches!(*lock(&slot), Slot::Fired { .. }) {
                if let Some((index, more, value)) = seal(&slot) {
                    self.deregister(&registrations);
                    ctx.unblocked();
                    self.cases[index].fire(more, value);
                }
                return;
            }
            ctx.yield_now(&status);
        }
    }

    /// Seal the slot for a branch chosen without callbacks, handing any
    /// value a callback already took back to its channel.
    fn abandon(&self, slot: &SlotRef, registrations: &[(usize, u64)]) {
        let stray = seal(slot);
        self.deregister(registrations);
        if let Some((index, _, Some(value))) = stray {
            self.cases[index].restore(value);
        }
    }

    fn deregister(&self, registrations: &[(usize, u64)]) {
        for (index, id) in registrations {
            self.cases[*index].cancel(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::Dispatcher;
    use std::cell::RefCell;
    use std::time::Duration;

    #[test]
    fn test_ready_case_wins_without_registering_later_cases() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let a: Channel<u32> = Channel::new("a", 1);
        let b: Channel<u32> = Channel::new("b", 1);
        assert!(a.send_async(1));

        let picked = Arc::new(Mutex::new(None));
        let (ca, cb, out) = (a.clone(), b.clone(), Arc::clone(&picked));
        dispatcher.new_coroutine("root", move |ctx| {
            let choice = RefCell::new(None);
            let mut selector = Selector::new("pick");
            selector
                .add_receive(&ca, |v| *choice.borrow_mut() = Some(("a", v)))
                .add_receive(&cb, |v| *choice.borrow_mut() = Some(("b", v)));
            selector.select(&ctx);
            drop(selector);
            *lock(&out) = choice.into_inner();
        });
        dispatcher.execute_until_all_blocked().unwrap();

        assert_eq!(*lock(&picked), Some(("a", Some(1))));
        assert_eq!(b.blocked_receive_count(), 0);
        assert!(dispatcher.is_done());
    }

    #[test]
    fn test_callbacks_are_deregistered_after_blocking_select() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let a: Channel<u32> = Channel::new("a", 0);
        let b: Channel<u32> = Channel::new("b", 0);
        let picked = Arc::new(Mutex::new(None));
        let (ca, cb, out) = (a.clone(), b.clone(), Arc::clone(&picked));
        dispatcher.new_coroutine("root", move |ctx| {
            let choice = RefCell::new(None);
            let mut selector = Selector::new("wait");
            selector
                .add_receive(&ca, |v| *choice.borrow_mut() = Some(("a", v)))
                .add_receive(&cb, |v| *choice.borrow_mut() = Some(("b", v)));
            selector.select(&ctx);
            drop(selector);
            *lock(&out) = choice.into_inner();
        });
        dispatcher.execute_until_all_blocked().unwrap();
        assert_eq!(a.blocked_receive_count(), 1);
        assert_eq!(b.blocked_receive_count(), 1);

        assert!(b.send_async(7));
        dispatcher.execute_until_all_blocked().unwrap();
        assert_eq!(*lock(&picked), Some(("b", Some(7))));
        assert_eq!(a.blocked_receive_count(), 0);
        assert_eq!(b.blocked_receive_count(), 0);
    }

    #[test]
    fn test_default_runs_when_nothing_is_ready() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let a: Channel<u32> = Channel::new("a", 0);
        let ran_default = Arc::new(Mutex::new(false));
        let (ca, out) = (a.clone(), Arc::clone(&ran_default));
        dispatcher.new_coroutine("root", move |ctx| {
            let mut hit = false;
            let mut selector = Selector::new("poll");
            selector.add_receive(&ca, |_| {}).add_default(|| hit = true);
            assert!(!selector.has_pending());
            selector.select(&ctx);
            drop(selector);
            *lock(&out) = hit;
        });
        dispatcher.execute_until_all_blocked().unwrap();
        assert!(*lock(&ran_default));
        assert_eq!(a.blocked_receive_count(), 0);
    }

    #[test]
    fn test_value_taken_by_losing_case_is_restored() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let a: Channel<u32> = Channel::new("a", 0);
        let picked = Arc::new(Mutex::new(Vec::new()));
        let (ca, out) = (a.clone(), Arc::clone(&picked));
        dispatcher.new_coroutine("root", move |ctx| {
            let order = RefCell::new(Vec::new());
            {
                let mut selector = Selector::new("loopback");
                selector
                    .add_receive(&ca, |v| order.borrow_mut().push(format!("recv {v:?}")))
                    .add_send(&ca, 3, || order.borrow_mut().push("sent".to_string()));
                selector.select(&ctx);
            }
            let mut order = order.into_inner();
            order.push(format!("after {:?}", ca.receive_async()));
            *lock(&out) = order;
        });
        dispatcher.execute_until_all_blocked().unwrap();
        assert_eq!(
            *lock(&picked),
            vec!["sent".to_string(), "after Some(3)".to_string()]
        );
    }
}
