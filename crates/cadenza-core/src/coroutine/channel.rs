// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic blocking channel for coroutine code.
//!
//! A channel has a fixed capacity buffer plus FIFO queues of blocked senders
//! and receivers. Values handed directly between a blocked peer and the
//! other side never occupy buffer space. Blocking calls park the calling
//! coroutine through its [`Context`] instead of blocking the OS thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tracing::error;

use super::{Context, lock};
use crate::payload::Payload;

/// Callback of a blocked receive. Takes the value out of the slot when it
/// accepts it; the flag is `false` once the channel is closed.
pub(crate) type ReceiveFn<T> = Box<dyn FnMut(&mut Option<T>, bool) -> bool + Send>;

/// Callback of a blocked send. Returns `true` when the send is still wanted.
pub(crate) type AcceptFn = Box<dyn FnMut() -> bool + Send>;

struct BlockedReceive<T> {
    id: u64,
    callback: ReceiveFn<T>,
}

struct BlockedSend<T> {
    id: u64,
    value: Option<T>,
    accept: AcceptFn,
}

struct ChannelState<T> {
    buffer: VecDeque<T>,
    blocked_sends: VecDeque<BlockedSend<T>>,
    blocked_receives: VecDeque<BlockedReceive<T>>,
    closed: bool,
    next_id: u64,
}

pub(crate) struct ChannelShared<T> {
    name: String,
    capacity: usize,
    state: Mutex<ChannelState<T>>,
    prefetched: Mutex<Option<T>>,
    corrupted: AtomicU64,
}

impl<T> ChannelShared<T> {
    pub(crate) fn push_back_prefetched(&self, value: T) {
        *lock(&self.prefetched) = Some(value);
    }
}

/// Outcome of a non-blocking receive attempt.
pub(crate) enum Receipt<T> {
    Value(T),
    Closed,
    Pending(Option<u64>),
}

/// Outcome of a non-blocking send attempt.
pub(crate) enum Delivery {
    Delivered,
    Pending(Option<u64>),
}

/// A named channel with a fixed buffer capacity.
pub struct Channel<T> {
    shared: Arc<ChannelShared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Create a channel. Capacity zero makes every send a rendezvous.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                name: name.into(),
                capacity,
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::new(),
                    blocked_sends: VecDeque::new(),
                    blocked_receives: VecDeque::new(),
                    closed: false,
                    next_id: 0,
                }),
                prefetched: Mutex::new(None),
                corrupted: AtomicU64::new(0),
            }),
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Buffer capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Receive a value, parking the coroutine until one arrives.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn receive(&self, ctx: &Context) -> Option<T> {
        let slot: Arc<Mutex<Option<Option<T>>>> = Arc::new(Mutex::new(None));
        let delivered = Arc::clone(&slot);
        let callback: ReceiveFn<T> = Box::new(move |value, _more| {
            *lock(&delivered) = Some(value.take());
            true
        });
        match self.receive_async_impl(Some(callback)) {
            Receipt::Value(value) => {
                ctx.unblocked();
                return Some(value);
            }
            Receipt::Closed => return None,
            Receipt::Pending(_) => {}
        }
        let status = format!("blocked on {}.receive", self.shared.name);
        loop {
            if let Some(result) = lock(&slot).take() {
                ctx.unblocked();
                return result;
            }
            ctx.yield_now(&status);
        }
    }

    /// Receive a value if one is available without blocking.
    pub fn receive_async(&self) -> Option<T> {
        self.receive_async_with_more().0
    }

    /// Receive without blocking; the flag is `false` once the channel is
    /// closed and drained.
    pub fn receive_async_with_more(&self) -> (Option<T>, bool) {
        match self.receive_async_impl(None) {
            Receipt::Value(value) => (Some(value), true),
            Receipt::Closed => (None, false),
            Receipt::Pending(_) => (None, true),
        }
    }

    /// Send a value, parking the coroutine until it is accepted.
    ///
    /// # Panics
    ///
    /// Panics when the channel is closed.
    pub fn send(&self, ctx: &Context, value: T) {
        let consumed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&consumed);
        let accept: AcceptFn = Box::new(move || {
            flag.store(true, Ordering::SeqCst);
            true
        });
        if let Delivery::Delivered = self.send_async_impl(value, Some(accept)) {
            ctx.unblocked();
            return;
        }
        let status = format!("blocked on {}.send", self.shared.name);
        loop {
            if consumed.load(Ordering::SeqCst) {
                ctx.unblocked();
                return;
            }
            if lock(&self.shared.state).closed {
                panic!("send on closed channel {}", self.shared.name);
            }
            ctx.yield_now(&status);
        }
    }

    /// Send without blocking. Returns `false` when the value was not
    /// accepted.
    ///
    /// # Panics
    ///
    /// Panics when the channel is closed.
    pub fn send_async(&self, value: T) -> bool {
        matches!(self.send_async_impl(value, None), Delivery::Delivered)
    }

    /// Close the channel and wake every blocked receiver with "no more
    /// values". Blocked senders fail on their next attempt.
    pub fn close(&self) {
        let receivers = {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            std::mem::take(&mut state.blocked_receives)
        };
        for mut receiver in receivers {
            let mut none = None;
            (receiver.callback)(&mut none, false);
        }
    }

    /// Whether the channel was closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Whether a send would complete immediately.
    pub fn can_send_without_blocking(&self) -> bool {
        let state = lock(&self.shared.state);
        state.buffer.len() < self.shared.capacity || !state.blocked_receives.is_empty()
    }

    /// Whether a receive would complete immediately.
    pub fn can_receive_without_blocking(&self) -> bool {
        if lock(&self.shared.prefetched).is_some() {
            return true;
        }
        let state = lock(&self.shared.state);
        !state.buffer.is_empty() || !state.blocked_sends.is_empty() || state.closed
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values dropped because they could not be decoded.
    pub fn corrupted_count(&self) -> u64 {
        self.shared.corrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared<T>> {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn blocked_receive_count(&self) -> usize {
        lock(&self.shared.state).blocked_receives.len()
    }

    #[cfg(test)]
    pub(crate) fn blocked_send_count(&self) -> usize {
        lock(&self.shared.state).blocked_sends.len()
    }

    pub(crate) fn receive_async_impl(&self, callback: Option<ReceiveFn<T>>) -> Receipt<T> {
        if let Some(value) = lock(&self.shared.prefetched).take() {
            return Receipt::Value(value);
        }
        let mut state = lock(&self.shared.state);
        if let Some(value) = state.buffer.pop_front() {
            // Slide the first willing blocked sender into the freed slot.
            while let Some(mut blocked) = state.blocked_sends.pop_front() {
                if (blocked.accept)() {
                    if let Some(pending) = blocked.value.take() {
                        state.buffer.push_back(pending);
                    }
                    break;
                }
            }
            return Receipt::Value(value);
        }
        if state.closed {
            return Receipt::Closed;
        }
        while let Some(mut blocked) = state.blocked_sends.pop_front() {
            if (blocked.accept)()
                && let Some(value) = blocked.value.take()
            {
                return Receipt::Value(value);
            }
        }
        match callback {
            Some(callback) => {
                state.next_id += 1;
                let id = state.next_id;
                state
                    .blocked_receives
                    .push_back(BlockedReceive { id, callback });
                Receipt::Pending(Some(id))
            }
            None => Receipt::Pending(None),
        }
    }

    pub(crate) fn send_async_impl(&self, value: T, accept: Option<AcceptFn>) -> Delivery {
        let mut state = lock(&self.shared.state);
        if state.closed {
            drop(state);
            panic!("send on closed channel {}", self.shared.name);
        }
        let mut value = Some(value);
        while let Some(mut blocked) = state.blocked_receives.pop_front() {
            if (blocked.callback)(&mut value, true) {
                return Delivery::Delivered;
            }
        }
        let Some(value) = value else {
            return Delivery::Delivered;
        };
        if state.buffer.len() < self.shared.capacity {
            state.buffer.push_back(value);
            return Delivery::Delivered;
        }
        match accept {
            Some(accept) => {
                state.next_id += 1;
                let id = state.next_id;
                state.blocked_sends.push_back(BlockedSend {
                    id,
                    value: Some(value),
                    accept,
                });
                Delivery::Pending(Some(id))
            }
            None => Delivery::Pending(None),
        }
    }

    pub(crate) fn remove_receive_callback(&self, id: u64) {
        lock(&self.shared.state)
            .blocked_receives
            .retain(|blocked| blocked.id != id);
    }

    pub(crate) fn remove_send_callback(&self, id: u64) {
        lock(&self.shared.state)
            .blocked_sends
            .retain(|blocked| blocked.id != id);
    }
}

impl Channel<Payload> {
    /// Receive and decode a value, parking until one decodes.
    ///
    /// Values that fail to decode are logged, counted and skipped.
    pub fn receive_as<V: DeserializeOwned>(&self, ctx: &Context) -> Option<V> {
        loop {
            let payload = self.receive(ctx)?;
            if let Some(value) = self.decode(&payload) {
                return Some(value);
            }
        }
    }

    /// Receive and decode a value without blocking, skipping corrupt values.
    pub fn receive_async_as<V: DeserializeOwned>(&self) -> Option<V> {
        loop {
            let payload = self.receive_async()?;
            if let Some(value) = self.decode(&payload) {
                return Some(value);
            }
        }
    }

    fn decode<V: DeserializeOwned>(&self, payload: &Payload) -> Option<V> {
        match payload.decode() {
            Ok(value) => Some(value),
            Err(e) => {
                let dropped = self.shared.corrupted.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    channel = %self.shared.name,
                    error = %e,
                    dropped,
                    "Dropping corrupt value received on channel"
                );
                None
            }
        }
    }
}
