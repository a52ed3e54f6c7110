// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! LRU cache of execution contexts keyed by run id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use super::ExecutionContext;
use crate::coroutine::lock;
use crate::task::ResetStickiness;

struct CacheInner {
    entries: HashMap<String, (ExecutionContext, u64)>,
    /// Run ids by last use.
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl CacheInner {
    fn touch(&mut self, run_id: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, used)) = self.entries.get_mut(run_id) {
            self.order.remove(used);
            *used = tick;
            self.order.insert(tick, run_id.to_string());
        }
    }

    fn remove(&mut self, run_id: &str) -> Option<ExecutionContext> {
        let (context, used) = self.entries.remove(run_id)?;
        self.order.remove(&used);
        Some(context)
    }
}

/// Sticky execution cache. A capacity of zero disables caching.
///
/// Evicted contexts are cleared once their current task releases them.
pub(crate) struct StickyCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    notifier: Option<mpsc::UnboundedSender<ResetStickiness>>,
}

impl StickyCache {
    pub(crate) fn new(capacity: usize, notifier: Option<mpsc::UnboundedSender<ResetStickiness>>) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            notifier,
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.capacity == 0
    }

    pub(crate) fn get(&self, run_id: &str) -> Option<ExecutionContext> {
        let mut inner = lock(&self.inner);
        let context = inner.entries.get(run_id).map(|(context, _)| context.clone())?;
        inner.touch(run_id);
        Some(context)
    }

    /// Insert a context, evicting the least recently used one when full.
    pub(crate) fn put(&self, context: ExecutionContext) {
        if self.is_disabled() {
            return;
        }
        let run_id = context.run_id().to_string();
        let evicted = {
            let mut inner = lock(&self.inner);
            let mut evicted = inner.remove(&run_id);
            if evicted.is_none() && inner.entries.len() >= self.capacity {
                let oldest = inner.order.values().next().cloned();
                evicted = oldest.and_then(|oldest| inner.remove(&oldest));
            }
            inner.entries.insert(run_id.clone(), (context, 0));
            inner.touch(&run_id);
            evicted
        };
        if let Some(evicted) = evicted
            && evicted.run_id() != run_id
        {
            debug!(run_id = %evicted.run_id(), "Sticky cache full, evicting least recently used execution");
            evicted.evict(self.notifier.clone());
        }
    }

    /// Remove and clear a context. No-op for unknown run ids.
    pub(crate) fn remove(&self, run_id: &str) {
        let removed = lock(&self.inner).remove(run_id);
        if let Some(context) = removed {
            context.evict(self.notifier.clone());
        }
    }

    pub(crate) fn contains(&self, run_id: &str) -> bool {
        lock(&self.inner).entries.contains_key(run_id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}
