// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plugin persisted-state store and per-plugin message queues.
//!
//! One shared [`Store`] backs the message router and the drain engine. All
//! access is lock-scoped; no lock is ever held across an `.await`, so
//! enqueueing during an in-flight drain is safe and expected.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;

/// Default bound for a plugin's message queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// One queued device message for a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub api: String,
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct StoreInner {
    plugin_states: HashMap<String, Value>,
    queues: HashMap<String, Vec<Message>>,
    selected_plugin_key: Option<String>,
    /// `(app, plugin_id)` pairs the user has starred.
    starred: HashSet<(String, String)>,
}

/// Shared state store: plugin persisted state, message queues, and the
/// selection/starring view state the routing decisions depend on.
#[derive(Default)]
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Persisted state ----------------------------------------------------

    pub fn plugin_state(&self, plugin_key: &str) -> Option<Value> {
        self.inner.lock().plugin_states.get(plugin_key).cloned()
    }

    pub fn set_plugin_state(&self, plugin_key: &str, state: Value) {
        self.inner.lock().plugin_states.insert(plugin_key.to_owned(), state);
    }

    /// Drop persisted state and any queued messages for a plugin.
    pub fn reset_plugin(&self, plugin_key: &str) {
        let mut inner = self.inner.lock();
        inner.plugin_states.remove(plugin_key);
        inner.queues.remove(plugin_key);
    }

    // -- Message queues -----------------------------------------------------

    /// Append a message to a plugin's queue, truncating to the newest
    /// `ceil(0.9 * max) + 1` entries when the bound is exceeded. Silent
    /// data loss under sustained overload is the documented trade-off.
    pub fn enqueue(&self, plugin_key: &str, message: Message, max_queue_size: usize) {
        let mut inner = self.inner.lock();
        let queue = inner.queues.entry(plugin_key.to_owned()).or_default();
        queue.push(message);
        if queue.len() > max_queue_size {
            let keep = div_ceil_tenths(max_queue_size) + 1;
            let excess = queue.len().saturating_sub(keep);
            queue.drain(..excess);
        }
    }

    /// Snapshot of the pending messages for a plugin.
    pub fn pending_messages(&self, plugin_key: &str) -> Vec<Message> {
        self.inner.lock().queues.get(plugin_key).cloned().unwrap_or_default()
    }

    pub fn pending_len(&self, plugin_key: &str) -> usize {
        self.inner.lock().queues.get(plugin_key).map_or(0, Vec::len)
    }

    /// Atomically drop the first `count` messages of a plugin's queue —
    /// the prefix a drain has already folded into persisted state.
    pub fn clear_queue(&self, plugin_key: &str, count: usize) {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.queues.get_mut(plugin_key) {
            queue.drain(..count.min(queue.len()));
        }
    }

    /// Drop all queued messages for every plugin of the given client.
    pub fn clear_client_queues(&self, client_id: &str) {
        let prefix = format!("{client_id}#");
        self.inner.lock().queues.retain(|key, _| !key.starts_with(&prefix));
    }

    // -- Selection / starring ----------------------------------------------

    pub fn select_plugin(&self, plugin_key: Option<String>) {
        self.inner.lock().selected_plugin_key = plugin_key;
    }

    pub fn selected_plugin_key(&self) -> Option<String> {
        self.inner.lock().selected_plugin_key.clone()
    }

    pub fn star_plugin(&self, app: &str, plugin_id: &str) {
        self.inner.lock().starred.insert((app.to_owned(), plugin_id.to_owned()));
    }

    pub fn unstar_plugin(&self, app: &str, plugin_id: &str) {
        self.inner.lock().starred.remove(&(app.to_owned(), plugin_id.to_owned()));
    }

    pub fn is_starred(&self, app: &str, plugin_id: &str) -> bool {
        self.inner.lock().starred.contains(&(app.to_owned(), plugin_id.to_owned()))
    }
}

/// `ceil(0.9 * n)` without going through floats.
fn div_ceil_tenths(n: usize) -> usize {
    (n * 9).div_ceil(10)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
