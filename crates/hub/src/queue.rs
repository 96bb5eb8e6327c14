// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Message routing and the queue drain engine.
//!
//! Inbound device messages either fold into plugin persisted state
//! immediately (the plugin is being observed) or land in that plugin's
//! bounded queue for a later drain. Drains run cooperatively: they fold
//! messages until the [`Idler`] asks for a yield, persist the progress so
//! far, and pick up whatever arrived in the meantime on the next pass.
//!
//! The engine does not serialize drains per plugin key; callers that may
//! start overlapping drains for one key must cancel the previous idler
//! first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::idler::Idler;
use crate::store::{Message, Store, DEFAULT_MAX_QUEUE_SIZE};
use crate::wire::{build_plugin_key, parse_trusted_message, TrustedMessage};

/// Folds above this duration log a warning; background plugin reducers are
/// expected to stay well under it.
const MAX_BACKGROUND_TASK_TIME: Duration = Duration::from_millis(25);

/// A plugin that folds device messages into persisted state.
pub trait PersistedStatePlugin: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the plugin declares a reducer at all. Plugins without one
    /// take part in neither immediate processing nor queueing.
    fn has_reducer(&self) -> bool {
        true
    }

    fn default_state(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// Fold one message into the given state, returning the next state.
    fn apply_message(&self, state: &Value, method: &str, params: &Value) -> anyhow::Result<Value>;

    /// Device-scoped plugins queue regardless of starring.
    fn is_device_plugin(&self) -> bool {
        false
    }

    /// Per-plugin queue bound override.
    fn max_queue_size(&self) -> Option<usize> {
        None
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Accumulated reducer timings for one `plugin.method` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatEntry {
    /// Total time spent in the reducer.
    pub cpu_time: Duration,
    /// Number of messages folded.
    pub messages: u64,
    /// Longest single fold.
    pub max_time: Duration,
}

/// Reducer timing registry, owned by whoever drives the engine so tests get
/// clean per-instance isolation.
#[derive(Default)]
pub struct StatsRegistry {
    entries: Mutex<IndexMap<String, StatEntry>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: &str, elapsed: Duration) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_owned()).or_default();
        entry.cpu_time += elapsed;
        entry.messages += 1;
        entry.max_time = entry.max_time.max(elapsed);
        if elapsed > MAX_BACKGROUND_TASK_TIME {
            warn!(
                plugin_method = key,
                elapsed_ms = elapsed.as_millis() as u64,
                "background message handling took too long"
            );
        }
    }

    /// Snapshot of all entries in first-recorded order.
    pub fn snapshot(&self) -> Vec<(String, StatEntry)> {
        self.entries.lock().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Fold one message, tracking stats. A reducer failure is logged and leaves
/// the state untouched; one bad message must never wedge the queue.
fn process_message(
    state: Value,
    plugin_key: &str,
    plugin: &dyn PersistedStatePlugin,
    message: &Message,
    stats: &StatsRegistry,
) -> Value {
    let stat_key = format!("{}.{}", plugin.id(), message.method);
    let started = Instant::now();
    match plugin.apply_message(&state, &message.method, &message.params) {
        Ok(next) => {
            stats.record(&stat_key, started.elapsed());
            next
        }
        Err(e) => {
            error!(
                plugin = plugin.id(),
                method = %message.method,
                plugin_key,
                err = %e,
                "failed to process event"
            );
            state
        }
    }
}

/// Apply a message to persisted state synchronously, storing the result if
/// it changed.
pub fn process_message_immediately(
    store: &Store,
    plugin_key: &str,
    plugin: &dyn PersistedStatePlugin,
    message: &Message,
    stats: &StatsRegistry,
) {
    let persisted = store.plugin_state(plugin_key).unwrap_or_else(|| plugin.default_state());
    let next = process_message(persisted.clone(), plugin_key, plugin, message, stats);
    if next != persisted {
        store.set_plugin_state(plugin_key, next);
    }
}

/// Route an inbound message: immediate when the plugin is selected with an
/// empty queue; queued when selected, device-scoped, or starred; dropped
/// otherwise.
pub fn process_message_later(
    store: &Store,
    plugin_key: &str,
    client_app: &str,
    plugin: &dyn PersistedStatePlugin,
    message: Message,
    stats: &StatsRegistry,
) {
    if !plugin.has_reducer() {
        return;
    }
    let selected = store.selected_plugin_key().as_deref() == Some(plugin_key);
    if selected && store.pending_len(plugin_key) == 0 {
        process_message_immediately(store, plugin_key, plugin, &message, stats);
    } else if selected
        || plugin.is_device_plugin()
        || store.is_starred(client_app, plugin.id())
    {
        let max = plugin.max_queue_size().unwrap_or(DEFAULT_MAX_QUEUE_SIZE);
        store.enqueue(plugin_key, message, max);
    }
    // Neither selected, device-scoped, nor starred: the message is dropped.
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

/// Drain progress handed to the caller after each folded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainProgress {
    pub current: usize,
    pub total: usize,
}

/// Replay a plugin's queued messages into its persisted state.
///
/// Returns `true` when the queue was fully drained, `false` when the idler
/// was cancelled first. Progress already written back stands either way;
/// unconsumed messages stay queued for a future drain.
pub async fn process_message_queue(
    plugin: &dyn PersistedStatePlugin,
    plugin_key: &str,
    store: &Store,
    stats: &StatsRegistry,
    mut on_progress: Option<&mut (dyn FnMut(DrainProgress) + Send)>,
    idler: &dyn Idler,
) -> bool {
    if !plugin.has_reducer() {
        return true;
    }

    let initial_total = store.pending_len(plugin_key);
    let mut progress = 0;

    loop {
        let messages = store.pending_messages(plugin_key);
        if messages.is_empty() {
            return true;
        }

        let persisted = store.plugin_state(plugin_key).unwrap_or_else(|| plugin.default_state());
        let mut state = persisted.clone();
        let mut offset = 0;

        // Fold synchronously until the idler asks for a yield. Writing the
        // consumed prefix and folded state back before idling keeps the
        // store consistent if this drain never resumes.
        loop {
            state = process_message(state, plugin_key, plugin, &messages[offset], stats);
            offset += 1;
            progress += 1;
            if let Some(on_progress) = on_progress.as_mut() {
                on_progress(DrainProgress {
                    current: progress,
                    total: initial_total.max(progress),
                });
            }
            if offset >= messages.len() || idler.should_idle() {
                break;
            }
        }

        store.clear_queue(plugin_key, offset);
        if state != persisted {
            store.set_plugin_state(plugin_key, state);
        }

        if idler.is_cancelled() {
            return false;
        }
        if idler.idle().await.is_err() {
            return false;
        }
        // New messages may have arrived while we idled; loop and pick
        // them up.
    }
}

// ---------------------------------------------------------------------------
// Routing from the wire
// ---------------------------------------------------------------------------

/// Binds client execute messages to registered plugins.
///
/// Subscribes conceptually to the controller's `ClientMessage` events: feed
/// each `(client_id, payload)` pair into [`MessageRouter::handle_client_message`].
pub struct MessageRouter {
    store: Arc<Store>,
    stats: Arc<StatsRegistry>,
    plugins: Mutex<HashMap<String, Arc<dyn PersistedStatePlugin>>>,
}

impl MessageRouter {
    pub fn new(store: Arc<Store>, stats: Arc<StatsRegistry>) -> Self {
        Self { store, stats, plugins: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    /// Register a plugin under its id; execute messages address plugins by
    /// their `api` field.
    pub fn register_plugin(&self, plugin: Arc<dyn PersistedStatePlugin>) {
        self.plugins.lock().insert(plugin.id().to_owned(), plugin);
    }

    /// Route one raw client message. Messages for unknown plugins are
    /// dropped with a debug log.
    pub fn handle_client_message(&self, client_id: &str, payload: &str) {
        let message = match parse_trusted_message(payload) {
            Ok(TrustedMessage::Execute(execute)) => execute,
            Ok(TrustedMessage::Response(_)) => return,
            Err(e) => {
                warn!(client_id, err = %e, "unroutable client message");
                return;
            }
        };

        let plugin = self.plugins.lock().get(&message.params.api).cloned();
        let Some(plugin) = plugin else {
            debug!(
                client_id,
                api = %message.params.api,
                "message for unregistered plugin dropped"
            );
            return;
        };

        // The client id leads with the app name.
        let client_app = client_id.split('#').next().unwrap_or(client_id);
        let plugin_key = build_plugin_key(client_id, plugin.id());
        let queued = Message {
            api: message.params.api.clone(),
            method: message.params.method.clone(),
            params: message.params.params.clone(),
        };
        process_message_later(&self.store, &plugin_key, client_app, plugin.as_ref(), queued, &self.stats);
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
