// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-transport client connection wrappers.
//!
//! A [`ClientConnection`] hides the transport behind fire-and-forget sends,
//! request/response correlation, and close/status notification. The registry
//! only ever sees this trait; the adapters own the concrete types and feed
//! inbound responses back through [`PendingRequests`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::CloseCode;
use crate::wire::{ErrorPayload, GetPluginsMessage, ResponseMessage};

/// Transport-level connection state changes delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Closed,
    Error,
}

/// Callback invoked on connection status changes.
pub type StatusCallback = Box<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Frames travelling from connection handles to the transport writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close the transport with the given WebSocket close code.
    Close(u16),
}

/// Resolver half of an in-flight request.
pub type PendingResponder = oneshot::Sender<Result<ResponseMessage, ErrorPayload>>;

/// Capability set every transport-specific connection satisfies.
pub trait ClientConnection: Send + Sync {
    /// Fire-and-forget: serialize and write, dropping on transport failure.
    fn send(&self, data: Value);

    /// Send a request carrying an `id` and await the correlated response.
    /// Assigns a fresh id when the payload has none. Fails when the
    /// response carries an error or the connection closes first.
    fn send_expect_response(&self, data: Value) -> BoxFuture<'_, anyhow::Result<ResponseMessage>>;

    /// Register a callback observing transport close/error.
    fn subscribe_to_events(&self, callback: StatusCallback);

    /// Pop the resolver for an in-flight request id, if any.
    fn match_pending_request(&self, id: u64) -> Option<PendingResponder>;

    /// Send a normal-closure frame and release transport resources.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// Pending request correlation
// ---------------------------------------------------------------------------

/// Tracks in-flight request/response pairs for one connection.
///
/// `strict` controls what an unmatched response id means: trusted device
/// transports treat it as a protocol error, the legacy browser transport
/// only logs it (stale in-flight messages from superseded connections are
/// common there).
pub struct PendingRequests {
    next_id: AtomicU64,
    inflight: Mutex<HashMap<u64, PendingResponder>>,
    strict: bool,
}

impl PendingRequests {
    pub fn new(strict: bool) -> Self {
        Self { next_id: AtomicU64::new(0), inflight: Mutex::new(HashMap::new()), strict }
    }

    /// Allocate a locally-unique message id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a resolver for `id` and hand back the awaiting half.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Result<ResponseMessage, ErrorPayload>> {
        let (tx, rx) = oneshot::channel();
        if self.inflight.lock().insert(id, tx).is_some() {
            warn!(id, "replaced an in-flight request with a duplicate id");
        }
        rx
    }

    /// Pop the resolver registered for `id`.
    pub fn take(&self, id: u64) -> Option<PendingResponder> {
        self.inflight.lock().remove(&id)
    }

    /// Route an inbound response to its resolver. Unmatched ids are an
    /// error on strict transports and a dropped warning otherwise.
    pub fn resolve(&self, response: ResponseMessage) -> anyhow::Result<()> {
        let id = response
            .id
            .ok_or_else(|| anyhow::anyhow!("response message carries no id"))?;
        let Some(responder) = self.take(id) else {
            if self.strict {
                anyhow::bail!("no pending request found for response id {id}");
            }
            warn!(id, "dropping response with no matching pending request");
            return Ok(());
        };
        let outcome = match response.error {
            Some(error) => Err(error),
            None => Ok(response),
        };
        // The requester may have given up; that is not our problem.
        let _ = responder.send(outcome);
        Ok(())
    }

    /// Fail every in-flight request, used when the transport goes away.
    pub fn fail_all(&self) {
        // Dropping the senders wakes every receiver with a closed error.
        self.inflight.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }
}

/// Status subscriber list shared by the connection types.
#[derive(Default)]
struct StatusSubscribers {
    callbacks: Mutex<Vec<Arc<dyn Fn(ConnectionStatus) + Send + Sync>>>,
}

impl StatusSubscribers {
    fn subscribe(&self, callback: StatusCallback) {
        self.callbacks.lock().push(Arc::from(callback));
    }

    fn notify(&self, status: ConnectionStatus) {
        let snapshot: Vec<_> = self.callbacks.lock().clone();
        for callback in snapshot {
            callback(status);
        }
    }
}

/// Internal surface the server adapters drive; everything a transport read
/// loop needs beyond the public [`ClientConnection`] contract.
pub(crate) trait SessionConnection: ClientConnection {
    /// Route an inbound response message to its pending request.
    fn resolve_response(&self, response: ResponseMessage) -> anyhow::Result<()>;

    /// Fan a transport status change out to subscribers; `Closed`/`Error`
    /// also fail all in-flight requests.
    fn notify_status(&self, status: ConnectionStatus);
}

// ---------------------------------------------------------------------------
// WebSocket connection (device transports)
// ---------------------------------------------------------------------------

/// Connection over a WebSocket-backed transport (tungstenite or axum); the
/// writer task on the other side of `outbound` owns the sink.
pub struct WsClientConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingRequests,
    subscribers: StatusSubscribers,
}

impl WsClientConnection {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            outbound,
            pending: PendingRequests::new(true),
            subscribers: StatusSubscribers::default(),
        }
    }

    fn write(&self, data: &Value) {
        match serde_json::to_string(data) {
            Ok(text) => {
                if self.outbound.send(Outbound::Text(text)).is_err() {
                    debug!("dropping outbound message: transport writer is gone");
                }
            }
            Err(e) => debug!(err = %e, "failed to serialize outbound message"),
        }
    }
}

impl ClientConnection for WsClientConnection {
    fn send(&self, data: Value) {
        self.write(&data);
    }

    fn send_expect_response(&self, data: Value) -> BoxFuture<'_, anyhow::Result<ResponseMessage>> {
        Box::pin(async move {
            let mut data = data;
            let obj = data
                .as_object_mut()
                .ok_or_else(|| anyhow::anyhow!("request payload must be a JSON object"))?;
            let id = match obj.get("id").and_then(Value::as_u64) {
                Some(id) => id,
                None => {
                    let id = self.pending.next_id();
                    obj.insert("id".to_owned(), json!(id));
                    id
                }
            };
            let rx = self.pending.register(id);
            self.write(&data);
            match rx.await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(error.into()),
                Err(_) => anyhow::bail!("connection closed before response to request {id}"),
            }
        })
    }

    fn subscribe_to_events(&self, callback: StatusCallback) {
        self.subscribers.subscribe(callback);
    }

    fn match_pending_request(&self, id: u64) -> Option<PendingResponder> {
        self.pending.take(id)
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close(CloseCode::Normal.as_u16()));
    }
}

impl SessionConnection for WsClientConnection {
    fn resolve_response(&self, response: ResponseMessage) -> anyhow::Result<()> {
        self.pending.resolve(response)
    }

    fn notify_status(&self, status: ConnectionStatus) {
        if matches!(status, ConnectionStatus::Closed | ConnectionStatus::Error) {
            self.pending.fail_all();
        }
        self.subscribers.notify(status);
    }
}

// ---------------------------------------------------------------------------
// Browser connection (legacy-aware)
// ---------------------------------------------------------------------------

/// Connection for browser clients.
///
/// Speaks the modern protocol by default; once the peer identifies itself
/// with a legacy `connect` message, outbound traffic is wrapped in the
/// legacy `{app, payload}` envelope and a known plugin list short-circuits
/// `getPlugins` requests locally.
pub struct BrowserClientConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingRequests,
    subscribers: StatusSubscribers,
    app: String,
    legacy: AtomicBool,
    legacy_plugins: Mutex<Option<Vec<String>>>,
    pending_get_plugins: Mutex<Option<u64>>,
}

impl BrowserClientConnection {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>, app: String) -> Self {
        Self {
            outbound,
            pending: PendingRequests::new(false),
            subscribers: StatusSubscribers::default(),
            app,
            legacy: AtomicBool::new(false),
            legacy_plugins: Mutex::new(None),
            pending_get_plugins: Mutex::new(None),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy.load(Ordering::Acquire)
    }

    /// Absorb a legacy `connect` message. A plugin list answers the hub's
    /// outstanding (or future) `getPlugins` request without a wire round
    /// trip.
    pub fn handle_legacy_connect(&self, plugins: Option<Vec<String>>) {
        self.legacy.store(true, Ordering::Release);
        let Some(plugins) = plugins else {
            return;
        };
        *self.legacy_plugins.lock() = Some(plugins.clone());
        if let Some(id) = self.pending_get_plugins.lock().take() {
            let synthesized = ResponseMessage {
                id: Some(id),
                success: Some(json!({ "plugins": plugins })),
                error: None,
            };
            if let Err(e) = self.pending.resolve(synthesized) {
                debug!(err = %e, "failed to resolve synthesized getPlugins response");
            }
        }
    }

    fn write(&self, data: &Value) {
        let framed = if self.is_legacy() {
            json!({ "app": self.app, "payload": data })
        } else {
            data.clone()
        };
        match serde_json::to_string(&framed) {
            Ok(text) => {
                if self.outbound.send(Outbound::Text(text)).is_err() {
                    debug!("dropping outbound message: transport writer is gone");
                }
            }
            Err(e) => debug!(err = %e, "failed to serialize outbound message"),
        }
    }
}

impl ClientConnection for BrowserClientConnection {
    fn send(&self, data: Value) {
        self.write(&data);
    }

    fn send_expect_response(&self, data: Value) -> BoxFuture<'_, anyhow::Result<ResponseMessage>> {
        Box::pin(async move {
            let mut data = data;
            let obj = data
                .as_object_mut()
                .ok_or_else(|| anyhow::anyhow!("request payload must be a JSON object"))?;
            let id = match obj.get("id").and_then(Value::as_u64) {
                Some(id) => id,
                None => {
                    let id = self.pending.next_id();
                    obj.insert("id".to_owned(), json!(id));
                    id
                }
            };

            let is_get_plugins = obj.get("method").and_then(Value::as_str)
                == Some(GetPluginsMessage::METHOD);
            if is_get_plugins {
                if let Some(plugins) = self.legacy_plugins.lock().clone() {
                    // The legacy connect already told us the plugin list.
                    return Ok(ResponseMessage {
                        id: Some(id),
                        success: Some(json!({ "plugins": plugins })),
                        error: None,
                    });
                }
                *self.pending_get_plugins.lock() = Some(id);
            }

            let rx = self.pending.register(id);
            self.write(&data);
            match rx.await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(error.into()),
                Err(_) => anyhow::bail!("connection closed before response to request {id}"),
            }
        })
    }

    fn subscribe_to_events(&self, callback: StatusCallback) {
        self.subscribers.subscribe(callback);
    }

    fn match_pending_request(&self, id: u64) -> Option<PendingResponder> {
        self.pending.take(id)
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close(CloseCode::Normal.as_u16()));
    }
}

impl SessionConnection for BrowserClientConnection {
    fn resolve_response(&self, response: ResponseMessage) -> anyhow::Result<()> {
        self.pending.resolve(response)
    }

    fn notify_status(&self, status: ConnectionStatus) {
        if matches!(status, ConnectionStatus::Closed | ConnectionStatus::Error) {
            self.pending.fail_all();
        }
        self.subscribers.notify(status);
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
