// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: listener/provider/connection stubs and the
//! counting test plugin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::adapter::ServerEvents;
use crate::certs::{CertificateExchangeResult, CertificateProvider};
use crate::connection::{ClientConnection, ConnectionStatus, PendingResponder, StatusCallback};
use crate::queue::PersistedStatePlugin;
use crate::wire::{
    build_client_id, CertificateExchangeMedium, ClientDescription, ClientQuery,
    ConnectionRecordEntry, DeviceOs, ResponseMessage, SecureClientQuery,
};

/// Extension trait to convert any `Display` error into `anyhow::Error`.
/// Replaces `.map_err(|e| anyhow::anyhow!("{e}"))` with `.anyhow()`.
pub trait AnyhowExt<T> {
    fn anyhow(self) -> anyhow::Result<T>;
}

impl<T, E: std::fmt::Display> AnyhowExt<T> for Result<T, E> {
    fn anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// A `ClientQuery` with sensible defaults for tests.
pub fn test_query(app: &str, os: DeviceOs, device: &str, device_id: &str) -> ClientQuery {
    ClientQuery {
        app: app.to_owned(),
        os,
        device: device.to_owned(),
        device_id: device_id.to_owned(),
        sdk_version: Some(4),
    }
}

/// Drain everything currently buffered on a broadcast receiver.
pub fn drain_events<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Listener stub
// ---------------------------------------------------------------------------

/// Compact record of a listener callback, for ordering assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Listening(u16),
    ConnectionAttempt(String),
    SecureConnectionAttempt(String),
    ConnectionCreated(String),
    ConnectionClosed(String),
    ClientMessage { id: String, payload: String },
    SetupError(String),
    Error(String),
    DeviceLogs(usize),
}

/// [`ServerEvents`] implementation that records every callback and resolves
/// clients locally.
pub struct RecordingListener {
    pub events: Mutex<Vec<ListenerEvent>>,
    /// Device id returned from `on_process_csr`.
    pub device_id: String,
    pub fail_csr: bool,
    pub fail_connection: bool,
    /// Connections handed to `on_connection_created`, in order.
    pub connections: Mutex<Vec<Arc<dyn ClientConnection>>>,
    /// Gate holding back client resolution until released, for buffering
    /// tests. `None` resolves immediately.
    resolve_gate: Mutex<Option<broadcast::Sender<()>>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    pub fn failing_csr() -> Arc<Self> {
        let mut listener = Self::new_inner();
        listener.fail_csr = true;
        Arc::new(listener)
    }

    pub fn failing_connection() -> Arc<Self> {
        let mut listener = Self::new_inner();
        listener.fail_connection = true;
        Arc::new(listener)
    }

    /// Hold client resolution until [`RecordingListener::release_clients`].
    pub fn gated() -> Arc<Self> {
        let listener = Self::new_inner();
        let (tx, _) = broadcast::channel(1);
        *listener.resolve_gate.lock() = Some(tx);
        Arc::new(listener)
    }

    fn new_inner() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            device_id: "D1".to_owned(),
            fail_csr: false,
            fail_connection: false,
            connections: Mutex::new(Vec::new()),
            resolve_gate: Mutex::new(None),
        }
    }

    pub fn release_clients(&self) {
        if let Some(gate) = self.resolve_gate.lock().as_ref() {
            let _ = gate.send(());
        }
    }

    pub fn recorded(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().push(event);
    }
}

impl ServerEvents for RecordingListener {
    fn on_listening(&self, port: u16) {
        self.record(ListenerEvent::Listening(port));
    }

    fn on_connection_attempt(&self, query: &ClientQuery) {
        self.record(ListenerEvent::ConnectionAttempt(query.app.clone()));
    }

    fn on_secure_connection_attempt(&self, query: &SecureClientQuery) {
        self.record(ListenerEvent::SecureConnectionAttempt(query.query.app.clone()));
    }

    fn on_process_csr<'a>(
        &'a self,
        _csr: &'a str,
        _query: &'a ClientQuery,
        _sandbox_dir: &'a str,
        _medium: CertificateExchangeMedium,
    ) -> BoxFuture<'a, anyhow::Result<CertificateExchangeResult>> {
        Box::pin(async move {
            if self.fail_csr {
                anyhow::bail!("certificate authority rejected the request");
            }
            Ok(CertificateExchangeResult { device_id: self.device_id.clone() })
        })
    }

    fn on_connection_created(
        &self,
        query: SecureClientQuery,
        connection: Arc<dyn ClientConnection>,
    ) -> BoxFuture<'_, anyhow::Result<ClientDescription>> {
        Box::pin(async move {
            let gate = self.resolve_gate.lock().as_ref().map(broadcast::Sender::subscribe);
            if let Some(mut gate) = gate {
                let _ = gate.recv().await;
            }
            if self.fail_connection {
                anyhow::bail!("client rejected by registry");
            }
            let id = build_client_id(&query.query);
            self.connections.lock().push(connection);
            self.record(ListenerEvent::ConnectionCreated(id.clone()));
            Ok(ClientDescription { id, query: query.query })
        })
    }

    fn on_connection_closed(&self, id: &str) {
        self.record(ListenerEvent::ConnectionClosed(id.to_owned()));
    }

    fn on_client_message(&self, id: &str, payload: &str) {
        self.record(ListenerEvent::ClientMessage {
            id: id.to_owned(),
            payload: payload.to_owned(),
        });
    }

    fn on_client_setup_error(&self, query: &ClientQuery, error: &anyhow::Error) {
        self.record(ListenerEvent::SetupError(format!("{}: {error}", query.app)));
    }

    fn on_error(&self, error: anyhow::Error) {
        self.record(ListenerEvent::Error(error.to_string()));
    }

    fn on_device_logs(&self, entries: Vec<ConnectionRecordEntry>) {
        self.record(ListenerEvent::DeviceLogs(entries.len()));
    }
}

// ---------------------------------------------------------------------------
// Certificate provider stub
// ---------------------------------------------------------------------------

/// Provider answering with fixed values and recording call order.
pub struct StubCertificateProvider {
    pub device_id: String,
    pub app_name: String,
    pub fail: bool,
    pub calls: Mutex<Vec<String>>,
}

impl StubCertificateProvider {
    pub fn new(device_id: &str) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.to_owned(),
            app_name: "com.example.app".to_owned(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            device_id: String::new(),
            app_name: String::new(),
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }
}

impl CertificateProvider for StubCertificateProvider {
    fn name(&self) -> &'static str {
        "stub-certificate-provider"
    }

    fn medium(&self) -> CertificateExchangeMedium {
        CertificateExchangeMedium::FsAccess
    }

    fn process_signing_request<'a>(
        &'a self,
        _query: &'a ClientQuery,
        _csr: &'a str,
        _sandbox_dir: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<CertificateExchangeResult>> {
        Box::pin(async move {
            self.calls.lock().push("process_signing_request".to_owned());
            if self.fail {
                anyhow::bail!("stub provider failure");
            }
            Ok(CertificateExchangeResult { device_id: self.device_id.clone() })
        })
    }

    fn get_target_device_id<'a>(
        &'a self,
        _query: &'a ClientQuery,
        _app_name: &'a str,
        _csr_path: &'a str,
        _csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            self.calls.lock().push("get_target_device_id".to_owned());
            if self.fail {
                anyhow::bail!("stub provider failure");
            }
            Ok(self.device_id.clone())
        })
    }

    fn extract_app_name_from_csr<'a>(
        &'a self,
        _csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            self.calls.lock().push("extract_app_name_from_csr".to_owned());
            if self.fail {
                anyhow::bail!("stub provider failure");
            }
            Ok(self.app_name.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// Connection stub
// ---------------------------------------------------------------------------

/// In-memory [`ClientConnection`] for registry tests.
pub struct StubConnection {
    pub sent: Mutex<Vec<Value>>,
    pub closed: AtomicBool,
    callbacks: Mutex<Vec<Arc<dyn Fn(ConnectionStatus) + Send + Sync>>>,
}

impl StubConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Simulate a transport status change.
    pub fn fire(&self, status: ConnectionStatus) {
        let snapshot: Vec<_> = self.callbacks.lock().clone();
        for callback in snapshot {
            callback(status);
        }
    }
}

impl ClientConnection for StubConnection {
    fn send(&self, data: Value) {
        self.sent.lock().push(data);
    }

    fn send_expect_response(&self, data: Value) -> BoxFuture<'_, anyhow::Result<ResponseMessage>> {
        Box::pin(async move {
            let id = data.get("id").and_then(Value::as_u64).unwrap_or(0);
            self.sent.lock().push(data);
            Ok(ResponseMessage { id: Some(id), success: Some(json!({})), error: None })
        })
    }

    fn subscribe_to_events(&self, callback: StatusCallback) {
        self.callbacks.lock().push(Arc::from(callback));
    }

    fn match_pending_request(&self, _id: u64) -> Option<PendingResponder> {
        None
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.fire(ConnectionStatus::Closed);
    }
}

// ---------------------------------------------------------------------------
// Test plugins
// ---------------------------------------------------------------------------

/// Counting plugin: `inc` adds `params.delta` (default 1) to `count`,
/// `boom` fails, anything else is a no-op.
pub struct TestPlugin;

impl TestPlugin {
    pub const ID: &'static str = "TestPlugin";
}

impl PersistedStatePlugin for TestPlugin {
    fn id(&self) -> &str {
        Self::ID
    }

    fn default_state(&self) -> Value {
        json!({"count": 0})
    }

    fn apply_message(&self, state: &Value, method: &str, params: &Value) -> anyhow::Result<Value> {
        match method {
            "inc" => {
                let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
                let delta = params.get("delta").and_then(Value::as_i64).unwrap_or(1);
                Ok(json!({"count": count + delta}))
            }
            "boom" => anyhow::bail!("reducer exploded"),
            _ => Ok(state.clone()),
        }
    }
}

/// Device-scoped variant of [`TestPlugin`].
pub struct DeviceTestPlugin;

impl PersistedStatePlugin for DeviceTestPlugin {
    fn id(&self) -> &str {
        "DeviceTestPlugin"
    }

    fn default_state(&self) -> Value {
        json!({"count": 0})
    }

    fn apply_message(&self, state: &Value, method: &str, params: &Value) -> anyhow::Result<Value> {
        TestPlugin.apply_message(state, method, params)
    }

    fn is_device_plugin(&self) -> bool {
        true
    }
}

/// Plugin that declares no reducer at all.
pub struct NoReducerPlugin;

impl PersistedStatePlugin for NoReducerPlugin {
    fn id(&self) -> &str {
        "NoReducerPlugin"
    }

    fn has_reducer(&self) -> bool {
        false
    }

    fn apply_message(&self, state: &Value, _method: &str, _params: &Value) -> anyhow::Result<Value> {
        Ok(state.clone())
    }
}

/// [`TestPlugin`] with a tiny queue bound, for truncation tests.
pub struct SmallQueuePlugin(pub usize);

impl PersistedStatePlugin for SmallQueuePlugin {
    fn id(&self) -> &str {
        "SmallQueuePlugin"
    }

    fn default_state(&self) -> Value {
        json!({"count": 0})
    }

    fn apply_message(&self, state: &Value, method: &str, params: &Value) -> anyhow::Result<Value> {
        TestPlugin.apply_message(state, method, params)
    }

    fn max_queue_size(&self) -> Option<usize> {
        Some(self.0)
    }
}
