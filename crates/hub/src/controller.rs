// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection registry and server controller.
//!
//! Owns the map of live client connections and the listening adapters:
//! insecure and secure socket-family servers, the alternate ws-family pair,
//! and the browser server. Implements [`ServerEvents`] so the adapters have
//! a single outlet, and re-publishes everything interesting as
//! [`HubEvent`]s.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::adapter::browser::BrowserServer;
use crate::adapter::socket::SocketServer;
use crate::adapter::ws::WsServer;
use crate::adapter::{ServerAdapter, ServerEvents};
use crate::certs::{load_secure_server_config, CertificateExchangeResult, CertificateProvider};
use crate::connection::{ClientConnection, ConnectionStatus};
use crate::events::HubEvent;
use crate::wire::{
    build_client_id, CertificateExchangeMedium, ClientDescription, ClientQuery,
    ConnectionRecordEntry, DeviceOs, SecureClientQuery,
};

/// How long a client has to reconnect securely after certificate exchange
/// before it is reported unresponsive.
const UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairs a live transport handle with its logical client. `connection` is
/// `None` for clients reconstructed from imported data.
#[derive(Clone)]
pub struct ClientInfo {
    pub connection: Option<Arc<dyn ClientConnection>>,
    pub client: ClientDescription,
}

/// CSR material carried from the secure query into connection setup.
#[derive(Debug, Clone, Default)]
pub struct CsrQuery {
    pub csr: Option<String>,
    pub csr_path: Option<String>,
}

/// Listening endpoints the controller should bind. `None` disables that
/// endpoint.
#[derive(Debug, Clone, Default)]
pub struct ServerPorts {
    pub insecure: Option<u16>,
    pub secure: Option<u16>,
    pub alt_insecure: Option<u16>,
    pub alt_secure: Option<u16>,
    pub browser: Option<u16>,
}

/// Static controller configuration.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub host: String,
    pub ports: ServerPorts,
    pub cert_dir: PathBuf,
    pub enable_android: bool,
    pub enable_ios: bool,
    pub allowed_browser_origins: Vec<String>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            ports: ServerPorts::default(),
            cert_dir: PathBuf::from("certs"),
            enable_android: true,
            enable_ios: true,
            allowed_browser_origins: vec![
                "http://localhost".to_owned(),
                "https://localhost".to_owned(),
            ],
        }
    }
}

/// The server controller: starts/stops adapters and owns the registry.
pub struct ServerController {
    inner: Arc<ControllerInner>,
    adapters: Vec<Box<dyn ServerAdapter>>,
}

impl ServerController {
    pub fn new(settings: HubSettings, provider: Arc<dyn CertificateProvider>) -> Self {
        Self { inner: ControllerInner::new(settings, provider), adapters: Vec::new() }
    }

    /// The registry half, shared with adapters and timers.
    pub fn registry(&self) -> Arc<ControllerInner> {
        Arc::clone(&self.inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Bind every configured endpoint. Returns `(label, bound_port)` pairs.
    /// Secure endpoints are skipped with a warning when the TLS material
    /// cannot be loaded.
    pub async fn start(&mut self) -> anyhow::Result<Vec<(&'static str, u16)>> {
        let events: Arc<dyn ServerEvents> = self.registry();
        let settings = self.inner.settings.clone();
        let wants_secure =
            settings.ports.secure.is_some() || settings.ports.alt_secure.is_some();
        let tls = if wants_secure {
            match load_secure_server_config(&settings.cert_dir) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(
                        cert_dir = %settings.cert_dir.display(),
                        err = %e,
                        "tls material unavailable; secure endpoints disabled"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut bound = Vec::new();

        if let Some(port) = settings.ports.insecure {
            let mut server = SocketServer::new(Arc::clone(&events), settings.host.clone());
            bound.push(("socket-insecure", server.start(port, None).await?));
            self.adapters.push(Box::new(server));
        }
        if let (Some(port), Some(tls)) = (settings.ports.secure, tls.clone()) {
            let mut server = SocketServer::new(Arc::clone(&events), settings.host.clone());
            bound.push(("socket-secure", server.start(port, Some(tls)).await?));
            self.adapters.push(Box::new(server));
        }
        if let Some(port) = settings.ports.alt_insecure {
            let mut server = WsServer::new(Arc::clone(&events), settings.host.clone());
            bound.push(("ws-insecure", server.start(port, None).await?));
            self.adapters.push(Box::new(server));
        }
        if let (Some(port), Some(tls)) = (settings.ports.alt_secure, tls.clone()) {
            let mut server = WsServer::new(Arc::clone(&events), settings.host.clone());
            bound.push(("ws-secure", server.start(port, Some(tls)).await?));
            self.adapters.push(Box::new(server));
        }
        if let Some(port) = settings.ports.browser {
            let mut server = BrowserServer::new(
                Arc::clone(&events),
                settings.host.clone(),
                settings.allowed_browser_origins.clone(),
            );
            bound.push(("browser", server.start(port, None).await?));
            self.adapters.push(Box::new(server));
        }

        Ok(bound)
    }

    /// Stop every adapter and cancel outstanding timers.
    pub async fn stop(&mut self) {
        for adapter in &mut self.adapters {
            adapter.stop().await;
        }
        self.adapters.clear();
        for (_, timer) in self.inner.unresponsive_timers.lock().drain() {
            timer.abort();
        }
    }
}

/// Registry state shared between the controller, its adapters, and timers.
pub struct ControllerInner {
    /// Weak handle back to the owning Arc; adapter callbacks and timers
    /// need owned handles without keeping the registry alive forever.
    self_ref: Weak<ControllerInner>,
    settings: HubSettings,
    provider: Arc<dyn CertificateProvider>,
    connections: Mutex<HashMap<String, ClientInfo>>,
    tracker: Mutex<ConnectionTracker>,
    unresponsive_timers: Mutex<HashMap<String, tokio::task::AbortHandle>>,
    unresponsive_reported: Mutex<HashSet<String>>,
    events_tx: broadcast::Sender<HubEvent>,
}

impl ControllerInner {
    pub fn new(settings: HubSettings, provider: Arc<dyn CertificateProvider>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            settings,
            provider,
            connections: Mutex::new(HashMap::new()),
            tracker: Mutex::new(ConnectionTracker::new()),
            unresponsive_timers: Mutex::new(HashMap::new()),
            unresponsive_reported: Mutex::new(HashSet::new()),
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events_tx.send(event);
    }

    /// Number of live registry entries.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn client(&self, id: &str) -> Option<ClientDescription> {
        self.connections.lock().get(id).map(|info| info.client.clone())
    }

    /// Register a new secure connection, replacing any zombie connection
    /// that still holds the same client id.
    pub async fn add_connection(
        &self,
        connection: Arc<dyn ClientConnection>,
        query: ClientQuery,
        csr_query: CsrQuery,
        silent_replace: bool,
    ) -> anyhow::Result<ClientDescription> {
        let mut query = query;

        // Android device ids may differ between the insecure and secure
        // attempts; the CSR is the source of truth for which device this
        // app actually runs on.
        if query.os == DeviceOs::Android {
            if let (Some(csr), Some(csr_path)) = (&csr_query.csr, &csr_query.csr_path) {
                let app_name = self.provider.extract_app_name_from_csr(csr).await?;
                query.device_id =
                    self.provider.get_target_device_id(&query, &app_name, csr_path, csr).await?;
                info!(
                    app = %app_name,
                    device_id = %query.device_id,
                    "detected app in certificate"
                );
            }
        }

        query.app = app_name_with_update_hint(&query);
        let id = build_client_id(&query);
        let client = ClientDescription { id: id.clone(), query };
        info!(id = %id, "initializing client");

        let registry = self.self_ref.clone();
        let callback_id = id.clone();
        connection.subscribe_to_events(Box::new(move |status| {
            if matches!(status, ConnectionStatus::Closed | ConnectionStatus::Error) {
                if let Some(registry) = registry.upgrade() {
                    registry.on_connection_closed(&callback_id);
                }
            }
        }));

        // A client that lost its connection without proper cleanup shows up
        // here as a zombie entry on reconnect; terminate it first.
        let stale = self.connections.lock().get(&id).and_then(|info| {
            info.connection
                .as_ref()
                .filter(|existing| !Arc::ptr_eq(existing, &connection))
                .cloned()
        });
        if let Some(stale) = stale {
            if !silent_replace {
                stale.close();
                self.remove_connection(&id);
            }
        }

        self.connections
            .lock()
            .insert(id, ClientInfo { connection: Some(connection), client: client.clone() });
        self.emit(HubEvent::ClientConnected { client: client.clone() });

        Ok(client)
    }

    /// Register a client with no live connection (imported/offline data).
    pub fn attach_fake_client(&self, client: ClientDescription) {
        self.connections
            .lock()
            .insert(client.id.clone(), ClientInfo { connection: None, client });
    }

    /// Disconnect (if connected) and forget a client.
    pub fn remove_connection(&self, id: &str) {
        let removed = self.connections.lock().remove(id);
        if let Some(info) = removed {
            info!(
                app = %info.client.query.app,
                device_id = %info.client.query.device_id,
                "client disconnected"
            );
            self.emit(HubEvent::ClientDisconnected { id: id.to_owned() });
        }
    }

    /// Fire-and-forget command dispatch to a registered client.
    pub fn client_request(&self, id: &str, data: Value) -> anyhow::Result<()> {
        self.live_connection(id)?.send(data);
        Ok(())
    }

    /// Request/response command dispatch to a registered client.
    pub async fn client_request_response(
        &self,
        id: &str,
        data: Value,
    ) -> anyhow::Result<crate::wire::ResponseMessage> {
        self.live_connection(id)?.send_expect_response(data).await
    }

    fn live_connection(&self, id: &str) -> anyhow::Result<Arc<dyn ClientConnection>> {
        self.connections
            .lock()
            .get(id)
            .and_then(|info| info.connection.clone())
            .ok_or_else(|| anyhow::anyhow!("no live connection for client {id}"))
    }

    fn arm_unresponsive_timer(
        &self,
        query: &ClientQuery,
        medium: CertificateExchangeMedium,
        device_id: &str,
    ) {
        let key = client_query_key(query);
        let registry = self.self_ref.clone();
        let query = query.clone();
        let device_id = device_id.to_owned();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(UNRESPONSIVE_TIMEOUT).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.unresponsive_timers.lock().remove(&timer_key);
            registry.notify_unresponsive(&query, medium, &device_id);
        });
        if let Some(previous) =
            self.unresponsive_timers.lock().insert(key, handle.abort_handle())
        {
            previous.abort();
        }
    }

    /// Raise the unresponsive-client event once per client key; repeats
    /// only log.
    fn notify_unresponsive(
        &self,
        query: &ClientQuery,
        medium: CertificateExchangeMedium,
        device_id: &str,
    ) {
        let key = client_query_key(query);
        if self.unresponsive_reported.lock().insert(key) {
            self.emit(HubEvent::ClientUnresponsive {
                app: query.app.clone(),
                os: query.os,
                device: query.device.clone(),
                device_id: device_id.to_owned(),
                medium,
            });
        } else {
            warn!(
                app = %query.app,
                device = %query.device,
                "client still unresponsive after certificate exchange"
            );
        }
    }
}

impl ServerEvents for ControllerInner {
    fn on_listening(&self, port: u16) {
        self.emit(HubEvent::Listening { port });
    }

    fn on_connection_attempt(&self, query: &ClientQuery) {
        info!(app = %query.app, device_id = %query.device_id, "insecure connection attempt");
        self.tracker.lock().log_connection_attempt(query);
        self.emit(HubEvent::ClientSetupStart {
            app: app_name_with_update_hint(query),
            os: query.os,
            device: query.device.clone(),
        });
    }

    fn on_secure_connection_attempt(&self, query: &SecureClientQuery) {
        let inner = &query.query;
        // Without these gates the user would see a connection timeout
        // instead, which is much harder to track down.
        if inner.os == DeviceOs::Ios && !self.settings.enable_ios {
            error!(
                app = %inner.app,
                device_id = %inner.device_id,
                "refusing connection: iOS support is disabled in settings"
            );
            return;
        }
        if inner.os == DeviceOs::Android && !self.settings.enable_android {
            error!(
                app = %inner.app,
                device_id = %inner.device_id,
                "refusing connection: Android support is disabled in settings"
            );
            return;
        }

        self.tracker.lock().log_connection_attempt(inner);

        // The client came back; its unresponsive timer is moot.
        if let Some(timer) = self.unresponsive_timers.lock().remove(&client_query_key(inner)) {
            timer.abort();
        }
    }

    fn on_process_csr<'a>(
        &'a self,
        csr: &'a str,
        query: &'a ClientQuery,
        sandbox_dir: &'a str,
        medium: CertificateExchangeMedium,
    ) -> BoxFuture<'a, anyhow::Result<CertificateExchangeResult>> {
        Box::pin(async move {
            self.provider.verify_medium(medium)?;
            let result = self.provider.process_signing_request(query, csr, sandbox_dir).await?;
            debug!(device_id = %result.device_id, "csr processed");
            // If the client never reconnects securely, tell the user.
            self.arm_unresponsive_timer(query, medium, &result.device_id);
            Ok(result)
        })
    }

    fn on_connection_created(
        &self,
        query: SecureClientQuery,
        connection: Arc<dyn ClientConnection>,
    ) -> BoxFuture<'_, anyhow::Result<ClientDescription>> {
        Box::pin(async move {
            info!(
                app = %query.query.app,
                device_id = %query.query.device_id,
                medium = ?query.medium,
                "connection established"
            );
            let csr_query = CsrQuery { csr: query.csr, csr_path: query.csr_path };
            self.add_connection(connection, query.query, csr_query, false).await
        })
    }

    fn on_connection_closed(&self, id: &str) {
        self.remove_connection(id);
    }

    fn on_client_message(&self, id: &str, payload: &str) {
        self.emit(HubEvent::ClientMessage { id: id.to_owned(), payload: payload.to_owned() });
    }

    fn on_client_setup_error(&self, query: &ClientQuery, error: &anyhow::Error) {
        error!(app = %query.app, device = %query.device, err = %error, "client setup error");
        self.emit(HubEvent::ClientSetupError {
            app: app_name_with_update_hint(query),
            os: query.os,
            device: query.device.clone(),
            message: format!(
                "failed to set up {} on {}: {error}",
                query.app, query.device
            ),
        });
    }

    fn on_error(&self, error: anyhow::Error) {
        self.emit(HubEvent::ServerError { message: error.to_string() });
    }

    fn on_device_logs(&self, entries: Vec<ConnectionRecordEntry>) {
        for entry in entries {
            info!(
                time = %entry.time.to_rfc3339(),
                level = %entry.level,
                app = %entry.app,
                device = %entry.device,
                message = %entry.message,
                "device log"
            );
        }
    }
}

/// Clients that connect with an outdated SDK get a visible hint appended to
/// their app name.
fn app_name_with_update_hint(query: &ClientQuery) -> String {
    match query.sdk_version {
        Some(version) if version < 4 => format!("{} (Outdated SDK)", query.app),
        _ => query.app.clone(),
    }
}

/// Timer/dedup key for a connection attempt.
fn client_query_key(query: &ClientQuery) -> String {
    format!("{}/{}/{}/{}", query.app, query.os, query.device, query.device_id)
}

// ---------------------------------------------------------------------------
// Connection-loop detection
// ---------------------------------------------------------------------------

/// Sliding-window counter flagging suspected client reconnect loops.
/// Diagnostic only; never refuses a connection.
pub struct ConnectionTracker {
    time_window: Duration,
    threshold: usize,
    attempts: HashMap<String, Vec<tokio::time::Instant>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self { time_window: Duration::from_secs(20), threshold: 4, attempts: HashMap::new() }
    }

    /// Record an attempt; returns true when the key just crossed the
    /// loop-detection threshold.
    pub fn log_connection_attempt(&mut self, query: &ClientQuery) -> bool {
        let key = format!("{}-{}-{}", query.os, query.device, query.app);
        let now = tokio::time::Instant::now();
        let entry = self.attempts.entry(key.clone()).or_default();
        entry.push(now);
        entry.retain(|t| now.duration_since(*t) <= self.time_window);

        if entry.len() >= self.threshold {
            error!(
                key = %key,
                attempts = entry.len(),
                window_secs = self.time_window.as_secs(),
                "connection loop detected"
            );
            return true;
        }
        false
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
