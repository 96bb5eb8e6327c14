// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for wire-level end-to-end tests.
//!
//! Starts real server adapters on ephemeral ports against an in-process
//! registry backed by a stub certificate provider, and drives them with
//! plain tokio-tungstenite clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use periscope::adapter::browser::BrowserServer;
use periscope::adapter::socket::SocketServer;
use periscope::adapter::ws::WsServer;
use periscope::adapter::{ServerAdapter, ServerEvents};
use periscope::controller::{ControllerInner, HubSettings};
use periscope::events::HubEvent;
use periscope::test_support::StubCertificateProvider;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Which adapter family a test hub serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    SocketInsecure,
    WsInsecure,
    Browser,
}

/// One running adapter plus the registry behind it.
pub struct TestHub {
    pub registry: Arc<ControllerInner>,
    pub port: u16,
    adapter: Box<dyn ServerAdapter>,
}

impl TestHub {
    /// Start the given endpoint on an ephemeral port with a stub provider
    /// that resolves every CSR to device id `D1`.
    pub async fn start(endpoint: Endpoint) -> anyhow::Result<Self> {
        let registry =
            ControllerInner::new(HubSettings::default(), StubCertificateProvider::new("D1"));
        let events: Arc<dyn ServerEvents> = registry.clone();

        let mut adapter: Box<dyn ServerAdapter> = match endpoint {
            Endpoint::SocketInsecure => Box::new(SocketServer::new(events, "127.0.0.1")),
            Endpoint::WsInsecure => Box::new(WsServer::new(events, "127.0.0.1")),
            Endpoint::Browser => Box::new(BrowserServer::new(
                events,
                "127.0.0.1",
                vec!["http://localhost".to_owned()],
            )),
        };
        let port = adapter.start(0, None).await?;
        Ok(Self { registry, port, adapter })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.registry.subscribe()
    }

    /// Connect a WebSocket client with the given query string and origin.
    pub async fn connect(&self, query: &str, origin: Option<&str>) -> anyhow::Result<WsClient> {
        let url = format!("ws://127.0.0.1:{}/?{}", self.port, query);
        let mut request = url.into_client_request()?;
        if let Some(origin) = origin {
            request.headers_mut().insert("Origin", origin.parse()?);
        }
        let (client, _) =
            tokio::time::timeout(TIMEOUT, tokio_tungstenite::connect_async(request)).await??;
        Ok(client)
    }

    pub async fn stop(mut self) {
        self.adapter.stop().await;
    }
}

/// Send one text frame.
pub async fn send_text(client: &mut WsClient, text: impl Into<String>) -> anyhow::Result<()> {
    let text: String = text.into();
    client.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Await the next text frame, parsed as JSON.
pub async fn recv_json(client: &mut WsClient) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = tokio::time::timeout(remaining, client.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed while waiting for a frame"))??;
        if message.is_text() {
            let text = message.into_text()?;
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

/// Await the first hub event matching the predicate.
pub async fn expect_event(
    rx: &mut broadcast::Receiver<HubEvent>,
    mut predicate: impl FnMut(&HubEvent) -> bool,
) -> anyhow::Result<HubEvent> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = tokio::time::timeout(remaining, rx.recv()).await??;
        if predicate(&event) {
            return Ok(event);
        }
    }
}
