// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Browser-family server adapter.
//!
//! Browser clients connect without certificates (medium `NONE`): the
//! connection is attempted, secured, and established in one step on
//! upgrade. The adapter verifies the request origin and transparently
//! normalizes the legacy dialect (`{app, type: "connect", plugins}` and
//! `{app, payload}`) into modern messages before dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{SecureSession, ServerAdapter, ServerEvents};
use crate::connection::{
    BrowserClientConnection, ClientConnection, ConnectionStatus, Outbound, SessionConnection,
};
use crate::wire::{
    parse_browser_client_query, CertificateExchangeMedium, ResponseMessage, SecureClientQuery,
};

#[derive(Clone)]
struct BrowserState {
    events: Arc<dyn ServerEvents>,
    allowed_origins: Arc<Vec<String>>,
    shutdown: CancellationToken,
}

/// Insecure WebSocket server for local browser clients.
pub struct BrowserServer {
    events: Arc<dyn ServerEvents>,
    host: String,
    allowed_origins: Arc<Vec<String>>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BrowserServer {
    pub fn new(
        events: Arc<dyn ServerEvents>,
        host: impl Into<String>,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            events,
            host: host.into(),
            allowed_origins: Arc::new(allowed_origins),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }
}

impl ServerAdapter for BrowserServer {
    fn start<'a>(
        &'a mut self,
        port: u16,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> BoxFuture<'a, anyhow::Result<u16>> {
        Box::pin(async move {
            if tls.is_some() {
                anyhow::bail!("the browser server only supports insecure connections");
            }
            let listener = TcpListener::bind((self.host.as_str(), port)).await?;
            let bound = listener.local_addr()?.port();
            info!(port = bound, "browser server listening");
            self.events.on_listening(bound);

            let state = BrowserState {
                events: Arc::clone(&self.events),
                allowed_origins: Arc::clone(&self.allowed_origins),
                shutdown: self.shutdown.clone(),
            };
            let router = Router::new().route("/", any(ws_handler)).with_state(state);
            let shutdown = self.shutdown.clone();
            self.handle = Some(tokio::spawn(async move {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await;
                if let Err(e) = result {
                    error!(err = %e, "browser server error");
                }
            }));

            Ok(bound)
        })
    }

    fn stop<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!("stopping browser server");
            self.shutdown.cancel();
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        })
    }
}

fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    origin.is_some_and(|origin| allowed.iter().any(|prefix| origin.starts_with(prefix)))
}

async fn ws_handler(
    State(state): State<BrowserState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, &state.allowed_origins) {
        warn!(origin = origin.unwrap_or("<none>"), "refused websocket connection");
        return StatusCode::FORBIDDEN.into_response();
    }

    let query = parse_browser_client_query(&params);
    state.events.on_connection_attempt(&query);
    ws.on_upgrade(move |socket| handle_connection(state, query, socket)).into_response()
}

async fn handle_connection(
    state: BrowserState,
    query: crate::wire::ClientQuery,
    socket: WebSocket,
) {
    info!(app = %query.app, device_id = %query.device_id, "browser connection established");

    let secure_query = SecureClientQuery {
        query: query.clone(),
        csr: None,
        csr_path: None,
        medium: CertificateExchangeMedium::None,
    };
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection =
        Arc::new(BrowserClientConnection::new(outbound_tx.clone(), query.app.clone()));
    let session = SecureSession::establish(
        Arc::clone(&state.events),
        secure_query,
        Arc::clone(&connection),
        outbound_tx,
    );

    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                session.on_transport_closed(ConnectionStatus::Closed);
                return;
            }
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        session.on_transport_closed(ConnectionStatus::Error);
                        return;
                    }
                }
                Some(Outbound::Close(code)) => {
                    let _ = sink
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    session.on_transport_closed(ConnectionStatus::Closed);
                    return;
                }
                None => return,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if handle_browser_message(&connection, &session, &text) {
                        connection.close();
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    session.on_transport_closed(ConnectionStatus::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(err = %e, "browser connection error");
                    session.on_transport_closed(ConnectionStatus::Error);
                    return;
                }
            },
        }
    }
}

/// Normalize one browser frame. Returns true when the client asked to
/// disconnect.
fn handle_browser_message(
    connection: &BrowserClientConnection,
    session: &SecureSession<BrowserClientConnection>,
    raw: &str,
) -> bool {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            debug!(err = %e, "received message is not valid json");
            return false;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("connect") => {
            let plugins = value.get("plugins").and_then(Value::as_array).map(|list| {
                list.iter().filter_map(|p| p.as_str().map(str::to_owned)).collect()
            });
            connection.handle_legacy_connect(plugins);
            false
        }
        Some("disconnect") => true,
        _ => {
            if let Some(payload) = value.get("payload") {
                // Legacy envelope. A payload with an id is a response to
                // one of our requests; anything else is client traffic.
                if payload.get("id").is_some_and(|id| !id.is_null()) {
                    match serde_json::from_value::<ResponseMessage>(payload.clone()) {
                        Ok(response) => {
                            if let Err(e) = connection.resolve_response(response) {
                                debug!(err = %e, "failed to match legacy response");
                            }
                        }
                        Err(e) => debug!(err = %e, "malformed legacy response payload"),
                    }
                } else {
                    session.on_raw_message(&payload.to_string());
                }
            } else {
                session.on_raw_message(raw);
            }
            false
        }
    }
}

#[cfg(test)]
#[path = "browser_tests.rs"]
mod tests;
