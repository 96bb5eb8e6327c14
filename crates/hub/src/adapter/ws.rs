// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alternate ws-family server adapter, built on axum.
//!
//! Serves the same protocol as the socket family over an axum router. The
//! insecure flavor goes through `axum::serve`; the secure flavor accepts
//! TCP itself, wraps each stream in rustls, and feeds the router through
//! hyper-util so TLS termination stays in-process.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{handle_untrusted_message, SecureSession, ServerAdapter, ServerEvents};
use crate::connection::{ConnectionStatus, Outbound, WsClientConnection};
use crate::wire::{parse_client_query, parse_secure_client_query};

#[derive(Clone)]
struct WsState {
    events: Arc<dyn ServerEvents>,
    secure: bool,
    shutdown: CancellationToken,
}

/// Axum-backed WebSocket server; TLS-terminating when started with a
/// rustls config.
pub struct WsServer {
    events: Arc<dyn ServerEvents>,
    host: String,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WsServer {
    pub fn new(events: Arc<dyn ServerEvents>, host: impl Into<String>) -> Self {
        Self { events, host: host.into(), shutdown: CancellationToken::new(), handle: None }
    }
}

impl ServerAdapter for WsServer {
    fn start<'a>(
        &'a mut self,
        port: u16,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> BoxFuture<'a, anyhow::Result<u16>> {
        Box::pin(async move {
            let listener = TcpListener::bind((self.host.as_str(), port)).await?;
            let bound = listener.local_addr()?.port();
            info!(port = bound, secure = tls.is_some(), "ws server listening");
            self.events.on_listening(bound);

            let state = WsState {
                events: Arc::clone(&self.events),
                secure: tls.is_some(),
                shutdown: self.shutdown.clone(),
            };
            let router = Router::new().route("/", any(ws_handler)).with_state(state);
            let shutdown = self.shutdown.clone();

            self.handle = Some(match tls {
                None => tokio::spawn(async move {
                    let result = axum::serve(listener, router)
                        .with_graceful_shutdown(shutdown.cancelled_owned())
                        .await;
                    if let Err(e) = result {
                        error!(err = %e, "ws server error");
                    }
                }),
                Some(config) => {
                    let acceptor = TlsAcceptor::from(config);
                    tokio::spawn(serve_tls(listener, acceptor, router, shutdown))
                }
            });

            Ok(bound)
        })
    }

    fn stop<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!("stopping ws server");
            self.shutdown.cancel();
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        })
    }
}

/// Accept TCP, terminate TLS, and hand each stream to the router through
/// hyper-util.
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) {
    let mut make_svc = router.into_make_service();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                debug!(err = %e, "tcp accept error");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        // IntoMakeService implements Service<T> for any T
        let svc_future = <_ as tower::Service<_>>::call(&mut make_svc, ());
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, err = %e, "tls handshake failed");
                    return;
                }
            };
            let Ok(svc) = svc_future.await;
            let io = hyper_util::rt::TokioIo::new(stream);
            let hyper_svc = hyper_util::service::TowerToHyperService::new(svc);
            let _ = hyper_util::server::conn::auto::Builder::new(
                hyper_util::rt::TokioExecutor::new(),
            )
            .serve_connection_with_upgrades(io, hyper_svc)
            .await;
        });
    }
}

async fn ws_handler(
    State(state): State<WsState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, params, socket))
}

async fn handle_connection(state: WsState, params: HashMap<String, String>, socket: WebSocket) {
    if state.secure {
        serve_secure(state, params, socket).await;
    } else {
        serve_insecure(state, params, socket).await;
    }
}

/// Insecure connection loop: certificate exchange only.
async fn serve_insecure(state: WsState, params: HashMap<String, String>, socket: WebSocket) {
    let Some(query) = parse_client_query(&params) else {
        warn!("unable to extract client query from the request url");
        return;
    };
    state.events.on_connection_attempt(&query);

    let (mut sink, mut source) = socket.split();
    loop {
        let inbound = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            inbound = source.next() => inbound,
        };
        match inbound {
            Some(Ok(Message::Text(text))) => {
                match handle_untrusted_message(&state.events, &query, &text).await {
                    Ok(Some(response)) => {
                        if sink.send(Message::Text(response.into())).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!(err = %e, "failed to handle message"),
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                state.events.on_error(anyhow::anyhow!("connection error: {e}"));
                return;
            }
        }
    }
}

/// Secure connection loop: application traffic for an established client.
async fn serve_secure(state: WsState, params: HashMap<String, String>, socket: WebSocket) {
    let Some(query) = parse_secure_client_query(&params) else {
        warn!("unable to extract secure client query from the request url");
        return;
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(WsClientConnection::new(outbound_tx.clone()));
    let session =
        SecureSession::establish(Arc::clone(&state.events), query, connection, outbound_tx);

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
                Some(Ok(Message::Text(text))) => session.on_raw_message(&text),
                Some(Ok(Message::Close(_))) | None => {
                    session.on_transport_closed(ConnectionStatus::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    state.events.on_error(anyhow::anyhow!("connection error: {e}"));
                    session.on_transport_closed(ConnectionStatus::Error);
                    return;
                }
            },
        }
    }
}
