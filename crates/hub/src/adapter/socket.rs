// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket-family server adapter: WebSocket over raw TCP, with TLS for the
//! secure flavor.
//!
//! The secure listener wraps accepted TCP streams in rustls before the
//! WebSocket handshake; client certificates are verified at the TLS layer,
//! so by the time the adapter sees a connection the transport has already
//! authenticated it.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{handle_untrusted_message, SecureSession, ServerAdapter, ServerEvents};
use crate::connection::{ConnectionStatus, Outbound, WsClientConnection};
use crate::wire::{decode_query_string, parse_client_query, parse_secure_client_query};

/// WebSocket server over plain TCP (insecure) or TLS (secure).
pub struct SocketServer {
    events: Arc<dyn ServerEvents>,
    host: String,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SocketServer {
    pub fn new(events: Arc<dyn ServerEvents>, host: impl Into<String>) -> Self {
        Self { events, host: host.into(), shutdown: CancellationToken::new(), handle: None }
    }
}

impl ServerAdapter for SocketServer {
    fn start<'a>(
        &'a mut self,
        port: u16,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> BoxFuture<'a, anyhow::Result<u16>> {
        Box::pin(async move {
            let listener = TcpListener::bind((self.host.as_str(), port)).await?;
            let bound = listener.local_addr()?.port();
            info!(port = bound, secure = tls.is_some(), "socket server listening");
            self.events.on_listening(bound);

            let events = Arc::clone(&self.events);
            let shutdown = self.shutdown.clone();
            let acceptor = tls.map(TlsAcceptor::from);

            self.handle = Some(tokio::spawn(async move {
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
                    let events = Arc::clone(&events);
                    let shutdown = shutdown.clone();
                    match acceptor.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(stream) => {
                                        serve_connection(events, stream, true, shutdown).await;
                                    }
                                    Err(e) => {
                                        debug!(%peer, err = %e, "tls handshake failed");
                                    }
                                }
                            });
                        }
                        None => {
                            tokio::spawn(serve_connection(events, stream, false, shutdown));
                        }
                    }
                }
            }));

            Ok(bound)
        })
    }

    fn stop<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!("stopping socket server");
            self.shutdown.cancel();
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        })
    }
}

/// Upgrade one accepted stream to a WebSocket and run the appropriate
/// connection state machine.
async fn serve_connection<S>(
    events: Arc<dyn ServerEvents>,
    stream: S,
    secure: bool,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut params = None;
    let callback = |request: &Request, response: Response| {
        params = request.uri().query().map(decode_query_string);
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(err = %e, "websocket handshake failed");
            return;
        }
    };
    let params = params.unwrap_or_default();

    if secure {
        serve_secure(events, ws, params, shutdown).await;
    } else {
        serve_insecure(events, ws, params, shutdown).await;
    }
}

/// Insecure connection loop: certificate exchange only.
async fn serve_insecure<S>(
    events: Arc<dyn ServerEvents>,
    ws: WebSocketStream<S>,
    params: std::collections::HashMap<String, String>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // If the query cannot be extracted, this may not even be a client of
    // ours; close without raising an error event.
    let Some(query) = parse_client_query(&params) else {
        warn!("unable to extract client query from the request url");
        return;
    };
    events.on_connection_attempt(&query);

    let (mut sink, mut source) = ws.split();
    loop {
        let inbound = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: WsCloseCode::Away,
                        reason: "".into(),
                    })))
                    .await;
                return;
            }
            inbound = source.next() => inbound,
        };
        match inbound {
            Some(Ok(message)) if message.is_text() => {
                let Ok(text) = message.into_text() else { continue };
                match handle_untrusted_message(&events, &query, &text).await {
                    Ok(Some(response)) => {
                        if sink.send(Message::Text(response.into())).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    // A single garbled message does not warrant closing
                    // the connection.
                    Err(e) => error!(err = %e, "failed to handle message"),
                }
            }
            Some(Ok(message)) if message.is_close() => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                events.on_error(anyhow::anyhow!("connection error: {e}"));
                return;
            }
            None => return,
        }
    }
}

/// Secure connection loop: application traffic for an established client.
async fn serve_secure<S>(
    events: Arc<dyn ServerEvents>,
    ws: WebSocketStream<S>,
    params: std::collections::HashMap<String, String>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(query) = parse_secure_client_query(&params) else {
        warn!("unable to extract secure client query from the request url");
        return;
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(WsClientConnection::new(outbound_tx.clone()));
    let session =
        SecureSession::establish(Arc::clone(&events), query, connection, outbound_tx);

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: WsCloseCode::Away,
                        reason: "".into(),
                    })))
                    .await;
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
                        .send(Message::Close(Some(CloseFrame {
                            code: WsCloseCode::from(code),
                            reason: "".into(),
                        })))
                        .await;
                    session.on_transport_closed(ConnectionStatus::Closed);
                    return;
                }
                None => return,
            },
            inbound = source.next() => match inbound {
                Some(Ok(message)) if message.is_text() => {
                    if let Ok(text) = message.into_text() {
                        session.on_raw_message(&text);
                    }
                }
                Some(Ok(message)) if message.is_close() => {
                    session.on_transport_closed(ConnectionStatus::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.on_error(anyhow::anyhow!("connection error: {e}"));
                    session.on_transport_closed(ConnectionStatus::Error);
                    return;
                }
                None => {
                    session.on_transport_closed(ConnectionStatus::Closed);
                    return;
                }
            },
        }
    }
}
