// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server adapters: one per transport+security combination.
//!
//! An adapter owns a listening endpoint and drives the connection state
//! machine: insecure connections only ever exchange certificates, secure
//! connections carry application traffic for an established client. All
//! effects flow through the [`ServerEvents`] listener; adapters know
//! nothing about the registry or the message router behind it.

pub mod browser;
pub mod socket;
pub mod ws;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::certs::CertificateExchangeResult;
use crate::connection::{ClientConnection, ConnectionStatus, Outbound, SessionConnection};
use crate::error::CloseCode;
use crate::wire::{
    parse_device_logs, parse_trusted_message, CertificateExchangeMedium, ClientDescription,
    ClientQuery, ConnectionRecordEntry, SecureClientQuery, TrustedMessage, UntrustedMessage,
};

/// Events triggered by a running server adapter interacting with clients.
///
/// The connection registry implements this; adapters treat it as their only
/// outlet.
pub trait ServerEvents: Send + Sync + 'static {
    /// The adapter is bound and accepting connections on `port`.
    fn on_listening(&self, port: u16);

    /// An insecure (certificate-exchange) connection attempt was made.
    fn on_connection_attempt(&self, query: &ClientQuery);

    /// A secure connection attempt was made with CSR provenance attached.
    fn on_secure_connection_attempt(&self, query: &SecureClientQuery);

    /// A CSR needs processing; resolves to the device identifier the
    /// client should adopt.
    fn on_process_csr<'a>(
        &'a self,
        csr: &'a str,
        query: &'a ClientQuery,
        sandbox_dir: &'a str,
        medium: CertificateExchangeMedium,
    ) -> BoxFuture<'a, anyhow::Result<CertificateExchangeResult>>;

    /// A secure connection was validated; resolves the durable client
    /// description once the registry has it.
    fn on_connection_created(
        &self,
        query: SecureClientQuery,
        connection: Arc<dyn ClientConnection>,
    ) -> BoxFuture<'_, anyhow::Result<ClientDescription>>;

    /// A connection with an established client has been closed.
    fn on_connection_closed(&self, id: &str);

    /// An execute message arrived for an established client.
    fn on_client_message(&self, id: &str, payload: &str);

    /// Certificate exchange failed for this client.
    fn on_client_setup_error(&self, query: &ClientQuery, error: &anyhow::Error);

    /// A transport-level error occurred.
    fn on_error(&self, error: anyhow::Error);

    /// Device-side log lines arrived alongside a CSR.
    fn on_device_logs(&self, entries: Vec<ConnectionRecordEntry>);
}

/// A listening endpoint bound to one transport+security combination.
pub trait ServerAdapter: Send {
    /// Bind and start serving. Pass port 0 for an ephemeral port; the bound
    /// port is returned either way. `tls` selects the secure flavor.
    fn start<'a>(
        &'a mut self,
        port: u16,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> BoxFuture<'a, anyhow::Result<u16>>;

    /// Stop accepting and tear down live connections.
    fn stop<'a>(&'a mut self) -> BoxFuture<'a, ()>;
}

// ---------------------------------------------------------------------------
// Insecure (certificate-exchange) handling
// ---------------------------------------------------------------------------

/// Handle one message received over an insecure connection. Only
/// certificate signing traffic is legal here. Returns the response to write
/// back, if any.
pub async fn handle_untrusted_message(
    listener: &Arc<dyn ServerEvents>,
    query: &ClientQuery,
    raw: &str,
) -> anyhow::Result<Option<String>> {
    let message: UntrustedMessage = serde_json::from_str(raw)?;
    match message {
        UntrustedMessage::SignCertificate { csr, destination, medium, timestamp, logs } => {
            let medium = CertificateExchangeMedium::from_wire(medium);
            info!(
                app = %query.app,
                device = %query.device,
                medium = ?medium,
                destination = %destination,
                "starting certificate exchange"
            );

            if !logs.is_empty() {
                listener.on_device_logs(parse_device_logs(query, medium, &logs));
            }

            if let Err(e) = verify_request_date(timestamp) {
                listener.on_client_setup_error(query, &e);
                return Ok(Some("{}".to_owned()));
            }

            match listener.on_process_csr(&csr, query, &destination, medium).await {
                Ok(result) => {
                    info!(
                        app = %query.app,
                        device_id = %result.device_id,
                        "exchanged certificate"
                    );
                    Ok(Some(json!({ "deviceId": result.device_id }).to_string()))
                }
                Err(e) => {
                    listener.on_client_setup_error(query, &e);
                    Ok(Some("{}".to_owned()))
                }
            }
        }
        UntrustedMessage::SignCertificateAck { logs } => {
            info!(app = %query.app, device = %query.device, "sign certificate ack received");
            if !logs.is_empty() {
                listener
                    .on_device_logs(parse_device_logs(query, CertificateExchangeMedium::FsAccess, &logs));
            }
            Ok(None)
        }
    }
}

/// A CSR generated on a different calendar day than the hub's clock points
/// at certificate verification failures down the line (device clock skew);
/// reject it with an actionable message.
fn verify_request_date(timestamp: Option<i64>) -> anyhow::Result<()> {
    let Some(millis) = timestamp else {
        return Ok(());
    };
    let Some(requested) = DateTime::<Utc>::from_timestamp_millis(millis) else {
        anyhow::bail!("certificate request carries an invalid timestamp: {millis}");
    };
    debug!(created_at = %requested.to_rfc3339(), "certificate request created");
    if requested.date_naive() != Utc::now().date_naive() {
        anyhow::bail!(
            "certificate request was generated on a different date than the current \
             system date; ensure the device's date and time match the host"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Secure session driver
// ---------------------------------------------------------------------------

enum Resolution {
    /// Client description not yet resolved; execute messages buffer here.
    Pending(Vec<String>),
    /// Established; messages dispatch directly under the client id.
    Ready(String),
    /// Resolution failed; the transport is being closed.
    Failed,
}

/// Shared state machine for an established (secure or browser) connection.
///
/// Owns the ordering guarantee around client resolution: execute messages
/// that arrive before [`ServerEvents::on_connection_created`] resolves are
/// buffered and replayed in arrival order, and later messages cannot
/// overtake them because both paths dispatch under the resolution lock.
pub(crate) struct SecureSession<C> {
    listener: Arc<dyn ServerEvents>,
    connection: Arc<C>,
    resolution: Mutex<Resolution>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl<C: SessionConnection + 'static> SecureSession<C> {
    /// Announce the secure attempt and kick off client resolution.
    pub fn establish(
        listener: Arc<dyn ServerEvents>,
        query: SecureClientQuery,
        connection: Arc<C>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        listener.on_secure_connection_attempt(&query);

        let session = Arc::new(Self {
            listener,
            connection,
            resolution: Mutex::new(Resolution::Pending(Vec::new())),
            outbound,
        });

        let task = Arc::clone(&session);
        tokio::spawn(async move {
            let connection: Arc<dyn ClientConnection> = task.connection.clone();
            let app = query.query.app.clone();
            match task.listener.on_connection_created(query, connection).await {
                Ok(description) => {
                    let mut resolution = task.resolution.lock();
                    let buffered = match std::mem::replace(
                        &mut *resolution,
                        Resolution::Ready(description.id.clone()),
                    ) {
                        Resolution::Pending(buffered) => buffered,
                        other => {
                            *resolution = other;
                            return;
                        }
                    };
                    for raw in buffered {
                        task.listener.on_client_message(&description.id, &raw);
                    }
                }
                Err(e) => {
                    error!(app = %app, err = %e, "failed to initialize client");
                    *task.resolution.lock() = Resolution::Failed;
                    let _ = task
                        .outbound
                        .send(Outbound::Close(CloseCode::InternalError.as_u16()));
                }
            }
        });

        session
    }

    /// Process one raw inbound frame from the transport.
    pub fn on_raw_message(&self, raw: &str) {
        match parse_trusted_message(raw) {
            Ok(TrustedMessage::Response(response)) => {
                if let Err(e) = self.connection.resolve_response(response) {
                    warn!(err = %e, "failed to match inbound response");
                    self.listener.on_error(e);
                }
            }
            Ok(TrustedMessage::Execute(_)) => {
                // Dispatch under the lock so buffered replay and direct
                // dispatch cannot reorder.
                let mut resolution = self.resolution.lock();
                match &mut *resolution {
                    Resolution::Pending(buffered) => buffered.push(raw.to_owned()),
                    Resolution::Ready(id) => self.listener.on_client_message(id, raw),
                    Resolution::Failed => {}
                }
            }
            Err(e) => {
                // An individual bad message does not kill the connection;
                // other plugins on it may still be healthy.
                warn!(err = %e, "failed to handle client message");
                self.listener.on_error(e);
            }
        }
    }

    /// The transport went away; fan the status out to the registry.
    pub fn on_transport_closed(&self, status: ConnectionStatus) {
        self.connection.notify_status(status);
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
