// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hub lifecycle and data events.
//!
//! The controller publishes these on a broadcast channel; the embedding
//! application subscribes to drive its device model, notifications, and
//! message routing.

use serde::{Deserialize, Serialize};

use crate::wire::{CertificateExchangeMedium, ClientDescription, DeviceOs};

/// Events emitted by the connection registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A server adapter is accepting connections on `port`.
    Listening { port: u16 },
    /// A client began the certificate-exchange handshake.
    ClientSetupStart { app: String, os: DeviceOs, device: String },
    /// A secure connection was registered.
    ClientConnected { client: ClientDescription },
    /// A registered connection went away.
    ClientDisconnected { id: String },
    /// An execute message arrived for a registered client.
    ClientMessage { id: String, payload: String },
    /// Certificate exchange failed; `message` is human-readable and names
    /// the offending app and device.
    ClientSetupError { app: String, os: DeviceOs, device: String, message: String },
    /// A client exchanged certificates but never reconnected securely.
    ClientUnresponsive {
        app: String,
        os: DeviceOs,
        device: String,
        device_id: String,
        medium: CertificateExchangeMedium,
    },
    /// A transport-level error surfaced from an adapter.
    ServerError { message: String },
}
