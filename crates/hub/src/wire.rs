// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire message shapes and client identity types.
//!
//! Everything that crosses a client transport is JSON. Inbound traffic on an
//! insecure (certificate-exchange) connection parses as [`UntrustedMessage`];
//! traffic on an established connection parses as [`TrustedMessage`]. The
//! browser transport additionally speaks a legacy dialect that its adapter
//! normalizes into these shapes before dispatch.

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client identity
// ---------------------------------------------------------------------------

/// Operating systems a client may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceOs {
    Android,
    #[serde(rename = "iOS")]
    Ios,
    Windows,
    #[serde(rename = "MacOS")]
    MacOs,
    Metro,
    #[serde(rename = "JSWebApp")]
    JsWebApp,
}

impl DeviceOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "Android",
            Self::Ios => "iOS",
            Self::Windows => "Windows",
            Self::MacOs => "MacOS",
            Self::Metro => "Metro",
            Self::JsWebApp => "JSWebApp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Android" => Some(Self::Android),
            "iOS" => Some(Self::Ios),
            "Windows" => Some(Self::Windows),
            "MacOS" => Some(Self::MacOs),
            "Metro" => Some(Self::Metro),
            "JSWebApp" => Some(Self::JsWebApp),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a connecting application process. Immutable once a connection
/// is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientQuery {
    pub app: String,
    pub os: DeviceOs,
    pub device: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<u32>,
}

/// Durable identifier for a connected client.
pub fn build_client_id(query: &ClientQuery) -> String {
    format!("{}#{}#{}#{}", query.app, query.os, query.device, query.device_id)
}

/// Composite key scoping plugin state and queues to one plugin on one client.
pub fn build_plugin_key(client_id: &str, plugin_id: &str) -> String {
    format!("{client_id}#{plugin_id}")
}

/// The durable handle for a connected application process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescription {
    pub id: String,
    pub query: ClientQuery,
}

/// Channel used for certificate exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateExchangeMedium {
    FsAccess,
    Www,
    None,
}

impl CertificateExchangeMedium {
    /// Older client SDKs omit the medium; absent or unknown values mean
    /// filesystem exchange.
    pub fn from_wire(raw: Option<u8>) -> Self {
        match raw {
            Some(2) => Self::Www,
            Some(3) => Self::None,
            _ => Self::FsAccess,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::FsAccess => 1,
            Self::Www => 2,
            Self::None => 3,
        }
    }
}

/// [`ClientQuery`] plus certificate-exchange provenance, as presented on a
/// secure connection attempt. Lives only for the duration of the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureClientQuery {
    pub query: ClientQuery,
    pub csr: Option<String>,
    pub csr_path: Option<String>,
    pub medium: CertificateExchangeMedium,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Messages accepted on an insecure (certificate-exchange) connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum UntrustedMessage {
    SignCertificate {
        csr: String,
        /// Filesystem destination for the deployed certificates (the app
        /// sandbox path), or an opaque token for non-filesystem mediums.
        destination: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        medium: Option<u8>,
        /// Client-side request creation time (epoch milliseconds).
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        /// Device-side log lines in `<epoch_ms>:<level>:<message>` form.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        logs: Vec<String>,
    },
    SignCertificateAck {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        logs: Vec<String>,
    },
}

/// `execute` payload: a plugin API call originating on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteParams {
    pub api: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteMessage {
    pub method: String,
    pub params: ExecuteParams,
}

impl ExecuteMessage {
    pub fn new(params: ExecuteParams) -> Self {
        Self { method: "execute".to_owned(), params }
    }
}

/// Error payload carried by a failed [`ResponseMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorPayload {}

/// Reply to a request previously sent with an `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Request for the client's plugin list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPluginsMessage {
    pub id: u64,
    pub method: String,
}

impl GetPluginsMessage {
    pub const METHOD: &'static str = "getPlugins";

    pub fn new(id: u64) -> Self {
        Self { id, method: Self::METHOD.to_owned() }
    }
}

/// Messages accepted on an established (trusted) connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TrustedMessage {
    /// Carries an `id`: a reply to one of our in-flight requests.
    Response(ResponseMessage),
    /// A plugin API call to forward to the message router.
    Execute(ExecuteMessage),
}

/// Classify an inbound trusted-channel message by shape: anything carrying
/// an `id` is a response, `execute` methods are client calls, the rest is a
/// protocol error.
pub fn parse_trusted_message(raw: &str) -> anyhow::Result<TrustedMessage> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if value.get("id").is_some_and(|id| !id.is_null()) {
        let response: ResponseMessage = serde_json::from_value(value)?;
        return Ok(TrustedMessage::Response(response));
    }
    match value.get("method").and_then(|m| m.as_str()) {
        Some("execute") => Ok(TrustedMessage::Execute(serde_json::from_value(value)?)),
        Some(other) => anyhow::bail!("unknown message method: {other}"),
        None => anyhow::bail!("message carries neither id nor method"),
    }
}

// ---------------------------------------------------------------------------
// Query-string parsing
// ---------------------------------------------------------------------------

/// Default sdk version assumed for legacy browser clients.
pub const LEGACY_SDK_VERSION: u32 = 4;

/// Parse the modern connection parameters (`device_id`, `device`, `app`,
/// `os`, `sdk_version`) from upgrade-request query parameters.
pub fn parse_client_query(params: &HashMap<String, String>) -> Option<ClientQuery> {
    let device_id = params.get("device_id")?.clone();
    let device = params.get("device")?.clone();
    let app = params.get("app")?.clone();
    let os = DeviceOs::parse(params.get("os")?)?;
    let sdk_version = params.get("sdk_version").and_then(|v| v.parse().ok());
    Some(ClientQuery { app, os, device, device_id, sdk_version })
}

/// Parse the secure-connection parameters: the modern set plus base64 `csr`,
/// `csr_path`, and numeric `medium`.
pub fn parse_secure_client_query(params: &HashMap<String, String>) -> Option<SecureClientQuery> {
    let query = parse_client_query(params)?;
    let csr = params.get("csr").and_then(|raw| {
        let bytes = base64::engine::general_purpose::STANDARD.decode(raw).ok()?;
        String::from_utf8(bytes).ok()
    });
    let csr_path = params.get("csr_path").cloned();
    let medium =
        CertificateExchangeMedium::from_wire(params.get("medium").and_then(|m| m.parse().ok()));
    Some(SecureClientQuery { query, csr, csr_path, medium })
}

/// Parse browser connection parameters. Falls back to the legacy `deviceId`
/// and `device` keys, defaulting the rest.
pub fn parse_browser_client_query(params: &HashMap<String, String>) -> ClientQuery {
    if let Some(query) = parse_client_query(params) {
        return query;
    }
    let device_id = params
        .get("deviceId")
        .cloned()
        .unwrap_or_else(|| "webbrowser".to_owned());
    let device = params.get("device").cloned().unwrap_or_else(|| "WebSocket".to_owned());
    ClientQuery {
        app: device.clone(),
        os: DeviceOs::MacOs,
        device,
        device_id,
        sdk_version: Some(LEGACY_SDK_VERSION),
    }
}

/// Decode a URI query string into a key/value map.
pub fn decode_query_string(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

// ---------------------------------------------------------------------------
// Device logs
// ---------------------------------------------------------------------------

/// One device-side log line forwarded during certificate exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecordEntry {
    pub time: DateTime<Utc>,
    pub level: String,
    pub os: DeviceOs,
    pub device: String,
    pub app: String,
    pub message: String,
    pub medium: CertificateExchangeMedium,
}

/// Parse `<epoch_ms>:<level>:<message>` log lines sent alongside a CSR.
/// Unparseable lines are skipped.
pub fn parse_device_logs(
    query: &ClientQuery,
    medium: CertificateExchangeMedium,
    logs: &[String],
) -> Vec<ConnectionRecordEntry> {
    let Some(pattern) = device_log_pattern() else {
        return Vec::new();
    };
    logs.iter()
        .filter_map(|line| {
            let caps = pattern.captures(line)?;
            let millis: i64 = caps.get(1)?.as_str().parse().ok()?;
            let time = DateTime::<Utc>::from_timestamp_millis(millis)?;
            Some(ConnectionRecordEntry {
                time,
                level: caps.get(2)?.as_str().to_owned(),
                os: query.os,
                device: query.device.clone(),
                app: query.app.clone(),
                message: caps.get(3)?.as_str().to_owned(),
                medium,
            })
        })
        .collect()
}

fn device_log_pattern() -> Option<&'static regex::Regex> {
    static PATTERN: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"^(\d+):(info|warning|error):(.*)$").ok())
        .as_ref()
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
