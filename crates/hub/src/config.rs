// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::controller::{HubSettings, ServerPorts};

/// App inspection hub: accepts client connections and routes their events.
#[derive(Debug, Parser)]
#[command(name = "periscope", version, about)]
pub struct Config {
    /// Host address to bind to.
    #[arg(long, env = "PERISCOPE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Insecure (certificate-exchange) socket port.
    #[arg(long, env = "PERISCOPE_INSECURE_PORT", default_value = "9089")]
    pub insecure_port: u16,

    /// Secure (TLS) socket port.
    #[arg(long, env = "PERISCOPE_SECURE_PORT", default_value = "9088")]
    pub secure_port: u16,

    /// Alternate insecure WebSocket port. 0 disables.
    #[arg(long, env = "PERISCOPE_ALT_INSECURE_PORT", default_value = "9091")]
    pub alt_insecure_port: u16,

    /// Alternate secure WebSocket port. 0 disables.
    #[arg(long, env = "PERISCOPE_ALT_SECURE_PORT", default_value = "9090")]
    pub alt_secure_port: u16,

    /// Browser-only insecure WebSocket port. 0 disables.
    #[arg(long, env = "PERISCOPE_BROWSER_PORT", default_value = "9333")]
    pub browser_port: u16,

    /// Directory holding ca.crt, ca.key, server.crt, and server.key.
    #[arg(long, env = "PERISCOPE_CERT_DIR", default_value = "certs")]
    pub cert_dir: PathBuf,

    /// Refuse connections from Android clients.
    #[arg(long, env = "PERISCOPE_DISABLE_ANDROID")]
    pub disable_android: bool,

    /// Refuse connections from iOS clients.
    #[arg(long, env = "PERISCOPE_DISABLE_IOS")]
    pub disable_ios: bool,

    /// Origin prefixes allowed on the browser port (comma separated).
    #[arg(
        long,
        env = "PERISCOPE_BROWSER_ORIGINS",
        default_value = "http://localhost,https://localhost,chrome-extension://",
        value_delimiter = ','
    )]
    pub browser_origins: Vec<String>,

    /// Per-plugin message queue bound.
    #[arg(long, env = "PERISCOPE_MAX_QUEUE_SIZE", default_value = "10000")]
    pub max_queue_size: usize,

    /// Log format (json or text).
    #[arg(long, env = "PERISCOPE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PERISCOPE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("--max-queue-size must be positive");
        }
        if self.insecure_port == 0 && self.alt_insecure_port == 0 && self.browser_port == 0 {
            anyhow::bail!("at least one listening port must be enabled");
        }
        Ok(())
    }

    /// Controller settings derived from the CLI surface. Port 0 disables an
    /// endpoint.
    pub fn hub_settings(&self) -> HubSettings {
        let port = |p: u16| (p != 0).then_some(p);
        HubSettings {
            host: self.host.clone(),
            ports: ServerPorts {
                insecure: port(self.insecure_port),
                secure: port(self.secure_port),
                alt_insecure: port(self.alt_insecure_port),
                alt_secure: port(self.alt_secure_port),
                browser: port(self.browser_port),
            },
            cert_dir: self.cert_dir.clone(),
            enable_android: !self.disable_android,
            enable_ios: !self.disable_ios,
            allowed_browser_origins: self.browser_origins.clone(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
