// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::future::BoxFuture;
use tracing::{error, info};

use periscope::certs::{CertificateAuthority, CertificateDeployer, FsCertificateProvider};
use periscope::config::Config;
use periscope::controller::ServerController;
use periscope::events::HubEvent;
use periscope::queue::{MessageRouter, StatsRegistry};
use periscope::store::Store;
use periscope::wire::ClientQuery;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_format.as_str() {
        "json" => {
            fmt::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt::fmt().with_env_filter(filter).init();
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let authority = CertificateAuthority::new(&config.cert_dir);
    let deployer = Arc::new(StagingDeployer { dir: config.cert_dir.join("staging") });
    let provider = Arc::new(FsCertificateProvider::new(authority, deployer));

    let mut controller = ServerController::new(config.hub_settings(), provider);

    // Route client messages into the per-plugin queues. Plugins register
    // with the router as they are loaded by the embedding UI.
    let store = Arc::new(Store::new());
    let stats = Arc::new(StatsRegistry::new());
    let router = Arc::new(MessageRouter::new(store, stats));
    let mut events = controller.subscribe();
    let event_router = Arc::clone(&router);
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                HubEvent::ClientMessage { id, payload } => {
                    event_router.handle_client_message(&id, &payload);
                }
                HubEvent::ClientConnected { client } => {
                    info!(id = %client.id, "client connected");
                }
                HubEvent::ClientDisconnected { id } => {
                    event_router.store().clear_client_queues(&id);
                    info!(id = %id, "client disconnected");
                }
                HubEvent::ClientUnresponsive { app, device, .. } => {
                    error!(app = %app, device = %device, "client is unresponsive after certificate exchange");
                }
                HubEvent::ClientSetupError { message, .. } => {
                    error!("{message}");
                }
                _ => {}
            }
        }
    });

    let bound = controller.start().await?;
    for (label, port) in &bound {
        info!(endpoint = *label, port = *port, "listening");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    controller.stop().await;
    Ok(())
}

/// Default deployment strategy for the standalone binary: stage certificate
/// files on local disk instead of pushing them to a device bridge.
struct StagingDeployer {
    dir: PathBuf,
}

impl CertificateDeployer for StagingDeployer {
    fn deploy_file<'a>(
        &'a self,
        query: &'a ClientQuery,
        _destination: &'a str,
        filename: &'a str,
        contents: &'a str,
        _csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let target = self.dir.join(&query.app);
            tokio::fs::create_dir_all(&target).await?;
            tokio::fs::write(target.join(filename), contents).await?;
            Ok(())
        })
    }

    fn target_device_id<'a>(
        &'a self,
        query: &'a ClientQuery,
        _app_name: &'a str,
        _csr_path: &'a str,
        _csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            // Without a device bridge the reported id is authoritative; mint
            // one for clients that have none yet.
            if query.device_id.is_empty() {
                return Ok(uuid::Uuid::new_v4().to_string());
            }
            Ok(query.device_id.clone())
        })
    }
}
