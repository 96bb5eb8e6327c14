// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Certificate exchange.
//!
//! Clients prove their identity with a certificate signed by the hub CA.
//! The per-OS mechanics of pushing certificates onto a device are injected
//! behind [`CertificateProvider`]; this module owns the pieces every
//! provider shares: CSR sanitization, the openssl-backed signing authority,
//! and the TLS server configuration for the secure listeners.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use futures_util::future::BoxFuture;
use ring::digest;
use tokio::process::Command;
use tracing::{debug, info};

use crate::wire::{CertificateExchangeMedium, ClientQuery};

/// File names used for staged device certificates.
pub const DEVICE_CA_CERT_FILE: &str = "hubCA.crt";
pub const DEVICE_CLIENT_CERT_FILE: &str = "device.crt";

/// Successful outcome of a certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateExchangeResult {
    pub device_id: String,
}

/// Per-OS certificate deployment strategy.
///
/// Implementations know how to find the target device for a CSR and how to
/// place certificate files into the requesting app's sandbox. Everything
/// device-specific lives behind this trait.
pub trait CertificateProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn medium(&self) -> CertificateExchangeMedium;

    /// Reject mediums this provider cannot serve.
    fn verify_medium(&self, medium: CertificateExchangeMedium) -> anyhow::Result<()> {
        if self.medium() != medium {
            anyhow::bail!("{} does not support medium {medium:?}", self.name());
        }
        Ok(())
    }

    /// Process a CSR end to end: issue certificates, deploy them, and
    /// resolve the device identifier the client should adopt.
    fn process_signing_request<'a>(
        &'a self,
        query: &'a ClientQuery,
        csr: &'a str,
        sandbox_dir: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<CertificateExchangeResult>>;

    /// Resolve which known device produced `csr`. Used on reconnect when a
    /// client's reported device id cannot be trusted (Android device ids
    /// may change between the insecure and secure attempts).
    fn get_target_device_id<'a>(
        &'a self,
        query: &'a ClientQuery,
        app_name: &'a str,
        csr_path: &'a str,
        csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Extract the requesting app's bundle identifier from a CSR.
    fn extract_app_name_from_csr<'a>(&'a self, csr: &'a str)
        -> BoxFuture<'a, anyhow::Result<String>>;
}

/// Strip carriage returns and surrounding whitespace from a CSR as sent by
/// assorted client SDKs. An empty result is a protocol error.
pub fn sanitize_csr(raw: &str) -> anyhow::Result<String> {
    let csr = raw.replace('\r', "");
    let csr = csr.trim();
    if csr.is_empty() {
        anyhow::bail!("received empty certificate signing request");
    }
    Ok(csr.to_owned())
}

/// Short stable fingerprint of a CSR, for logs and dedup keys.
pub fn csr_fingerprint(csr: &str) -> String {
    let hash = digest::digest(&digest::SHA256, csr.as_bytes());
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash.as_ref());
    encoded.chars().take(16).collect()
}

// ---------------------------------------------------------------------------
// TLS configuration
// ---------------------------------------------------------------------------

/// PEM file names expected inside the certificate directory.
const CA_CERT_FILE: &str = "ca.crt";
const SERVER_CERT_FILE: &str = "server.crt";
const SERVER_KEY_FILE: &str = "server.key";

/// Build the rustls server configuration for the secure listeners: serve
/// the hub certificate and require a client certificate signed by the hub
/// CA.
pub fn load_secure_server_config(cert_dir: &Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let ca_path = cert_dir.join(CA_CERT_FILE);
    let cert_path = cert_dir.join(SERVER_CERT_FILE);
    let key_path = cert_dir.join(SERVER_KEY_FILE);

    let mut roots = rustls::RootCertStore::empty();
    for cert in read_pem_certs(&ca_path)? {
        roots.add(cert)?;
    }

    let chain = read_pem_certs(&cert_path)?;
    let key = read_pem_key(&key_path)?;

    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)?;

    Ok(Arc::new(config))
}

fn read_pem_certs(
    path: &Path,
) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut data.as_slice()).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn read_pem_key(path: &Path) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    rustls_pemfile::private_key(&mut data.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

// ---------------------------------------------------------------------------
// Signing authority
// ---------------------------------------------------------------------------

/// Openssl-CLI-backed certificate authority.
///
/// Issues client certificates from CSRs against the CA material in the
/// certificate directory. Kept as a plain struct (not a provider) so each
/// per-OS provider composes it with its own deployment strategy.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    dir: PathBuf,
}

impl CertificateAuthority {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    /// The CA certificate in PEM form, as deployed to devices.
    pub async fn ca_certificate(&self) -> anyhow::Result<String> {
        Ok(tokio::fs::read_to_string(self.ca_cert_path()).await?)
    }

    /// Extract the CN (bundle identifier) from a CSR subject line.
    pub async fn extract_bundle_id(&self, csr: &str) -> anyhow::Result<String> {
        let staged = stage_csr(csr).await?;
        let output = openssl(&[
            "req",
            "-noout",
            "-subject",
            "-in",
            &staged.path_str()?,
        ])
        .await?;
        parse_subject_cn(&output)
            .ok_or_else(|| anyhow::anyhow!("no CN found in CSR subject: {output}"))
    }

    /// Issue a client certificate for the CSR, signed by the hub CA.
    pub async fn generate_client_certificate(&self, csr: &str) -> anyhow::Result<String> {
        let staged = stage_csr(csr).await?;
        let ca_cert = self.dir.join(CA_CERT_FILE);
        let ca_key = self.dir.join("ca.key");
        let serial = self.dir.join("ca.srl");
        openssl(&[
            "x509",
            "-req",
            "-in",
            &staged.path_str()?,
            "-CA",
            &path_str(&ca_cert)?,
            "-CAkey",
            &path_str(&ca_key)?,
            "-CAcreateserial",
            "-CAserial",
            &path_str(&serial)?,
            "-days",
            "30",
        ])
        .await
    }
}

/// Run an openssl subcommand, returning stdout.
async fn openssl(args: &[&str]) -> anyhow::Result<String> {
    debug!(args = ?args, "running openssl");
    let output = Command::new("openssl").args(args).output().await.map_err(|e| {
        anyhow::anyhow!("failed to spawn openssl (is it installed?): {e}")
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("openssl {} failed: {stderr}", args.first().unwrap_or(&""));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A CSR written to a temp file for openssl consumption.
struct StagedCsr {
    file: tempfile::NamedTempFile,
}

impl StagedCsr {
    fn path_str(&self) -> anyhow::Result<String> {
        path_str(self.file.path())
    }
}

async fn stage_csr(csr: &str) -> anyhow::Result<StagedCsr> {
    let csr = sanitize_csr(csr)?;
    let file = tokio::task::spawn_blocking(move || -> anyhow::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut file, csr.as_bytes())?;
        Ok(file)
    })
    .await??;
    Ok(StagedCsr { file })
}

fn path_str(path: &Path) -> anyhow::Result<String> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow::anyhow!("non-UTF-8 path: {}", path.display()))
}

/// Pull the CN value out of an openssl `-subject` line. Accepts both the
/// `subject=/C=US/CN=app` and `subject=C = US, CN = app` output dialects.
fn parse_subject_cn(subject: &str) -> Option<String> {
    let line = subject.trim();
    for sep in ['/', ','] {
        for part in line.split(sep) {
            let part = part.trim().trim_start_matches("subject=").trim();
            if let Some(rest) = part.strip_prefix("CN") {
                let value = rest.trim_start().trim_start_matches('=').trim();
                if !value.is_empty() {
                    return Some(value.to_owned());
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Filesystem provider
// ---------------------------------------------------------------------------

/// Strategy for placing certificate files into an app sandbox; the
/// device-bridge implementation is injected by the embedding application.
pub trait CertificateDeployer: Send + Sync {
    fn deploy_file<'a>(
        &'a self,
        query: &'a ClientQuery,
        destination: &'a str,
        filename: &'a str,
        contents: &'a str,
        csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Resolve the device that produced `csr` among candidates known to the
    /// bridge.
    fn target_device_id<'a>(
        &'a self,
        query: &'a ClientQuery,
        app_name: &'a str,
        csr_path: &'a str,
        csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// Filesystem-medium provider: sign the CSR with the local CA and hand the
/// resulting files to the injected deployer.
pub struct FsCertificateProvider {
    authority: CertificateAuthority,
    deployer: Arc<dyn CertificateDeployer>,
}

impl FsCertificateProvider {
    pub fn new(authority: CertificateAuthority, deployer: Arc<dyn CertificateDeployer>) -> Self {
        Self { authority, deployer }
    }
}

impl CertificateProvider for FsCertificateProvider {
    fn name(&self) -> &'static str {
        "fs-certificate-provider"
    }

    fn medium(&self) -> CertificateExchangeMedium {
        CertificateExchangeMedium::FsAccess
    }

    fn process_signing_request<'a>(
        &'a self,
        query: &'a ClientQuery,
        csr: &'a str,
        sandbox_dir: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<CertificateExchangeResult>> {
        Box::pin(async move {
            let csr = sanitize_csr(csr)?;
            info!(
                app = %query.app,
                device = %query.device,
                fingerprint = %csr_fingerprint(&csr),
                "starting certificate exchange"
            );

            let app_name = self.authority.extract_bundle_id(&csr).await?;
            let ca_certificate = self.authority.ca_certificate().await?;
            let client_certificate = self.authority.generate_client_certificate(&csr).await?;

            let device_id =
                self.deployer.target_device_id(query, &app_name, sandbox_dir, &csr).await?;

            self.deployer
                .deploy_file(query, sandbox_dir, DEVICE_CA_CERT_FILE, &ca_certificate, &csr)
                .await?;
            self.deployer
                .deploy_file(query, sandbox_dir, DEVICE_CLIENT_CERT_FILE, &client_certificate, &csr)
                .await?;

            info!(app = %query.app, device_id = %device_id, "finished certificate exchange");
            Ok(CertificateExchangeResult { device_id })
        })
    }

    fn get_target_device_id<'a>(
        &'a self,
        query: &'a ClientQuery,
        app_name: &'a str,
        csr_path: &'a str,
        csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            self.deployer.target_device_id(query, app_name, csr_path, csr).await
        })
    }

    fn extract_app_name_from_csr<'a>(
        &'a self,
        csr: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move { self.authority.extract_bundle_id(csr).await })
    }
}

#[cfg(test)]
#[path = "certs_tests.rs"]
mod tests;
