//! Process-wide transfer context.
//!
//! The HTTP client (with its multiplexed connection pool), TLS trust
//! configuration, the shared abort flag and the progress observer all have
//! process lifetime. They are constructed once here instead of living in
//! globals, and everything downstream borrows the session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{DownloadError, Result};
use crate::progress::{NullObserver, ProgressObserver};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS trust knobs, filled from the environment by the caller.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Skip certificate validation entirely (`PRD_DISABLE_CERT_CHECK`).
    pub disable_cert_check: bool,
    /// Extra CA bundle file (`PRD_SSL_CERT_FILE`).
    pub cert_file: Option<PathBuf>,
    /// Directory of extra CA certificates (`PRD_SSL_CERT_DIR`).
    pub cert_dir: Option<PathBuf>,
}

pub struct Session {
    client: reqwest::Client,
    /// Client for records that opt out of TLS validation.
    insecure_client: reqwest::Client,
    abort: Arc<AtomicBool>,
    observer: Arc<dyn ProgressObserver>,
}

impl Session {
    pub fn new(tls: TlsConfig, observer: Arc<dyn ProgressObserver>) -> Result<Session> {
        let client = build_client(&tls, false)?;
        let insecure_client = build_client(&tls, true)?;
        Ok(Session {
            client,
            insecure_client,
            abort: Arc::new(AtomicBool::new(false)),
            observer,
        })
    }

    /// Session with default TLS trust and no progress reporting; what the
    /// tests use.
    pub fn plain() -> Result<Session> {
        Session::new(TlsConfig::default(), Arc::new(NullObserver))
    }

    pub fn client(&self, validate_tls: bool) -> &reqwest::Client {
        if validate_tls {
            &self.client
        } else {
            &self.insecure_client
        }
    }

    pub fn observer(&self) -> &Arc<dyn ProgressObserver> {
        &self.observer
    }

    pub fn abort_flag(&self) -> &Arc<AtomicBool> {
        &self.abort
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Ask every in-flight transfer to stop at its next callback.
    pub fn set_abort(&self, value: bool) {
        self.abort.store(value, Ordering::Relaxed);
    }
}

fn build_client(tls: &TlsConfig, insecure: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("prd/", env!("CARGO_PKG_VERSION")));

    if insecure || tls.disable_cert_check {
        builder = builder.danger_accept_invalid_certs(true);
    }
    for cert in collect_extra_roots(tls) {
        builder = builder.add_root_certificate(cert);
    }

    builder
        .build()
        .map_err(|e| DownloadError::TransportFatal(e.to_string()))
}

fn collect_extra_roots(tls: &TlsConfig) -> Vec<reqwest::Certificate> {
    let mut bundles = Vec::new();
    if let Some(file) = &tls.cert_file {
        bundles.push(file.clone());
    }
    if let Some(dir) = &tls.cert_dir {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some("pem" | "crt") => bundles.push(path),
                    _ => {}
                }
            }
        }
    }

    let mut certs = Vec::new();
    for path in bundles {
        let Ok(data) = std::fs::read(&path) else {
            warn!(path = %path.display(), "cannot read CA bundle");
            continue;
        };
        match reqwest::Certificate::from_pem_bundle(&data) {
            Ok(parsed) => certs.extend(parsed),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot parse CA bundle"),
        }
    }
    certs
}
