//! Environment-driven configuration.

use std::path::PathBuf;

use prd_fetch::TlsConfig;
use tracing::warn;

pub const DEFAULT_SEARCH_URL: &str = "https://springfiles.springrts.com/json.php";

#[derive(Debug, Clone)]
pub struct Config {
    /// `PRD_RAPID_REPO_MASTER`
    pub repo_master: String,
    /// `PRD_RAPID_USE_STREAMER`; anything but "false" enables the streamer.
    pub use_streamer: bool,
    /// `PRD_MAX_HTTP_REQS_PER_SEC`; 0 = unlimited.
    pub max_reqs_per_sec: u32,
    /// `PRD_HTTP_SEARCH_URL`
    pub search_url: String,
    pub tls: TlsConfig,
}

impl Config {
    pub fn from_env() -> Config {
        let max_reqs_per_sec = match std::env::var("PRD_MAX_HTTP_REQS_PER_SEC") {
            Ok(v) => v.parse().unwrap_or_else(|_| {
                warn!("PRD_MAX_HTTP_REQS_PER_SEC value is not valid, not limiting");
                0
            }),
            Err(_) => 0,
        };
        Config {
            repo_master: std::env::var("PRD_RAPID_REPO_MASTER")
                .unwrap_or_else(|_| prd_rapid::DEFAULT_REPO_MASTER.to_string()),
            use_streamer: std::env::var("PRD_RAPID_USE_STREAMER")
                .map(|v| v != "false")
                .unwrap_or(true),
            max_reqs_per_sec,
            search_url: std::env::var("PRD_HTTP_SEARCH_URL")
                .unwrap_or_else(|_| DEFAULT_SEARCH_URL.to_string()),
            tls: TlsConfig {
                disable_cert_check: std::env::var("PRD_DISABLE_CERT_CHECK")
                    .map(|v| v == "true")
                    .unwrap_or(false),
                cert_file: std::env::var_os("PRD_SSL_CERT_FILE").map(PathBuf::from),
                cert_dir: std::env::var_os("PRD_SSL_CERT_DIR").map(PathBuf::from),
            },
        }
    }
}

/// Default writable data directory when `--filesystem-writepath` is absent.
pub fn default_write_path() -> PathBuf {
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spring")
}
