use std::path::PathBuf;

use clap::Parser;

/// Downloads maps, games and engines for spring-based games, by name or
/// rapid tag, verifying every file against its content hash.
#[derive(Debug, Parser)]
#[command(
    name = "prd",
    version,
    about,
    after_help = "\
Environment variables:
  PRD_RAPID_USE_STREAMER=[true]|false   use streamer.cgi for rapid downloads
  PRD_RAPID_REPO_MASTER=<url>           rapid repo master location
  PRD_MAX_HTTP_REQS_PER_SEC=[0]         HTTP request start rate, 0 = unlimited
  PRD_HTTP_SEARCH_URL=<url>             springfiles search service
  PRD_DISABLE_CERT_CHECK=[false]|true   skip TLS certificate validation
  PRD_SSL_CERT_FILE=<path>              extra CA bundle
  PRD_SSL_CERT_DIR=<path>               directory of extra CA certificates"
)]
pub struct Args {
    /// Root of the writable data directory
    #[arg(long, value_name = "PATH")]
    pub filesystem_writepath: Option<PathBuf>,

    /// Download a game by name or rapid tag
    #[arg(long, value_name = "NAME")]
    pub download_game: Vec<String>,

    /// Download a map by name
    #[arg(long, value_name = "NAME")]
    pub download_map: Vec<String>,

    /// Download an engine release for this platform
    #[arg(long, value_name = "VERSION")]
    pub download_engine: Vec<String>,

    /// Download a raw URL into the data directory
    #[arg(long, value_name = "URL")]
    pub http_download: Vec<String>,

    /// Check every pool file against its content hash
    #[arg(long)]
    pub rapid_validate: bool,

    /// With --rapid-validate: delete broken files
    #[arg(long)]
    pub delete: bool,

    /// Validate one package descriptor and the pool files it references
    #[arg(long, value_name = "PATH")]
    pub validate_sdp: Option<PathBuf>,

    /// Print the file list of a package descriptor
    #[arg(long, value_name = "PATH")]
    pub dump_sdp: Option<PathBuf>,

    #[arg(long)]
    pub disable_logging: bool,

    /// Do not resolve and download dependencies
    #[arg(long)]
    pub disable_fetch_depends: bool,

    /// Untyped search terms (map, game or rapid tag)
    #[arg(value_name = "NAME")]
    pub items: Vec<String>,
}
