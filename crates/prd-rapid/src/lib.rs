//! The rapid pooled-distribution protocol.
//!
//! - `index.rs` - repo master and per-repo `versions` indices
//! - `sdp.rs` - package descriptors and their self-consistency check
//! - `streamer.rs` - the length-prefixed streaming fetch protocol
//! - `download.rs` - the package download driver (streamer or pool GETs)

pub use download::RapidDownloader;
pub use index::{RapidIndex, DEFAULT_REPO_MASTER, REPO_RECHECK};
pub use sdp::{filter_downloaded, parse_sdp, validate_sdp, FileEntry, Sdp};
pub use streamer::{build_request_bitmap, download_stream, PoolStreamWriter};

mod download;
mod index;
mod sdp;
mod streamer;
