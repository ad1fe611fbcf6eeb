//! SDP package descriptors.
//!
//! An `.sdp` file is a gzipped stream of fixed-layout records, one per file
//! in the package:
//!
//! ```text
//! length: u8
//! name:   length bytes
//! md5:    16 bytes   (of the file's uncompressed contents; names the pool object)
//! crc32:  4 bytes
//! size:   u32 big-endian (uncompressed size)
//! ```
//!
//! The descriptor's own filename embeds the MD5 of
//! `concat_i(MD5(name_i) || md5_i)`, which ties the content list to the
//! package identity: a descriptor that fails this check is deleted so the
//! next run fetches a fresh copy.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use prd_fetch::{DownloadError, Result};
use prd_fs::SpringDir;
use prd_hash::{md5_of, Md5Digest, Md5Hash, StreamHash};
use tracing::{debug, info, warn};

/// One file of a rapid package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// MD5 of the uncompressed contents; also the pool address.
    pub md5: Md5Digest,
    pub crc32: [u8; 4],
    /// Uncompressed size. The gzipped pool object is usually smaller.
    pub size: u32,
    /// Marked by the pool filter when the object still needs fetching.
    pub fetch: bool,
}

/// Package metadata from a repo's `versions` index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdp {
    /// Rapid tag, e.g. `ba:stable`.
    pub shortname: String,
    /// Hex MD5 naming the descriptor.
    pub md5: String,
    /// Descriptive name, e.g. `Balanced Annihilation V9.46`.
    pub name: String,
    pub depends: Vec<String>,
    /// URL of the repo that published this package.
    pub base_url: String,
}

impl Sdp {
    pub fn sdp_path(&self, dir: &SpringDir) -> std::path::PathBuf {
        dir.sdp_path(&self.md5)
    }

    pub fn descriptor_url(&self) -> String {
        format!("{}/packages/{}.sdp", self.base_url, self.md5)
    }

    pub fn streamer_url(&self) -> String {
        format!("{}/streamer.cgi?{}", self.base_url, self.md5)
    }

    pub fn pool_url(&self, md5_hex: &str) -> String {
        format!(
            "{}/pool/{}/{}.gz",
            self.base_url,
            &md5_hex[..2],
            &md5_hex[2..]
        )
    }

    /// A user search term matches on the exact tag or the exact descriptive
    /// name; `*` and the empty string match everything.
    pub fn matches(&self, term: &str) -> bool {
        term.is_empty() || term == "*" || term == self.shortname || term == self.name
    }
}

/// Parse a descriptor and verify its embedded hash. A descriptor whose
/// content list does not match the hash in its filename is deleted.
pub fn parse_sdp(path: &Path) -> Result<Vec<FileEntry>> {
    let file = File::open(path)
        .map_err(|e| DownloadError::SdpCorrupt(format!("{}: {e}", path.display())))?;
    let mut gz = GzDecoder::new(file);

    let mut files = Vec::new();
    let mut sdp_hash = Md5Hash::new();
    loop {
        let mut len_buf = [0u8; 1];
        match gz.read(&mut len_buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(DownloadError::SdpCorrupt(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        }
        let len = len_buf[0] as usize;
        let mut name = vec![0u8; len];
        let mut md5 = [0u8; 16];
        let mut crc32 = [0u8; 4];
        let mut size = [0u8; 4];
        read_record(&mut gz, path, &mut name, &mut md5, &mut crc32, &mut size)?;
        let name = String::from_utf8_lossy(&name).into_owned();

        sdp_hash.update(md5_of(name.as_bytes()).as_bytes());
        sdp_hash.update(&md5);

        files.push(FileEntry {
            name,
            md5: Md5Digest(md5),
            crc32,
            size: u32::from_be_bytes(size),
            fetch: false,
        });
    }

    let expected = md5_from_filename(path);
    let actual = sdp_hash.finish();
    if expected.as_deref() != Some(actual.to_hex().as_str()) {
        warn!(
            path = %path.display(),
            actual = %actual,
            "descriptor content does not match its name, deleting"
        );
        let _ = std::fs::remove_file(path);
        return Err(DownloadError::SdpCorrupt(format!(
            "{}: content hash {} does not match filename",
            path.display(),
            actual
        )));
    }
    debug!(path = %path.display(), files = files.len(), "parsed descriptor");
    Ok(files)
}

fn read_record(
    gz: &mut impl Read,
    path: &Path,
    name: &mut [u8],
    md5: &mut [u8; 16],
    crc32: &mut [u8; 4],
    size: &mut [u8; 4],
) -> Result<()> {
    gz.read_exact(name)
        .and_then(|_| gz.read_exact(md5))
        .and_then(|_| gz.read_exact(crc32))
        .and_then(|_| gz.read_exact(size))
        .map_err(|e| DownloadError::SdpCorrupt(format!("{}: {e}", path.display())))
}

/// Hex MD5 embedded in a descriptor filename (`<md5>.sdp`).
fn md5_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    if stem.len() == 32 && stem.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(stem.to_ascii_lowercase())
    } else {
        None
    }
}

/// Mark the entries whose pool object is not in `present`. Returns whether
/// anything is left to fetch.
pub fn filter_downloaded(
    files: &mut [FileEntry],
    present: &std::collections::HashSet<Md5Digest>,
) -> bool {
    let mut need = false;
    for entry in files.iter_mut() {
        entry.fetch = !present.contains(&entry.md5);
        need |= entry.fetch;
    }
    need
}

/// Deep validation of a descriptor: parse it (deleting it when
/// self-inconsistent), then verify every referenced pool object exists and
/// matches its hash, deleting broken objects. Returns true when everything
/// checked out.
pub fn validate_sdp(dir: &SpringDir, path: &Path) -> Result<bool> {
    let files = parse_sdp(path)?;
    let mut valid = true;
    for entry in &files {
        let pool_path = dir.pool_path(&entry.md5.to_hex());
        if !pool_path.exists() {
            info!(file = %entry.name, pool = %pool_path.display(), "missing pool object");
            valid = false;
        } else if !prd_fs::pool_file_valid(&pool_path, &entry.md5) {
            info!(pool = %pool_path.display(), "removing invalid pool object");
            std::fs::remove_file(&pool_path).map_err(|e| {
                DownloadError::PoolCorrupt(format!("{}: {e}", pool_path.display()))
            })?;
            valid = false;
        }
    }
    Ok(valid)
}
