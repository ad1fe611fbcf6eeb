//! Sidecar files written next to downloads.
//!
//! The `.etag` sidecar stores `<md5-of-file>:<etag>`; the md5 prefix ties the
//! validator to the file contents so a file replaced by other means makes the
//! sidecar stale instead of wrong. The optional `.md5.gz` sidecar carries a
//! standard `md5sum`-style line for external consumers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use prd_hash::Md5Digest;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::md5_file;
use crate::staged::StagedFile;

fn etag_path(file: &Path) -> PathBuf {
    let mut p = file.to_path_buf().into_os_string();
    p.push(".etag");
    PathBuf::from(p)
}

/// Read the stored ETag for `file`, if the sidecar exists and still matches
/// the file's current contents.
pub fn read_etag(file: &Path) -> Option<String> {
    let sidecar = etag_path(file);
    if !file.exists() || !sidecar.exists() {
        return None;
    }
    let contents = fs::read_to_string(&sidecar).ok()?;
    let line = contents.lines().next()?;
    let (stored_md5, etag) = line.split_once(':')?;
    let actual = md5_file(file).ok()?;
    if actual.to_hex() != stored_md5 {
        debug!(file = %file.display(), "stale etag sidecar ignored");
        return None;
    }
    Some(etag.to_string())
}

/// Store the ETag a server returned for `file`. Weak validators (anything
/// not starting with `"`) are not stored.
pub fn write_etag(file: &Path, etag: &str) -> Result<()> {
    if !etag.starts_with('"') {
        return Ok(());
    }
    let digest = md5_file(file)?;
    let mut staged = StagedFile::open(etag_path(file))?;
    staged.write(format!("{}:{}", digest.to_hex(), etag).as_bytes())?;
    staged.commit()
}

/// Write the gzip-compressed `<final>.md5.gz` checksum sidecar.
pub fn write_checksum_sidecar(file: &Path, digest: &Md5Digest) -> Result<()> {
    let basename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut sidecar = file.to_path_buf().into_os_string();
    sidecar.push(".md5.gz");
    let sidecar = PathBuf::from(sidecar);

    let out = fs::File::create(&sidecar).map_err(|source| Error::Create {
        path: sidecar.clone(),
        source,
    })?;
    let mut enc = GzEncoder::new(out, Compression::default());
    enc.write_all(format!("{}  {}\n", digest.to_hex(), basename).as_bytes())
        .and_then(|_| enc.finish().map(|_| ()))
        .map_err(|source| Error::Write {
            path: sidecar,
            source,
        })
}
