//! Helpers for the content-addressed pool: shard directory creation,
//! enumeration and integrity validation.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use prd_hash::{GzipMd5, Md5Digest, Md5Hash, StreamHash};
use tracing::warn;

use crate::error::Result;

/// Ensure all 256 `pool/<xx>/` shard directories exist.
pub fn create_pool_dirs(pool_root: &Path) -> Result<()> {
    for i in 0..256u32 {
        fs::create_dir_all(pool_root.join(format!("{i:02x}")))?;
    }
    Ok(())
}

/// Enumerate pool objects as `(path, md5)` pairs. The digest is recovered
/// from the path (`<xy>/<rest>.gz`); entries with unparsable names and
/// leftover `.tmp` files are skipped.
pub fn list_pool(pool_root: &Path) -> Result<Vec<(PathBuf, Md5Digest)>> {
    let mut out = Vec::new();
    let shards = match fs::read_dir(pool_root) {
        Ok(iter) => iter,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for shard in shards {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        let prefix = shard.file_name().to_string_lossy().into_owned();
        for entry in fs::read_dir(shard.path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".gz") else {
                // .tmp leftovers and anything else foreign
                continue;
            };
            match Md5Digest::from_hex(&format!("{prefix}{stem}")) {
                Some(digest) => out.push((entry.path(), digest)),
                None => warn!(path = %entry.path().display(), "ignoring foreign file in pool"),
            }
        }
    }
    Ok(out)
}

/// MD5 of a file's raw on-disk bytes.
pub fn md5_file(path: &Path) -> Result<Md5Digest> {
    hash_file(path, Md5Hash::new())
}

/// MD5 of the decompressed contents of a gzipped file.
pub fn gzip_md5_file(path: &Path) -> Result<Md5Digest> {
    hash_file(path, GzipMd5::new())
}

fn hash_file<H: StreamHash>(path: &Path, mut hash: H) -> Result<Md5Digest> {
    let mut file = File::open(path).map_err(|source| crate::Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|source| crate::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n]);
    }
    Ok(hash.finish())
}

/// Check a single pool object against the digest its path claims.
pub fn pool_file_valid(path: &Path, expected: &Md5Digest) -> bool {
    match gzip_md5_file(path) {
        Ok(actual) => actual == *expected,
        Err(_) => false,
    }
}

/// Outcome of a full pool validation sweep.
pub struct PoolReport {
    pub checked: usize,
    pub broken: Vec<PathBuf>,
}

/// Validate every object in the pool, optionally deleting broken ones so a
/// later download can restore them.
pub fn validate_pool(pool_root: &Path, delete_broken: bool) -> Result<PoolReport> {
    let files = list_pool(pool_root)?;
    let mut report = PoolReport {
        checked: files.len(),
        broken: Vec::new(),
    };
    for (path, expected) in files {
        if pool_file_valid(&path, &expected) {
            continue;
        }
        warn!(path = %path.display(), "invalid file in pool");
        if delete_broken {
            fs::remove_file(&path).map_err(|source| crate::Error::Remove {
                path: path.clone(),
                source,
            })?;
        }
        report.broken.push(path);
    }
    Ok(report)
}
