//! The on-disk layout of a spring data directory.
//!
//! Every path the downloader touches is derived here from a single root:
//!
//! ```text
//! <root>/maps/               installed maps
//! <root>/games/              installed games
//! <root>/engine/<platform>/  unpacked engines
//! <root>/packages/<md5>.sdp  rapid package descriptors
//! <root>/pool/<xy>/<rest>.gz content-addressed pool objects
//! <root>/rapid/...           cached repo master and versions files
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Characters that are not allowed in filenames on at least one supported
/// platform.
const ILLEGAL_FILENAME_CHARS: &[char] = &['\\', '/', ':', '?', '"', '<', '>', '|'];

/// Replace filesystem-hostile characters with `_`.
pub fn escape_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if ILLEGAL_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Root of the writable spring directory plus path derivation helpers.
#[derive(Debug, Clone)]
pub struct SpringDir {
    root: PathBuf,
}

impl SpringDir {
    pub fn new(root: impl Into<PathBuf>) -> SpringDir {
        SpringDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination directory for a download category subdirectory
    /// (`"maps"`, `"games"`, `"engine"`).
    pub fn category_dir(&self, subdir: &str) -> PathBuf {
        self.root.join(subdir)
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.root.join("pool")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn rapid_dir(&self) -> PathBuf {
        self.root.join("rapid")
    }

    /// Pool object path for an MD5 hex string: the first two characters
    /// shard the directory, the rest names the gzipped object.
    pub fn pool_path(&self, md5_hex: &str) -> PathBuf {
        debug_assert!(md5_hex.len() == 32);
        self.pool_dir()
            .join(&md5_hex[..2])
            .join(format!("{}.gz", &md5_hex[2..]))
    }

    /// Descriptor path for a rapid package.
    pub fn sdp_path(&self, md5_hex: &str) -> PathBuf {
        self.packages_dir().join(format!("{md5_hex}.sdp"))
    }

    /// Local cache path for a remote rapid URL: scheme is dropped, `/` keeps
    /// separating directories and `:` becomes `-`.
    pub fn rapid_cache_path(&self, url: &str) -> PathBuf {
        let stripped = match url.find("//") {
            Some(pos) => &url[pos + 2..],
            None => url,
        };
        let mut path = self.rapid_dir();
        for part in stripped.split('/').filter(|p| !p.is_empty()) {
            path.push(part.replace(':', "-"));
        }
        path
    }

    /// Where a repo's `versions.gz` is cached.
    pub fn versions_path(&self, repo_url: &str) -> PathBuf {
        self.rapid_cache_path(repo_url).join("versions.gz")
    }

    /// Where an unpacked engine lands.
    pub fn engine_dir(&self, platform: &str, version: &str) -> PathBuf {
        self.root
            .join("engine")
            .join(platform)
            .join(escape_filename(version))
    }

    /// Free space on the filesystem holding the spring directory, in MiB.
    pub fn free_space_mb(&self) -> std::io::Result<u64> {
        // The root may not exist yet on a first run.
        std::fs::create_dir_all(&self.root)?;
        Ok(fs2::available_space(&self.root)? / (1024 * 1024))
    }
}

/// True when `path` is missing or its mtime is more than `max_age` in the
/// past. Used to gate re-fetching of cached rapid index files.
pub fn is_older_than(path: &Path, max_age: Duration) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return true;
    };
    let Ok(mtime) = meta.modified() else {
        return true;
    };
    match SystemTime::now().duration_since(mtime) {
        Ok(age) => age > max_age,
        // mtime in the future, treat as fresh
        Err(_) => false,
    }
}
