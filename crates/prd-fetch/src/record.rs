//! The download record: one unit of work for the transfer engine.

use std::path::PathBuf;

use prd_hash::{GzipMd5, Md5Digest, Md5Hash, StreamHash};

/// What kind of content a record resolves to. Engine categories are
/// platform-specific because engine builds are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    None,
    Map,
    Game,
    /// Generic engine request, translated to the running platform before
    /// searching.
    Engine,
    EngineLinux,
    EngineLinux64,
    EngineWindows,
    EngineWindows64,
    EngineMacosx,
    /// Raw URL download, no search possible.
    Http,
}

impl Category {
    pub fn from_str(s: &str) -> Option<Category> {
        Some(match s {
            "map" => Category::Map,
            "game" => Category::Game,
            "engine" => Category::Engine,
            "engine_linux" => Category::EngineLinux,
            "engine_linux64" => Category::EngineLinux64,
            "engine_windows" => Category::EngineWindows,
            "engine_windows64" => Category::EngineWindows64,
            "engine_macosx" => Category::EngineMacosx,
            "http" => Category::Http,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::None => "none",
            Category::Map => "map",
            Category::Game => "game",
            Category::Engine => "engine",
            Category::EngineLinux => "engine_linux",
            Category::EngineLinux64 => "engine_linux64",
            Category::EngineWindows => "engine_windows",
            Category::EngineWindows64 => "engine_windows64",
            Category::EngineMacosx => "engine_macosx",
            Category::Http => "http",
        }
    }

    pub fn is_engine(&self) -> bool {
        matches!(
            self,
            Category::Engine
                | Category::EngineLinux
                | Category::EngineLinux64
                | Category::EngineWindows
                | Category::EngineWindows64
                | Category::EngineMacosx
        )
    }

    /// Subdirectory of the spring dir this category installs into.
    pub fn subdir(&self) -> Option<&'static str> {
        match self {
            Category::Map => Some("maps"),
            Category::Game => Some("games"),
            c if c.is_engine() => Some("engine"),
            _ => None,
        }
    }
}

/// Which pipeline fetches the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadType {
    Http,
    Rapid,
}

/// Transfer state of a record. `Downloading` is entered on the first
/// successful write; `Failed` and `Finished` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    None,
    Downloading,
    Failed,
    Finished,
}

/// Which running hash to maintain while bytes stream in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashKind {
    #[default]
    None,
    /// MD5 of the bytes as stored on disk.
    Md5,
    /// MD5 of the decompressed form of a gzipped download; verifies pool
    /// objects without inflating them to disk.
    GzipMd5,
}

impl HashKind {
    pub fn new_hash(&self) -> Option<Box<dyn StreamHash>> {
        match self {
            HashKind::None => None,
            HashKind::Md5 => Some(Box::new(Md5Hash::new())),
            HashKind::GzipMd5 => Some(Box::new(GzipMd5::new())),
        }
    }
}

/// One downloadable object: where it comes from, where it lands, and how it
/// is verified. Owned by the resolver; the engine mutates only the transfer
/// fields (`state`, `progress`) for the duration of a run.
#[derive(Debug)]
pub struct Download {
    /// Final destination path.
    pub name: PathBuf,
    /// Human-facing identifier: a springname, rapid tag, or URL.
    pub origin_name: String,
    pub category: Category,
    pub dltype: DownloadType,
    /// Candidate URLs for the same content; one is picked at random per
    /// attempt.
    pub mirrors: Vec<String>,
    /// Origin names that must be installed for this record to be usable.
    pub depends: Vec<String>,
    /// Exact size when the index knows it.
    pub size: Option<u64>,
    /// Stand-in size for progress when `size` is unknown; at least 1.
    pub approx_size: u64,
    pub expected_hash: Option<Md5Digest>,
    pub hash_kind: HashKind,
    pub version: String,
    pub validate_tls: bool,
    pub no_cache: bool,
    pub use_etags: bool,
    pub write_checksum_sidecar: bool,
    pub state: State,
    /// Bytes transferred so far.
    pub progress: u64,
}

impl Download {
    pub fn new(name: impl Into<PathBuf>, origin_name: impl Into<String>, category: Category) -> Download {
        Download {
            name: name.into(),
            origin_name: origin_name.into(),
            category,
            dltype: DownloadType::Http,
            mirrors: Vec::new(),
            depends: Vec::new(),
            size: None,
            approx_size: 1,
            expected_hash: None,
            hash_kind: HashKind::None,
            version: String::new(),
            validate_tls: true,
            no_cache: false,
            use_etags: false,
            write_checksum_sidecar: false,
            state: State::None,
            progress: 0,
        }
    }

    pub fn add_mirror(&mut self, url: impl Into<String>) -> &mut Self {
        self.mirrors.push(url.into());
        self
    }

    pub fn add_depend(&mut self, origin: impl Into<String>) -> &mut Self {
        self.depends.push(origin.into());
        self
    }

    /// Expect a plain MD5 over the final on-disk bytes.
    pub fn expect_md5(&mut self, digest: Md5Digest) -> &mut Self {
        self.expected_hash = Some(digest);
        self.hash_kind = HashKind::Md5;
        self
    }

    /// Expect the gzip-composite hash: the download is stored compressed
    /// and `digest` names its decompressed contents.
    pub fn expect_gzip_md5(&mut self, digest: Md5Digest) -> &mut Self {
        self.expected_hash = Some(digest);
        self.hash_kind = HashKind::GzipMd5;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Size used for aggregate progress accounting.
    pub fn weight(&self) -> u64 {
        self.size.unwrap_or(self.approx_size).max(1)
    }
}
