//! Filesystem primitives for the downloader.
//!
//! - `staged.rs` - write-to-tmp-then-rename file handle
//! - `layout.rs` - spring directory path derivation
//! - `pool.rs` - content-addressed pool enumeration and validation
//! - `sidecar.rs` - `.etag` and `.md5.gz` sidecars

pub use error::{Error, Result};
pub use layout::{escape_filename, is_older_than, SpringDir};
pub use pool::{
    create_pool_dirs, gzip_md5_file, list_pool, md5_file, pool_file_valid, validate_pool,
    PoolReport,
};
pub use sidecar::{read_etag, write_checksum_sidecar, write_etag};
pub use staged::StagedFile;

mod error;
mod layout;
mod pool;
mod sidecar;
mod staged;
