use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create '{path}': {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("write to '{path}' failed: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("read from '{path}' failed: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("renaming '{from}' onto '{to}' failed: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("failed to remove '{path}': {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("'{path}' is not a valid pool object name")]
    BadPoolName { path: PathBuf },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
