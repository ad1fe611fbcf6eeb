use std::time::Duration;

use prd_hash::Md5Digest;

/// Everything that can go wrong between "record admitted" and "file
/// installed". Whether a failure is worth another attempt is a property of
/// the variant, never of the call site.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("retryable transport error: {0}")]
    TransportRetryable(String),

    #[error("transport error: {0}")]
    TransportFatal(String),

    #[error("server returned HTTP {0}")]
    HttpStatus(u16),

    #[error("rate limited by server (Retry-After: {0:?})")]
    RateLimited(Option<Duration>),

    #[error("hash mismatch for '{name}': expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: Md5Digest,
        actual: Md5Digest,
    },

    #[error("corrupt package descriptor: {0}")]
    SdpCorrupt(String),

    #[error("corrupt pool object: {0}")]
    PoolCorrupt(String),

    #[error("file write failed: {0}")]
    IoWrite(#[source] prd_fs::Error),

    #[error("placing finished file failed: {0}")]
    IoRename(#[source] prd_fs::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("dependency '{0}' could not be resolved")]
    DependencyNotFound(String),

    #[error("no mirrors for '{0}'")]
    NoMirrors(String),

    #[error("insufficient disk space: {available} MiB available, {needed} MiB needed")]
    DiskFull { available: u64, needed: u64 },

    #[error("retry limit of {0} reached")]
    RetryLimit(u32),

    #[error("download run aborted")]
    Aborted,
}

impl DownloadError {
    /// True for failures the retry queue absorbs: transport-level errors,
    /// server errors, and explicit rate limiting. Client errors (4xx) are
    /// final, with the single exception of 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::TransportRetryable(_) | DownloadError::RateLimited(_) => true,
            DownloadError::HttpStatus(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Map a reqwest error onto the retryable/fatal split.
    pub fn from_transport(err: &reqwest::Error) -> DownloadError {
        // Connection setup, timeouts and mid-body stream errors are the
        // transient class; anything structural (bad URL, redirect loop,
        // builder misuse) is not going to get better on its own.
        if err.is_connect() || err.is_timeout() || err.is_body() || err.is_request() {
            DownloadError::TransportRetryable(err.to_string())
        } else {
            DownloadError::TransportFatal(err.to_string())
        }
    }
}

impl From<prd_fs::Error> for DownloadError {
    fn from(e: prd_fs::Error) -> Self {
        match e {
            prd_fs::Error::Rename { .. } => DownloadError::IoRename(e),
            _ => DownloadError::IoWrite(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_final_except_429() {
        assert!(!DownloadError::HttpStatus(404).is_retryable());
        assert!(!DownloadError::HttpStatus(403).is_retryable());
        assert!(DownloadError::HttpStatus(429).is_retryable());
        assert!(DownloadError::HttpStatus(500).is_retryable());
        assert!(DownloadError::HttpStatus(503).is_retryable());
    }

    #[test]
    fn verification_failures_are_final() {
        let err = DownloadError::HashMismatch {
            name: "a.bin".into(),
            expected: prd_hash::md5_of(b"a"),
            actual: prd_hash::md5_of(b"b"),
        };
        assert!(!err.is_retryable());
        assert!(!DownloadError::Aborted.is_retryable());
    }
}
