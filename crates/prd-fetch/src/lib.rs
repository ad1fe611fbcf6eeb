//! Parallel HTTP downloading with streaming verification.
//!
//! # Architecture
//!
//! - `record.rs` - the Download record and its state machine
//! - `session.rs` - process-lifetime HTTP client, TLS trust, abort flag
//! - `engine.rs` - the multi-transfer scheduler (retry queue, rate limit)
//! - `io_pool.rs` - worker threads with per-transfer FIFO strands
//! - `throttle.rs` / `backoff.rs` - request pacing
//! - `progress.rs` - observer seam and aggregate progress projection

pub use backoff::retry_delay;
pub use engine::{fetch_url, EngineTuning, HttpEngine};
pub use error::{DownloadError, Result};
pub use io_pool::{Handle, IoPool, ResultFn, WorkFn};
pub use progress::{NullObserver, PackProgress, ProgressObserver};
pub use record::{Category, Download, DownloadType, HashKind, State};
pub use session::{Session, TlsConfig};
pub use throttle::Throttler;

mod backoff;
mod engine;
mod error;
mod io_pool;
mod progress;
mod record;
mod session;
mod throttle;
