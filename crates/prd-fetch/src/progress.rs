//! Progress reporting seam between the engine and whatever renders it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives aggregate progress while transfers run. Implementations must be
/// cheap and thread-safe; the engine calls this from its scheduler task for
/// every body chunk.
pub trait ProgressObserver: Send + Sync {
    fn progress(&self, done: u64, total: u64);
}

/// Observer that ignores everything.
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn progress(&self, _done: u64, _total: u64) {}
}

/// Aggregate progress over a batch of transfers.
///
/// Individual transfers only learn their true size from the response, which
/// may differ from the (possibly approximate) size counted into `total`
/// up front. Each transfer's real progress is projected onto its approximate
/// share so the aggregate total stays constant and the curve monotonic while
/// downloads run.
pub struct PackProgress {
    total: AtomicU64,
    done: AtomicU64,
}

impl PackProgress {
    pub fn new() -> PackProgress {
        PackProgress {
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
        }
    }

    pub fn add_total(&self, weight: u64) {
        self.total.fetch_add(weight, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Fold one transfer's progress change into the aggregate.
    /// `weight` is the transfer's share of `total`; `transfer_total` is the
    /// real size reported by the server.
    pub fn update(&self, weight: u64, transfer_total: u64, old_done: u64, new_done: u64) {
        if transfer_total == 0 {
            return;
        }
        let at = weight as f64 / transfer_total as f64;
        let delta = (at * new_done as f64) as i64 - (at * old_done as f64) as i64;
        if delta >= 0 {
            self.done.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.done.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }
}

impl Default for PackProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_keeps_total_constant() {
        let pack = PackProgress::new();
        pack.add_total(100);
        pack.add_total(50);
        assert_eq!(pack.total(), 150);

        // first transfer: claimed weight 100, actually 200 bytes long
        pack.update(100, 200, 0, 200);
        assert_eq!(pack.done(), 100);

        // second: weight 50, exactly 50 bytes
        pack.update(50, 50, 0, 25);
        assert_eq!(pack.done(), 125);
        pack.update(50, 50, 25, 50);
        assert_eq!(pack.done(), 150);
    }

    #[test]
    fn incremental_updates_accumulate() {
        let pack = PackProgress::new();
        pack.add_total(1000);
        let mut done = 0;
        for step in [100, 250, 400, 1000] {
            pack.update(1000, 1000, done, step);
            done = step;
        }
        assert_eq!(pack.done(), 1000);
    }
}
