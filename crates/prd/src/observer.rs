//! Console progress rendering.

use indicatif::{ProgressBar, ProgressStyle};
use prd_fetch::ProgressObserver;

/// Renders aggregate transfer progress as a single bar.
pub struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    pub fn new() -> BarObserver {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("[{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .expect("static template")
                .progress_chars("=>-"),
        );
        BarObserver { bar }
    }
}

impl Default for BarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for BarObserver {
    fn progress(&self, done: u64, total: u64) {
        if self.bar.length() != Some(total) {
            self.bar.set_length(total);
        }
        self.bar.set_position(done);
        if done >= total && total > 0 {
            self.bar.finish_and_clear();
        }
    }
}
