use indicatif::{ProgressBar, ProgressStyle};
use lazy_static::lazy_static;
use std::time::{Duration, Instant};

/// How often the progress bar is redrawn.
pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

lazy_static! {
    static ref ACTION_STYLE: ProgressStyle =
        ProgressStyle::with_template("{msg:>9}  {bar} {percent:>3}%  {pos}/{len}  [{elapsed_precise}]")
            .expect("progress bar style template should compile");

    static ref FINISH_STYLE: ProgressStyle =
        ProgressStyle::with_template("{msg} [{elapsed_precise}]")
            .expect("progress bar style template should compile");
}

/// Wraps an `indicatif::ProgressBar` over the run-plan's action steps, with a
/// local buffer so per-action updates do not thrash the terminal.
pub struct PlanProgress {
    inner: ProgressBar,
    position: u64,
    message: String,
    last_sync: Instant,
    total: u64,
}

impl PlanProgress {
    pub fn new(total: u64, enabled: bool) -> PlanProgress {
        let inner = if enabled {
            let inner = ProgressBar::new(total).with_style(ACTION_STYLE.clone());
            inner.enable_steady_tick(PROGRESS_UPDATE_INTERVAL);
            inner
        } else {
            ProgressBar::hidden()
        };
        PlanProgress {
            inner,
            position: 0,
            message: String::new(),
            last_sync: Instant::now(),
            total,
        }
    }

    /// Record one step. `label` is the action's short form: the abbreviated
    /// commit hash, or the action name.
    pub fn step(&mut self, position: u64, label: &str) {
        self.position = position;
        self.message.clear();
        self.message.push_str(label);
        if self.last_sync.elapsed() >= PROGRESS_UPDATE_INTERVAL || position >= self.total {
            self.sync();
        }
    }

    #[inline]
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.inner.suspend(f)
    }

    pub fn finish_with_message(&mut self, message: &str) {
        self.sync();
        self.inner.set_style(FINISH_STYLE.clone());
        self.inner.finish_with_message(message.to_string());
    }

    fn sync(&mut self) {
        self.inner.set_position(self.position);
        self.inner.set_message(self.message.clone());
        self.last_sync = Instant::now();
    }
}

impl Drop for PlanProgress {
    fn drop(&mut self) {
        self.sync();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hidden_progress_accepts_steps() {
        let mut progress = PlanProgress::new(10, false);
        progress.step(1, "emerge");
        progress.step(2, "abc1234");
        progress.step(10, "");
        progress.finish_with_message("done");
    }
}
