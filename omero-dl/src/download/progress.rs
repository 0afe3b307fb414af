use std::time::{Duration, Instant};

/// Two-level progress of a run: filesets overall, bytes of the current file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgressState {
    pub overall_completed: usize,
    pub overall_total: usize,
    pub current_file_bytes_done: u64,
    pub current_file_bytes_total: u64,
}

impl DownloadProgressState {
    pub fn file_fraction(&self) -> f64 {
        if self.current_file_bytes_total == 0 {
            return 1.0;
        }
        self.current_file_bytes_done as f64 / self.current_file_bytes_total as f64
    }
}

/// Receives progress notifications from a run. Both methods default to
/// no-ops.
pub trait ProgressObserver: Send {
    fn on_overall_progress(&mut self, _done: usize, _total: usize) {}

    fn on_file_progress(&mut self, _done: u64, _total: u64) {}
}

impl ProgressObserver for () {}

/// Picks which per-file byte updates are worth reporting.
///
/// The first update of a file and its completion always pass. In between an
/// update passes once `min_bytes` more have arrived or `min_interval` has
/// elapsed since the last reported one. A byte count lower than the last
/// reported one starts a new file.
pub struct ProgressThrottle {
    min_interval: Duration,
    min_bytes: u64,
    last: Option<(Instant, u64)>,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration, min_bytes: u64) -> Self {
        Self {
            min_interval,
            min_bytes,
            last: None,
        }
    }

    pub fn should_emit(&mut self, done: u64, total: u64) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some((_, last_done)) if done == last_done => false,
            Some((_, last_done)) if done < last_done => true,
            Some(_) if done >= total => true,
            Some((at, last_done)) => {
                done - last_done >= self.min_bytes || now.duration_since(at) >= self.min_interval
            }
        };
        if due {
            self.last = Some((now, done));
        }
        due
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 8 * 1024 * 1024)
    }
}
