use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// One observable state of a running job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub status: String,
    /// 0-100
    pub percent: u8,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            status: "Queued".to_string(),
            percent: 0,
        }
    }
}

/// Writer side of the progress channel.
///
/// Each `set` overwrites both fields and then notifies subscribers; readers only
/// ever see whole snapshots and may skip intermediate ones.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<Progress>,
    published: Arc<AtomicUsize>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Progress::default());
        Self {
            tx,
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    pub fn set(&self, status: impl Into<String>, percent: u8) {
        self.tx.send_replace(Progress {
            status: status.into(),
            percent: percent.min(100),
        });
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Report `done` of `total` items for a phase, e.g. "Tiling level 2 (10/40)".
    pub fn step(&self, phase: &str, done: usize, total: usize) {
        self.set(format!("{} ({}/{})", phase, done, total), percent_of(done, total));
    }

    pub fn current(&self) -> Progress {
        self.tx.borrow().clone()
    }

    /// Snapshots published so far. Subscribers may have seen fewer.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer percent, truncating like a progress bar would.
pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u64 * 100) / total as u64) as u8
}
