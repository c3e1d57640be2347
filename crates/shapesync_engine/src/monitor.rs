//! Debounced lag check.
//!
//! New data on any shape means the source advanced globally, so a shape
//! that has not confirmed it caught up to that point may simply have no
//! matching rows and would otherwise sit behind until its long poll times
//! out. The monitor arms one timer; when it fires, the coordinator refreshes
//! the lagging shapes.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// A single deferred check per coordinator.
///
/// Scheduling while a check is pending starts no second timer. While the
/// timer is armed the coming run covers the new data. While the check is
/// running, the schedule is recorded as missed and the task runs the check
/// again after another delay. This is a debounce, not a rate limiter.
#[derive(Debug)]
pub(crate) struct LagMonitor {
    delay: Duration,
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    task: Option<JoinHandle<()>>,
    running: bool,
    /// Set when a schedule arrived while the check was running.
    missed: bool,
}

impl LagMonitor {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// Arms the timer unless one is pending. Returns true if it armed.
    ///
    /// `check` runs after the delay, and again after another delay for as
    /// long as schedules keep arriving while it runs. The slot is released
    /// only once a run finishes with nothing missed.
    pub(crate) fn schedule<F, Fut>(self: &Arc<Self>, check: F) -> bool
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if slot.task.is_some() {
            if slot.running && !slot.missed {
                debug!("lag check running, will run again");
                slot.missed = true;
            }
            return false;
        }

        let monitor = Arc::downgrade(self);
        let delay = self.delay;
        slot.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                match monitor.upgrade() {
                    Some(monitor) => monitor.slot.lock().running = true,
                    None => return,
                }
                check().await;
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                let mut slot = monitor.slot.lock();
                slot.running = false;
                if std::mem::take(&mut slot.missed) {
                    continue;
                }
                slot.task = None;
                return;
            }
        }));
        debug!(delay_ms = delay.as_millis() as u64, "lag check scheduled");
        true
    }

    /// Returns true while a check is armed or running.
    pub(crate) fn is_pending(&self) -> bool {
        self.slot.lock().task.is_some()
    }

    /// Aborts a pending check.
    pub(crate) fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.running = false;
        slot.missed = false;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }
}

impl Drop for LagMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.slot.get_mut().task.take() {
            task.abort();
        }
    }
}
