//! Background housekeeping: one named thread per session running a task at a
//! fixed delay, and the partition assignment it keeps current.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};

/// Fixed-delay scheduler.
///
/// The task first runs after `initial_delay`, then `period` after each run
/// completes. Runs never overlap.
pub struct Housekeeper {
    name: String,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Housekeeper {
    /// Spawn the housekeeping thread.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Internal` if the thread cannot be spawned.
    pub fn start<F>(name: &str, initial_delay: Duration, period: Duration, mut task: F) -> DeviceResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    match stop_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => task(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    delay = period;
                }
            })
            .map_err(|e| DeviceError::internal(format!("failed to spawn housekeeping thread: {e}")))?;

        debug!(name, ?initial_delay, ?period, "housekeeping started");
        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }

    /// Stop the thread and wait for a run in progress to finish.
    /// Stopping twice is a no-op.
    pub fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.try_send(());
        drop(stop_tx);
        if let Some(join) = self.join.take() {
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                warn!(name = %self.name, "housekeeping task panicked");
            }
        }
        debug!(name = %self.name, "housekeeping stopped");
    }

    /// Whether [`stop`](Self::stop) has not been called yet.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }
}

impl fmt::Debug for Housekeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Housekeeper")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of the partition list a device should publish into.
pub trait PartitionSource: Send {
    /// Current partitions, or `None` when the source has nothing new.
    fn poll(&mut self) -> Option<Vec<String>>;
}

impl<F> PartitionSource for F
where
    F: FnMut() -> Option<Vec<String>> + Send,
{
    fn poll(&mut self) -> Option<Vec<String>> {
        self()
    }
}

/// Shared, thread-safe partition assignment.
#[derive(Debug, Clone, Default)]
pub struct PartitionController {
    partitions: Arc<RwLock<Vec<String>>>,
}

impl PartitionController {
    /// Start with no partitions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current partitions.
    #[must_use]
    pub fn partition(&self) -> Vec<String> {
        self.partitions.read().map(|p| p.clone()).unwrap_or_default()
    }

    /// Replace the partition list. Returns whether it changed.
    pub fn set_partition(&self, partitions: Vec<String>) -> bool {
        let Ok(mut current) = self.partitions.write() else {
            return false;
        };
        if *current == partitions {
            return false;
        }
        info!(from = ?*current, to = ?partitions, "partition changed");
        *current = partitions;
        true
    }

    /// Add `partition` if absent. Returns whether it was added.
    pub fn add_partition(&self, partition: &str) -> bool {
        let mut next = self.partition();
        if next.iter().any(|p| p == partition) {
            return false;
        }
        next.push(partition.to_string());
        self.set_partition(next)
    }

    /// Remove `partition` if present. Returns whether it was removed.
    pub fn remove_partition(&self, partition: &str) -> bool {
        let mut next = self.partition();
        let before = next.len();
        next.retain(|p| p != partition);
        if next.len() == before {
            return false;
        }
        self.set_partition(next)
    }

    /// Poll `source` once and apply whatever it reports.
    pub fn check_source(&self, source: &mut dyn PartitionSource) -> bool {
        source.poll().is_some_and(|partitions| self.set_partition(partitions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_partition_edits() {
        let controller = PartitionController::new();
        assert!(controller.partition().is_empty());
        assert!(controller.add_partition("icu"));
        assert!(!controller.add_partition("icu"));
        assert!(controller.add_partition("bed-4"));
        assert_eq!(controller.partition(), vec!["icu".to_string(), "bed-4".to_string()]);
        assert!(controller.remove_partition("icu"));
        assert!(!controller.remove_partition("icu"));
        assert!(!controller.set_partition(vec!["bed-4".to_string()]));
    }

    #[test]
    fn test_check_source_applies_changes() {
        let controller = PartitionController::new();
        let mut polls = 0;
        let mut source = move || {
            polls += 1;
            (polls == 1).then(|| vec!["ward-2".to_string()])
        };
        assert!(controller.check_source(&mut source));
        assert!(!controller.check_source(&mut source));
        assert_eq!(controller.partition(), vec!["ward-2".to_string()]);
    }

    #[test]
    fn test_housekeeper_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut keeper = Housekeeper::start("hk-test", Duration::ZERO, Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        keeper.stop();
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        assert!(!keeper.is_running());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        keeper.stop();
    }

    #[test]
    fn test_initial_delay_is_honoured() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut keeper = Housekeeper::start("hk-delay", Duration::from_secs(60), Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        keeper.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
