//! Where objective updates go once the handler has resolved them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::topics::GlobalAlarmObjective;

/// Applies remotely published alarm objectives to the device.
pub trait AlarmObjectiveListener: Send {
    /// New or changed bounds for `objective.metric_id`.
    fn on_set(&mut self, objective: &GlobalAlarmObjective);

    /// The objective for `metric_id` was withdrawn.
    fn on_unset(&mut self, metric_id: &str);
}

/// One resolved objective change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ObjectiveUpdate {
    Set(GlobalAlarmObjective),
    Unset { metric_id: String },
}

impl ObjectiveUpdate {
    /// Metric the update is about.
    #[must_use]
    pub fn metric_id(&self) -> &str {
        match self {
            Self::Set(objective) => &objective.metric_id,
            Self::Unset { metric_id } => metric_id,
        }
    }

    /// Replay this update onto `listener`.
    pub fn apply(&self, listener: &mut dyn AlarmObjectiveListener) {
        match self {
            Self::Set(objective) => listener.on_set(objective),
            Self::Unset { metric_id } => listener.on_unset(metric_id),
        }
    }
}

/// Collects updates in arrival order.
impl AlarmObjectiveListener for Vec<ObjectiveUpdate> {
    fn on_set(&mut self, objective: &GlobalAlarmObjective) {
        self.push(ObjectiveUpdate::Set(objective.clone()));
    }

    fn on_unset(&mut self, metric_id: &str) {
        self.push(ObjectiveUpdate::Unset {
            metric_id: metric_id.to_string(),
        });
    }
}

/// Create a bounded queue carrying updates from the event loop to the device thread.
#[must_use]
pub fn objective_queue(capacity: usize) -> (QueuedObjectiveSink, ObjectiveQueue) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueuedObjectiveSink {
            tx,
            dropped: Arc::clone(&dropped),
        },
        ObjectiveQueue { rx, dropped },
    )
}

/// Listener that never blocks the event loop: updates are queued for the
/// device thread. A full queue drops the update and counts it.
#[derive(Debug, Clone)]
pub struct QueuedObjectiveSink {
    tx: Sender<ObjectiveUpdate>,
    dropped: Arc<AtomicU64>,
}

impl QueuedObjectiveSink {
    fn push(&self, update: ObjectiveUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(metric_id = update.metric_id(), "objective queue full, update dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl AlarmObjectiveListener for QueuedObjectiveSink {
    fn on_set(&mut self, objective: &GlobalAlarmObjective) {
        self.push(ObjectiveUpdate::Set(objective.clone()));
    }

    fn on_unset(&mut self, metric_id: &str) {
        self.push(ObjectiveUpdate::Unset {
            metric_id: metric_id.to_string(),
        });
    }
}

/// Receiving end of [`objective_queue`].
#[derive(Debug)]
pub struct ObjectiveQueue {
    rx: Receiver<ObjectiveUpdate>,
    dropped: Arc<AtomicU64>,
}

impl ObjectiveQueue {
    /// Apply every queued update to `listener`, oldest first. Returns how many
    /// were applied.
    pub fn drain(&self, listener: &mut dyn AlarmObjectiveListener) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.rx.try_recv() {
            update.apply(listener);
            applied += 1;
        }
        applied
    }

    /// Updates waiting to be drained.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Updates lost because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let (mut sink, queue) = objective_queue(8);
        sink.on_set(&GlobalAlarmObjective::new("HR", 40.0, 120.0));
        sink.on_unset("SpO2");
        assert_eq!(queue.pending(), 2);

        let mut applied = Vec::new();
        assert_eq!(queue.drain(&mut applied), 2);
        assert_eq!(
            applied,
            vec![
                ObjectiveUpdate::Set(GlobalAlarmObjective::new("HR", 40.0, 120.0)),
                ObjectiveUpdate::Unset {
                    metric_id: "SpO2".to_string()
                },
            ]
        );
        assert_eq!(queue.drain(&mut applied), 0);
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let (mut sink, queue) = objective_queue(1);
        sink.on_unset("HR");
        sink.on_unset("RR");
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_update_serializes_with_kind_tag() {
        let json = serde_json::to_string(&ObjectiveUpdate::Unset {
            metric_id: "HR".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"unset\""));
    }
}
