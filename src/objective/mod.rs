//! Remotely published alarm objectives.
//!
//! [`ObjectiveSubscriptionHandler`] runs on the event loop and resolves
//! subscription samples into set/unset calls on an [`AlarmObjectiveListener`].
//! Pair it with [`QueuedObjectiveSink`] to apply those calls on the device's
//! own thread instead of the loop's.

mod handler;
mod sink;

pub use handler::{CycleSummary, ObjectiveSubscriptionHandler};
pub use sink::{objective_queue, AlarmObjectiveListener, ObjectiveQueue, ObjectiveUpdate, QueuedObjectiveSink};
