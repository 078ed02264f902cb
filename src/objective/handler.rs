//! Subscription handler for remotely published alarm objectives.
//!
//! Each read cycle drains the samples gated by the handler's condition and
//! feeds them through a small state machine:
//!
//! | sample                  | action                                   |
//! |-------------------------|------------------------------------------|
//! | `New` view, valid data  | bind handle to `metric_id`               |
//! | `Alive`, valid data     | `on_set(objective)`                      |
//! | `NotAlive`              | `on_unset(bound metric_id)` or skip      |
//!
//! The handle binding table is the only way a disposal is traced back to its
//! metric: the payload of a disposal sample carries no valid data and the
//! transport's reverse lookup cannot be trusted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::event_loop::{ConditionHandler, ConditionId};
use crate::topics::GlobalAlarmObjective;
use crate::transport::{InstanceHandle, InstanceState, LoanGuard, SampleInfo, SampleReader, ViewState};

use super::sink::AlarmObjectiveListener;

/// Outcome counters of one read cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Samples taken from the reader.
    pub samples: usize,
    /// `on_set` calls made.
    pub set: usize,
    /// `on_unset` calls made.
    pub unset: usize,
    /// Disposals whose handle was never bound.
    pub unresolved: usize,
}

/// Reconciles objective samples against the handle binding table.
pub struct ObjectiveSubscriptionHandler {
    reader: Arc<dyn SampleReader<GlobalAlarmObjective>>,
    bindings: HashMap<InstanceHandle, String>,
    listener: Box<dyn AlarmObjectiveListener>,
}

impl ObjectiveSubscriptionHandler {
    /// Create a handler with an empty binding table.
    pub fn new(
        reader: Arc<dyn SampleReader<GlobalAlarmObjective>>,
        listener: Box<dyn AlarmObjectiveListener>,
    ) -> Self {
        Self {
            reader,
            bindings: HashMap::new(),
            listener,
        }
    }

    /// Metric id bound to `handle`, if its `New` sample was observed.
    #[must_use]
    pub fn binding(&self, handle: InstanceHandle) -> Option<&str> {
        self.bindings.get(&handle).map(String::as_str)
    }

    /// Number of bound handles.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Read and dispatch everything pending on `condition`.
    ///
    /// An empty read is normal. Other read failures are logged; the loan is
    /// returned on every path.
    pub fn read_cycle(&mut self, condition: ConditionId) -> CycleSummary {
        let reader = Arc::clone(&self.reader);
        let _loan = LoanGuard::new(reader.as_ref());

        let samples = match reader.read(condition) {
            Ok(samples) => samples,
            Err(TransportError::NoData) => return CycleSummary::default(),
            Err(err) => {
                warn!(%condition, error = %err, "objective read failed");
                return CycleSummary::default();
            }
        };

        let mut summary = CycleSummary {
            samples: samples.len(),
            ..CycleSummary::default()
        };
        for (info, objective) in &samples {
            self.dispatch(info, objective, &mut summary);
        }
        summary
    }

    fn dispatch(&mut self, info: &SampleInfo, objective: &GlobalAlarmObjective, summary: &mut CycleSummary) {
        let handle = info.instance_handle;

        if info.valid_data && info.view_state == ViewState::New {
            debug!(%handle, metric_id = %objective.metric_id, "objective bound");
            self.bindings.insert(handle, objective.metric_id.clone());
        }

        match info.instance_state {
            InstanceState::Alive if info.valid_data => {
                self.listener.on_set(objective);
                summary.set += 1;
            }
            InstanceState::Alive => {
                debug!(%handle, "objective sample without data ignored");
            }
            InstanceState::NotAlive => match self.bindings.get(&handle) {
                Some(metric_id) => {
                    self.listener.on_unset(metric_id);
                    summary.unset += 1;
                }
                None => {
                    warn!(%handle, "objective disposed before it was bound; unset skipped");
                    summary.unresolved += 1;
                }
            },
        }
    }
}

impl ConditionHandler for ObjectiveSubscriptionHandler {
    fn condition_changed(&mut self, condition: ConditionId) {
        let summary = self.read_cycle(condition);
        if summary.samples > 0 {
            debug!(%condition, ?summary, "objective read cycle");
        }
    }
}

impl std::fmt::Debug for ObjectiveSubscriptionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectiveSubscriptionHandler")
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}
