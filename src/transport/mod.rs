//! Transport primitives consumed by the publication layer.
//!
//! The pub/sub bus itself (participants, topic registration, QoS, wire format)
//! lives outside this crate. A device only needs:
//! - a [`DataWriter`] per payload type: register, write, unregister
//! - a [`SampleReader`] for subscriptions: create a read condition, read the
//!   samples it gates, return the loan
//!
//! [`memory`] provides in-process implementations for embedded use and tests.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::event_loop::{ConditionId, ConditionSignal};
use crate::topics::{
    AlarmSettings, Alert, DeviceAlertCondition, DeviceIdentity, GlobalAlarmObjective, LocalAlarmObjective, Numeric,
    SampleArray,
};

/// In-memory reference transport.
pub mod memory;

/// Opaque transport handle for one registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    /// The sentinel a transport returns when it cannot allocate an instance.
    pub const NIL: Self = Self(0);

    /// Wrap a transport-assigned value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The transport-assigned value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is [`NIL`](Self::NIL).
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "handle:nil")
        } else {
            write!(f, "handle:{}", self.0)
        }
    }
}

/// Writer for one payload type.
///
/// Implementations must be non-blocking or boundedly blocking.
pub trait DataWriter<T>: Send + Sync {
    /// Register an instance keyed by the identity fields of `data`.
    ///
    /// A transport that cannot allocate returns [`InstanceHandle::NIL`].
    fn register_instance(&self, data: &T) -> Result<InstanceHandle, TransportError>;

    /// Publish `data` on a registered instance.
    fn write(&self, data: &T, handle: InstanceHandle) -> Result<(), TransportError>;

    /// Retire a registered instance.
    fn unregister_instance(&self, data: &T, handle: InstanceHandle) -> Result<(), TransportError>;

    /// Release the writer itself.
    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Whether the reader has seen this instance before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ViewState {
    New,
    NotNew,
}

/// Liveliness of the instance a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum InstanceState {
    Alive,
    NotAlive,
}

/// Metadata accompanying each delivered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleInfo {
    /// Instance the sample belongs to.
    pub instance_handle: InstanceHandle,
    /// First delivery for this instance or not.
    pub view_state: ViewState,
    /// Whether the instance is still alive.
    pub instance_state: InstanceState,
    /// False when the sample only signals a state change (e.g. disposal).
    pub valid_data: bool,
}

/// Which samples a read condition selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StateMask {
    pub unread_only: bool,
    pub any_view_state: bool,
    pub any_instance_state: bool,
}

impl StateMask {
    /// Unread samples in any view or instance state.
    pub const UNREAD_ANY: Self = Self {
        unread_only: true,
        any_view_state: true,
        any_instance_state: true,
    };
}

impl Default for StateMask {
    fn default() -> Self {
        Self::UNREAD_ANY
    }
}

/// Subscription side of the transport.
pub trait SampleReader<T>: Send + Sync {
    /// Create a read condition. The transport calls `signal` whenever samples
    /// matching `mask` become available.
    fn create_condition(
        &self,
        condition: ConditionId,
        mask: StateMask,
        signal: ConditionSignal,
    ) -> Result<(), TransportError>;

    /// Delete a read condition created by [`create_condition`](Self::create_condition).
    fn delete_condition(&self, condition: ConditionId) -> Result<(), TransportError>;

    /// Read samples gated by `condition`, loaning the buffers to the caller.
    ///
    /// Returns `TransportError::NoData` when nothing is available. Every call,
    /// successful or not, must be followed by [`return_loan`](Self::return_loan).
    fn read(&self, condition: ConditionId) -> Result<Vec<(SampleInfo, T)>, TransportError>;

    /// Give loaned buffers back to the transport.
    fn return_loan(&self);

    /// Release the reader itself.
    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Returns a reader's loan when dropped, on every exit path.
pub struct LoanGuard<'a, T> {
    reader: &'a dyn SampleReader<T>,
}

impl<'a, T> LoanGuard<'a, T> {
    /// Guard the loan taken by the next read on `reader`.
    #[must_use]
    pub fn new(reader: &'a dyn SampleReader<T>) -> Self {
        Self { reader }
    }
}

impl<T> Drop for LoanGuard<'_, T> {
    fn drop(&mut self) {
        self.reader.return_loan();
    }
}

/// Every endpoint a device session publishes to or subscribes from.
///
/// Writer fields are named after the payload they carry.
#[derive(Clone)]
#[allow(missing_docs)]
pub struct DeviceTransport {
    pub identity: Arc<dyn DataWriter<DeviceIdentity>>,
    pub numeric: Arc<dyn DataWriter<Numeric>>,
    pub sample_array: Arc<dyn DataWriter<SampleArray>>,
    pub alarm_settings: Arc<dyn DataWriter<AlarmSettings>>,
    pub alarm_objective: Arc<dyn DataWriter<LocalAlarmObjective>>,
    pub device_alert: Arc<dyn DataWriter<DeviceAlertCondition>>,
    pub patient_alert: Arc<dyn DataWriter<Alert>>,
    pub technical_alert: Arc<dyn DataWriter<Alert>>,
    /// Subscription to alarm objectives published by other participants.
    pub objective_reader: Arc<dyn SampleReader<GlobalAlarmObjective>>,
}

impl fmt::Debug for DeviceTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTransport").finish_non_exhaustive()
    }
}
