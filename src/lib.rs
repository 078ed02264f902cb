//! # vitalbus - Device telemetry publication over a pub/sub bus
//!
//! vitalbus is the layer between a physiological monitor's driver and a
//! publish/subscribe bus. The driver hands it readings; vitalbus decides when
//! a publishable instance is created, rewritten or retired, back-dates
//! waveform batches to their first sample, reconciles transient alert sets,
//! and applies alarm objectives published by other participants.
//!
//! ## Core Concepts
//!
//! - **Instance**: a live publishable slot for one metric identity
//! - **Holder**: the caller's receipt for an instance, handed back on the next publish
//! - **Reading**: a timestamp capture of optional device time plus host time
//! - **Objective**: externally published alarm bounds the device should apply
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vitalbus::{DeviceIdentity, DeviceSession, SessionConfig};
//! use vitalbus::transport::memory::InMemoryBus;
//!
//! let bus = InMemoryBus::new();
//! let mut session = DeviceSession::start(SessionConfig::default(), bus.transport())?;
//!
//! session.set_identity(DeviceIdentity::new("monitor-7").manufacturer("Acme"));
//! session.write_device_identity()?;
//!
//! let key = session.metric_key("MDC_PULS_OXIM_PULS_RATE", "vendor-hr").with_unit("MDC_DIM_BEAT_PER_MIN");
//! let reading = session.reading();
//! let hr = session.numeric_sample(None, Some(72.0), &key, &reading)?;
//! let hr = session.numeric_sample(hr, Some(75.0), &key, &session.reading())?;
//! session.numeric_sample(hr, None, &key, &session.reading())?; // retired
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod housekeeping;
pub mod objective;
pub mod publish;
pub mod registry;
pub mod session;
pub mod time;
pub mod topics;
pub mod transport;

// Re-export primary types at crate root for convenience
pub use alert::{AlertCategory, AlertSetReconciler, DeviceAlertConditionWriter};
pub use config::SessionConfig;
pub use error::{DeviceError, DeviceResult, StateError, TransportError, ValidationError};
pub use event_loop::{ConditionHandler, ConditionId, ConditionSignal, EventLoop};
pub use housekeeping::{Housekeeper, PartitionController, PartitionSource};
pub use objective::{
    objective_queue, AlarmObjectiveListener, ObjectiveQueue, ObjectiveSubscriptionHandler, ObjectiveUpdate,
    QueuedObjectiveSink,
};
pub use publish::{AlarmObjectivePublisher, AlarmSettingsPublisher, BatchPublisher, NumericPublisher, ScalarPublisher};
pub use registry::{InstanceHolder, InstanceRegistry};
pub use session::{DeviceSession, ShutdownReport};
pub use time::{back_date, reconcile, sample_times, DeviceClock, HostClock, Reading, WireTime, WireTimes};
pub use topics::{
    AlarmKey, AlarmSettings, Alert, AlertKey, Bounds, DeviceAlertCondition, DeviceIdentity, GlobalAlarmObjective,
    LocalAlarmObjective, MetricKey, Numeric, SampleArray, Topic, WaveformKey,
};
pub use transport::{DataWriter, DeviceTransport, InstanceHandle, SampleInfo, SampleReader};
