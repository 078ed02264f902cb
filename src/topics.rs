//! Payload shapes published and consumed by a device, with their identity keys.
//!
//! The transport treats every payload as opaque. This layer only reads and
//! writes identity fields (device, metric, vendor metric, instance, unit,
//! frequency) and value fields.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::time::WireTimes;

/// Unit used when a metric has no dimension.
pub const DIMENSIONLESS: &str = "MDC_DIM_DIMLESS";

/// A publishable payload type whose instances are identified by a key.
pub trait Topic: Clone + fmt::Debug + Send + Sync + 'static {
    /// Identity of one instance; any field change names a different instance.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync;

    /// Topic name, used in logs.
    const NAME: &'static str;

    /// Identity of this payload.
    fn key(&self) -> Self::Key;

    /// A fresh payload carrying only identity fields.
    fn from_key(key: &Self::Key) -> Self;

    /// Device that owns an instance with this key.
    fn device_id(key: &Self::Key) -> &str;
}

/// Identity of a single-valued metric instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    /// Owning device's unique identifier.
    pub device_id: String,
    /// Standard nomenclature code of the metric.
    pub metric_id: String,
    /// Vendor's own code for the same metric.
    pub vendor_metric_id: String,
    /// Distinguishes repeated sensors reporting the same metric.
    pub instance_id: i32,
    /// Unit code.
    pub unit_id: String,
}

impl MetricKey {
    /// Creates a key with instance 0 and a dimensionless unit.
    #[must_use]
    pub fn new(device_id: impl Into<String>, metric_id: impl Into<String>, vendor_metric_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            metric_id: metric_id.into(),
            vendor_metric_id: vendor_metric_id.into(),
            instance_id: 0,
            unit_id: DIMENSIONLESS.to_string(),
        }
    }

    /// Same key with `instance_id` replaced.
    #[must_use]
    pub const fn with_instance(mut self, instance_id: i32) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Same key with `unit_id` replaced.
    #[must_use]
    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = unit_id.into();
        self
    }

    /// Key of a waveform sampled at `frequency` Hz.
    #[must_use]
    pub const fn at_frequency(self, frequency: u32) -> WaveformKey {
        WaveformKey {
            metric: self,
            frequency,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.device_id, self.metric_id, self.vendor_metric_id, self.instance_id, self.unit_id
        )
    }
}

/// Identity of a waveform instance. Frequency is part of identity so that
/// downstream consumers can assume fixed-rate framing per instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaveformKey {
    /// Metric identity.
    #[serde(flatten)]
    pub metric: MetricKey,
    /// Sampling rate in Hz.
    pub frequency: u32,
}

impl fmt::Display for WaveformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}Hz", self.metric, self.frequency)
    }
}

/// Identity of an alarm limit instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AlarmKey {
    pub device_id: String,
    pub metric_id: String,
}

impl AlarmKey {
    /// Key for `metric_id` on `device_id`.
    #[must_use]
    pub fn new(device_id: impl Into<String>, metric_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            metric_id: metric_id.into(),
        }
    }
}

/// Identity of a transient alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AlertKey {
    pub device_id: String,
    pub identifier: String,
}

/// Scalar numeric reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Numeric {
    #[serde(flatten)]
    pub key: MetricKey,
    pub value: f32,
    #[serde(flatten)]
    pub times: WireTimes,
}

impl Topic for Numeric {
    type Key = MetricKey;
    const NAME: &'static str = "Numeric";

    fn key(&self) -> MetricKey {
        self.key.clone()
    }

    fn from_key(key: &MetricKey) -> Self {
        Self {
            key: key.clone(),
            value: 0.0,
            times: WireTimes::default(),
        }
    }

    fn device_id(key: &MetricKey) -> &str {
        &key.device_id
    }
}

/// Batch of waveform samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SampleArray {
    #[serde(flatten)]
    pub key: WaveformKey,
    pub values: Vec<f32>,
    #[serde(flatten)]
    pub times: WireTimes,
}

impl Topic for SampleArray {
    type Key = WaveformKey;
    const NAME: &'static str = "SampleArray";

    fn key(&self) -> WaveformKey {
        self.key.clone()
    }

    fn from_key(key: &WaveformKey) -> Self {
        Self {
            key: key.clone(),
            values: Vec::new(),
            times: WireTimes::default(),
        }
    }

    fn device_id(key: &WaveformKey) -> &str {
        &key.metric.device_id
    }
}

/// A lower/upper limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Low limit.
    pub lower: f32,
    /// High limit.
    pub upper: f32,
}

impl Bounds {
    /// Pair of `lower` and `upper`.
    #[must_use]
    pub const fn new(lower: f32, upper: f32) -> Self {
        Self { lower, upper }
    }

    /// Both bounds, or nothing when either is missing.
    #[must_use]
    pub fn both(lower: Option<f32>, upper: Option<f32>) -> Option<Self> {
        Some(Self::new(lower?, upper?))
    }

    /// Missing bounds become unbounded.
    #[must_use]
    pub fn open_ended(lower: Option<f32>, upper: Option<f32>) -> Self {
        Self::new(lower.unwrap_or(f32::NEG_INFINITY), upper.unwrap_or(f32::INFINITY))
    }

    /// Bitwise comparison: NaN equals NaN, `-0.0` differs from `0.0`.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.lower.to_bits() == other.lower.to_bits() && self.upper.to_bits() == other.upper.to_bits()
    }
}

/// Alarm limits currently in force on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AlarmSettings {
    #[serde(flatten)]
    pub key: AlarmKey,
    #[serde(flatten)]
    pub bounds: Bounds,
}

/// Alarm limits the device asks the rest of the system to adopt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct LocalAlarmObjective {
    #[serde(flatten)]
    pub key: AlarmKey,
    #[serde(flatten)]
    pub bounds: Bounds,
}

macro_rules! alarm_topic {
    ($ty:ident, $name:literal) => {
        impl Topic for $ty {
            type Key = AlarmKey;
            const NAME: &'static str = $name;

            fn key(&self) -> AlarmKey {
                self.key.clone()
            }

            fn from_key(key: &AlarmKey) -> Self {
                Self {
                    key: key.clone(),
                    bounds: Bounds::new(0.0, 0.0),
                }
            }

            fn device_id(key: &AlarmKey) -> &str {
                &key.device_id
            }
        }
    };
}

alarm_topic!(AlarmSettings, "AlarmSettings");
alarm_topic!(LocalAlarmObjective, "LocalAlarmSettingsObjective");

/// Alarm limits published by another participant for devices to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAlarmObjective {
    /// Metric the limits apply to.
    pub metric_id: String,
    /// Requested low limit.
    pub lower: f32,
    /// Requested high limit.
    pub upper: f32,
}

impl GlobalAlarmObjective {
    /// Objective for `metric_id`.
    #[must_use]
    pub fn new(metric_id: impl Into<String>, lower: f32, upper: f32) -> Self {
        Self {
            metric_id: metric_id.into(),
            lower,
            upper,
        }
    }

    /// Requested limits as a pair.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        Bounds::new(self.lower, self.upper)
    }
}

/// Transient textual alert (patient or technical).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Alert {
    #[serde(flatten)]
    pub key: AlertKey,
    pub text: String,
}

impl Topic for Alert {
    type Key = AlertKey;
    const NAME: &'static str = "Alert";

    fn key(&self) -> AlertKey {
        self.key.clone()
    }

    fn from_key(key: &AlertKey) -> Self {
        Self {
            key: key.clone(),
            text: String::new(),
        }
    }

    fn device_id(key: &AlertKey) -> &str {
        &key.device_id
    }
}

/// Overall alert state of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DeviceAlertCondition {
    pub device_id: String,
    pub alert_state: String,
}

impl Topic for DeviceAlertCondition {
    type Key = String;
    const NAME: &'static str = "DeviceAlertCondition";

    fn key(&self) -> String {
        self.device_id.clone()
    }

    fn from_key(key: &String) -> Self {
        Self {
            device_id: key.clone(),
            alert_state: String::new(),
        }
    }

    fn device_id(key: &String) -> &str {
        key
    }
}

/// Descriptive identity of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DeviceIdentity {
    pub unique_device_identifier: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub operating_system: String,
    pub software_rev: String,
}

impl DeviceIdentity {
    /// Identity for `unique_device_identifier`, stamped with this host's OS
    /// and the crate version.
    #[must_use]
    pub fn new(unique_device_identifier: impl Into<String>) -> Self {
        Self {
            unique_device_identifier: unique_device_identifier.into(),
            operating_system: std::env::consts::OS.to_string(),
            software_rev: env!("CARGO_PKG_VERSION").to_string(),
            ..Self::default()
        }
    }

    /// Set the manufacturer.
    #[must_use]
    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    /// Set the model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the serial number.
    #[must_use]
    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = serial_number.into();
        self
    }

    /// True once a unique device identifier has been assigned.
    #[must_use]
    pub fn is_established(&self) -> bool {
        !self.unique_device_identifier.trim().is_empty()
    }
}

impl Topic for DeviceIdentity {
    type Key = String;
    const NAME: &'static str = "DeviceIdentity";

    fn key(&self) -> String {
        self.unique_device_identifier.clone()
    }

    fn from_key(key: &String) -> Self {
        Self {
            unique_device_identifier: key.clone(),
            ..Self::default()
        }
    }

    fn device_id(key: &String) -> &str {
        key
    }
}
