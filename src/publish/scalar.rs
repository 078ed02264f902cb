//! Scalar publisher.
//!
//! One state-transition function serves plain numerics and limit pairs. The
//! payload type decides, through [`ScalarTopic::apply`], whether a new value
//! changes anything visible on the wire; unchanged limit pairs are not
//! rewritten.

use std::sync::Arc;

use crate::error::DeviceResult;
use crate::registry::{InstanceHolder, InstanceRegistry};
use crate::time::{reconcile, Reading, WireTimes};
use crate::topics::{AlarmSettings, Bounds, LocalAlarmObjective, Numeric, Topic};
use crate::transport::DataWriter;

use super::require_identity;

/// A topic carrying one value.
pub trait ScalarTopic: Topic {
    /// What the driver hands over for one publish.
    type Value;

    /// Store `value` (and `times`, if the topic carries them). Returns whether
    /// the payload changed in a way that needs a write.
    fn apply(&mut self, value: &Self::Value, times: &WireTimes) -> bool;
}

impl ScalarTopic for Numeric {
    type Value = f32;

    fn apply(&mut self, value: &f32, times: &WireTimes) -> bool {
        self.value = *value;
        self.times = *times;
        true
    }
}

impl ScalarTopic for AlarmSettings {
    type Value = Bounds;

    fn apply(&mut self, value: &Bounds, _times: &WireTimes) -> bool {
        if self.bounds.same_as(value) {
            return false;
        }
        self.bounds = *value;
        true
    }
}

impl ScalarTopic for LocalAlarmObjective {
    type Value = Bounds;

    fn apply(&mut self, value: &Bounds, _times: &WireTimes) -> bool {
        if self.bounds.same_as(value) {
            return false;
        }
        self.bounds = *value;
        true
    }
}

/// Publisher for a single-valued topic.
#[derive(Debug)]
pub struct ScalarPublisher<T: ScalarTopic> {
    registry: InstanceRegistry<T>,
}

/// Numeric readings.
pub type NumericPublisher = ScalarPublisher<Numeric>;
/// Alarm limits in force on the device.
pub type AlarmSettingsPublisher = ScalarPublisher<AlarmSettings>;
/// Alarm limits the device asks others to adopt.
pub type AlarmObjectivePublisher = ScalarPublisher<LocalAlarmObjective>;

impl<T: ScalarTopic> ScalarPublisher<T> {
    /// Create a publisher with no live instances.
    pub fn new(writer: Arc<dyn DataWriter<T>>) -> Self {
        Self {
            registry: InstanceRegistry::new(writer),
        }
    }

    /// Publish `value` under `key`, or retire the instance when `value` is `None`.
    ///
    /// Returns the holder to pass on the next call. `None` means no instance is
    /// live, either because the value was absent or because the transport
    /// could not allocate one.
    ///
    /// # Errors
    ///
    /// - `StateError::IdentityNotEstablished` if `key` names no device
    /// - transport write failures
    pub fn publish(
        &mut self,
        holder: Option<InstanceHolder<T::Key>>,
        key: &T::Key,
        value: Option<T::Value>,
        reading: &Reading,
    ) -> DeviceResult<Option<InstanceHolder<T::Key>>> {
        let holder = self.registry.invalidate_if_key_changed(holder, key);

        let Some(value) = value else {
            if let Some(holder) = holder {
                self.registry.retire(&holder);
            }
            return Ok(None);
        };

        require_identity::<T>(key)?;
        let times = reconcile(reading);

        let Some((holder, created)) = self.registry.ensure(key) else {
            return Ok(None);
        };
        self.registry
            .update(&holder, |data| data.apply(&value, &times) || created)?;
        Ok(Some(holder))
    }

    /// Retire the instance behind `holder`, if still live.
    pub fn retire(&mut self, holder: &InstanceHolder<T::Key>) -> bool {
        self.registry.retire(holder)
    }

    /// Retire every instance this publisher created.
    pub fn retire_all(&mut self) -> usize {
        self.registry.retire_all()
    }

    /// Read-only view of the live instances.
    #[must_use]
    pub const fn registry(&self) -> &InstanceRegistry<T> {
        &self.registry
    }

    /// Release this publisher's writer.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close failure.
    pub fn close_writer(&self) -> DeviceResult<()> {
        Ok(self.registry.close_writer()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, StateError};
    use crate::topics::{AlarmKey, MetricKey};
    use crate::transport::memory::InMemoryWriter;
    use chrono::{TimeZone, Utc};

    fn reading(sec: i64) -> Reading {
        Reading::host_only(Utc.timestamp_opt(sec, 0).unwrap())
    }

    fn numeric_setup() -> (Arc<InMemoryWriter<Numeric>>, NumericPublisher) {
        let writer = Arc::new(InMemoryWriter::new());
        let publisher = NumericPublisher::new(Arc::clone(&writer) as Arc<dyn DataWriter<Numeric>>);
        (writer, publisher)
    }

    #[test]
    fn test_numeric_lifecycle() {
        let (writer, mut publisher) = numeric_setup();
        let key = MetricKey::new("dev1", "HR", "vendorHR").with_unit("bpm");

        let holder = publisher.publish(None, &key, Some(72.0), &reading(10)).unwrap();
        assert!(holder.is_some());
        assert_eq!(writer.register_count(), 1);
        assert_eq!(writer.write_count(), 1);

        let same = publisher.publish(holder.clone(), &key, Some(75.0), &reading(11)).unwrap();
        assert_eq!(same, holder);
        assert_eq!(writer.register_count(), 1);
        assert_eq!(writer.write_count(), 2);

        let last = writer.writes().pop().unwrap();
        assert_eq!(last.value, 75.0);
        assert_eq!(last.times.presentation_time.sec, 11);
        assert_eq!(last.times.device_time.sec, 0);

        let gone = publisher.publish(same, &key, None, &reading(12)).unwrap();
        assert!(gone.is_none());
        assert_eq!(writer.unregister_count(), 1);
        assert!(publisher.registry().is_empty());
    }

    #[test]
    fn test_null_never_creates() {
        let (writer, mut publisher) = numeric_setup();
        let key = MetricKey::new("dev1", "HR", "vendorHR");
        assert!(publisher.publish(None, &key, None, &reading(1)).unwrap().is_none());
        assert_eq!(writer.register_count(), 0);
        assert_eq!(writer.unregister_count(), 0);
    }

    #[test]
    fn test_numeric_writes_repeated_value() {
        let (writer, mut publisher) = numeric_setup();
        let key = MetricKey::new("dev1", "SpO2", "vSpO2");
        let h = publisher.publish(None, &key, Some(98.0), &reading(1)).unwrap();
        publisher.publish(h, &key, Some(98.0), &reading(2)).unwrap();
        assert_eq!(writer.write_count(), 2);
    }

    #[test]
    fn test_key_change_retires_exactly_once() {
        let (writer, mut publisher) = numeric_setup();
        let bpm = MetricKey::new("dev1", "HR", "vendorHR").with_unit("bpm");
        let other = bpm.clone().with_instance(1);
        let h = publisher.publish(None, &bpm, Some(60.0), &reading(1)).unwrap();
        let h2 = publisher.publish(h, &other, Some(61.0), &reading(2)).unwrap().unwrap();
        assert_eq!(h2.key(), &other);
        assert_eq!(writer.unregister_count(), 1);
        assert_eq!(writer.register_count(), 2);
        assert_eq!(publisher.registry().len(), 1);
    }

    #[test]
    fn test_missing_identity_fails_fast() {
        let (writer, mut publisher) = numeric_setup();
        let key = MetricKey::new("", "HR", "vendorHR");
        let err = publisher.publish(None, &key, Some(1.0), &reading(1)).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::State(StateError::IdentityNotEstablished { topic: "Numeric" })
        ));
        assert_eq!(writer.register_count(), 0);
    }

    #[test]
    fn test_nil_handle_yields_no_holder() {
        let (writer, mut publisher) = numeric_setup();
        writer.refuse_registrations(true);
        let key = MetricKey::new("dev1", "HR", "vendorHR");
        assert!(publisher.publish(None, &key, Some(1.0), &reading(1)).unwrap().is_none());
        assert_eq!(writer.write_count(), 0);
    }

    #[test]
    fn test_identical_bounds_written_once() {
        let writer = Arc::new(InMemoryWriter::<LocalAlarmObjective>::new());
        let mut publisher =
            AlarmObjectivePublisher::new(Arc::clone(&writer) as Arc<dyn DataWriter<LocalAlarmObjective>>);
        let key = AlarmKey::new("dev1", "HR");
        let bounds = Bounds::new(50.0, 120.0);

        let h = publisher.publish(None, &key, Some(bounds), &reading(1)).unwrap();
        let h = publisher.publish(h, &key, Some(bounds), &reading(2)).unwrap();
        assert!(h.is_some());
        assert_eq!(writer.register_count(), 1);
        assert_eq!(writer.write_count(), 1);

        publisher.publish(h, &key, Some(Bounds::new(50.0, 110.0)), &reading(3)).unwrap();
        assert_eq!(writer.write_count(), 2);
    }

    #[test]
    fn test_numeric_retry_after_failed_write() {
        let (writer, mut publisher) = numeric_setup();
        let key = MetricKey::new("dev1", "HR", "vendorHR");
        let h = publisher.publish(None, &key, Some(60.0), &reading(1)).unwrap();

        writer.fail_writes(true);
        let err = publisher.publish(h.clone(), &key, Some(61.0), &reading(2)).unwrap_err();
        assert!(err.is_transport());
        assert_eq!(writer.write_count(), 1);

        writer.fail_writes(false);
        let again = publisher.publish(h.clone(), &key, Some(61.0), &reading(2)).unwrap();
        assert_eq!(again, h);
        assert_eq!(writer.write_count(), 2);
        assert_eq!(writer.writes().pop().unwrap().value, 61.0);
    }

    #[test]
    fn test_bounds_retry_after_failed_write() {
        let writer = Arc::new(InMemoryWriter::<LocalAlarmObjective>::new());
        let mut publisher =
            AlarmObjectivePublisher::new(Arc::clone(&writer) as Arc<dyn DataWriter<LocalAlarmObjective>>);
        let key = AlarmKey::new("dev1", "HR");

        let h = publisher.publish(None, &key, Some(Bounds::new(50.0, 120.0)), &reading(1)).unwrap();
        writer.fail_writes(true);
        assert!(publisher
            .publish(h.clone(), &key, Some(Bounds::new(40.0, 110.0)), &reading(2))
            .is_err());

        writer.fail_writes(false);
        publisher.publish(h.clone(), &key, Some(Bounds::new(40.0, 110.0)), &reading(3)).unwrap();
        assert_eq!(writer.write_count(), 2);
        assert!(writer.writes().pop().unwrap().bounds.same_as(&Bounds::new(40.0, 110.0)));

        // Now published, so the same limits are not rewritten.
        publisher.publish(h, &key, Some(Bounds::new(40.0, 110.0)), &reading(4)).unwrap();
        assert_eq!(writer.write_count(), 2);
    }

    #[test]
    fn test_first_write_happens_even_for_zero_bounds() {
        let writer = Arc::new(InMemoryWriter::<AlarmSettings>::new());
        let mut publisher = AlarmSettingsPublisher::new(Arc::clone(&writer) as Arc<dyn DataWriter<AlarmSettings>>);
        let key = AlarmKey::new("dev1", "HR");
        publisher.publish(None, &key, Some(Bounds::new(0.0, 0.0)), &reading(1)).unwrap();
        assert_eq!(writer.write_count(), 1);
    }
}
