//! Timestamp reconciliation.
//!
//! A device reports a [`Reading`]: the host time at which data arrived plus,
//! when the device keeps its own clock, the device-local time. Publishers turn
//! a reading into wire time fields with [`reconcile`]. Waveform batches arrive
//! after their last sample was taken, so [`back_date`] moves the reading to
//! the first sample of the batch.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// A timestamp capture: optional device-local time plus mandatory host time.
///
/// # Examples
///
/// ```
/// use vitalbus::time::{reconcile, Reading};
/// use chrono::{TimeZone, Utc};
///
/// let host = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
/// let wire = reconcile(&Reading::host_only(host));
/// assert_eq!(wire.device_time.sec, 0);
/// assert_eq!(wire.presentation_time.sec, 1_700_000_000);
/// assert_eq!(wire.presentation_time.nanosec, 250_000_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    /// Device-local time, when the device maintains a clock.
    pub device_time: Option<DateTime<Utc>>,

    /// Host time at which the reading was captured.
    pub host_time: DateTime<Utc>,
}

impl Reading {
    /// A reading with host time only.
    #[must_use]
    pub const fn host_only(host_time: DateTime<Utc>) -> Self {
        Self {
            device_time: None,
            host_time,
        }
    }

    /// A reading carrying both device and host time.
    #[must_use]
    pub const fn with_device_time(device_time: DateTime<Utc>, host_time: DateTime<Utc>) -> Self {
        Self {
            device_time: Some(device_time),
            host_time,
        }
    }

    /// A host-only reading taken now.
    #[must_use]
    pub fn now() -> Self {
        Self::host_only(Utc::now())
    }

    /// Whether the device supplied its own time.
    #[must_use]
    pub const fn has_device_time(&self) -> bool {
        self.device_time.is_some()
    }
}

/// Seconds and nanoseconds since the Unix epoch, as carried on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WireTime {
    /// Whole seconds since the epoch.
    pub sec: i64,
    /// Sub-second part, below one billion.
    pub nanosec: u32,
}

impl WireTime {
    /// The zero time, used when a device time is absent.
    pub const ZERO: Self = Self { sec: 0, nanosec: 0 };

    /// Converts a UTC timestamp to wire time.
    ///
    /// # Panics
    ///
    /// Panics if `at` precedes the Unix epoch. Callers hand us clock readings,
    /// so a negative duration means the caller is broken.
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let sec = at.timestamp();
        assert!(sec >= 0, "timestamp {at} precedes the Unix epoch");
        Self {
            sec,
            nanosec: at.timestamp_subsec_nanos(),
        }
    }
}

/// Wire-ready time fields for one write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireTimes {
    /// Device-local time; zero when the device has no clock.
    pub device_time: WireTime,

    /// Host time used for presentation.
    pub presentation_time: WireTime,
}

/// Converts a reading into wire time fields.
///
/// # Panics
///
/// Panics if either time precedes the Unix epoch.
#[must_use]
pub fn reconcile(reading: &Reading) -> WireTimes {
    WireTimes {
        device_time: reading
            .device_time
            .map_or(WireTime::ZERO, WireTime::from_datetime),
        presentation_time: WireTime::from_datetime(reading.host_time),
    }
}

/// Span covered by `steps` sample periods at `frequency_hz`, in whole nanoseconds.
fn sample_span(frequency_hz: u32, steps: usize) -> Duration {
    if frequency_hz == 0 || steps == 0 {
        return Duration::zero();
    }
    let nanos = (steps as u128) * NANOS_PER_SECOND / u128::from(frequency_hz);
    Duration::nanoseconds(i64::try_from(nanos).unwrap_or(i64::MAX))
}

/// Moves a batch reading back to the time of the batch's first sample.
///
/// The host time is shifted earlier by `(sample_count - 1) / frequency_hz`
/// seconds, truncated to whole nanoseconds. Device time presence is preserved.
/// A zero frequency or a batch of at most one sample leaves the reading as is.
///
/// # Examples
///
/// ```
/// use vitalbus::time::{back_date, Reading};
/// use chrono::{Duration, Utc};
///
/// let host = Utc::now();
/// let first = back_date(&Reading::host_only(host), 100, 10);
/// assert_eq!(host - first.host_time, Duration::milliseconds(90));
/// ```
#[must_use]
pub fn back_date(reading: &Reading, frequency_hz: u32, sample_count: usize) -> Reading {
    let span = sample_span(frequency_hz, sample_count.saturating_sub(1));
    Reading {
        device_time: reading.device_time,
        host_time: reading.host_time - span,
    }
}

/// Host time of every sample in a batch, oldest first.
///
/// Sample `i` of `n` is stamped `host_time - (n - 1 - i) / frequency_hz`.
#[must_use]
pub fn sample_times(reading: &Reading, frequency_hz: u32, sample_count: usize) -> Vec<DateTime<Utc>> {
    (0..sample_count)
        .map(|index| reading.host_time - sample_span(frequency_hz, sample_count - 1 - index))
        .collect()
}

/// Source of readings for a device.
///
/// Devices without their own clock use [`HostClock`]. Devices that report
/// their own time build readings with [`Reading::with_device_time`].
pub trait DeviceClock: Send + Sync {
    /// Current reading.
    fn instant(&self) -> Reading;
}

/// Clock that only knows host time.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostClock;

impl DeviceClock for HostClock {
    fn instant(&self) -> Reading {
        Reading::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(sec: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(sec, nanos).unwrap()
    }

    #[test]
    fn test_reconcile_without_device_time_zeroes_device_fields() {
        let wire = reconcile(&Reading::host_only(at(100, 5)));
        assert_eq!(wire.device_time, WireTime::ZERO);
        assert_eq!(wire.presentation_time, WireTime { sec: 100, nanosec: 5 });
    }

    #[test]
    fn test_reconcile_with_device_time() {
        let wire = reconcile(&Reading::with_device_time(at(50, 1), at(100, 2)));
        assert_eq!(wire.device_time, WireTime { sec: 50, nanosec: 1 });
        assert_eq!(wire.presentation_time, WireTime { sec: 100, nanosec: 2 });
    }

    #[test]
    #[should_panic(expected = "precedes the Unix epoch")]
    fn test_reconcile_rejects_pre_epoch() {
        let _ = reconcile(&Reading::host_only(at(-1, 0)));
    }

    #[test]
    fn test_back_date_ten_samples_at_100hz() {
        let host = at(1_000, 0);
        let first = back_date(&Reading::host_only(host), 100, 10);
        assert_eq!(first.host_time, at(999, 910_000_000));
        assert!(!first.has_device_time());
    }

    #[test]
    fn test_back_date_preserves_device_time() {
        let device = at(10, 0);
        let first = back_date(&Reading::with_device_time(device, at(1_000, 0)), 50, 5);
        assert_eq!(first.device_time, Some(device));
        assert_eq!(first.host_time, at(999, 920_000_000));
    }

    #[test]
    fn test_back_date_degenerate_inputs() {
        let reading = Reading::host_only(at(1_000, 0));
        assert_eq!(back_date(&reading, 0, 10), reading);
        assert_eq!(back_date(&reading, 100, 1), reading);
        assert_eq!(back_date(&reading, 100, 0), reading);
    }

    #[test]
    fn test_back_date_truncates_to_nanoseconds() {
        // 2 samples at 3 Hz: 333_333_333.33ns
        let first = back_date(&Reading::host_only(at(1_000, 0)), 3, 2);
        assert_eq!(first.host_time, at(999, 666_666_667));
    }

    #[test]
    fn test_sample_times_first_and_last() {
        let host = at(1_000, 0);
        let times = sample_times(&Reading::host_only(host), 100, 10);
        assert_eq!(times.len(), 10);
        assert_eq!(times[0], at(999, 910_000_000));
        assert_eq!(times[9], host);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_host_clock_has_no_device_time() {
        assert!(!HostClock.instant().has_device_time());
    }
}
