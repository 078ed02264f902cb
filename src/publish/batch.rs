//! Waveform batch publisher.
//!
//! A batch arrives after its last sample was taken. The reading is moved back
//! to the first sample before the instance is registered, so even the
//! registration timestamp reflects the start of the batch. Frequency is part
//! of the key: changing the sampling rate recreates the instance.

use std::sync::Arc;

use crate::error::{DeviceResult, ValidationError};
use crate::registry::{InstanceHolder, InstanceRegistry};
use crate::time::{back_date, reconcile, Reading};
use crate::topics::{SampleArray, WaveformKey};
use crate::transport::DataWriter;

use super::require_identity;

/// Publisher for [`SampleArray`] batches.
#[derive(Debug)]
pub struct BatchPublisher {
    registry: InstanceRegistry<SampleArray>,
}

impl BatchPublisher {
    /// Create a publisher with no live instances.
    pub fn new(writer: Arc<dyn DataWriter<SampleArray>>) -> Self {
        Self {
            registry: InstanceRegistry::new(writer),
        }
    }

    /// Publish a batch under `key`, or retire the instance when `samples` is
    /// `None` or empty.
    ///
    /// # Errors
    ///
    /// - `ValidationError::NotPositive` if `key.frequency` is zero
    /// - `StateError::IdentityNotEstablished` if `key` names no device
    /// - transport write failures
    pub fn publish(
        &mut self,
        holder: Option<InstanceHolder<WaveformKey>>,
        key: &WaveformKey,
        samples: Option<&[f32]>,
        reading: &Reading,
    ) -> DeviceResult<Option<InstanceHolder<WaveformKey>>> {
        let holder = self.registry.invalidate_if_key_changed(holder, key);

        let samples = match samples {
            Some(samples) if !samples.is_empty() => samples,
            _ => {
                if let Some(holder) = holder {
                    self.registry.retire(&holder);
                }
                return Ok(None);
            }
        };

        if key.frequency == 0 {
            return Err(ValidationError::NotPositive {
                field: "frequency".to_string(),
            }
            .into());
        }
        require_identity::<SampleArray>(key)?;

        let times = reconcile(&back_date(reading, key.frequency, samples.len()));

        let Some((holder, _)) = self.registry.ensure_with(key, |data| {
            data.values = samples.to_vec();
            data.times = times;
        }) else {
            return Ok(None);
        };
        self.registry.update(&holder, |data| {
            data.values.clear();
            data.values.extend_from_slice(samples);
            data.times = times;
            true
        })?;
        Ok(Some(holder))
    }

    /// Retire the instance behind `holder`, if still live.
    pub fn retire(&mut self, holder: &InstanceHolder<WaveformKey>) -> bool {
        self.registry.retire(holder)
    }

    /// Retire every batch instance. Returns how many were retired.
    pub fn retire_all(&mut self) -> usize {
        self.registry.retire_all()
    }

    /// Read-only view of the live instances.
    #[must_use]
    pub const fn registry(&self) -> &InstanceRegistry<SampleArray> {
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
