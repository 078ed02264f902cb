//! Device session: the owning object that wires identity, publishers, alert
//! reconcilers, the objective subscription and housekeeping together for one
//! device.
//!
//! Publish calls are made from the device's own thread. Subscription
//! callbacks run on the shared [`EventLoop`] and only queue their results;
//! [`DeviceSession::apply_pending_objectives`] applies them on the device
//! thread.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::alert::{AlertCategory, AlertSetReconciler, DeviceAlertConditionWriter};
use crate::config::SessionConfig;
use crate::error::{DeviceError, DeviceResult, StateError};
use crate::event_loop::{ConditionId, EventLoop};
use crate::housekeeping::{Housekeeper, PartitionController, PartitionSource};
use crate::objective::{
    objective_queue, AlarmObjectiveListener, ObjectiveQueue, ObjectiveSubscriptionHandler, QueuedObjectiveSink,
};
use crate::publish::{AlarmObjectivePublisher, AlarmSettingsPublisher, BatchPublisher, NumericPublisher};
use crate::registry::{InstanceHolder, InstanceRegistry};
use crate::time::{DeviceClock, HostClock, Reading};
use crate::topics::{AlarmKey, Bounds, DeviceIdentity, MetricKey, Topic, WaveformKey};
use crate::transport::{DataWriter, DeviceTransport, SampleReader, StateMask};

/// What [`DeviceSession::shutdown`] managed to release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Instances unregistered during teardown.
    pub retired: usize,
    /// Resources whose release failed, in teardown order.
    pub failures: Vec<String>,
}

impl ShutdownReport {
    /// Whether every resource was released.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, resource: &str, result: Result<(), impl std::fmt::Display>) {
        if let Err(err) = result {
            error!(resource, error = %err, "failed to release resource");
            self.failures.push(resource.to_string());
        }
    }
}

/// One device's publication state.
pub struct DeviceSession {
    config: SessionConfig,
    transport: DeviceTransport,
    event_loop: Arc<EventLoop>,
    clock: Arc<dyn DeviceClock>,

    identity: DeviceIdentity,
    identities: InstanceRegistry<DeviceIdentity>,
    identity_holder: Option<InstanceHolder<String>>,

    numerics: NumericPublisher,
    waveforms: BatchPublisher,
    alarm_settings: AlarmSettingsPublisher,
    alarm_objectives: AlarmObjectivePublisher,

    device_alert: DeviceAlertConditionWriter,
    patient_alerts: AlertSetReconciler,
    technical_alerts: AlertSetReconciler,

    objective_condition: Option<ConditionId>,
    objective_sink: QueuedObjectiveSink,
    objective_queue: ObjectiveQueue,

    partitions: PartitionController,
    housekeeper: Option<Housekeeper>,

    shut_down: bool,
}

impl DeviceSession {
    /// Create a session with its own event loop, sized by
    /// [`SessionConfig::event_loop_queue_capacity`].
    ///
    /// # Errors
    ///
    /// Returns the configuration's validation error, or `DeviceError::Internal`
    /// if the loop thread cannot be spawned.
    pub fn start(config: SessionConfig, transport: DeviceTransport) -> DeviceResult<Self> {
        config.validate()?;
        let event_loop = EventLoop::start("vitalbus-events", config.event_loop_queue_capacity)?;
        Self::new(config, transport, Arc::new(event_loop))
    }

    /// Create a session over `transport`, sharing `event_loop` with other
    /// sessions. Nothing is published until the
    /// identity is written.
    ///
    /// # Errors
    ///
    /// Returns the configuration's validation error.
    pub fn new(config: SessionConfig, transport: DeviceTransport, event_loop: Arc<EventLoop>) -> DeviceResult<Self> {
        config.validate()?;
        let (objective_sink, objective_queue) = objective_queue(config.objective_queue_capacity);

        Ok(Self {
            identities: InstanceRegistry::new(Arc::clone(&transport.identity)),
            numerics: NumericPublisher::new(Arc::clone(&transport.numeric)),
            waveforms: BatchPublisher::new(Arc::clone(&transport.sample_array)),
            alarm_settings: AlarmSettingsPublisher::new(Arc::clone(&transport.alarm_settings)),
            alarm_objectives: AlarmObjectivePublisher::new(Arc::clone(&transport.alarm_objective)),
            device_alert: DeviceAlertConditionWriter::new(Arc::clone(&transport.device_alert)),
            patient_alerts: AlertSetReconciler::new(AlertCategory::Patient, Arc::clone(&transport.patient_alert)),
            technical_alerts: AlertSetReconciler::new(
                AlertCategory::Technical,
                Arc::clone(&transport.technical_alert),
            ),
            config,
            transport,
            event_loop,
            clock: Arc::new(HostClock),
            identity: DeviceIdentity::default(),
            identity_holder: None,
            objective_condition: None,
            objective_sink,
            objective_queue,
            partitions: PartitionController::new(),
            housekeeper: None,
            shut_down: false,
        })
    }

    /// Use `clock` for readings taken by the session itself.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn DeviceClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validated configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Loop running this session's subscription callbacks.
    #[must_use]
    pub const fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// A reading from the session clock.
    #[must_use]
    pub fn reading(&self) -> Reading {
        self.clock.instant()
    }

    // ---- identity -------------------------------------------------------

    /// Identity as last set, published or not.
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Edit the identity; call [`write_device_identity`](Self::write_device_identity)
    /// to publish the edits.
    pub fn identity_mut(&mut self) -> &mut DeviceIdentity {
        &mut self.identity
    }

    /// Replace the identity; see [`identity_mut`](Self::identity_mut).
    pub fn set_identity(&mut self, identity: DeviceIdentity) {
        self.identity = identity;
    }

    /// Manufacturer, if set.
    #[must_use]
    pub fn manufacturer(&self) -> Option<&str> {
        non_empty(&self.identity.manufacturer)
    }

    /// Model, if set.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        non_empty(&self.identity.model)
    }

    /// Unique device identifier, once established.
    #[must_use]
    pub fn unique_device_identifier(&self) -> Option<&str> {
        non_empty(&self.identity.unique_device_identifier)
    }

    /// Publish the identity and bring up the per-device resources that depend
    /// on it: the device alert condition and the objective subscription.
    ///
    /// # Errors
    ///
    /// - `StateError::IdentityNotEstablished` if the unique identifier is empty
    /// - `StateError::ShutDown` after [`shutdown`](Self::shutdown)
    /// - transport failures writing the identity or creating the subscription
    pub fn write_device_identity(&mut self) -> DeviceResult<()> {
        self.ensure_open()?;
        if !self.identity.is_established() {
            return Err(StateError::IdentityNotEstablished {
                topic: DeviceIdentity::NAME,
            }
            .into());
        }

        let uid = self.identity.unique_device_identifier.clone();
        let holder = self.identities.invalidate_if_key_changed(self.identity_holder.take(), &uid);
        self.identity_holder = holder.or_else(|| self.identities.ensure(&uid).map(|(holder, _)| holder));
        if let Some(holder) = &self.identity_holder {
            let identity = &self.identity;
            self.identities.update(holder, |published| {
                published.clone_from(identity);
                true
            })?;
        }

        self.patient_alerts.set_device_id(uid.as_str());
        self.technical_alerts.set_device_id(uid.as_str());
        self.device_alert.create(&uid);

        if self.objective_condition.is_none() {
            self.objective_condition = Some(self.attach_objective_handler()?);
        }
        Ok(())
    }

    fn attach_objective_handler(&self) -> DeviceResult<ConditionId> {
        let condition = ConditionId::new();
        let handler = ObjectiveSubscriptionHandler::new(
            Arc::clone(&self.transport.objective_reader),
            Box::new(self.objective_sink.clone()),
        );
        self.event_loop.add_handler(condition, Box::new(handler))?;

        let signal = self.event_loop.signal_for(condition);
        if let Err(err) = self
            .transport
            .objective_reader
            .create_condition(condition, StateMask::UNREAD_ANY, signal)
        {
            if let Err(detach) = self.event_loop.remove_handler(condition) {
                warn!(%condition, error = %detach, "failed to detach objective handler");
            }
            return Err(err.into());
        }
        info!(%condition, "objective subscription attached");
        Ok(condition)
    }

    // ---- sampling -------------------------------------------------------

    /// Key for `metric_id` on this device, with the configured default
    /// instance and unit.
    #[must_use]
    pub fn metric_key(&self, metric_id: &str, vendor_metric_id: &str) -> MetricKey {
        MetricKey::new(
            self.identity.unique_device_identifier.as_str(),
            metric_id,
            vendor_metric_id,
        )
        .with_instance(self.config.default_instance_id)
        .with_unit(self.config.default_unit_id.as_str())
    }

    /// Publish a numeric reading, or retire it when `value` is `None`.
    ///
    /// # Errors
    ///
    /// See [`crate::publish::ScalarPublisher::publish`]; also fails after shutdown.
    pub fn numeric_sample(
        &mut self,
        holder: Option<InstanceHolder<MetricKey>>,
        value: Option<f32>,
        key: &MetricKey,
        reading: &Reading,
    ) -> DeviceResult<Option<InstanceHolder<MetricKey>>> {
        self.ensure_open()?;
        self.numerics.publish(holder, key, value, reading)
    }

    /// [`numeric_sample`](Self::numeric_sample) for devices reporting integers.
    ///
    /// # Errors
    ///
    /// Same as [`numeric_sample`](Self::numeric_sample).
    #[allow(clippy::cast_precision_loss)]
    pub fn numeric_sample_int(
        &mut self,
        holder: Option<InstanceHolder<MetricKey>>,
        value: Option<i32>,
        key: &MetricKey,
        reading: &Reading,
    ) -> DeviceResult<Option<InstanceHolder<MetricKey>>> {
        self.numeric_sample(holder, value.map(|v| v as f32), key, reading)
    }

    /// Publish a waveform batch, back-dated to its first sample, or retire it
    /// when `samples` is `None` or empty.
    ///
    /// # Errors
    ///
    /// See [`BatchPublisher::publish`]; also fails after shutdown.
    pub fn sample_array_sample(
        &mut self,
        holder: Option<InstanceHolder<WaveformKey>>,
        samples: Option<&[f32]>,
        key: &WaveformKey,
        reading: &Reading,
    ) -> DeviceResult<Option<InstanceHolder<WaveformKey>>> {
        self.ensure_open()?;
        self.waveforms.publish(holder, key, samples, reading)
    }

    /// [`sample_array_sample`](Self::sample_array_sample) for integer samples.
    ///
    /// # Errors
    ///
    /// Same as [`sample_array_sample`](Self::sample_array_sample).
    #[allow(clippy::cast_precision_loss)]
    pub fn sample_array_sample_int(
        &mut self,
        holder: Option<InstanceHolder<WaveformKey>>,
        samples: Option<&[i32]>,
        key: &WaveformKey,
        reading: &Reading,
    ) -> DeviceResult<Option<InstanceHolder<WaveformKey>>> {
        let widened: Option<Vec<f32>> = samples.map(|s| s.iter().map(|&v| v as f32).collect());
        self.sample_array_sample(holder, widened.as_deref(), key, reading)
    }

    /// Publish the alarm limits in force for `metric_id`. A missing bound is
    /// published as open (negative or positive infinity). Unchanged limits
    /// are not rewritten.
    ///
    /// # Errors
    ///
    /// Same as [`numeric_sample`](Self::numeric_sample).
    pub fn alarm_settings_sample(
        &mut self,
        holder: Option<InstanceHolder<AlarmKey>>,
        lower: Option<f32>,
        upper: Option<f32>,
        metric_id: &str,
    ) -> DeviceResult<Option<InstanceHolder<AlarmKey>>> {
        self.ensure_open()?;
        let key = AlarmKey::new(self.identity.unique_device_identifier.as_str(), metric_id);
        let reading = self.reading();
        self.alarm_settings
            .publish(holder, &key, Some(Bounds::open_ended(lower, upper)), &reading)
    }

    /// Publish the limits this device asks others to adopt for `metric_id`.
    /// Both bounds are required; otherwise the objective is retired.
    ///
    /// # Errors
    ///
    /// Same as [`numeric_sample`](Self::numeric_sample).
    pub fn alarm_objective_sample(
        &mut self,
        holder: Option<InstanceHolder<AlarmKey>>,
        lower: Option<f32>,
        upper: Option<f32>,
        metric_id: &str,
    ) -> DeviceResult<Option<InstanceHolder<AlarmKey>>> {
        self.ensure_open()?;
        let key = AlarmKey::new(self.identity.unique_device_identifier.as_str(), metric_id);
        let reading = self.reading();
        self.alarm_objectives
            .publish(holder, &key, Bounds::both(lower, upper), &reading)
    }

    // ---- alerts ---------------------------------------------------------

    /// Publish the device-level alert state; `None` publishes the empty state.
    ///
    /// # Errors
    ///
    /// - `StateError::NoDeviceAlertCondition` before the identity was written
    /// - transport write failures
    pub fn write_device_alert(&mut self, state: Option<&str>) -> DeviceResult<()> {
        self.ensure_open()?;
        self.device_alert.write(state)
    }

    /// Alert reconciler for `category`.
    pub fn alerts_mut(&mut self, category: AlertCategory) -> &mut AlertSetReconciler {
        match category {
            AlertCategory::Patient => &mut self.patient_alerts,
            AlertCategory::Technical => &mut self.technical_alerts,
        }
    }

    /// Read-only alert reconciler for `category`.
    #[must_use]
    pub const fn alerts(&self, category: AlertCategory) -> &AlertSetReconciler {
        match category {
            AlertCategory::Patient => &self.patient_alerts,
            AlertCategory::Technical => &self.technical_alerts,
        }
    }

    // ---- objectives -----------------------------------------------------

    /// Apply objective updates resolved on the event loop since the last call.
    pub fn apply_pending_objectives(&self, listener: &mut dyn AlarmObjectiveListener) -> usize {
        self.objective_queue.drain(listener)
    }

    /// Objective updates waiting for [`apply_pending_objectives`](Self::apply_pending_objectives).
    #[must_use]
    pub fn pending_objectives(&self) -> usize {
        self.objective_queue.pending()
    }

    /// Objective updates lost to a full queue.
    #[must_use]
    pub fn dropped_objectives(&self) -> u64 {
        self.objective_queue.dropped()
    }

    // ---- housekeeping ---------------------------------------------------

    /// Partition assignment kept current by the housekeeping thread.
    #[must_use]
    pub const fn partitions(&self) -> &PartitionController {
        &self.partitions
    }

    /// Poll `source` on the housekeeping thread at the configured fixed delay,
    /// replacing any previous source.
    ///
    /// # Errors
    ///
    /// - `StateError::ShutDown` after [`shutdown`](Self::shutdown)
    /// - `DeviceError::Internal` if the thread cannot be spawned
    pub fn start_partition_polling(&mut self, mut source: Box<dyn PartitionSource>) -> DeviceResult<()> {
        self.ensure_open()?;
        if let Some(mut previous) = self.housekeeper.take() {
            previous.stop();
        }
        let partitions = self.partitions.clone();
        let keeper = Housekeeper::start(
            "vitalbus-housekeeping",
            self.config.housekeeping_initial_delay(),
            self.config.housekeeping_period(),
            move || {
                partitions.check_source(source.as_mut());
            },
        )?;
        self.housekeeper = Some(keeper);
        Ok(())
    }

    // ---- teardown -------------------------------------------------------

    /// Retire every numeric, waveform, alarm settings, alarm objective and
    /// alert instance. Returns how many were retired.
    pub fn unregister_all_instances(&mut self) -> usize {
        self.numerics.retire_all()
            + self.waveforms.retire_all()
            + self.alarm_settings.retire_all()
            + self.alarm_objectives.retire_all()
            + self.patient_alerts.retire_all()
            + self.technical_alerts.retire_all()
    }

    /// Release everything the session owns, in dependency order. Each failure
    /// is logged and recorded; the remaining steps still run. Calling it again
    /// does nothing.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.shut_down {
            return report;
        }
        self.shut_down = true;

        if let Some(mut keeper) = self.housekeeper.take() {
            keeper.stop();
        }

        let reader = Arc::clone(&self.transport.objective_reader);
        if let Some(condition) = self.objective_condition.take() {
            report.record(
                "objective handler",
                self.event_loop.remove_handler(condition).map(|_| ()),
            );
            report.record("objective condition", reader.delete_condition(condition));
        }
        report.record("objective reader", reader.close());

        report.retired = self.unregister_all_instances() + self.device_alert.retire() + self.identities.retire_all();
        self.identity_holder = None;

        let closes: [(&str, DeviceResult<()>); 8] = [
            ("alarm objective writer", self.alarm_objectives.close_writer()),
            ("alarm settings writer", self.alarm_settings.close_writer()),
            ("sample array writer", self.waveforms.close_writer()),
            ("numeric writer", self.numerics.close_writer()),
            ("identity writer", self.identities.close_writer().map_err(DeviceError::from)),
            ("device alert writer", self.device_alert.close_writer()),
            ("patient alert writer", self.patient_alerts.close_writer()),
            ("technical alert writer", self.technical_alerts.close_writer()),
        ];
        for (resource, result) in closes {
            report.record(resource, result);
        }

        info!(
            retired = report.retired,
            failures = report.failures.len(),
            "device session shut down"
        );
        report
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub const fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.shut_down {
            return Err(StateError::ShutDown);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.identity.unique_device_identifier)
            .field("numerics", &self.numerics.registry().len())
            .field("waveforms", &self.waveforms.registry().len())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
