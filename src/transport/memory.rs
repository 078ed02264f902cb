//! In-memory transport.
//!
//! Thread-safe, in-process implementations of the transport traits. Every
//! operation is recorded so callers can inspect exactly what reached the "wire".

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use crate::error::TransportError;
use crate::event_loop::{ConditionId, ConditionSignal};
use crate::topics::{
    AlarmSettings, Alert, DeviceAlertCondition, DeviceIdentity, GlobalAlarmObjective, LocalAlarmObjective, Numeric,
    SampleArray, Topic,
};
use crate::transport::{
    DataWriter, DeviceTransport, InstanceHandle, InstanceState, SampleInfo, SampleReader, StateMask, ViewState,
};

fn lock_err(context: &'static str) -> TransportError {
    TransportError::backend(format!("poisoned lock: {context}"))
}

/// One recorded writer operation.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum WireOp<T> {
    Register { handle: InstanceHandle, data: T },
    Write { handle: InstanceHandle, data: T },
    Unregister { handle: InstanceHandle, data: T },
}

impl<T> WireOp<T> {
    /// Instance the operation targeted.
    #[must_use]
    pub const fn handle(&self) -> InstanceHandle {
        match self {
            Self::Register { handle, .. } | Self::Write { handle, .. } | Self::Unregister { handle, .. } => *handle,
        }
    }
}

#[derive(Debug)]
struct WriterState<T> {
    next_handle: u64,
    live: HashMap<InstanceHandle, T>,
    ops: Vec<WireOp<T>>,
    refuse_registrations: bool,
    fail_writes: bool,
    closed: bool,
}

impl<T> Default for WriterState<T> {
    fn default() -> Self {
        Self {
            next_handle: 1,
            live: HashMap::new(),
            ops: Vec::new(),
            refuse_registrations: false,
            fail_writes: false,
            closed: false,
        }
    }
}

/// Recording writer. Registering a key that is already live returns the
/// existing handle, as a keyed pub/sub bus would.
#[derive(Debug)]
pub struct InMemoryWriter<T> {
    state: RwLock<WriterState<T>>,
}

impl<T> Default for InMemoryWriter<T> {
    fn default() -> Self {
        Self {
            state: RwLock::new(WriterState::default()),
        }
    }
}

impl<T: Topic> InMemoryWriter<T> {
    /// An open writer with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent registrations return the nil handle.
    pub fn refuse_registrations(&self, refuse: bool) {
        if let Ok(mut state) = self.state.write() {
            state.refuse_registrations = refuse;
        }
    }

    /// Make subsequent writes fail.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.write() {
            state.fail_writes = fail;
        }
    }

    /// All recorded operations, oldest first.
    #[must_use]
    pub fn ops(&self) -> Vec<WireOp<T>> {
        self.state.read().map(|s| s.ops.clone()).unwrap_or_default()
    }

    /// Payloads of every successful write, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<T> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                WireOp::Write { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Successful registrations recorded.
    #[must_use]
    pub fn register_count(&self) -> usize {
        self.count(|op| matches!(op, WireOp::Register { .. }))
    }

    /// Successful writes recorded.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.count(|op| matches!(op, WireOp::Write { .. }))
    }

    /// Successful unregistrations recorded.
    #[must_use]
    pub fn unregister_count(&self) -> usize {
        self.count(|op| matches!(op, WireOp::Unregister { .. }))
    }

    /// Instances currently registered.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.read().map(|s| s.live.len()).unwrap_or_default()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().map(|s| s.closed).unwrap_or_default()
    }

    /// Forget recorded operations; live instances are kept.
    pub fn clear_ops(&self) {
        if let Ok(mut state) = self.state.write() {
            state.ops.clear();
        }
    }

    fn count(&self, pred: impl Fn(&WireOp<T>) -> bool) -> usize {
        self.state
            .read()
            .map(|s| s.ops.iter().filter(|op| pred(op)).count())
            .unwrap_or_default()
    }
}

impl<T: Topic> DataWriter<T> for InMemoryWriter<T> {
    fn register_instance(&self, data: &T) -> Result<InstanceHandle, TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("writer.register"))?;
        if state.closed {
            return Err(TransportError::Closed {
                resource: T::NAME.to_string(),
            });
        }
        if state.refuse_registrations {
            return Ok(InstanceHandle::NIL);
        }

        let key = data.key();
        if let Some((handle, _)) = state.live.iter().find(|(_, live)| live.key() == key) {
            return Ok(*handle);
        }

        let handle = InstanceHandle::from_raw(state.next_handle);
        state.next_handle += 1;
        state.live.insert(handle, data.clone());
        state.ops.push(WireOp::Register {
            handle,
            data: data.clone(),
        });
        Ok(handle)
    }

    fn write(&self, data: &T, handle: InstanceHandle) -> Result<(), TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("writer.write"))?;
        if state.closed {
            return Err(TransportError::Closed {
                resource: T::NAME.to_string(),
            });
        }
        if state.fail_writes {
            return Err(TransportError::WriteFailed {
                handle,
                message: "writes disabled".to_string(),
            });
        }
        let Some(live) = state.live.get_mut(&handle) else {
            return Err(TransportError::WriteFailed {
                handle,
                message: "instance not registered".to_string(),
            });
        };
        *live = data.clone();
        state.ops.push(WireOp::Write {
            handle,
            data: data.clone(),
        });
        Ok(())
    }

    fn unregister_instance(&self, data: &T, handle: InstanceHandle) -> Result<(), TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("writer.unregister"))?;
        if state.live.remove(&handle).is_none() {
            return Err(TransportError::backend(format!("unknown instance {handle}")));
        }
        state.ops.push(WireOp::Unregister {
            handle,
            data: data.clone(),
        });
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("writer.close"))?;
        if state.closed {
            return Err(TransportError::Closed {
                resource: T::NAME.to_string(),
            });
        }
        state.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct ReaderState<T> {
    conditions: HashMap<ConditionId, (StateMask, ConditionSignal)>,
    pending: VecDeque<(SampleInfo, T)>,
    seen: HashSet<InstanceHandle>,
    outstanding_loans: usize,
    reads: usize,
    fail_next_read: Option<TransportError>,
    closed: bool,
}

impl<T> Default for ReaderState<T> {
    fn default() -> Self {
        Self {
            conditions: HashMap::new(),
            pending: VecDeque::new(),
            seen: HashSet::new(),
            outstanding_loans: 0,
            reads: 0,
            fail_next_read: None,
            closed: false,
        }
    }
}

/// Reader fed by the test or embedding process playing the remote writer.
#[derive(Debug)]
pub struct InMemoryReader<T> {
    state: RwLock<ReaderState<T>>,
}

impl<T> Default for InMemoryReader<T> {
    fn default() -> Self {
        Self {
            state: RwLock::new(ReaderState::default()),
        }
    }
}

impl<T: Clone + Send + Sync> InMemoryReader<T> {
    /// An open reader with no conditions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw sample and wake every read condition.
    pub fn deliver(&self, info: SampleInfo, data: T) {
        let signals: Vec<ConditionSignal> = match self.state.write() {
            Ok(mut state) => {
                state.pending.push_back((info, data));
                state.conditions.values().map(|(_, s)| s.clone()).collect()
            }
            Err(_) => return,
        };
        for signal in signals {
            signal.signal();
        }
    }

    /// A remote writer published `data` on instance `handle`.
    pub fn remote_write(&self, handle: u64, data: T) {
        let handle = InstanceHandle::from_raw(handle);
        let view_state = self.observe(handle);
        self.deliver(
            SampleInfo {
                instance_handle: handle,
                view_state,
                instance_state: InstanceState::Alive,
                valid_data: true,
            },
            data,
        );
    }

    /// A remote writer unregistered instance `handle`. The payload carries no
    /// valid data, as on a real bus.
    pub fn remote_dispose(&self, handle: u64, placeholder: T) {
        let handle = InstanceHandle::from_raw(handle);
        let view_state = self.observe(handle);
        self.deliver(
            SampleInfo {
                instance_handle: handle,
                view_state,
                instance_state: InstanceState::NotAlive,
                valid_data: false,
            },
            placeholder,
        );
    }

    /// Make the next read fail with `err`.
    pub fn fail_next_read(&self, err: TransportError) {
        if let Ok(mut state) = self.state.write() {
            state.fail_next_read = Some(err);
        }
    }

    /// Reads whose loan has not been returned.
    #[must_use]
    pub fn outstanding_loans(&self) -> usize {
        self.state.read().map(|s| s.outstanding_loans).unwrap_or_default()
    }

    /// Read calls made, failed ones included.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.state.read().map(|s| s.reads).unwrap_or_default()
    }

    /// Read conditions currently attached.
    #[must_use]
    pub fn condition_count(&self) -> usize {
        self.state.read().map(|s| s.conditions.len()).unwrap_or_default()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().map(|s| s.closed).unwrap_or_default()
    }

    fn observe(&self, handle: InstanceHandle) -> ViewState {
        let first = self
            .state
            .write()
            .map(|mut state| state.seen.insert(handle))
            .unwrap_or(false);
        if first {
            ViewState::New
        } else {
            ViewState::NotNew
        }
    }
}

impl<T: Clone + Send + Sync> SampleReader<T> for InMemoryReader<T> {
    fn create_condition(
        &self,
        condition: ConditionId,
        mask: StateMask,
        signal: ConditionSignal,
    ) -> Result<(), TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("reader.create_condition"))?;
        if state.closed {
            return Err(TransportError::Closed {
                resource: "reader".to_string(),
            });
        }
        let wake = !state.pending.is_empty();
        state.conditions.insert(condition, (mask, signal.clone()));
        drop(state);
        if wake {
            signal.signal();
        }
        Ok(())
    }

    fn delete_condition(&self, condition: ConditionId) -> Result<(), TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("reader.delete_condition"))?;
        state
            .conditions
            .remove(&condition)
            .map(|_| ())
            .ok_or_else(|| TransportError::backend(format!("unknown condition {condition}")))
    }

    fn read(&self, condition: ConditionId) -> Result<Vec<(SampleInfo, T)>, TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("reader.read"))?;
        state.outstanding_loans += 1;
        state.reads += 1;
        if state.closed {
            return Err(TransportError::Closed {
                resource: "reader".to_string(),
            });
        }
        if !state.conditions.contains_key(&condition) {
            return Err(TransportError::backend(format!("unknown condition {condition}")));
        }
        if let Some(err) = state.fail_next_read.take() {
            return Err(err);
        }
        if state.pending.is_empty() {
            return Err(TransportError::NoData);
        }
        Ok(state.pending.drain(..).collect())
    }

    fn return_loan(&self) {
        if let Ok(mut state) = self.state.write() {
            state.outstanding_loans = state.outstanding_loans.saturating_sub(1);
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("reader.close"))?;
        state.closed = true;
        state.conditions.clear();
        Ok(())
    }
}

/// A full set of in-memory endpoints for one device, kept typed so callers can
/// inspect each one.
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct InMemoryBus {
    pub identity: Arc<InMemoryWriter<DeviceIdentity>>,
    pub numeric: Arc<InMemoryWriter<Numeric>>,
    pub sample_array: Arc<InMemoryWriter<SampleArray>>,
    pub alarm_settings: Arc<InMemoryWriter<AlarmSettings>>,
    pub alarm_objective: Arc<InMemoryWriter<LocalAlarmObjective>>,
    pub device_alert: Arc<InMemoryWriter<DeviceAlertCondition>>,
    pub patient_alert: Arc<InMemoryWriter<Alert>>,
    pub technical_alert: Arc<InMemoryWriter<Alert>>,
    pub objectives: Arc<InMemoryReader<GlobalAlarmObjective>>,
}

impl InMemoryBus {
    /// Fresh endpoints with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-erased view for a session.
    #[must_use]
    pub fn transport(&self) -> DeviceTransport {
        DeviceTransport {
            identity: Arc::clone(&self.identity) as Arc<dyn DataWriter<DeviceIdentity>>,
            numeric: Arc::clone(&self.numeric) as Arc<dyn DataWriter<Numeric>>,
            sample_array: Arc::clone(&self.sample_array) as Arc<dyn DataWriter<SampleArray>>,
            alarm_settings: Arc::clone(&self.alarm_settings) as Arc<dyn DataWriter<AlarmSettings>>,
            alarm_objective: Arc::clone(&self.alarm_objective) as Arc<dyn DataWriter<LocalAlarmObjective>>,
            device_alert: Arc::clone(&self.device_alert) as Arc<dyn DataWriter<DeviceAlertCondition>>,
            patient_alert: Arc::clone(&self.patient_alert) as Arc<dyn DataWriter<Alert>>,
            technical_alert: Arc::clone(&self.technical_alert) as Arc<dyn DataWriter<Alert>>,
            objective_reader: Arc::clone(&self.objectives) as Arc<dyn SampleReader<GlobalAlarmObjective>>,
        }
    }
}
