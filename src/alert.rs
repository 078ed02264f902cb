//! Transient alert reconciliation.
//!
//! Callers assert, once per pass, which alerts are true right now. The
//! reconciler works out additions, text changes and removals itself:
//!
//! ```text
//! mark_old()                 every active identifier becomes "old"
//! write(id, Some(text))      id is still active; written only if text changed
//! clear_old()                anything still old was not re-asserted: retire it
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceResult, StateError};
use crate::registry::{InstanceHolder, InstanceRegistry};
use crate::topics::{Alert, AlertKey, DeviceAlertCondition};
use crate::transport::DataWriter;

/// Which alert channel a reconciler feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    /// Physiological alarms about the patient.
    Patient,
    /// Equipment faults and advisories.
    Technical,
}

/// Two-generation alert set for one category.
#[derive(Debug)]
pub struct AlertSetReconciler {
    category: AlertCategory,
    device_id: String,
    registry: InstanceRegistry<Alert>,
    active: HashMap<String, InstanceHolder<AlertKey>>,
    old: HashSet<String>,
}

impl AlertSetReconciler {
    /// Create an empty reconciler publishing `category` alerts through `writer`.
    pub fn new(category: AlertCategory, writer: Arc<dyn DataWriter<Alert>>) -> Self {
        Self {
            category,
            device_id: String::new(),
            registry: InstanceRegistry::new(writer),
            active: HashMap::new(),
            old: HashSet::new(),
        }
    }

    /// Channel this reconciler feeds.
    #[must_use]
    pub const fn category(&self) -> AlertCategory {
        self.category
    }

    /// Device that new alert instances belong to.
    pub fn set_device_id(&mut self, device_id: impl Into<String>) {
        self.device_id = device_id.into();
    }

    /// Start a pass: every active alert is presumed gone until re-asserted.
    pub fn mark_old(&mut self) {
        self.old.clear();
        self.old.extend(self.active.keys().cloned());
    }

    /// Assert `identifier` with `text`, or retire it when `text` is `None`.
    ///
    /// # Errors
    ///
    /// - `StateError::IdentityNotEstablished` when creating an alert before the
    ///   device id is set
    /// - transport write failures
    pub fn write(&mut self, identifier: &str, text: Option<&str>) -> DeviceResult<()> {
        let Some(text) = text else {
            self.old.remove(identifier);
            if let Some(holder) = self.active.remove(identifier) {
                self.registry.retire(&holder);
            }
            return Ok(());
        };

        self.old.remove(identifier);

        let (holder, created) = match self.active.get(identifier) {
            Some(holder) => (holder.clone(), false),
            None => {
                if self.device_id.trim().is_empty() {
                    return Err(StateError::IdentityNotEstablished { topic: "Alert" }.into());
                }
                let key = AlertKey {
                    device_id: self.device_id.clone(),
                    identifier: identifier.to_string(),
                };
                let Some((holder, _)) = self.registry.ensure(&key) else {
                    return Ok(());
                };
                self.active.insert(identifier.to_string(), holder.clone());
                (holder, true)
            }
        };

        self.registry.update(&holder, |alert| {
            if !created && alert.text == text {
                return false;
            }
            alert.text = text.to_string();
            true
        })?;
        Ok(())
    }

    /// End a pass: retire every alert not re-asserted since [`mark_old`](Self::mark_old).
    ///
    /// # Errors
    ///
    /// Never fails in practice; retirement errors are logged by the registry.
    pub fn clear_old(&mut self) -> DeviceResult<()> {
        for identifier in std::mem::take(&mut self.old) {
            self.write(&identifier, None)?;
        }
        Ok(())
    }

    /// Run a whole pass from the set of alerts true right now.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub fn reconcile<'a, I>(&mut self, current: I) -> DeviceResult<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.mark_old();
        for (identifier, text) in current {
            self.write(identifier, Some(text))?;
        }
        self.clear_old()
    }

    /// Retire every active alert.
    pub fn retire_all(&mut self) -> usize {
        self.old.clear();
        self.active.clear();
        self.registry.retire_all()
    }

    /// Last published text of an active alert.
    #[must_use]
    pub fn text(&self, identifier: &str) -> Option<&str> {
        let holder = self.active.get(identifier)?;
        self.registry.data(holder).map(|a| a.text.as_str())
    }

    /// Whether `identifier` has a live instance.
    #[must_use]
    pub fn is_active(&self, identifier: &str) -> bool {
        self.active.contains_key(identifier)
    }

    /// Number of live alerts in this channel.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Release this channel's writer.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close failure.
    pub fn close_writer(&self) -> DeviceResult<()> {
        Ok(self.registry.close_writer()?)
    }
}

/// Single per-device alert state instance.
#[derive(Debug)]
pub struct DeviceAlertConditionWriter {
    registry: InstanceRegistry<DeviceAlertCondition>,
    holder: Option<InstanceHolder<String>>,
}

impl DeviceAlertConditionWriter {
    /// Create a writer; the instance itself is registered by [`create`](Self::create).
    pub fn new(writer: Arc<dyn DataWriter<DeviceAlertCondition>>) -> Self {
        Self {
            registry: InstanceRegistry::new(writer),
            holder: None,
        }
    }

    /// Register the device's alert condition instance with an empty state.
    /// Creating it again for the same device is a no-op.
    pub fn create(&mut self, device_id: &str) {
        let key = device_id.to_string();
        self.holder = self.registry.invalidate_if_key_changed(self.holder.take(), &key);
        if self.holder.is_none() {
            self.holder = self.registry.ensure(&key).map(|(holder, _)| holder);
        }
    }

    /// Publish the device alert state; `None` is published as the empty state.
    /// Unchanged states are not rewritten.
    ///
    /// # Errors
    ///
    /// - `StateError::NoDeviceAlertCondition` before [`create`](Self::create)
    /// - transport write failures
    pub fn write(&mut self, state: Option<&str>) -> DeviceResult<()> {
        let Some(holder) = self.holder.as_ref() else {
            return Err(StateError::NoDeviceAlertCondition.into());
        };
        let state = state.unwrap_or_default();
        self.registry.update(holder, |condition| {
            if condition.alert_state == state {
                return false;
            }
            condition.alert_state = state.to_string();
            true
        })?;
        Ok(())
    }

    /// Current published state.
    #[must_use]
    pub fn state(&self) -> Option<&str> {
        let holder = self.holder.as_ref()?;
        self.registry.data(holder).map(|c| c.alert_state.as_str())
    }

    pub(crate) fn retire(&mut self) -> usize {
        self.holder = None;
        self.registry.retire_all()
    }

    /// Release this channel's writer.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close failure.
    pub fn close_writer(&self) -> DeviceResult<()> {
        Ok(self.registry.close_writer()?)
    }
}
