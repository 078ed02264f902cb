//! Instance registry.
//!
//! The registry owns the transport handle and last-written payload for every
//! live instance of one topic. Callers keep an [`InstanceHolder`], a small
//! receipt naming the instance they published last; handing it back lets the
//! registry decide whether the instance is still the right one.
//!
//! Invariant: at most one live entry per key. Entries are created on first
//! publish and removed when retired.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::topics::Topic;
use crate::transport::{DataWriter, InstanceHandle};

/// Receipt for a live instance: its key and transport handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHolder<K> {
    key: K,
    handle: InstanceHandle,
}

impl<K> InstanceHolder<K> {
    /// Key the instance was registered under.
    #[must_use]
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Transport handle of the instance.
    #[must_use]
    pub const fn handle(&self) -> InstanceHandle {
        self.handle
    }
}

#[derive(Debug)]
struct LiveInstance<T> {
    handle: InstanceHandle,
    data: T,
}

/// Keyed store of live instances for topic `T`.
pub struct InstanceRegistry<T: Topic> {
    writer: Arc<dyn DataWriter<T>>,
    live: HashMap<T::Key, LiveInstance<T>>,
}

impl<T: Topic> InstanceRegistry<T> {
    /// Create an empty registry publishing through `writer`.
    pub fn new(writer: Arc<dyn DataWriter<T>>) -> Self {
        Self {
            writer,
            live: HashMap::new(),
        }
    }

    /// Return the live holder for `key`, creating it if needed.
    ///
    /// Returns `None` when the transport could not allocate an instance; the
    /// failure is logged and nothing is stored.
    pub fn ensure(&mut self, key: &T::Key) -> Option<(InstanceHolder<T::Key>, bool)> {
        self.ensure_with(key, |_| {})
    }

    /// Like [`ensure`](Self::ensure), but `init` fills the payload before it is
    /// registered (e.g. so the registration carries the right timestamp).
    /// `init` is not called when the instance already exists.
    pub fn ensure_with(
        &mut self,
        key: &T::Key,
        init: impl FnOnce(&mut T),
    ) -> Option<(InstanceHolder<T::Key>, bool)> {
        if let Some(live) = self.live.get(key) {
            return Some((
                InstanceHolder {
                    key: key.clone(),
                    handle: live.handle,
                },
                false,
            ));
        }

        let mut data = T::from_key(key);
        init(&mut data);
        let handle = match self.writer.register_instance(&data) {
            Ok(handle) if !handle.is_nil() => handle,
            Ok(_) => {
                warn!(topic = T::NAME, ?key, "unable to register instance: nil handle");
                return None;
            }
            Err(err) => {
                warn!(topic = T::NAME, ?key, error = %err, "unable to register instance");
                return None;
            }
        };

        debug!(topic = T::NAME, ?key, %handle, "instance created");
        self.live.insert(key.clone(), LiveInstance { handle, data });
        Some((
            InstanceHolder {
                key: key.clone(),
                handle,
            },
            true,
        ))
    }

    /// Retire `holder` if its key differs from `key` in any field.
    pub fn invalidate_if_key_changed(
        &mut self,
        holder: Option<InstanceHolder<T::Key>>,
        key: &T::Key,
    ) -> Option<InstanceHolder<T::Key>> {
        match holder {
            Some(holder) if holder.key != *key => {
                self.retire(&holder);
                None
            }
            other => other,
        }
    }

    /// Unregister the instance behind `holder` and drop its entry.
    ///
    /// Retiring a holder that is no longer live is a no-op. Returns whether an
    /// instance was retired.
    pub fn retire(&mut self, holder: &InstanceHolder<T::Key>) -> bool {
        match self.live.get(&holder.key) {
            Some(live) if live.handle == holder.handle => {}
            _ => return false,
        }
        let Some(live) = self.live.remove(&holder.key) else {
            return false;
        };
        if let Err(err) = self.writer.unregister_instance(&live.data, live.handle) {
            warn!(topic = T::NAME, key = ?holder.key, error = %err, "unregister failed");
        }
        debug!(topic = T::NAME, key = ?holder.key, handle = %live.handle, "instance retired");
        true
    }

    /// Retire every live instance. Returns how many were retired.
    pub fn retire_all(&mut self) -> usize {
        let holders: Vec<_> = self
            .live
            .iter()
            .map(|(key, live)| InstanceHolder {
                key: key.clone(),
                handle: live.handle,
            })
            .collect();
        holders.iter().filter(|h| self.retire(h)).count()
    }

    /// Mutate the payload behind `holder` and write it when `update` reports a change.
    ///
    /// Returns whether a write happened. A holder that is no longer live is
    /// ignored. The stored payload only changes once the write succeeds, so a
    /// failed value is retried in full on the next call.
    ///
    /// # Errors
    ///
    /// Propagates the transport's write failure.
    pub fn update(
        &mut self,
        holder: &InstanceHolder<T::Key>,
        update: impl FnOnce(&mut T) -> bool,
    ) -> Result<bool, TransportError> {
        let Some(live) = self.live.get_mut(&holder.key).filter(|l| l.handle == holder.handle) else {
            debug!(topic = T::NAME, key = ?holder.key, "update on stale holder ignored");
            return Ok(false);
        };
        let mut next = live.data.clone();
        if !update(&mut next) {
            return Ok(false);
        }
        self.writer.write(&next, live.handle)?;
        live.data = next;
        Ok(true)
    }

    /// Last payload written (or registered) for `holder`.
    #[must_use]
    pub fn data(&self, holder: &InstanceHolder<T::Key>) -> Option<&T> {
        self.live
            .get(&holder.key)
            .filter(|l| l.handle == holder.handle)
            .map(|l| &l.data)
    }

    /// Whether `holder` still names a live instance.
    #[must_use]
    pub fn is_live(&self, holder: &InstanceHolder<T::Key>) -> bool {
        self.data(holder).is_some()
    }

    /// Whether an instance is live under `key`.
    #[must_use]
    pub fn contains_key(&self, key: &T::Key) -> bool {
        self.live.contains_key(key)
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Release the underlying writer.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close failure.
    pub fn close_writer(&self) -> Result<(), TransportError> {
        self.writer.close()
    }
}

impl<T: Topic> std::fmt::Debug for InstanceRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("topic", &T::NAME)
            .field("live", &self.live.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::{MetricKey, Numeric};
    use crate::transport::memory::InMemoryWriter;

    fn setup() -> (Arc<InMemoryWriter<Numeric>>, InstanceRegistry<Numeric>) {
        let writer = Arc::new(InMemoryWriter::new());
        let registry = InstanceRegistry::new(Arc::clone(&writer) as Arc<dyn DataWriter<Numeric>>);
        (writer, registry)
    }

    fn key(unit: &str) -> MetricKey {
        MetricKey::new("dev1", "HR", "vHR").with_unit(unit)
    }

    #[test]
    fn test_ensure_creates_once() {
        let (writer, mut registry) = setup();
        let (first, created) = registry.ensure(&key("bpm")).unwrap();
        assert!(created);
        let (second, created) = registry.ensure(&key("bpm")).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(writer.register_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_nil_handle_is_not_stored() {
        let (writer, mut registry) = setup();
        writer.refuse_registrations(true);
        assert!(registry.ensure(&key("bpm")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_key_change_retires_then_creates() {
        let (writer, mut registry) = setup();
        let (holder, _) = registry.ensure(&key("bpm")).unwrap();
        let kept = registry.invalidate_if_key_changed(Some(holder.clone()), &key("per_min"));
        assert!(kept.is_none());
        let (next, created) = registry.ensure(&key("per_min")).unwrap();
        assert!(created);
        assert_ne!(holder, next);
        assert!(!registry.is_live(&holder));
        assert_eq!(writer.unregister_count(), 1);
        assert_eq!(writer.register_count(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unchanged_key_keeps_holder() {
        let (writer, mut registry) = setup();
        let (holder, _) = registry.ensure(&key("bpm")).unwrap();
        let kept = registry.invalidate_if_key_changed(Some(holder.clone()), &key("bpm"));
        assert_eq!(kept, Some(holder));
        assert_eq!(writer.unregister_count(), 0);
    }

    #[test]
    fn test_retire_twice_is_noop() {
        let (writer, mut registry) = setup();
        let (holder, _) = registry.ensure(&key("bpm")).unwrap();
        assert!(registry.retire(&holder));
        assert!(!registry.retire(&holder));
        assert_eq!(writer.unregister_count(), 1);
    }

    #[test]
    fn test_update_writes_only_on_change() {
        let (writer, mut registry) = setup();
        let (holder, _) = registry.ensure(&key("bpm")).unwrap();
        assert!(registry.update(&holder, |n| {
            n.value = 72.0;
            true
        })
        .unwrap());
        assert!(!registry.update(&holder, |_| false).unwrap());
        assert_eq!(writer.write_count(), 1);
        assert_eq!(registry.data(&holder).map(|n| n.value), Some(72.0));
    }

    #[test]
    fn test_failed_write_keeps_published_payload() {
        let (writer, mut registry) = setup();
        let (holder, _) = registry.ensure(&key("bpm")).unwrap();
        registry
            .update(&holder, |n| {
                n.value = 60.0;
                true
            })
            .unwrap();

        writer.fail_writes(true);
        let err = registry
            .update(&holder, |n| {
                n.value = 61.0;
                true
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::WriteFailed { .. }));
        assert_eq!(registry.data(&holder).map(|n| n.value), Some(60.0));

        writer.fail_writes(false);
        let changed = registry
            .update(&holder, |n| {
                let changed = n.value != 61.0;
                n.value = 61.0;
                changed
            })
            .unwrap();
        assert!(changed);
        assert_eq!(writer.write_count(), 2);
        assert_eq!(registry.data(&holder).map(|n| n.value), Some(61.0));
    }

    #[test]
    fn test_update_on_stale_holder_is_ignored() {
        let (writer, mut registry) = setup();
        let (holder, _) = registry.ensure(&key("bpm")).unwrap();
        registry.retire(&holder);
        assert!(!registry.update(&holder, |_| true).unwrap());
        assert_eq!(writer.write_count(), 0);
    }

    #[test]
    fn test_retire_all() {
        let (writer, mut registry) = setup();
        registry.ensure(&key("a")).unwrap();
        registry.ensure(&key("b")).unwrap();
        assert_eq!(registry.retire_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(writer.live_count(), 0);
    }
}
