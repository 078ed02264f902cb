//! Cooperative single-threaded event loop for subscription callbacks.
//!
//! Every [`ConditionHandler`] runs on one dedicated worker thread, strictly
//! serialized, in the order conditions were signalled. Handlers must not
//! block; state they derive for another execution context should be queued
//! (see [`crate::objective::QueuedObjectiveSink`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DeviceError, DeviceResult, StateError};

/// Identifies a read condition attached to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionId(Uuid);

impl ConditionId {
    /// Create a new random condition id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConditionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback run on the loop thread when its condition is signalled.
pub trait ConditionHandler: Send {
    /// Handle one wake-up of `condition`. Must not block.
    fn condition_changed(&mut self, condition: ConditionId);
}

enum LoopMsg {
    AddHandler {
        condition: ConditionId,
        handler: Box<dyn ConditionHandler>,
        reply: Sender<()>,
    },
    RemoveHandler {
        condition: ConditionId,
        reply: Sender<bool>,
    },
    Signal {
        condition: ConditionId,
    },
}

/// Cloneable, non-blocking trigger for one condition.
///
/// Transports hold one of these per read condition and call [`signal`](Self::signal)
/// when data arrives.
#[derive(Clone)]
pub struct ConditionSignal {
    condition: ConditionId,
    tx: Sender<LoopMsg>,
    dropped: Arc<AtomicU64>,
}

impl ConditionSignal {
    /// Condition this signal wakes.
    #[must_use]
    pub const fn condition(&self) -> ConditionId {
        self.condition
    }

    /// Wake the loop for this condition. Never blocks; a full queue drops the wake-up.
    pub fn signal(&self) {
        match self.tx.try_send(LoopMsg::Signal {
            condition: self.condition,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl fmt::Debug for ConditionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionSignal")
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}

/// The loop: one worker thread dispatching condition wake-ups to handlers.
pub struct EventLoop {
    tx: Sender<LoopMsg>,
    dropped_signals: Arc<AtomicU64>,
    loop_thread: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Start the loop thread.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Internal` if the worker thread cannot be spawned.
    pub fn start(name: &str, queue_capacity: usize) -> DeviceResult<Self> {
        let (tx, rx) = bounded::<LoopMsg>(queue_capacity.max(1));
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&rx))
            .map_err(|e| DeviceError::internal(format!("failed to spawn event loop: {e}")))?;
        let loop_thread = join.thread().id();

        Ok(Self {
            tx,
            dropped_signals: Arc::new(AtomicU64::new(0)),
            loop_thread,
            join: Mutex::new(Some(join)),
        })
    }

    /// Attach a handler; subsequent signals for `condition` invoke it.
    ///
    /// # Errors
    ///
    /// Fails with `StateError::ShutDown` once the loop has stopped, and with
    /// `StateError::OnEventLoopThread` when called from a running handler.
    pub fn add_handler(&self, condition: ConditionId, handler: Box<dyn ConditionHandler>) -> DeviceResult<()> {
        self.ensure_off_loop()?;
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LoopMsg::AddHandler {
                condition,
                handler,
                reply: reply_tx,
            })
            .map_err(|_| StateError::ShutDown)?;
        reply_rx.recv().map_err(|_| StateError::ShutDown)?;
        Ok(())
    }

    /// Detach a handler. Once this returns, the handler will not run again.
    ///
    /// Returns whether a handler was attached.
    ///
    /// # Errors
    ///
    /// Same conditions as [`add_handler`](Self::add_handler).
    pub fn remove_handler(&self, condition: ConditionId) -> DeviceResult<bool> {
        self.ensure_off_loop()?;
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LoopMsg::RemoveHandler {
                condition,
                reply: reply_tx,
            })
            .map_err(|_| StateError::ShutDown)?;
        Ok(reply_rx.recv().map_err(|_| StateError::ShutDown)?)
    }

    /// A trigger for `condition`, to hand to the transport.
    #[must_use]
    pub fn signal_for(&self, condition: ConditionId) -> ConditionSignal {
        ConditionSignal {
            condition,
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped_signals),
        }
    }

    /// Bound of the loop's message queue.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.tx.capacity().unwrap_or_default()
    }

    /// Wake-ups dropped because the queue was full.
    #[must_use]
    pub fn dropped_signals(&self) -> u64 {
        self.dropped_signals.load(Ordering::Relaxed)
    }

    fn ensure_off_loop(&self) -> Result<(), StateError> {
        if thread::current().id() == self.loop_thread {
            return Err(StateError::OnEventLoopThread);
        }
        Ok(())
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("dropped_signals", &self.dropped_signals())
            .finish_non_exhaustive()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Outstanding ConditionSignals keep the channel open, so the worker is
        // detached rather than joined; it exits once the last sender is gone.
        let (dummy_tx, _) = bounded::<LoopMsg>(1);
        drop(std::mem::replace(&mut self.tx, dummy_tx));
        if let Ok(mut guard) = self.join.lock() {
            drop(guard.take());
        }
    }
}

fn worker_loop(rx: &Receiver<LoopMsg>) {
    let mut handlers: HashMap<ConditionId, Box<dyn ConditionHandler>> = HashMap::new();

    while let Ok(msg) = rx.recv() {
        match msg {
            LoopMsg::AddHandler {
                condition,
                handler,
                reply,
            } => {
                handlers.insert(condition, handler);
                debug!(%condition, "handler attached");
                let _ = reply.send(());
            }
            LoopMsg::RemoveHandler { condition, reply } => {
                let removed = handlers.remove(&condition).is_some();
                debug!(%condition, removed, "handler detached");
                let _ = reply.send(removed);
            }
            LoopMsg::Signal { condition } => match handlers.get_mut(&condition) {
                Some(handler) => handler.condition_changed(condition),
                None => warn!(%condition, "signal for unknown condition"),
            },
        }
    }
}
