//! Publishers: per-kind create/update/retire logic on top of the instance registry.
//!
//! Every publisher follows the same transition. Given the caller's current
//! holder, the desired key and a value that may be absent:
//! - a holder whose key differs is retired
//! - an absent value retires whatever is left and yields no holder
//! - otherwise the instance is created if needed and the value written

use crate::error::StateError;
use crate::topics::Topic;

/// Multi-sample waveform batches.
pub mod batch;
/// Single-valued metrics and alarm limit pairs.
pub mod scalar;

pub use batch::BatchPublisher;
pub use scalar::{AlarmObjectivePublisher, AlarmSettingsPublisher, NumericPublisher, ScalarPublisher, ScalarTopic};

/// Fails fast when an instance would be created for an unidentified device.
pub(crate) fn require_identity<T: Topic>(key: &T::Key) -> Result<(), StateError> {
    if T::device_id(key).trim().is_empty() {
        return Err(StateError::IdentityNotEstablished { topic: T::NAME });
    }
    Ok(())
}
