//! Error types for vitalbus.
//!
//! All errors are strongly typed using thiserror. Only caller misuse
//! (publishing before an identity exists, writing an alert condition before it
//! was created) is meant to reach the clinical front end; transport conditions
//! that are expected in normal operation are absorbed by the layer that sees them.

use thiserror::Error;

use crate::transport::InstanceHandle;

/// Caller precondition violations.
#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Device identity is not established; populate unique_device_identifier before publishing {topic}")]
    IdentityNotEstablished {
        topic: &'static str,
    },

    #[error("No device alert condition instance; write the device identity first")]
    NoDeviceAlertCondition,

    #[error("Device session has been shut down")]
    ShutDown,

    #[error("Event loop handlers cannot be changed from the event loop thread")]
    OnEventLoopThread,
}

/// Transport failures surfaced by a writer or reader.
#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("No data available")]
    NoData,

    #[error("Transport returned a nil handle")]
    NilHandle,

    #[error("Write to {handle} failed: {message}")]
    WriteFailed {
        handle: InstanceHandle,
        message: String,
    },

    #[error("Transport resource '{resource}' is closed")]
    Closed {
        resource: String,
    },

    #[error("Transport backend error: {message}")]
    Backend {
        message: String,
    },
}

impl TransportError {
    /// Creates a backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Validation errors for configuration and keys.
#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field '{field}' must be positive")]
    NotPositive {
        field: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Top-level error type for vitalbus.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Caller precondition violations.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Writer or reader failures.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid keys or configuration.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Broken internal invariant.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl DeviceError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a caller precondition violation.
    #[must_use]
    pub const fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true for conditions that occur in normal asynchronous operation
    /// and should not be reported as failures.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::NoData | TransportError::NilHandle)
        )
    }
}

/// Result type alias for vitalbus operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_mentions_topic() {
        let err = StateError::IdentityNotEstablished { topic: "Numeric" };
        let msg = format!("{err}");
        assert!(msg.contains("publishing Numeric"));
        assert!(msg.contains("unique_device_identifier"));
    }

    #[test]
    fn test_transport_error_write_failed() {
        let err = TransportError::WriteFailed {
            handle: InstanceHandle::from_raw(7),
            message: "queue full".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("queue full"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn test_device_error_from_state() {
        let err: DeviceError = StateError::NoDeviceAlertCondition.into();
        assert!(err.is_state());
        assert!(!err.is_transport());
        assert!(!err.is_expected());
    }

    #[test]
    fn test_device_error_expected_conditions() {
        let no_data: DeviceError = TransportError::NoData.into();
        assert!(no_data.is_transport());
        assert!(no_data.is_expected());

        let nil: DeviceError = TransportError::NilHandle.into();
        assert!(nil.is_expected());

        let backend: DeviceError = TransportError::backend("boom").into();
        assert!(!backend.is_expected());
    }

    #[test]
    fn test_device_error_from_validation() {
        let err: DeviceError = ValidationError::NotPositive {
            field: "frequency".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(format!("{err}").contains("frequency"));
    }

    #[test]
    fn test_device_error_internal() {
        let err = DeviceError::internal("spawn failed");
        assert!(!err.is_state());
        assert!(!err.is_expected());
        assert!(format!("{err}").contains("spawn failed"));
    }
}
