//! Device session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceResult, ValidationError};
use crate::topics::DIMENSIONLESS;

/// Tunables for a [`crate::session::DeviceSession`].
///
/// Every field has a default, so a JSON document only needs the fields it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay before the first housekeeping run.
    pub housekeeping_initial_delay_ms: u64,
    /// Delay between the end of one housekeeping run and the start of the next.
    pub housekeeping_period_ms: u64,
    /// Max queued condition wake-ups on the event loop.
    pub event_loop_queue_capacity: usize,
    /// Max resolved objective updates awaiting the device thread.
    pub objective_queue_capacity: usize,
    /// Unit used by [`crate::session::DeviceSession::metric_key`].
    pub default_unit_id: String,
    /// Instance id used by [`crate::session::DeviceSession::metric_key`].
    pub default_instance_id: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            housekeeping_initial_delay_ms: 1000,
            housekeeping_period_ms: 5000,
            event_loop_queue_capacity: 1024,
            objective_queue_capacity: 1024,
            default_unit_id: DIMENSIONLESS.to_string(),
            default_instance_id: 0,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for malformed JSON and the
    /// errors of [`validate`](Self::validate).
    pub fn from_json(json: &str) -> DeviceResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that periods and capacities are usable.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::NotPositive` for a zero period or capacity and
    /// `ValidationError::MissingField` for an empty default unit.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let zero = [
            ("housekeeping_period_ms", self.housekeeping_period_ms == 0),
            ("event_loop_queue_capacity", self.event_loop_queue_capacity == 0),
            ("objective_queue_capacity", self.objective_queue_capacity == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ValidationError::NotPositive {
                field: (*field).to_string(),
            });
        }
        if self.default_unit_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "default_unit_id".to_string(),
            });
        }
        Ok(())
    }

    /// [`housekeeping_initial_delay_ms`](Self::housekeeping_initial_delay_ms) as a `Duration`.
    #[must_use]
    pub const fn housekeeping_initial_delay(&self) -> Duration {
        Duration::from_millis(self.housekeeping_initial_delay_ms)
    }

    /// [`housekeeping_period_ms`](Self::housekeeping_period_ms) as a `Duration`.
    #[must_use]
    pub const fn housekeeping_period(&self) -> Duration {
        Duration::from_millis(self.housekeeping_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_polling_schedule() {
        let config = SessionConfig::default();
        assert_eq!(config.housekeeping_initial_delay(), Duration::from_secs(1));
        assert_eq!(config.housekeeping_period(), Duration::from_secs(5));
        assert_eq!(config.default_unit_id, DIMENSIONLESS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{"housekeeping_period_ms": 250}"#).unwrap();
        assert_eq!(config.housekeeping_period_ms, 250);
        assert_eq!(config.event_loop_queue_capacity, 1024);
    }

    #[test]
    fn test_zero_period_rejected() {
        let err = SessionConfig::from_json(r#"{"housekeeping_period_ms": 0}"#).unwrap_err();
        assert!(err.is_validation());
        assert!(format!("{err}").contains("housekeeping_period_ms"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = SessionConfig::from_json("{not json").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_empty_unit_rejected() {
        let config = SessionConfig {
            default_unit_id: " ".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingField { .. })
        ));
    }
}
