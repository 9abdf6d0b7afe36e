use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Fatal failures. Anything recoverable within a tick is a [`TickFlag`].
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid input: {0}")]
    InputValidation(String),
    #[error("Device model misconfigured: {0}")]
    ModelConfiguration(String),
    #[error("Forecast unavailable: {0}")]
    ForecastUnavailable(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<figment::Error> for ControlError {
    fn from(e: figment::Error) -> Self {
        ControlError::Configuration(e.to_string())
    }
}

impl From<validator::ValidationErrors> for ControlError {
    fn from(e: validator::ValidationErrors) -> Self {
        ControlError::Configuration(e.to_string())
    }
}

/// Conditions that leave a tick completed but flagged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TickFlag {
    ForecastUnavailable,
    DemandShortfall,
    OptimizationDegraded,
}

pub(crate) fn ensure_finite(label: &str, value: f64) -> ControlResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ControlError::InputValidation(format!(
            "{label} must be finite, got {value}"
        )))
    }
}
