use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Comfort and safety envelope the planner works within.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConstraints {
    /// Legionella-motivated floor for every node (°C)
    pub min_safe_c: f64,
    /// Scald-motivated ceiling for every node (°C)
    pub max_safe_c: f64,
    pub target_band_low_c: f64,
    pub target_band_high_c: f64,
    /// Cumulative demand that may go unserved over one horizon (kWh)
    pub shortfall_tolerance_kwh: f64,
    /// Air temperature around the tank (°C)
    pub tank_ambient_c: f64,
    /// Heat-pump source temperature when no forecast is supplied (°C)
    pub default_source_c: f64,
}

impl Default for PlanningConstraints {
    fn default() -> Self {
        Self {
            min_safe_c: 38.0,
            max_safe_c: 80.0,
            target_band_low_c: 45.0,
            target_band_high_c: 60.0,
            shortfall_tolerance_kwh: 0.5,
            tank_ambient_c: 20.0,
            default_source_c: 8.0,
        }
    }
}

impl PlanningConstraints {
    pub fn validate(&self) -> ControlResult<()> {
        let temps = [
            self.min_safe_c,
            self.max_safe_c,
            self.target_band_low_c,
            self.target_band_high_c,
            self.tank_ambient_c,
            self.default_source_c,
        ];
        if temps.iter().any(|t| !t.is_finite()) {
            return Err(ControlError::Configuration(
                "planning temperatures must be finite".into(),
            ));
        }
        if self.min_safe_c >= self.max_safe_c {
            return Err(ControlError::Configuration(format!(
                "minimum safe temperature {} must be below maximum {}",
                self.min_safe_c, self.max_safe_c
            )));
        }
        if self.target_band_low_c > self.target_band_high_c
            || self.target_band_low_c < self.min_safe_c
            || self.target_band_high_c > self.max_safe_c
        {
            return Err(ControlError::Configuration(
                "target band must lie inside the safe envelope".into(),
            ));
        }
        if !(self.shortfall_tolerance_kwh >= 0.0) {
            return Err(ControlError::Configuration(
                "shortfall tolerance must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Distance of `temp_c` from the target band (K)
    pub fn band_deviation(&self, temp_c: f64) -> f64 {
        if temp_c < self.target_band_low_c {
            self.target_band_low_c - temp_c
        } else if temp_c > self.target_band_high_c {
            temp_c - self.target_band_high_c
        } else {
            0.0
        }
    }
}

/// Weights turning the constrained problem into a single merit value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    /// Cost per unit of constraint violation, in kWh-equivalents
    pub penalty: f64,
    /// Cost per K·h of band deviation; small enough to only break ties
    pub tie_break: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            penalty: 100.0,
            tie_break: 1e-3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constraints_are_valid() {
        assert!(PlanningConstraints::default().validate().is_ok());
    }

    #[test]
    fn test_band_outside_envelope_rejected() {
        let c = PlanningConstraints {
            target_band_high_c: 85.0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
        let c = PlanningConstraints {
            min_safe_c: 80.0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_band_deviation() {
        let c = PlanningConstraints::default();
        assert_eq!(c.band_deviation(50.0), 0.0);
        assert!((c.band_deviation(40.0) - 5.0).abs() < 1e-12);
        assert!((c.band_deviation(62.5) - 2.5).abs() < 1e-12);
    }
}
