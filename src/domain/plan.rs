use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TickFlag;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    /// Heat-pump modulation fraction
    pub modulation: f64,
    /// True when the step is planned to charge the store beyond current demand
    pub storage_priority: bool,
}

/// Predicted outcome of rolling a modulation trajectory through the models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryMetrics {
    pub grid_import_kwh: f64,
    pub renewable_surplus_kwh: f64,
    pub electrical_kwh: f64,
    pub thermal_kwh: f64,
    pub demand_kwh: f64,
    pub delivered_kwh: f64,
    /// Cumulative demand not covered, in excess of the configured tolerance
    pub shortfall_kwh: f64,
    /// Heat the store could not absorb at its physical ceiling
    pub rejected_kwh: f64,
    /// Node-hours below the minimum safe temperature (K·h)
    pub min_violation_kh: f64,
    /// Node-hours above the maximum safe temperature (K·h)
    pub max_violation_kh: f64,
    /// Mean node distance from the target band, integrated over time (K·h)
    pub band_deviation_kh: f64,
    pub peak_node_c: f64,
    pub lowest_node_c: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<PlanStep>,
    pub flags: Vec<TickFlag>,
    pub predicted: TrajectoryMetrics,
    pub solver: String,
}

impl DispatchPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn first(&self) -> Option<&PlanStep> {
        self.steps.first()
    }

    pub fn modulations(&self) -> Vec<f64> {
        self.steps.iter().map(|s| s.modulation).collect()
    }

    pub fn has_flag(&self, flag: TickFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// This plan advanced by one step and resized to `len`, padding with the
    /// final modulation.
    pub fn shifted_modulations(&self, len: usize) -> Option<Vec<f64>> {
        let last = self.steps.last()?.modulation;
        let mut out: Vec<f64> = self.steps.iter().skip(1).map(|s| s.modulation).collect();
        out.resize(len, last);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn plan(mods: &[f64]) -> DispatchPlan {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        DispatchPlan {
            id: Uuid::new_v4(),
            created_at: t0,
            steps: mods
                .iter()
                .enumerate()
                .map(|(i, &m)| PlanStep {
                    time_start: t0 + Duration::hours(i as i64),
                    time_end: t0 + Duration::hours(i as i64 + 1),
                    modulation: m,
                    storage_priority: false,
                })
                .collect(),
            flags: vec![],
            predicted: TrajectoryMetrics::default(),
            solver: "test".into(),
        }
    }

    #[test]
    fn test_shifted_modulations_pads_with_last() {
        let p = plan(&[0.1, 0.2, 0.3]);
        assert_eq!(p.shifted_modulations(3), Some(vec![0.2, 0.3, 0.3]));
        assert_eq!(p.shifted_modulations(1), Some(vec![0.2]));
    }

    #[test]
    fn test_empty_plan_has_no_seed() {
        let p = plan(&[]);
        assert!(p.is_empty());
        assert_eq!(p.shifted_modulations(4), None);
    }
}
