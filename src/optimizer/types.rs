use serde::{Deserialize, Serialize};

use crate::domain::{DispatchPlan, TrajectoryMetrics};
use crate::error::ControlResult;

/// Constraint residuals of one candidate trajectory. Zero means satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintReport {
    pub min_comfort_kh: f64,
    pub max_safety_kh: f64,
    pub rejected_kwh: f64,
    pub shortfall_kwh: f64,
    /// Largest step-to-step modulation change beyond the ramp limit
    pub ramp_excess: f64,
}

impl ConstraintReport {
    pub fn is_feasible(&self, tolerance: f64) -> bool {
        self.min_comfort_kh <= tolerance
            && self.max_safety_kh <= tolerance
            && self.rejected_kwh <= tolerance
            && self.shortfall_kwh <= tolerance
            && self.ramp_excess <= tolerance
    }
}

/// A bounded, time-coupled search problem over one decision per step.
///
/// Solvers only see this interface. `project` must map any vector onto the
/// feasible box and ramp corridor; `merit` folds objective and penalties into
/// one number.
pub trait TrajectoryProblem: Sync {
    fn dimension(&self) -> usize;
    fn seed(&self) -> Vec<f64>;
    fn project(&self, x: &mut [f64]);
    fn merit(&self, x: &[f64]) -> ControlResult<f64>;
    fn constraints(&self, x: &[f64]) -> ControlResult<ConstraintReport>;

    /// Whether the seed is a previous solution carried forward.
    fn warm_started(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub solution: Vec<f64>,
    pub merit: f64,
    pub evaluations: usize,
    pub converged: bool,
}

pub trait TrajectorySolver: Send + Sync {
    fn name(&self) -> &str;
    fn solve(&self, problem: &dyn TrajectoryProblem) -> ControlResult<SolveOutcome>;
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: DispatchPlan,
    pub constraints: ConstraintReport,
    pub evaluations: usize,
    pub merit: f64,
}

impl PlanOutcome {
    pub fn metrics(&self) -> &TrajectoryMetrics {
        &self.plan.predicted
    }
}
