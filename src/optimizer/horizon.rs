use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ConstraintReport, ObjectiveWeights, PatternSearch, PlanOutcome, PlanningConstraints,
    TrajectoryProblem, TrajectorySolver,
};
use crate::domain::{DispatchPlan, ForecastBundle, PlanStep, TrajectoryMetrics};
use crate::error::{ControlError, ControlResult, TickFlag};
use crate::simulation::{HeatPumpModel, ThermalStoreModel, ThermalStoreState};

/// Comfort violation below this is numerical noise (K·h)
const COMFORT_TOLERANCE_KH: f64 = 1e-6;

/// What the previous tick leaves behind for the next solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanContext<'a> {
    pub warm_start: Option<&'a DispatchPlan>,
    /// Modulation committed on the previous tick, for the ramp limit
    pub previous_modulation: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct StepRecord {
    thermal_kw: f64,
    demand_kw: f64,
}

struct Rollout {
    metrics: TrajectoryMetrics,
    report: ConstraintReport,
    steps: Vec<StepRecord>,
}

/// Receding-horizon planner for one heat pump charging one store.
pub struct HorizonOptimizer {
    store_model: ThermalStoreModel,
    constraints: PlanningConstraints,
    weights: ObjectiveWeights,
    solver: Box<dyn TrajectorySolver>,
}

impl HorizonOptimizer {
    pub fn new(
        store_model: ThermalStoreModel,
        constraints: PlanningConstraints,
        weights: ObjectiveWeights,
        solver: Box<dyn TrajectorySolver>,
    ) -> ControlResult<Self> {
        constraints.validate()?;
        if !(weights.penalty > 0.0 && weights.tie_break >= 0.0) {
            return Err(ControlError::Configuration(
                "penalty weight must be positive and tie-break weight non-negative".into(),
            ));
        }
        if store_model.max_temp_c > constraints.max_safe_c {
            return Err(ControlError::Configuration(format!(
                "store ceiling {} °C above maximum safe {} °C",
                store_model.max_temp_c, constraints.max_safe_c
            )));
        }
        Ok(Self {
            store_model,
            constraints,
            weights,
            solver,
        })
    }

    /// Pattern search with the store capped at the safety ceiling.
    pub fn with_defaults(constraints: PlanningConstraints) -> ControlResult<Self> {
        let store_model = ThermalStoreModel {
            max_temp_c: constraints.max_safe_c,
            ..Default::default()
        };
        Self::new(
            store_model,
            constraints,
            ObjectiveWeights::default(),
            Box::new(PatternSearch::default()),
        )
    }

    pub fn store_model(&self) -> &ThermalStoreModel {
        &self.store_model
    }

    pub fn constraints(&self) -> &PlanningConstraints {
        &self.constraints
    }

    pub fn plan(
        &self,
        forecasts: &ForecastBundle,
        initial: &ThermalStoreState,
        heat_pump: &HeatPumpModel,
        horizon_length: usize,
        context: PlanContext<'_>,
    ) -> ControlResult<PlanOutcome> {
        if horizon_length == 0 {
            return Err(ControlError::Configuration(
                "horizon length must be positive".into(),
            ));
        }
        if forecasts.steps() < horizon_length {
            return Err(ControlError::Configuration(format!(
                "forecast covers {} steps, horizon needs {horizon_length}",
                forecasts.steps()
            )));
        }

        let mut problem = DispatchProblem {
            optimizer: self,
            forecasts,
            initial,
            heat_pump,
            horizon: horizon_length,
            previous: context.previous_modulation.map(|m| heat_pump.clamp_modulation(m)),
            comfort_allowance_kh: 0.0,
            seed: Vec::new(),
            warm_started: false,
        };
        let mut flags = Vec::new();

        // no trajectory delivers more or keeps the store warmer than full output
        let flat_out = problem.max_output_trajectory();
        let full_output = problem.rollout(&flat_out)?;
        let undeliverable = full_output.metrics.demand_kwh - full_output.metrics.delivered_kwh
            > self.constraints.shortfall_tolerance_kwh;
        let unavoidable_cold = full_output.report.min_comfort_kh > COMFORT_TOLERANCE_KH;
        if undeliverable || unavoidable_cold {
            warn!(
                demand_kwh = full_output.metrics.demand_kwh,
                deliverable_kwh = full_output.metrics.delivered_kwh,
                min_comfort_kh = full_output.report.min_comfort_kh,
                "demand cannot be met above the comfort minimum, relaxing it"
            );
            problem.comfort_allowance_kh = full_output.report.min_comfort_kh;
            flags.push(TickFlag::DemandShortfall);
        }

        let warm = context
            .warm_start
            .and_then(|p| p.shifted_modulations(horizon_length));
        problem.warm_started = warm.is_some();
        let mut seed = warm.unwrap_or_else(|| problem.follow_demand());
        problem.project(&mut seed);
        problem.seed = seed;

        let outcome = self.solver.solve(&problem)?;
        let solution = if outcome.converged && outcome.merit.is_finite() {
            outcome.solution
        } else {
            warn!(
                evaluations = outcome.evaluations,
                merit = outcome.merit,
                "solver did not converge, committing seed trajectory"
            );
            flags.push(TickFlag::OptimizationDegraded);
            problem.seed.clone()
        };

        let rollout = problem.rollout(&solution)?;
        let merit = problem.score(&rollout);
        debug!(
            evaluations = outcome.evaluations,
            merit,
            grid_import_kwh = rollout.metrics.grid_import_kwh,
            "horizon solved"
        );

        let window = forecasts.window;
        let steps = solution
            .iter()
            .zip(&rollout.steps)
            .enumerate()
            .map(|(i, (&modulation, rec))| PlanStep {
                time_start: window.timestamp(i),
                time_end: window.timestamp(i + 1),
                modulation,
                storage_priority: rec.thermal_kw > rec.demand_kw + 1e-9,
            })
            .collect();

        Ok(PlanOutcome {
            plan: DispatchPlan {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                steps,
                flags,
                predicted: rollout.metrics,
                solver: self.solver.name().to_string(),
            },
            constraints: rollout.report,
            evaluations: outcome.evaluations,
            merit,
        })
    }

    /// Rolls `modulations` through the models without optimizing.
    pub fn evaluate(
        &self,
        forecasts: &ForecastBundle,
        initial: &ThermalStoreState,
        heat_pump: &HeatPumpModel,
        modulations: &[f64],
    ) -> ControlResult<(TrajectoryMetrics, ConstraintReport)> {
        if modulations.len() > forecasts.steps() {
            return Err(ControlError::InputValidation(format!(
                "{} modulations for a {}-step forecast",
                modulations.len(),
                forecasts.steps()
            )));
        }
        let problem = DispatchProblem {
            optimizer: self,
            forecasts,
            initial,
            heat_pump,
            horizon: modulations.len(),
            previous: None,
            comfort_allowance_kh: 0.0,
            seed: Vec::new(),
            warm_started: false,
        };
        let rollout = problem.rollout(modulations)?;
        Ok((rollout.metrics, rollout.report))
    }
}

struct DispatchProblem<'a> {
    optimizer: &'a HorizonOptimizer,
    forecasts: &'a ForecastBundle,
    initial: &'a ThermalStoreState,
    heat_pump: &'a HeatPumpModel,
    horizon: usize,
    previous: Option<f64>,
    /// Minimum-comfort violation the merit tolerates before penalizing (K·h)
    comfort_allowance_kh: f64,
    seed: Vec<f64>,
    warm_started: bool,
}

impl DispatchProblem<'_> {
    fn follow_demand(&self) -> Vec<f64> {
        let nominal = self.heat_pump.nominal_thermal_kw();
        (0..self.horizon)
            .map(|t| self.heat_pump.clamp_modulation(self.forecasts.demand_kw(t) / nominal))
            .collect()
    }

    /// Full output as soon as the ramp limit allows.
    fn max_output_trajectory(&self) -> Vec<f64> {
        let mut x = vec![self.heat_pump.max_modulation(); self.horizon];
        self.project(&mut x);
        x
    }

    fn rollout(&self, x: &[f64]) -> ControlResult<Rollout> {
        let c = &self.optimizer.constraints;
        let model = &self.optimizer.store_model;
        let dt = self.forecasts.step_hours();
        let nodes = self.initial.node_count.max(1) as f64;

        let mut state = self.initial.clone();
        let mut m = TrajectoryMetrics {
            peak_node_c: state.max_temp_c(),
            lowest_node_c: state.min_temp_c(),
            ..Default::default()
        };
        let mut report = ConstraintReport::default();
        let mut steps = Vec::with_capacity(x.len());
        let mut prev = self.previous;

        for (t, &u) in x.iter().enumerate() {
            let charge_c = state
                .node_temps_c
                .get(model.charge_node)
                .copied()
                .unwrap_or_else(|| state.top_temp_c());
            let out = self.heat_pump.output(
                u,
                self.forecasts.source_temp_c(t, c.default_source_c),
                self.heat_pump.sink_temp_c(charge_c),
            )?;
            let demand_kw = self.forecasts.demand_kw(t);
            let step = model.advance(&state, out.thermal_kw - demand_kw, c.tank_ambient_c, dt)?;
            state = step.state;

            let renewable_kw = self.forecasts.renewable_kw(t);
            m.grid_import_kwh += (out.electrical_kw - renewable_kw).max(0.0) * dt;
            m.renewable_surplus_kwh += (renewable_kw - out.electrical_kw).max(0.0) * dt;
            m.electrical_kwh += out.electrical_kw * dt;
            m.thermal_kwh += out.thermal_kw * dt;
            m.demand_kwh += demand_kw * dt;
            m.delivered_kwh += demand_kw * dt - step.unmet_kwh;
            m.rejected_kwh += step.rejected_kwh;

            for &temp in &state.node_temps_c {
                m.min_violation_kh += (c.min_safe_c - temp).max(0.0) * dt;
                m.max_violation_kh += (temp - c.max_safe_c).max(0.0) * dt;
                m.band_deviation_kh += c.band_deviation(temp) * dt / nodes;
                m.peak_node_c = m.peak_node_c.max(temp);
                m.lowest_node_c = m.lowest_node_c.min(temp);
            }

            if let Some(p) = prev {
                report.ramp_excess = report
                    .ramp_excess
                    .max((u - p).abs() - self.heat_pump.ramp_limit());
            }
            prev = Some(u);
            steps.push(StepRecord {
                thermal_kw: out.thermal_kw,
                demand_kw,
            });
        }

        m.shortfall_kwh =
            (m.demand_kwh - m.delivered_kwh - c.shortfall_tolerance_kwh).max(0.0);
        report.min_comfort_kh = m.min_violation_kh;
        report.max_safety_kh = m.max_violation_kh;
        report.rejected_kwh = m.rejected_kwh;
        report.shortfall_kwh = m.shortfall_kwh;
        report.ramp_excess = report.ramp_excess.max(0.0);
        Ok(Rollout {
            metrics: m,
            report,
            steps,
        })
    }

    fn score(&self, rollout: &Rollout) -> f64 {
        let w = self.optimizer.weights;
        let r = &rollout.report;
        let comfort = (r.min_comfort_kh - self.comfort_allowance_kh).max(0.0);
        rollout.metrics.grid_import_kwh
            + w.tie_break * rollout.metrics.band_deviation_kh
            + w.penalty * (comfort + r.max_safety_kh + r.rejected_kwh + r.shortfall_kwh)
    }
}

impl TrajectoryProblem for DispatchProblem<'_> {
    fn dimension(&self) -> usize {
        self.horizon
    }

    fn seed(&self) -> Vec<f64> {
        self.seed.clone()
    }

    fn project(&self, x: &mut [f64]) {
        let lo = self.heat_pump.min_modulation();
        let hi = self.heat_pump.max_modulation();
        let ramp = self.heat_pump.ramp_limit();
        let mut prev = self.previous;
        for v in x.iter_mut() {
            let (a, b) = match prev {
                Some(p) => ((p - ramp).max(lo), (p + ramp).min(hi)),
                None => (lo, hi),
            };
            *v = if v.is_finite() { v.clamp(a, b) } else { a };
            prev = Some(*v);
        }
    }

    fn merit(&self, x: &[f64]) -> ControlResult<f64> {
        Ok(self.score(&self.rollout(x)?))
    }

    fn constraints(&self, x: &[f64]) -> ControlResult<ConstraintReport> {
        Ok(self.rollout(x)?.report)
    }

    fn warm_started(&self) -> bool {
        self.warm_started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ForecastSeries, HorizonWindow, SeriesKind};
    use crate::simulation::{CopCurve, HeatPumpSpec, TankSpec};
    use chrono::TimeZone;

    fn bundle(pv: &[f64], wind: &[f64], demand: &[f64]) -> ForecastBundle {
        let w = HorizonWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            60,
            demand.len(),
        );
        ForecastBundle::assemble(
            w,
            ForecastSeries::from_values(SeriesKind::Pv, &w, pv),
            ForecastSeries::from_values(SeriesKind::Wind, &w, wind),
            ForecastSeries::from_values(SeriesKind::Demand, &w, demand),
            None,
        )
        .unwrap()
    }

    fn heat_pump(nominal: f64, ramp: f64) -> HeatPumpModel {
        HeatPumpModel::new(HeatPumpSpec {
            nominal_thermal_kw: nominal,
            ramp_limit: ramp,
            cop_curve: CopCurve::Table {
                source_temps_c: vec![0.0],
                sink_temps_c: vec![50.0],
                cop: vec![vec![3.0]],
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn tank(temp: f64) -> ThermalStoreState {
        ThermalStoreState::uniform(&TankSpec::default(), temp).unwrap()
    }

    fn optimizer() -> HorizonOptimizer {
        HorizonOptimizer::with_defaults(PlanningConstraints {
            min_safe_c: 35.0,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_feasible_horizon_satisfies_all_constraints() {
        let n = 12;
        let forecasts = bundle(&vec![0.0; n], &vec![1.0; n], &vec![3.0; n]);
        let hp = heat_pump(10.0, 0.3);
        let out = optimizer()
            .plan(&forecasts, &tank(50.0), &hp, n, PlanContext::default())
            .unwrap();
        assert_eq!(out.plan.len(), n);
        assert!(!out.plan.has_flag(TickFlag::DemandShortfall));
        assert!(out.constraints.is_feasible(1e-9), "{:?}", out.constraints);
        for pair in out.plan.modulations().windows(2) {
            assert!((pair[1] - pair[0]).abs() <= 0.3 + 1e-9);
        }
    }

    #[test]
    fn test_zero_demand_and_renewables_gives_idle_plan() {
        let n = 8;
        let forecasts = bundle(&vec![0.0; n], &vec![0.0; n], &vec![0.0; n]);
        let hp = heat_pump(10.0, 1.0);
        let opt = optimizer();
        let initial = tank(50.0);
        let busy = opt
            .plan(&forecasts, &initial, &hp, n, PlanContext::default())
            .unwrap()
            .plan;
        let mut warm = busy.clone();
        warm.steps.iter_mut().for_each(|s| s.modulation = 0.5);
        let out = opt
            .plan(
                &forecasts,
                &initial,
                &hp,
                n,
                PlanContext {
                    warm_start: Some(&warm),
                    previous_modulation: None,
                },
            )
            .unwrap();
        assert!(out.plan.modulations().iter().all(|&m| m < 1e-3));
        assert!(out.metrics().grid_import_kwh < 1e-2);
    }

    #[test]
    fn test_impossible_demand_flags_shortfall() {
        let n = 6;
        let forecasts = bundle(&vec![0.0; n], &vec![0.0; n], &vec![30.0; n]);
        let hp = heat_pump(10.0, 1.0);
        let out = optimizer()
            .plan(&forecasts, &tank(45.0), &hp, n, PlanContext::default())
            .unwrap();
        assert!(out.plan.has_flag(TickFlag::DemandShortfall));
        assert!(out.plan.modulations().iter().all(|&m| m > 0.99));
        assert!(out.metrics().peak_node_c <= 80.0 + 1e-9);
    }

    #[test]
    fn test_draining_below_comfort_minimum_flags_shortfall() {
        // 14 kW for 6 h is deliverable only by pulling the store under 38 °C
        let n = 6;
        let forecasts = bundle(&vec![0.0; n], &vec![0.0; n], &vec![14.0; n]);
        let hp = heat_pump(10.0, 1.0);
        let opt = HorizonOptimizer::with_defaults(PlanningConstraints::default()).unwrap();
        let out = opt
            .plan(&forecasts, &tank(50.0), &hp, n, PlanContext::default())
            .unwrap();
        assert!(out.plan.has_flag(TickFlag::DemandShortfall));
        assert!(out.metrics().shortfall_kwh < 1e-9);
        assert!(out.metrics().lowest_node_c < 38.0);
        assert!(out.constraints.min_comfort_kh > 0.0);
        // relaxed only as far as full output forces
        assert!(out.plan.modulations().iter().all(|&m| m > 0.99));
        let (full, _) = opt.evaluate(&forecasts, &tank(50.0), &hp, &[1.0; 6]).unwrap();
        assert!(out.metrics().lowest_node_c >= full.lowest_node_c - 1e-9);
    }

    #[test]
    fn test_ramp_limit_applies_from_previous_commit() {
        let n = 4;
        let forecasts = bundle(&vec![0.0; n], &vec![0.0; n], &vec![9.0; n]);
        let hp = heat_pump(10.0, 0.1);
        let out = optimizer()
            .plan(
                &forecasts,
                &tank(40.0),
                &hp,
                n,
                PlanContext {
                    warm_start: None,
                    previous_modulation: Some(0.0),
                },
            )
            .unwrap();
        assert!(out.plan.modulations()[0] <= 0.1 + 1e-12);
        assert!(out.plan.modulations()[3] <= 0.4 + 1e-12);
    }

    #[test]
    fn test_budget_exhaustion_degrades_to_seed() {
        let n = 6;
        let forecasts = bundle(&vec![0.0; n], &vec![2.0; n], &vec![4.0; n]);
        let hp = heat_pump(10.0, 1.0);
        let opt = HorizonOptimizer::new(
            ThermalStoreModel::default(),
            PlanningConstraints::default(),
            ObjectiveWeights::default(),
            Box::new(PatternSearch {
                max_evaluations: 2,
                ..Default::default()
            }),
        )
        .unwrap();
        let out = opt
            .plan(&forecasts, &tank(50.0), &hp, n, PlanContext::default())
            .unwrap();
        assert!(out.plan.has_flag(TickFlag::OptimizationDegraded));
        for m in out.plan.modulations() {
            assert!((m - 0.4).abs() < 1e-12);
        }
    }

    #[test]
    fn test_stationary_warm_start_is_kept() {
        let n = 6;
        let forecasts = bundle(&vec![0.0; n], &vec![10.0; n], &vec![2.0; n]);
        let hp = heat_pump(10.0, 1.0);
        let opt = optimizer();
        let initial = tank(50.0);
        let first = opt
            .plan(&forecasts, &initial, &hp, n, PlanContext::default())
            .unwrap()
            .plan;
        let second = opt
            .plan(
                &forecasts,
                &initial,
                &hp,
                n,
                PlanContext {
                    warm_start: Some(&first),
                    previous_modulation: first.first().map(|s| s.modulation),
                },
            )
            .unwrap()
            .plan;
        let expected = first.shifted_modulations(n).unwrap();
        for (a, b) in second.modulations().iter().zip(&expected) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_short_forecast_is_configuration_error() {
        let forecasts = bundle(&[0.0; 3], &[0.0; 3], &[1.0; 3]);
        let hp = heat_pump(10.0, 1.0);
        assert!(matches!(
            optimizer().plan(&forecasts, &tank(50.0), &hp, 4, PlanContext::default()),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn test_evaluate_reports_import() {
        let forecasts = bundle(&[0.0; 2], &[0.0, 10.0], &[0.0; 2]);
        let hp = heat_pump(9.0, 1.0);
        let (metrics, report) = optimizer()
            .evaluate(&forecasts, &tank(45.0), &hp, &[0.5, 0.5])
            .unwrap();
        // 4.5 kW thermal at COP 3 is 1.5 kW, imported in the first hour only
        assert!((metrics.grid_import_kwh - 1.5).abs() < 1e-9);
        assert!((metrics.renewable_surplus_kwh - 8.5).abs() < 1e-9);
        assert!(report.is_feasible(1e-9));
    }
}
