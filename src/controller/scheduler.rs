use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use super::TraceSink;
use crate::domain::{
    CostTrace, CostTraceEntry, CostTotals, DispatchPlan, ForecastBundle, ForecastSeries,
    HorizonWindow, SeriesKind,
};
use crate::error::{ControlError, ControlResult, TickFlag};
use crate::forecast::ForecastProvider;
use crate::optimizer::{ConstraintReport, HorizonOptimizer, PlanContext};
use crate::simulation::{HeatPumpModel, ThermalStoreState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Forecasting,
    Planning,
    Committing,
}

/// Action committed when a tick has no usable forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FallbackPolicy {
    /// Repeat the previous committed modulation
    HoldLast,
    /// Ramp toward the device minimum
    Minimum,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub horizon_steps: usize,
    pub step_minutes: u32,
    pub fetch_timeout: std::time::Duration,
    pub fallback: FallbackPolicy,
    /// Also request a source-temperature series; failures fall back to the
    /// configured default source temperature.
    pub use_source_temperature: bool,
    /// Hourly modulation schedule evaluated next to every plan, by local hour
    pub baseline: Option<Vec<f64>>,
    pub timezone: Tz,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            horizon_steps: 24,
            step_minutes: 60,
            fetch_timeout: std::time::Duration::from_secs(10),
            fallback: FallbackPolicy::HoldLast,
            use_source_temperature: true,
            baseline: None,
            timezone: chrono_tz::UTC,
        }
    }
}

/// Stop condition for a bounded simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickBudget {
    Count(u64),
    Until(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub entry: CostTraceEntry,
    /// Absent when the tick fell back without planning
    pub plan: Option<DispatchPlan>,
    pub constraints: Option<ConstraintReport>,
    pub baseline_import_kwh: Option<f64>,
}

impl TickReport {
    pub fn has_flag(&self, flag: TickFlag) -> bool {
        self.entry.flags.contains(&flag)
    }
}

/// Owns the store state and runs one strictly sequential control loop.
pub struct Scheduler {
    provider: Arc<dyn ForecastProvider>,
    optimizer: HorizonOptimizer,
    heat_pump: HeatPumpModel,
    settings: SchedulerSettings,
    state: ThermalStoreState,
    phase: SchedulerPhase,
    last_plan: Option<DispatchPlan>,
    last_bundle: Option<ForecastBundle>,
    last_modulation: Option<f64>,
    trace: CostTrace,
    sink: Option<Box<dyn TraceSink>>,
    next_tick: u64,
}

impl Scheduler {
    pub fn new(
        provider: Arc<dyn ForecastProvider>,
        optimizer: HorizonOptimizer,
        heat_pump: HeatPumpModel,
        initial_state: ThermalStoreState,
        settings: SchedulerSettings,
    ) -> ControlResult<Self> {
        if settings.horizon_steps == 0 || settings.step_minutes == 0 {
            return Err(ControlError::Configuration(
                "horizon length and step length must be positive".into(),
            ));
        }
        if settings.fetch_timeout.is_zero() {
            return Err(ControlError::Configuration(
                "forecast fetch timeout must be positive".into(),
            ));
        }
        let model = optimizer.store_model();
        if model.charge_node >= initial_state.node_count
            || model.discharge_node >= initial_state.node_count
        {
            return Err(ControlError::Configuration(format!(
                "port nodes {}/{} outside a {}-node store",
                model.charge_node, model.discharge_node, initial_state.node_count
            )));
        }
        if let Some(baseline) = &settings.baseline {
            if baseline.len() != 24 {
                return Err(ControlError::Configuration(format!(
                    "baseline schedule needs 24 hourly entries, got {}",
                    baseline.len()
                )));
            }
            if baseline
                .iter()
                .any(|&m| !(heat_pump.min_modulation()..=heat_pump.max_modulation()).contains(&m))
            {
                return Err(ControlError::Configuration(
                    "baseline schedule leaves the modulation range".into(),
                ));
            }
        }
        Ok(Self {
            provider,
            optimizer,
            heat_pump,
            settings,
            state: initial_state,
            phase: SchedulerPhase::Idle,
            last_plan: None,
            last_bundle: None,
            last_modulation: None,
            trace: CostTrace::new(),
            sink: None,
            next_tick: 0,
        })
    }

    pub fn with_trace_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> &ThermalStoreState {
        &self.state
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn trace(&self) -> &CostTrace {
        &self.trace
    }

    pub fn last_plan(&self) -> Option<&DispatchPlan> {
        self.last_plan.as_ref()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    fn step(&self) -> Duration {
        Duration::minutes(i64::from(self.settings.step_minutes))
    }

    /// Runs one control tick starting at `now`. The store state only changes
    /// once the tick has fully committed.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> ControlResult<TickReport> {
        let result = self.run_tick(now).await;
        self.phase = SchedulerPhase::Idle;
        result
    }

    async fn run_tick(&mut self, now: DateTime<Utc>) -> ControlResult<TickReport> {
        let window = HorizonWindow::new(now, self.settings.step_minutes, self.settings.horizon_steps);

        self.phase = SchedulerPhase::Forecasting;
        let fetched = self.fetch_bundle(window).await;

        let mut flags = Vec::new();
        let mut plan = None;
        let mut constraints = None;
        let mut baseline_import_kwh = None;
        let (modulation, realized) = match fetched {
            Ok(bundle) => {
                self.phase = SchedulerPhase::Planning;
                let outcome = self.optimizer.plan(
                    &bundle,
                    &self.state,
                    &self.heat_pump,
                    self.settings.horizon_steps,
                    PlanContext {
                        warm_start: self.last_plan.as_ref(),
                        previous_modulation: self.last_modulation,
                    },
                )?;
                baseline_import_kwh = self.baseline_import(&bundle)?;
                if let Some(baseline) = baseline_import_kwh {
                    info!(
                        planned_import_kwh = outcome.metrics().grid_import_kwh,
                        baseline_import_kwh = baseline,
                        "baseline comparison"
                    );
                }
                flags.extend(outcome.plan.flags.iter().copied());
                let modulation = outcome
                    .plan
                    .first()
                    .map(|s| s.modulation)
                    .unwrap_or_else(|| self.fallback_modulation());
                constraints = Some(outcome.constraints);
                plan = Some(outcome.plan);
                (modulation, Some(bundle))
            }
            Err(error) => {
                warn!(%error, fallback = %self.settings.fallback, "falling back");
                flags.push(TickFlag::ForecastUnavailable);
                let stale = self.last_bundle.as_ref().and_then(ForecastBundle::shifted);
                (self.fallback_modulation(), stale)
            }
        };

        self.phase = SchedulerPhase::Committing;
        self.commit(now, modulation, realized, plan, constraints, flags, baseline_import_kwh)
    }

    /// Fetches every series concurrently, each under its own timeout.
    async fn fetch_bundle(&self, window: HorizonWindow) -> ControlResult<ForecastBundle> {
        let source = async {
            if self.settings.use_source_temperature {
                Some(self.fetch_series(SeriesKind::SourceTemperature, window).await)
            } else {
                None
            }
        };
        let (pv, wind, demand, source) = tokio::join!(
            self.fetch_series(SeriesKind::Pv, window),
            self.fetch_series(SeriesKind::Wind, window),
            self.fetch_series(SeriesKind::Demand, window),
            source,
        );

        let source = match source {
            Some(Ok(series)) => match series.check_alignment(&window) {
                Ok(()) => Some(series),
                Err(e) => {
                    warn!(error = %e, "source temperature misaligned, using default");
                    None
                }
            },
            Some(Err(reason)) => {
                warn!(%reason, "source temperature unavailable, using default");
                None
            }
            None => None,
        };

        let missing: Vec<String> = [&pv, &wind, &demand]
            .into_iter()
            .filter_map(|r| r.as_ref().err().cloned())
            .collect();
        match (pv, wind, demand) {
            (Ok(pv), Ok(wind), Ok(demand)) => {
                ForecastBundle::assemble(window, pv, wind, demand, source)
                    .map_err(|e| ControlError::ForecastUnavailable(e.to_string()))
            }
            _ => Err(ControlError::ForecastUnavailable(missing.join("; "))),
        }
    }

    async fn fetch_series(
        &self,
        kind: SeriesKind,
        window: HorizonWindow,
    ) -> Result<ForecastSeries, String> {
        let timeout = self.settings.fetch_timeout;
        match tokio::time::timeout(timeout, self.provider.fetch(kind, window)).await {
            Ok(Ok(series)) => Ok(series),
            Ok(Err(e)) => Err(format!("{kind}: {e:#}")),
            Err(_) => Err(format!("{kind}: no response within {timeout:?}")),
        }
    }

    fn fallback_modulation(&self) -> f64 {
        let hp = &self.heat_pump;
        match (self.settings.fallback, self.last_modulation) {
            (FallbackPolicy::HoldLast, Some(last)) => hp.clamp_modulation(last),
            (FallbackPolicy::Minimum, Some(last)) => {
                hp.clamp_modulation(hp.min_modulation().max(last - hp.ramp_limit()))
            }
            (_, None) => hp.min_modulation(),
        }
    }

    fn baseline_import(&self, bundle: &ForecastBundle) -> ControlResult<Option<f64>> {
        let Some(baseline) = &self.settings.baseline else {
            return Ok(None);
        };
        let schedule: Vec<f64> = bundle
            .window
            .timestamps()
            .map(|t| baseline[t.with_timezone(&self.settings.timezone).hour() as usize % 24])
            .collect();
        let (metrics, _) =
            self.optimizer
                .evaluate(bundle, &self.state, &self.heat_pump, &schedule)?;
        Ok(Some(metrics.grid_import_kwh))
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &mut self,
        now: DateTime<Utc>,
        modulation: f64,
        realized: Option<ForecastBundle>,
        plan: Option<DispatchPlan>,
        constraints: Option<ConstraintReport>,
        flags: Vec<TickFlag>,
        baseline_import_kwh: Option<f64>,
    ) -> ControlResult<TickReport> {
        let limits = self.optimizer.constraints();
        let model = self.optimizer.store_model();
        let dt = f64::from(self.settings.step_minutes) / 60.0;

        let charge_c = self.state.node_temps_c[model.charge_node];
        let (next_state, thermal_kw, electrical_kw, import, surplus, unmet) = match &realized {
            Some(bundle) => {
                let out = self.heat_pump.output(
                    modulation,
                    bundle.source_temp_c(0, limits.default_source_c),
                    self.heat_pump.sink_temp_c(charge_c),
                )?;
                let step = model.advance(
                    &self.state,
                    out.thermal_kw - bundle.demand_kw(0),
                    limits.tank_ambient_c,
                    dt,
                )?;
                let renewable_kw = bundle.renewable_kw(0);
                (
                    step.state,
                    out.thermal_kw,
                    out.electrical_kw,
                    (out.electrical_kw - renewable_kw).max(0.0) * dt,
                    (renewable_kw - out.electrical_kw).max(0.0) * dt,
                    step.unmet_kwh,
                )
            }
            None => {
                warn!("no cached forecast, holding store state");
                (self.state.clone(), 0.0, 0.0, 0.0, 0.0, 0.0)
            }
        };

        let comfort_violation_k = next_state
            .node_temps_c
            .iter()
            .map(|&t| (limits.min_safe_c - t).max(t - limits.max_safe_c).max(0.0))
            .fold(0.0, f64::max);

        let entry = CostTraceEntry {
            tick: self.next_tick,
            timestamp: now,
            modulation,
            thermal_kw,
            electrical_kw,
            node_temps_c: next_state.node_temps_c.clone(),
            grid_import_kwh: import,
            renewable_surplus_kwh: surplus,
            comfort_violation_k,
            unmet_demand_kwh: unmet,
            flags,
        };
        self.trace.push(entry.clone())?;
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&entry) {
                warn!(error = %e, tick = entry.tick, "trace sink write failed");
            }
        }

        info!(
            tick = entry.tick,
            %now,
            modulation,
            thermal_kw,
            grid_import_kwh = import,
            top_c = next_state.top_temp_c(),
            flags = ?entry.flags,
            "committed step"
        );

        self.state = next_state;
        self.last_modulation = Some(modulation);
        self.last_bundle = realized;
        self.last_plan = plan.clone();
        self.next_tick += 1;

        Ok(TickReport {
            entry,
            plan,
            constraints,
            baseline_import_kwh,
        })
    }

    /// Ticks on a virtual clock from `start` until the budget is spent.
    pub async fn run_simulation(
        &mut self,
        start: DateTime<Utc>,
        budget: TickBudget,
    ) -> ControlResult<CostTotals> {
        let step = self.step();
        let mut now = start;
        let mut done = 0u64;
        loop {
            let more = match budget {
                TickBudget::Count(n) => done < n,
                TickBudget::Until(end) => now < end,
            };
            if !more {
                break;
            }
            self.tick(now).await?;
            now += step;
            done += 1;
        }
        let totals = self.trace.totals();
        info!(
            ticks = totals.ticks,
            grid_import_kwh = totals.grid_import_kwh,
            renewable_surplus_kwh = totals.renewable_surplus_kwh,
            unmet_demand_kwh = totals.unmet_demand_kwh,
            flagged_ticks = totals.flagged_ticks,
            "simulation finished"
        );
        Ok(totals)
    }

    /// Ticks on wall-clock step boundaries until `shutdown` resolves. A tick
    /// in progress completes before the loop exits.
    pub async fn run_realtime<F>(&mut self, shutdown: F) -> ControlResult<CostTotals>
    where
        F: Future<Output = ()>,
    {
        let step = self.step();
        let period = step
            .to_std()
            .map_err(|e| ControlError::Configuration(format!("invalid tick length: {e}")))?;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping control loop");
                    break;
                }
                _ = interval.tick() => {
                    let now = Utc::now().duration_trunc(step).map_err(|e| {
                        ControlError::Configuration(format!("cannot align clock to {step}: {e}"))
                    })?;
                    debug!(%now, "control tick");
                    self.tick(now).await?;
                }
            }
        }
        Ok(self.trace.totals())
    }
}
