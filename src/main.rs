use anyhow::Result;
use chrono::{Duration, DurationRound, Utc};
use district_heat_mpc::config::{Config, RunMode};
use district_heat_mpc::controller::{self, TickBudget};
use district_heat_mpc::telemetry::{self, init_tracing};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    let engine = Arc::new(controller::build_forecast_engine(&cfg)?);
    let mut scheduler = controller::build_scheduler(&cfg, engine)?;

    let step = Duration::minutes(i64::from(cfg.controller.step_minutes));
    let totals = match cfg.controller.mode {
        RunMode::Simulation => {
            let start = match cfg.controller.simulation_start {
                Some(start) => start,
                None => Utc::now().duration_trunc(step)?,
            };
            let budget = match (cfg.controller.simulation_end, cfg.controller.simulation_ticks) {
                (Some(end), _) => TickBudget::Until(end),
                (None, Some(n)) => TickBudget::Count(n),
                (None, None) => TickBudget::Count(24),
            };
            info!(%start, ?budget, "starting simulation");
            scheduler.run_simulation(start, budget).await?
        }
        RunMode::Realtime => {
            info!(step_minutes = cfg.controller.step_minutes, "starting control loop");
            scheduler.run_realtime(telemetry::shutdown_signal()).await?
        }
    };

    info!(
        ticks = totals.ticks,
        grid_import_kwh = totals.grid_import_kwh,
        renewable_surplus_kwh = totals.renewable_surplus_kwh,
        unmet_demand_kwh = totals.unmet_demand_kwh,
        worst_comfort_violation_k = totals.worst_comfort_violation_k,
        "controller stopped"
    );
    Ok(())
}
