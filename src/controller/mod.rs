pub mod scheduler;
pub mod trace_log;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use scheduler::{
    FallbackPolicy, Scheduler, SchedulerPhase, SchedulerSettings, TickBudget, TickReport,
};
pub use trace_log::{JsonLinesTraceSink, TraceSink};

use crate::config::{Config, WeatherSource};
use crate::error::{ControlError, ControlResult};
use crate::forecast::{
    ForecastEngine, ForecastProvider, HousingStockDemand, HttpWeatherFeed, SiteGeneration,
    WeatherFeed,
};
use crate::optimizer::HorizonOptimizer;
use crate::simulation::HeatPumpModel;

/// Weather feed and estimators for the configured site.
pub fn build_forecast_engine(cfg: &Config) -> Result<ForecastEngine> {
    let location = cfg.site_location()?;
    let weather: Arc<dyn WeatherFeed> = match cfg.weather.source {
        WeatherSource::Synthetic => Arc::new(cfg.weather.synthetic.clone()),
        WeatherSource::OpenMeteo => Arc::new(HttpWeatherFeed::new(
            cfg.weather.base_url.clone(),
            Duration::from_secs(cfg.weather.cache_ttl_seconds),
            Duration::from_secs(cfg.weather.http_timeout_seconds),
        )?),
    };
    let generation = SiteGeneration {
        location: location.clone(),
        pv_arrays: cfg.pv_arrays.clone(),
        turbines: cfg.wind_turbines.clone(),
        wind: cfg.wind.clone(),
    };
    let demand = HousingStockDemand::new(
        cfg.housing_stock.clone(),
        cfg.network.clone(),
        location.timezone,
    );
    info!(
        weather = %cfg.weather.source,
        pv_arrays = cfg.pv_arrays.len(),
        turbines = cfg.wind_turbines.len(),
        homes = demand.homes(),
        "forecast engine ready"
    );
    Ok(ForecastEngine::new(
        location,
        weather,
        Arc::new(generation),
        Arc::new(demand),
    ))
}

/// Wires the models and optimizer from `cfg` around `provider`.
pub fn build_scheduler(cfg: &Config, provider: Arc<dyn ForecastProvider>) -> ControlResult<Scheduler> {
    let heat_pump = HeatPumpModel::new(cfg.heat_pump.clone())?;
    let optimizer = HorizonOptimizer::new(
        cfg.store_model(),
        cfg.comfort.clone(),
        cfg.objective_weights(),
        Box::new(cfg.pattern_search()),
    )?;
    let scheduler = Scheduler::new(
        provider,
        optimizer,
        heat_pump,
        cfg.initial_state()?,
        cfg.scheduler_settings()?,
    )?;
    match &cfg.controller.trace_path {
        Some(path) => {
            let sink = JsonLinesTraceSink::open(path)
                .map_err(|e| ControlError::Configuration(format!("{e:#}")))?;
            info!(path = %path.display(), "writing cost trace");
            Ok(scheduler.with_trace_sink(Box::new(sink)))
        }
        None => Ok(scheduler),
    }
}
