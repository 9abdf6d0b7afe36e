use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DemandEstimator, GenerationEstimator, SiteLocation, WeatherFeed, WeatherPoint};
use crate::domain::{ForecastSeries, HorizonWindow, SeriesKind, SeriesPoint};

/// Source of the per-tick forecast series, one call per series kind.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn fetch(&self, kind: SeriesKind, window: HorizonWindow) -> Result<ForecastSeries>;
}

/// Weather feed chained into the generation and demand estimators.
///
/// Concurrent calls for the same window share one weather fetch.
pub struct ForecastEngine {
    pub location: SiteLocation,
    pub weather: Arc<dyn WeatherFeed>,
    pub generation: Arc<dyn GenerationEstimator>,
    pub demand: Arc<dyn DemandEstimator>,
    cache: Mutex<Option<(HorizonWindow, Vec<WeatherPoint>)>>,
}

impl ForecastEngine {
    pub fn new(
        location: SiteLocation,
        weather: Arc<dyn WeatherFeed>,
        generation: Arc<dyn GenerationEstimator>,
        demand: Arc<dyn DemandEstimator>,
    ) -> Self {
        Self {
            location,
            weather,
            generation,
            demand,
            cache: Mutex::new(None),
        }
    }

    async fn weather_for(&self, window: HorizonWindow) -> Result<Vec<WeatherPoint>> {
        let mut cache = self.cache.lock().await;
        if let Some((w, points)) = cache.as_ref() {
            if *w == window {
                return Ok(points.clone());
            }
        }
        let last = window.timestamp(window.steps.saturating_sub(1));
        let series = self
            .weather
            .fetch(&self.location, window.start, last, window.step_minutes)
            .await
            .context("weather fetch failed")?;
        let points = series.sample(&window)?;
        debug!(start = %window.start, steps = window.steps, "weather sampled");
        *cache = Some((window, points.clone()));
        Ok(points)
    }
}

#[async_trait]
impl ForecastProvider for ForecastEngine {
    async fn fetch(&self, kind: SeriesKind, window: HorizonWindow) -> Result<ForecastSeries> {
        let weather = self.weather_for(window).await?;
        match kind {
            SeriesKind::Pv => Ok(self.generation.estimate(&weather, &window)?.pv),
            SeriesKind::Wind => Ok(self.generation.estimate(&weather, &window)?.wind),
            SeriesKind::Demand => self.demand.estimate(&weather, &window),
            SeriesKind::SourceTemperature => {
                let temps: Vec<f64> = weather.iter().map(|p| p.temperature_c).collect();
                Ok(ForecastSeries::from_values(kind, &window, &temps))
            }
        }
    }
}

/// Replays fixed time series. Each request is cut from the stored series by
/// timestamp, so successive ticks see a consistent forecast.
#[derive(Debug, Clone, Default)]
pub struct FixedForecastProvider {
    series: HashMap<SeriesKind, ForecastSeries>,
}

impl FixedForecastProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(
        mut self,
        kind: SeriesKind,
        start: DateTime<Utc>,
        step_minutes: u32,
        values: &[f64],
    ) -> Self {
        let window = HorizonWindow::new(start, step_minutes, values.len());
        self.series
            .insert(kind, ForecastSeries::from_values(kind, &window, values));
        self
    }

    pub fn with_series(mut self, series: ForecastSeries) -> Self {
        self.series.insert(series.kind, series);
        self
    }
}

#[async_trait]
impl ForecastProvider for FixedForecastProvider {
    async fn fetch(&self, kind: SeriesKind, window: HorizonWindow) -> Result<ForecastSeries> {
        let Some(series) = self.series.get(&kind) else {
            bail!("no {kind} series loaded");
        };
        if series.step_minutes != window.step_minutes {
            bail!(
                "{kind} series has {} min steps, window wants {}",
                series.step_minutes,
                window.step_minutes
            );
        }
        let Some(offset) = series.points.iter().position(|p| p.timestamp == window.start) else {
            bail!("{kind} series does not start at {}", window.start);
        };
        let points: Vec<SeriesPoint> = series
            .points
            .iter()
            .skip(offset)
            .take(window.steps)
            .copied()
            .collect();
        if points.len() < window.steps {
            bail!(
                "{kind} series covers {} of {} steps from {}",
                points.len(),
                window.steps,
                window.start
            );
        }
        Ok(ForecastSeries::new(kind, window.step_minutes, points))
    }
}
