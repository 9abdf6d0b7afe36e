//! Weather inputs for the generation and demand estimators.
//!
//! [`HttpWeatherFeed`] reads an Open-Meteo style hourly forecast;
//! [`SyntheticWeatherFeed`] produces a reproducible diurnal pattern for
//! offline simulation runs.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::HorizonWindow;

/// Geographic site of the network.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: Tz,
    pub altitude_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    /// Wind speed at the measurement height (m/s)
    pub wind_speed_ms: f64,
    /// Total cloud cover, 0 to 1
    pub cloud_cover: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSeries {
    pub points: Vec<WeatherPoint>,
}

impl WeatherSeries {
    /// Interpolates the series onto `window`. Fails if any step falls
    /// outside the data.
    pub fn sample(&self, window: &HorizonWindow) -> Result<Vec<WeatherPoint>> {
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(f), Some(l)) => (f.timestamp, l.timestamp),
            _ => bail!("weather series is empty"),
        };
        window
            .timestamps()
            .map(|t| {
                if t < first || t > last {
                    bail!("weather data covers {first}..{last}, missing {t}");
                }
                let i = self.points.partition_point(|p| p.timestamp <= t);
                let lo = &self.points[i - 1];
                if lo.timestamp == t || i == self.points.len() {
                    return Ok(WeatherPoint { timestamp: t, ..*lo });
                }
                let hi = &self.points[i];
                let span = (hi.timestamp - lo.timestamp).num_seconds() as f64;
                let f = (t - lo.timestamp).num_seconds() as f64 / span;
                let mix = |a: f64, b: f64| a + (b - a) * f;
                Ok(WeatherPoint {
                    timestamp: t,
                    temperature_c: mix(lo.temperature_c, hi.temperature_c),
                    wind_speed_ms: mix(lo.wind_speed_ms, hi.wind_speed_ms),
                    cloud_cover: mix(lo.cloud_cover, hi.cloud_cover),
                })
            })
            .collect()
    }
}

#[async_trait]
pub trait WeatherFeed: Send + Sync {
    async fn fetch(
        &self,
        location: &SiteLocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_minutes: u32,
    ) -> Result<WeatherSeries>;
}

/// Client for an Open-Meteo compatible `/v1/forecast` endpoint.
#[derive(Clone)]
pub struct HttpWeatherFeed {
    base_url: String,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(DateTime<Utc>, WeatherSeries)>>>,
    ttl: std::time::Duration,
}

impl HttpWeatherFeed {
    pub fn new(base_url: String, ttl: std::time::Duration, timeout: std::time::Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("district-heat-mpc/0.1"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url,
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
        })
    }

    async fn cached(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<WeatherSeries> {
        let c = self.cache.read().await;
        let (fetched_at, series) = c.as_ref()?;
        let fresh = (Utc::now() - *fetched_at).num_seconds() < self.ttl.as_secs() as i64;
        let covers = series.points.first().is_some_and(|p| p.timestamp <= start)
            && series.points.last().is_some_and(|p| p.timestamp >= end);
        (fresh && covers).then(|| series.clone())
    }
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    wind_speed_10m: Vec<Option<f64>>,
    cloud_cover: Vec<Option<f64>>,
}

fn parse_hourly(hourly: OpenMeteoHourly) -> Result<WeatherSeries> {
    let n = hourly.time.len();
    if hourly.temperature_2m.len() != n || hourly.wind_speed_10m.len() != n || hourly.cloud_cover.len() != n {
        bail!("weather response columns have different lengths");
    }
    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        let timestamp = NaiveDateTime::parse_from_str(&hourly.time[i], "%Y-%m-%dT%H:%M")
            .with_context(|| format!("bad timestamp {}", hourly.time[i]))?
            .and_utc();
        // Gaps in the upstream model output end the usable series.
        let (Some(t), Some(w), Some(c)) = (
            hourly.temperature_2m[i],
            hourly.wind_speed_10m[i],
            hourly.cloud_cover[i],
        ) else {
            break;
        };
        points.push(WeatherPoint {
            timestamp,
            temperature_c: t,
            wind_speed_ms: w.max(0.0),
            cloud_cover: (c / 100.0).clamp(0.0, 1.0),
        });
    }
    Ok(WeatherSeries { points })
}

#[async_trait]
impl WeatherFeed for HttpWeatherFeed {
    async fn fetch(
        &self,
        location: &SiteLocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _step_minutes: u32,
    ) -> Result<WeatherSeries> {
        if let Some(series) = self.cached(start, end).await {
            return Ok(series);
        }

        // Hourly data; widen to whole hours so interpolation has both ends.
        let from = start - Duration::hours(1);
        let to = end + Duration::hours(1);
        let fmt = "%Y-%m-%dT%H:00";
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", format!("{:.4}", location.latitude)),
                ("longitude", format!("{:.4}", location.longitude)),
                ("hourly", "temperature_2m,wind_speed_10m,cloud_cover".to_string()),
                ("wind_speed_unit", "ms".to_string()),
                ("timezone", "UTC".to_string()),
                ("start_hour", from.format(fmt).to_string()),
                ("end_hour", to.format(fmt).to_string()),
            ])
            .send()
            .await
            .context("weather GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("weather read failed")?;
        if !status.is_success() {
            bail!("weather API error: HTTP {status}: {body}");
        }
        let raw: OpenMeteoResponse =
            serde_json::from_str(&body).context("weather JSON parse failed")?;
        let series = parse_hourly(raw.hourly)?;

        let covered = series.points.first().is_some_and(|p| p.timestamp <= start)
            && series.points.last().is_some_and(|p| p.timestamp >= end);
        if !covered {
            bail!("weather forecast does not cover {start}..{end}");
        }
        debug!(points = series.points.len(), "weather forecast fetched");

        let mut c = self.cache.write().await;
        *c = Some((Utc::now(), series.clone()));
        Ok(series)
    }
}

/// Seeded weather generator. The same timestamp always yields the same
/// values, so overlapping windows agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticWeatherFeed {
    pub seed: u64,
    pub mean_temp_c: f64,
    pub temp_amplitude_c: f64,
    pub mean_wind_ms: f64,
    pub wind_spread_ms: f64,
    pub mean_cloud_cover: f64,
}

impl Default for SyntheticWeatherFeed {
    fn default() -> Self {
        Self {
            seed: 7,
            mean_temp_c: 6.0,
            temp_amplitude_c: 4.0,
            mean_wind_ms: 6.5,
            wind_spread_ms: 2.5,
            mean_cloud_cover: 0.6,
        }
    }
}

impl SyntheticWeatherFeed {
    pub fn point(&self, timestamp: DateTime<Utc>) -> WeatherPoint {
        let minutes = timestamp.timestamp().div_euclid(60) as u64;
        let mut rng = StdRng::seed_from_u64(self.seed ^ minutes.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let noise = Normal::new(0.0, 1.0).map(|n| n.sample(&mut rng)).unwrap_or(0.0);
        let cloud_noise = Normal::new(0.0, 0.2).map(|n| n.sample(&mut rng)).unwrap_or(0.0);

        let hours = timestamp.timestamp() as f64 / 3600.0;
        let day_phase = 2.0 * std::f64::consts::PI * (hours.rem_euclid(24.0) - 9.0) / 24.0;
        // Weather fronts on a multi-day cycle
        let front = (2.0 * std::f64::consts::PI * hours / 53.0).sin();

        WeatherPoint {
            timestamp,
            temperature_c: self.mean_temp_c + self.temp_amplitude_c * day_phase.sin() + 0.5 * noise,
            wind_speed_ms: (self.mean_wind_ms + self.wind_spread_ms * (front + 0.3 * noise)).max(0.0),
            cloud_cover: (self.mean_cloud_cover + 0.25 * front + cloud_noise).clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl WeatherFeed for SyntheticWeatherFeed {
    async fn fetch(
        &self,
        _location: &SiteLocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_minutes: u32,
    ) -> Result<WeatherSeries> {
        if step_minutes == 0 || end < start {
            bail!("invalid weather request {start}..{end} every {step_minutes} min");
        }
        let step = Duration::minutes(i64::from(step_minutes));
        let mut points = Vec::new();
        let mut t = start;
        while t <= end {
            points.push(self.point(t));
            t += step;
        }
        Ok(WeatherSeries { points })
    }
}
