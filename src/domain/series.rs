use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::error::{ControlError, ControlResult};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SeriesKind {
    /// Photovoltaic electrical output (kW)
    Pv,
    /// Wind electrical output available to the heat pump (kW)
    Wind,
    /// Network heat demand (thermal kW)
    Demand,
    /// Heat-pump source temperature, usually outdoor air (°C)
    SourceTemperature,
}

impl SeriesKind {
    pub const REQUIRED: [SeriesKind; 3] = [SeriesKind::Pv, SeriesKind::Wind, SeriesKind::Demand];
}

/// Fixed-step window the controller plans over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonWindow {
    pub start: DateTime<Utc>,
    pub step_minutes: u32,
    pub steps: usize,
}

impl HorizonWindow {
    pub fn new(start: DateTime<Utc>, step_minutes: u32, steps: usize) -> Self {
        Self {
            start,
            step_minutes,
            steps,
        }
    }

    pub fn step(&self) -> Duration {
        Duration::minutes(i64::from(self.step_minutes))
    }

    pub fn step_hours(&self) -> f64 {
        f64::from(self.step_minutes) / 60.0
    }

    pub fn timestamp(&self, index: usize) -> DateTime<Utc> {
        self.start + self.step() * index as i32
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp(self.steps)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.steps).map(|i| self.timestamp(i))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSeries {
    pub kind: SeriesKind,
    pub step_minutes: u32,
    pub points: Vec<SeriesPoint>,
}

impl ForecastSeries {
    pub fn new(kind: SeriesKind, step_minutes: u32, points: Vec<SeriesPoint>) -> Self {
        Self {
            kind,
            step_minutes,
            points,
        }
    }

    /// Builds a series on `window` from one value per step.
    pub fn from_values(kind: SeriesKind, window: &HorizonWindow, values: &[f64]) -> Self {
        let points = window
            .timestamps()
            .zip(values.iter().copied())
            .map(|(timestamp, value)| SeriesPoint { timestamp, value })
            .collect();
        Self::new(kind, window.step_minutes, points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        self.points.get(index).map(|p| p.value)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.value)
    }

    /// Drops the first `steps` points.
    pub fn shifted(&self, steps: usize) -> Self {
        Self {
            kind: self.kind,
            step_minutes: self.step_minutes,
            points: self.points.iter().skip(steps).copied().collect(),
        }
    }

    /// Checks that the series lands exactly on `window`'s grid.
    pub fn check_alignment(&self, window: &HorizonWindow) -> ControlResult<()> {
        if self.step_minutes != window.step_minutes {
            return Err(ControlError::Configuration(format!(
                "{} series step {} min does not match horizon step {} min",
                self.kind, self.step_minutes, window.step_minutes
            )));
        }
        if self.points.len() != window.steps {
            return Err(ControlError::Configuration(format!(
                "{} series has {} points, horizon needs {}",
                self.kind,
                self.points.len(),
                window.steps
            )));
        }
        for (i, (point, expected)) in self.points.iter().zip(window.timestamps()).enumerate() {
            if point.timestamp != expected {
                return Err(ControlError::Configuration(format!(
                    "{} series point {} at {} expected {}",
                    self.kind, i, point.timestamp, expected
                )));
            }
            if !point.value.is_finite() {
                return Err(ControlError::InputValidation(format!(
                    "{} series point {} is not finite",
                    self.kind, i
                )));
            }
        }
        Ok(())
    }
}

/// The aligned inputs for one planning solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastBundle {
    pub window: HorizonWindow,
    pub pv: ForecastSeries,
    pub wind: ForecastSeries,
    pub demand: ForecastSeries,
    pub source_temperature: Option<ForecastSeries>,
}

impl ForecastBundle {
    pub fn assemble(
        window: HorizonWindow,
        pv: ForecastSeries,
        wind: ForecastSeries,
        demand: ForecastSeries,
        source_temperature: Option<ForecastSeries>,
    ) -> ControlResult<Self> {
        if window.steps == 0 {
            return Err(ControlError::Configuration(
                "horizon must contain at least one step".into(),
            ));
        }
        for (series, kind) in [(&pv, SeriesKind::Pv), (&wind, SeriesKind::Wind), (&demand, SeriesKind::Demand)] {
            if series.kind != kind {
                return Err(ControlError::Configuration(format!(
                    "expected {kind} series, got {}",
                    series.kind
                )));
            }
            series.check_alignment(&window)?;
        }
        if let Some(source) = &source_temperature {
            source.check_alignment(&window)?;
        }
        if demand.values().any(|d| d < 0.0) {
            return Err(ControlError::InputValidation(
                "heat demand must not be negative".into(),
            ));
        }
        Ok(Self {
            window,
            pv,
            wind,
            demand,
            source_temperature,
        })
    }

    pub fn steps(&self) -> usize {
        self.window.steps
    }

    pub fn step_hours(&self) -> f64 {
        self.window.step_hours()
    }

    /// Renewable power available to the heat pump, floored at zero.
    pub fn renewable_kw(&self, index: usize) -> f64 {
        let pv = self.pv.value(index).unwrap_or(0.0);
        let wind = self.wind.value(index).unwrap_or(0.0);
        (pv + wind).max(0.0)
    }

    pub fn demand_kw(&self, index: usize) -> f64 {
        self.demand.value(index).unwrap_or(0.0)
    }

    pub fn source_temp_c(&self, index: usize, fallback_c: f64) -> f64 {
        self.source_temperature
            .as_ref()
            .and_then(|s| s.value(index))
            .unwrap_or(fallback_c)
    }

    pub fn total_demand_kwh(&self) -> f64 {
        self.demand.values().sum::<f64>() * self.step_hours()
    }

    /// The same forecast seen one step later. `None` once nothing is left.
    pub fn shifted(&self) -> Option<Self> {
        if self.window.steps <= 1 {
            return None;
        }
        let window = HorizonWindow::new(
            self.window.timestamp(1),
            self.window.step_minutes,
            self.window.steps - 1,
        );
        Some(Self {
            window,
            pv: self.pv.shifted(1),
            wind: self.wind.shifted(1),
            demand: self.demand.shifted(1),
            source_temperature: self.source_temperature.as_ref().map(|s| s.shifted(1)),
        })
    }
}
