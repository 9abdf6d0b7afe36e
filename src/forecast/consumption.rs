use anyhow::{bail, Result};
use chrono::{NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumIter, EnumString};
use validator::Validate;

use super::WeatherPoint;
use crate::domain::{ForecastSeries, HorizonWindow, SeriesKind};

/// Daily-average temperatures outside this range use the nearest edge.
pub const PROFILE_TEMP_RANGE_C: (f64, f64) = (-3.0, 14.0);

/// Hour-of-day demand weights, mean 1.
const DIURNAL_SHAPE: [f64; 24] = [
    0.60, 0.55, 0.55, 0.55, 0.60, 0.80, 1.35, 1.60, 1.45, 1.10, 0.95, 0.90, 0.90, 0.85, 0.85,
    0.90, 1.10, 1.35, 1.50, 1.45, 1.30, 1.10, 0.85, 0.85,
];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HouseType {
    Detached,
    SemiDetached,
    MidTerrace,
    DetachedBungalow,
    SemiDetachedBungalow,
    GroundFloorFlat,
    MidFloorFlat,
    TopFloorFlat,
}

impl HouseType {
    /// Fabric and ventilation loss of a 2003-2007 build (kW/K)
    pub fn heat_loss_kw_per_k(self) -> f64 {
        match self {
            HouseType::Detached => 0.25,
            HouseType::SemiDetached => 0.19,
            HouseType::MidTerrace => 0.15,
            HouseType::DetachedBungalow => 0.20,
            HouseType::SemiDetachedBungalow => 0.16,
            HouseType::GroundFloorFlat => 0.11,
            HouseType::MidFloorFlat => 0.08,
            HouseType::TopFloorFlat => 0.11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AgeBand {
    #[strum(serialize = "pre-1983")]
    Pre1983,
    #[strum(serialize = "1983-2002")]
    From1983,
    #[strum(serialize = "2003-2007")]
    From2003,
    #[strum(serialize = "post-2007")]
    Post2007,
}

impl AgeBand {
    pub fn from_year(year_built: i32) -> Self {
        match year_built {
            y if y < 1983 => AgeBand::Pre1983,
            y if y < 2003 => AgeBand::From1983,
            y if y < 2008 => AgeBand::From2003,
            _ => AgeBand::Post2007,
        }
    }

    pub fn loss_factor(self) -> f64 {
        match self {
            AgeBand::Pre1983 => 1.6,
            AgeBand::From1983 => 1.25,
            AgeBand::From2003 => 1.0,
            AgeBand::Post2007 => 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HousingGroup {
    pub house_type: HouseType,
    #[validate(range(min = 1800, max = 2100))]
    pub year_built: i32,
    #[validate(range(min = 1))]
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NetworkSettings {
    /// Distribution heat loss as a fraction of delivered heat
    #[validate(range(min = 0.0))]
    pub losses_factor: f64,
    /// Circulation pumping energy as a fraction of delivered heat
    #[validate(range(min = 0.0))]
    pub pumping_factor: f64,
    /// Calibration of the archetypes to the real buildings
    #[validate(range(min = 0.0))]
    pub performance_factor: f64,
    /// Safety margin added on top of the expected demand
    #[validate(range(min = 0.0))]
    pub margin_fraction: f64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            losses_factor: 0.5,
            pumping_factor: 0.01,
            performance_factor: 1.0,
            margin_fraction: 0.0,
        }
    }
}

impl NetworkSettings {
    pub fn scale(&self) -> f64 {
        (1.0 + self.losses_factor + self.pumping_factor)
            * self.performance_factor
            * (1.0 + self.margin_fraction)
    }
}

pub trait DemandEstimator: Send + Sync {
    fn estimate(&self, weather: &[WeatherPoint], window: &HorizonWindow) -> Result<ForecastSeries>;
}

/// Degree-hour demand model over a housing-stock catalogue.
pub struct HousingStockDemand {
    pub groups: Vec<HousingGroup>,
    pub network: NetworkSettings,
    pub timezone: Tz,
    pub base_temp_c: f64,
    pub hot_water_kw_per_home: f64,
}

impl HousingStockDemand {
    pub fn new(groups: Vec<HousingGroup>, network: NetworkSettings, timezone: Tz) -> Self {
        Self {
            groups,
            network,
            timezone,
            base_temp_c: 15.5,
            hot_water_kw_per_home: 0.15,
        }
    }

    /// Heat loss of the whole stock (kW/K)
    pub fn stock_loss_kw_per_k(&self) -> f64 {
        self.groups
            .iter()
            .map(|g| {
                g.house_type.heat_loss_kw_per_k()
                    * AgeBand::from_year(g.year_built).loss_factor()
                    * f64::from(g.quantity)
            })
            .sum()
    }

    pub fn homes(&self) -> u32 {
        self.groups.iter().map(|g| g.quantity).sum()
    }

    /// Expected network demand (kW) for one hour of day at a daily average.
    pub fn hourly_demand_kw(&self, daily_average_c: f64, local_hour: usize) -> f64 {
        let t = daily_average_c.clamp(PROFILE_TEMP_RANGE_C.0, PROFILE_TEMP_RANGE_C.1);
        let shape = DIURNAL_SHAPE[local_hour % 24];
        let space = self.stock_loss_kw_per_k() * (self.base_temp_c - t).max(0.0);
        let hot_water = self.hot_water_kw_per_home * f64::from(self.homes());
        (space + hot_water) * shape * self.network.scale()
    }
}

impl DemandEstimator for HousingStockDemand {
    fn estimate(&self, weather: &[WeatherPoint], window: &HorizonWindow) -> Result<ForecastSeries> {
        if weather.len() != window.steps {
            bail!(
                "{} weather points for a {}-step horizon",
                weather.len(),
                window.steps
            );
        }
        let mut days: HashMap<NaiveDate, (f64, usize)> = HashMap::new();
        for p in weather {
            let day = p.timestamp.with_timezone(&self.timezone).date_naive();
            let entry = days.entry(day).or_insert((0.0, 0));
            entry.0 += p.temperature_c;
            entry.1 += 1;
        }
        let values: Vec<f64> = weather
            .iter()
            .map(|p| {
                let local = p.timestamp.with_timezone(&self.timezone);
                let (sum, n) = days.get(&local.date_naive()).copied().unwrap_or((p.temperature_c, 1));
                self.hourly_demand_kw(sum / n as f64, local.hour() as usize)
            })
            .collect();
        Ok(ForecastSeries::from_values(SeriesKind::Demand, window, &values))
    }
}
