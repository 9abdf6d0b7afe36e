use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use validator::Validate;

use super::{SiteLocation, WeatherPoint};
use crate::domain::{ForecastSeries, HorizonWindow, SeriesKind};

const SOLAR_CONSTANT_W_M2: f64 = 1367.0;
const STC_IRRADIANCE_W_M2: f64 = 1000.0;
/// Share of clear-sky irradiance left under full overcast
const OVERCAST_FLOOR: f64 = 0.35;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PvArray {
    pub name: String,
    #[validate(range(min = 0.0))]
    pub peak_kw: f64,
    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt_deg: f64,
    /// Compass bearing the modules face, 180 = south
    #[validate(range(min = 0.0, max = 360.0))]
    pub azimuth_deg: f64,
    /// Inverter, wiring and soiling losses combined
    #[validate(range(min = 0.0, max = 1.0))]
    pub derate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerCurvePoint {
    pub wind_speed_ms: f64,
    pub power_kw: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WindTurbine {
    pub name: String,
    #[validate(range(min = 1.0))]
    pub hub_height_m: f64,
    #[validate(range(min = 0.0))]
    pub nominal_kw: f64,
    pub quantity: u32,
    #[validate(length(min = 2))]
    pub power_curve: Vec<PowerCurvePoint>,
}

impl WindTurbine {
    /// Vestas V29, 225 kW.
    pub fn vestas_v29(quantity: u32) -> Self {
        let speeds = [
            0.0, 3.0, 3.5, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 25.0,
            26.0, 27.0,
        ];
        let power = [
            0.0, 0.0, 2.1, 7.1, 20.5, 38.3, 61.9, 92.2, 128.0, 165.0, 196.0, 216.0, 223.0, 225.0,
            225.0, 0.0, 0.0,
        ];
        Self {
            name: "Vestas V29".into(),
            hub_height_m: 30.0,
            nominal_kw: 225.0,
            quantity,
            power_curve: speeds
                .iter()
                .zip(power)
                .map(|(&wind_speed_ms, power_kw)| PowerCurvePoint {
                    wind_speed_ms,
                    power_kw,
                })
                .collect(),
        }
    }

    /// Output of one turbine at hub-height speed `v`. Zero outside the curve.
    pub fn power_kw(&self, v: f64) -> f64 {
        let curve = &self.power_curve;
        let (Some(first), Some(last)) = (curve.first(), curve.last()) else {
            return 0.0;
        };
        if v < first.wind_speed_ms || v > last.wind_speed_ms {
            return 0.0;
        }
        let i = curve.partition_point(|p| p.wind_speed_ms <= v);
        if i == 0 || i == curve.len() {
            return curve[i.saturating_sub(1)].power_kw.min(self.nominal_kw);
        }
        let (a, b) = (curve[i - 1], curve[i]);
        let f = (v - a.wind_speed_ms) / (b.wind_speed_ms - a.wind_speed_ms);
        (a.power_kw + (b.power_kw - a.power_kw) * f).min(self.nominal_kw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WindSettings {
    #[validate(range(min = 0.0, max = 1.0))]
    pub hellman_exponent: f64,
    /// Height of the forecast wind speed (m)
    #[validate(range(min = 1.0))]
    pub measurement_height_m: f64,
    /// Wind output earmarked for other local consumers (kW)
    #[validate(range(min = 0.0))]
    pub reserved_power_kw: f64,
}

impl Default for WindSettings {
    fn default() -> Self {
        Self {
            hellman_exponent: 0.2,
            measurement_height_m: 10.0,
            reserved_power_kw: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationForecast {
    pub pv: ForecastSeries,
    pub wind: ForecastSeries,
}

/// Maps weather onto electrical output. Implementations hold only static
/// site data.
pub trait GenerationEstimator: Send + Sync {
    fn estimate(&self, weather: &[WeatherPoint], window: &HorizonWindow) -> Result<GenerationForecast>;
}

pub struct SiteGeneration {
    pub location: SiteLocation,
    pub pv_arrays: Vec<PvArray>,
    pub turbines: Vec<WindTurbine>,
    pub wind: WindSettings,
}

impl SiteGeneration {
    /// Solar elevation and azimuth in degrees at a UTC instant.
    pub fn solar_position(&self, time: DateTime<Utc>) -> (f64, f64) {
        let day_of_year = time.ordinal() as f64;
        let hour = time.hour() as f64 + time.minute() as f64 / 60.0;

        let declination = (23.45 * (360.0 / 365.0 * (day_of_year + 284.0) * PI / 180.0).sin()).to_radians();
        let latitude = self.location.latitude.to_radians();

        let solar_time = hour + self.location.longitude / 15.0;
        let hour_angle_deg = 15.0 * (solar_time - 12.0);
        let hour_angle = hour_angle_deg.to_radians();

        let elevation = (latitude.sin() * declination.sin()
            + latitude.cos() * declination.cos() * hour_angle.cos())
        .asin();

        let azimuth_cos = (declination.sin() - latitude.sin() * elevation.sin())
            / (latitude.cos() * elevation.cos());
        let mut azimuth_deg = azimuth_cos.clamp(-1.0, 1.0).acos().to_degrees();
        if hour_angle_deg > 0.0 {
            azimuth_deg = 360.0 - azimuth_deg;
        }
        (elevation.to_degrees(), azimuth_deg)
    }

    /// Global horizontal irradiance under a clear sky (W/m²).
    pub fn clear_sky_ghi(elevation_deg: f64) -> f64 {
        if elevation_deg <= 0.0 {
            return 0.0;
        }
        let elevation = elevation_deg.to_radians();
        let air_mass = if elevation_deg > 5.0 {
            1.0 / elevation.sin()
        } else {
            12.0 - elevation_deg / 5.0
        };
        let transmittance = 0.7_f64.powf(air_mass.powf(0.678));
        SOLAR_CONSTANT_W_M2 * transmittance * elevation.sin()
    }

    /// Plane-of-array irradiance for one array (W/m²).
    fn plane_of_array(array: &PvArray, elevation_deg: f64, azimuth_deg: f64, cloud_cover: f64) -> f64 {
        let ghi = Self::clear_sky_ghi(elevation_deg)
            * (OVERCAST_FLOOR + (1.0 - OVERCAST_FLOOR) * (1.0 - cloud_cover.clamp(0.0, 1.0)));
        if ghi <= 0.0 {
            return 0.0;
        }
        let diffuse_fraction = 0.2 + 0.6 * cloud_cover.clamp(0.0, 1.0);
        let beam_h = ghi * (1.0 - diffuse_fraction);
        let diffuse_h = ghi * diffuse_fraction;

        let el = elevation_deg.to_radians();
        let tilt = array.tilt_deg.to_radians();
        let cos_incidence = el.sin() * tilt.cos()
            + el.cos() * tilt.sin() * (azimuth_deg - array.azimuth_deg).to_radians().cos();
        let beam_gain = (cos_incidence.max(0.0) / el.sin().max(0.087)).min(5.0);
        beam_h * beam_gain + diffuse_h * (1.0 + tilt.cos()) / 2.0
    }

    pub fn pv_kw(&self, point: &WeatherPoint) -> f64 {
        let (elevation, azimuth) = self.solar_position(point.timestamp);
        self.pv_arrays
            .iter()
            .map(|a| {
                let poa = Self::plane_of_array(a, elevation, azimuth, point.cloud_cover);
                (a.peak_kw * poa / STC_IRRADIANCE_W_M2 * a.derate).clamp(0.0, a.peak_kw)
            })
            .sum()
    }

    /// Farm output left for the heat pump after the reserved share.
    pub fn wind_kw(&self, point: &WeatherPoint) -> f64 {
        let total: f64 = self
            .turbines
            .iter()
            .map(|t| {
                let v_hub = point.wind_speed_ms
                    * (t.hub_height_m / self.wind.measurement_height_m).powf(self.wind.hellman_exponent);
                t.power_kw(v_hub) * f64::from(t.quantity)
            })
            .sum();
        (total - self.wind.reserved_power_kw).max(0.0)
    }
}

impl GenerationEstimator for SiteGeneration {
    fn estimate(&self, weather: &[WeatherPoint], window: &HorizonWindow) -> Result<GenerationForecast> {
        if weather.len() != window.steps {
            bail!(
                "{} weather points for a {}-step horizon",
                weather.len(),
                window.steps
            );
        }
        let pv: Vec<f64> = weather.iter().map(|p| self.pv_kw(p)).collect();
        let wind: Vec<f64> = weather.iter().map(|p| self.wind_kw(p)).collect();
        Ok(GenerationForecast {
            pv: ForecastSeries::from_values(SeriesKind::Pv, window, &pv),
            wind: ForecastSeries::from_values(SeriesKind::Wind, window, &wind),
        })
    }
}
