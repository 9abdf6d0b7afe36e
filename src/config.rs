use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::PathBuf;
use strum::Display;
use validator::Validate;

use crate::controller::{FallbackPolicy, SchedulerSettings};
use crate::error::{ControlError, ControlResult};
use crate::forecast::{
    HousingGroup, NetworkSettings, PvArray, SiteLocation, SyntheticWeatherFeed, WindSettings,
    WindTurbine,
};
use crate::optimizer::{ObjectiveWeights, PatternSearch, PlanningConstraints};
use crate::simulation::{HeatPumpSpec, TankSpec, ThermalStoreModel, ThermalStoreState};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub site: SiteConfig,
    #[serde(default)]
    #[validate(nested)]
    pub pv_arrays: Vec<PvArray>,
    #[serde(default)]
    #[validate(nested)]
    pub wind: WindSettings,
    #[serde(default)]
    #[validate(nested)]
    pub wind_turbines: Vec<WindTurbine>,
    #[validate(length(min = 1), nested)]
    pub housing_stock: Vec<HousingGroup>,
    #[serde(default)]
    #[validate(nested)]
    pub network: NetworkSettings,
    #[validate(nested)]
    pub tank: TankConfig,
    pub heat_pump: HeatPumpSpec,
    #[serde(default)]
    pub comfort: PlanningConstraints,
    #[serde(default)]
    #[validate(nested)]
    pub optimizer: OptimizerConfig,
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub weather: WeatherConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SiteConfig {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    /// IANA name, e.g. `Europe/London`
    pub timezone: String,
    #[serde(default)]
    pub altitude_m: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TankConfig {
    #[validate(range(exclusive_min = 0.0))]
    pub volume_m3: f64,
    #[validate(range(min = 1, max = 100))]
    pub node_count: usize,
    #[serde(default = "default_wall_u_value")]
    #[validate(range(min = 0.0))]
    pub wall_u_value: f64,
    #[serde(default = "default_one")]
    #[validate(range(min = 0.0))]
    pub conduction_multiplier: f64,
    #[serde(default = "default_initial_temp")]
    pub initial_temp_c: f64,
    /// Overrides `initial_temp_c`, top node first
    #[serde(default)]
    pub initial_node_temps_c: Option<Vec<f64>>,
    #[serde(default)]
    pub charge_node: usize,
    #[serde(default)]
    pub discharge_node: usize,
}

fn default_wall_u_value() -> f64 {
    TankSpec::default().wall_u_value
}

fn default_one() -> f64 {
    1.0
}

fn default_initial_temp() -> f64 {
    50.0
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct OptimizerConfig {
    #[validate(range(exclusive_min = 0.0))]
    pub penalty_weight: f64,
    #[validate(range(min = 0.0))]
    pub tie_break_weight: f64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub initial_step: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub min_step: f64,
    #[validate(range(min = 1))]
    pub max_evaluations: usize,
    /// First poll step when refining the previous tick's plan
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub warm_start_step: f64,
    #[validate(range(min = 0.0))]
    pub warm_start_min_gain: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let weights = ObjectiveWeights::default();
        let search = PatternSearch::default();
        Self {
            penalty_weight: weights.penalty,
            tie_break_weight: weights.tie_break,
            initial_step: search.initial_step,
            min_step: search.min_step,
            max_evaluations: search.max_evaluations,
            warm_start_step: search.warm_start_step,
            warm_start_min_gain: search.warm_start_min_gain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunMode {
    Simulation,
    Realtime,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerConfig {
    pub mode: RunMode,
    #[validate(range(min = 1, max = 336))]
    pub horizon_steps: usize,
    #[validate(range(min = 1, max = 1440))]
    pub step_minutes: u32,
    #[serde(default = "default_fetch_timeout")]
    #[validate(range(min = 1))]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "default_fallback")]
    pub fallback: FallbackPolicy,
    #[serde(default = "default_true")]
    pub use_source_temperature: bool,
    /// 24 hourly modulations compared against every plan
    #[serde(default)]
    #[validate(length(equal = 24))]
    pub baseline_schedule: Option<Vec<f64>>,
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
    /// Virtual clock start; defaults to the current hour
    #[serde(default)]
    pub simulation_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub simulation_ticks: Option<u64>,
    #[serde(default)]
    pub simulation_end: Option<DateTime<Utc>>,
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_fallback() -> FallbackPolicy {
    FallbackPolicy::HoldLast
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WeatherSource {
    Synthetic,
    OpenMeteo,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct WeatherConfig {
    pub source: WeatherSource,
    #[validate(url)]
    pub base_url: String,
    pub cache_ttl_seconds: u64,
    #[validate(range(min = 1))]
    pub http_timeout_seconds: u64,
    pub synthetic: SyntheticWeatherFeed,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            source: WeatherSource::Synthetic,
            base_url: "https://api.open-meteo.com/v1/forecast".into(),
            cache_ttl_seconds: 900,
            http_timeout_seconds: 10,
            synthetic: SyntheticWeatherFeed::default(),
        }
    }
}

impl Config {
    /// Reads `.env`, then the TOML file named by `HEAT_MPC_CONFIG` (or
    /// `config/default.toml`), then `HEAT_MPC__SECTION__KEY` overrides.
    pub fn load() -> ControlResult<Self> {
        dotenvy::dotenv().ok();
        let path =
            std::env::var("HEAT_MPC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let cfg: Config = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HEAT_MPC__").split("__"))
            .extract()?;
        cfg.validate_all()?;
        Ok(cfg)
    }

    pub fn from_toml_str(toml: &str) -> ControlResult<Self> {
        let cfg: Config = Figment::from(Toml::string(toml)).extract()?;
        cfg.validate_all()?;
        Ok(cfg)
    }

    /// Field ranges plus the checks that span sections.
    pub fn validate_all(&self) -> ControlResult<()> {
        self.validate()?;
        self.timezone()?;
        self.comfort.validate()?;
        self.tank_spec().validate()?;
        crate::simulation::HeatPumpModel::new(self.heat_pump.clone())?;

        let nodes = self.tank.node_count;
        if self.tank.charge_node >= nodes || self.tank.discharge_node >= nodes {
            return Err(ControlError::Configuration(format!(
                "tank ports {}/{} outside {nodes} nodes",
                self.tank.charge_node, self.tank.discharge_node
            )));
        }
        if let Some(temps) = &self.tank.initial_node_temps_c {
            if temps.len() != nodes {
                return Err(ControlError::Configuration(format!(
                    "{} initial node temperatures for {nodes} nodes",
                    temps.len()
                )));
            }
        }
        if self.optimizer.min_step > self.optimizer.initial_step {
            return Err(ControlError::Configuration(
                "optimizer min_step exceeds initial_step".into(),
            ));
        }
        if !(self.optimizer.min_step..=self.optimizer.initial_step)
            .contains(&self.optimizer.warm_start_step)
        {
            return Err(ControlError::Configuration(
                "optimizer warm_start_step must lie between min_step and initial_step".into(),
            ));
        }
        if self.pv_arrays.is_empty() && self.wind_turbines.is_empty() {
            return Err(ControlError::Configuration(
                "site needs at least one PV array or wind turbine".into(),
            ));
        }
        for turbine in &self.wind_turbines {
            if turbine.power_curve.windows(2).any(|w| w[1].wind_speed_ms <= w[0].wind_speed_ms) {
                return Err(ControlError::Configuration(format!(
                    "power curve of {} must have rising wind speeds",
                    turbine.name
                )));
            }
        }
        if let (Some(start), Some(end)) =
            (self.controller.simulation_start, self.controller.simulation_end)
        {
            if end <= start {
                return Err(ControlError::Configuration(
                    "simulation_end must follow simulation_start".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn timezone(&self) -> ControlResult<Tz> {
        self.site.timezone.parse::<Tz>().map_err(|e| {
            ControlError::Configuration(format!("unknown timezone {:?}: {e}", self.site.timezone))
        })
    }

    pub fn site_location(&self) -> ControlResult<SiteLocation> {
        Ok(SiteLocation {
            latitude: self.site.latitude,
            longitude: self.site.longitude,
            timezone: self.timezone()?,
            altitude_m: self.site.altitude_m,
        })
    }

    pub fn tank_spec(&self) -> TankSpec {
        TankSpec {
            volume_m3: self.tank.volume_m3,
            node_count: self.tank.node_count,
            wall_u_value: self.tank.wall_u_value,
            conduction_multiplier: self.tank.conduction_multiplier,
        }
    }

    pub fn initial_state(&self) -> ControlResult<ThermalStoreState> {
        let spec = self.tank_spec();
        match &self.tank.initial_node_temps_c {
            Some(temps) => ThermalStoreState::new(&spec, temps.clone()),
            None => ThermalStoreState::uniform(&spec, self.tank.initial_temp_c),
        }
    }

    /// Store ceiling is the maximum safe temperature.
    pub fn store_model(&self) -> ThermalStoreModel {
        ThermalStoreModel::new(
            self.comfort.max_safe_c,
            self.tank.charge_node,
            self.tank.discharge_node,
        )
    }

    pub fn objective_weights(&self) -> ObjectiveWeights {
        ObjectiveWeights {
            penalty: self.optimizer.penalty_weight,
            tie_break: self.optimizer.tie_break_weight,
        }
    }

    pub fn pattern_search(&self) -> PatternSearch {
        PatternSearch {
            initial_step: self.optimizer.initial_step,
            min_step: self.optimizer.min_step,
            max_evaluations: self.optimizer.max_evaluations,
            warm_start_step: self.optimizer.warm_start_step,
            warm_start_min_gain: self.optimizer.warm_start_min_gain,
        }
    }

    pub fn scheduler_settings(&self) -> ControlResult<SchedulerSettings> {
        Ok(SchedulerSettings {
            horizon_steps: self.controller.horizon_steps,
            step_minutes: self.controller.step_minutes,
            fetch_timeout: std::time::Duration::from_secs(self.controller.fetch_timeout_seconds),
            fallback: self.controller.fallback,
            use_source_temperature: self.controller.use_source_temperature,
            baseline: self.controller.baseline_schedule.clone(),
            timezone: self.timezone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [site]
        latitude = 57.6568
        longitude = -3.5818
        timezone = "Europe/London"

        [[pv_arrays]]
        name = "roof"
        peak_kw = 10.0
        tilt_deg = 30.0
        azimuth_deg = 180.0
        derate = 0.85

        [[housing_stock]]
        house_type = "mid-terrace"
        year_built = 1990
        quantity = 6

        [tank]
        volume_m3 = 2.0
        node_count = 6

        [heat_pump]
        nominal_thermal_kw = 12.0
        min_modulation = 0.0
        max_modulation = 1.0
        ramp_limit = 0.5
        cop_ceiling = 10.0
        sink_approach_k = 5.0
        [heat_pump.cop_curve]
        kind = "table"
        source_temps_c = [-5.0, 15.0]
        sink_temps_c = [40.0, 70.0]
        cop = [[3.0, 2.0], [4.5, 3.0]]

        [controller]
        mode = "simulation"
        horizon_steps = 12
        step_minutes = 60
    "#;

    #[test]
    fn test_minimal_config_loads_with_defaults() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.tank.initial_temp_c, 50.0);
        assert_eq!(cfg.comfort.max_safe_c, 80.0);
        assert_eq!(cfg.controller.fallback, FallbackPolicy::HoldLast);
        assert_eq!(cfg.weather.source, WeatherSource::Synthetic);
        assert_eq!(cfg.store_model().max_temp_c, cfg.comfort.max_safe_c);
        assert_eq!(cfg.initial_state().unwrap().node_count, 6);
        assert_eq!(cfg.timezone().unwrap(), chrono_tz::Europe::London);
    }

    #[test]
    fn test_bad_timezone_is_configuration_error() {
        let toml = MINIMAL.replace("Europe/London", "Mars/Olympus");
        assert!(matches!(
            Config::from_toml_str(&toml),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let toml = MINIMAL.replace("node_count = 6", "node_count = 0");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_port_outside_tank_rejected() {
        let toml = MINIMAL.replace("node_count = 6", "node_count = 6\ncharge_node = 6");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("ports"));
    }

    #[test]
    fn test_bad_cop_curve_is_model_error() {
        let toml = MINIMAL.replace("[4.5, 3.0]", "[4.5, 0.5]");
        assert!(matches!(
            Config::from_toml_str(&toml),
            Err(ControlError::ModelConfiguration(_))
        ));
    }

    #[test]
    fn test_short_baseline_rejected() {
        let toml = MINIMAL.replace(
            "step_minutes = 60",
            "step_minutes = 60\nbaseline_schedule = [0.5, 0.5]",
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }
}
