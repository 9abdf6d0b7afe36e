//! Stratified hot-water store.
//!
//! The tank is a column of `N` equal-volume nodes, index 0 at the top. Each
//! call to [`ThermalStoreModel::advance`] splits the step into substeps and in
//! every substep applies, in order: conduction between neighbours, exponential
//! loss to ambient, the net heat injection or extraction at the configured
//! port, and a mixing pass that restores top-to-bottom ordering.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_finite, ControlError, ControlResult};

/// kWh per kg per K
pub const WATER_SPECIFIC_HEAT: f64 = 4.186 / 3600.0;
/// kg per m³
pub const WATER_DENSITY: f64 = 998.0;
/// kW per m per K
pub const WATER_CONDUCTIVITY: f64 = 0.00064;
/// Height-to-diameter ratio used to derive geometry from volume
pub const TANK_ASPECT_RATIO: f64 = 3.0;

const MAX_CONDUCTION_FOURIER: f64 = 0.25;
const MAX_SUBSTEPS: usize = 10_000;
const ORDER_TOLERANCE_C: f64 = 1e-9;

/// Physical description of a tank, before any temperatures are known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankSpec {
    pub volume_m3: f64,
    pub node_count: usize,
    /// Wall heat-transfer coefficient (kW/m²K)
    pub wall_u_value: f64,
    /// Multiplier on still-water conduction to account for buoyant mixing
    pub conduction_multiplier: f64,
}

impl Default for TankSpec {
    fn default() -> Self {
        Self {
            volume_m3: 1.0,
            node_count: 5,
            wall_u_value: 0.00011,
            conduction_multiplier: 1.0,
        }
    }
}

impl TankSpec {
    pub fn validate(&self) -> ControlResult<()> {
        if self.node_count == 0 {
            return Err(ControlError::Configuration(
                "tank needs at least one node".into(),
            ));
        }
        if !(self.volume_m3.is_finite() && self.volume_m3 > 0.0) {
            return Err(ControlError::Configuration(format!(
                "tank volume must be positive, got {}",
                self.volume_m3
            )));
        }
        if !(self.wall_u_value.is_finite() && self.wall_u_value >= 0.0) {
            return Err(ControlError::Configuration(
                "wall U-value must be non-negative".into(),
            ));
        }
        if !(self.conduction_multiplier.is_finite() && self.conduction_multiplier >= 0.0) {
            return Err(ControlError::Configuration(
                "conduction multiplier must be non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn diameter_m(&self) -> f64 {
        (4.0 * self.volume_m3 / (TANK_ASPECT_RATIO * std::f64::consts::PI)).cbrt()
    }

    pub fn height_m(&self) -> f64 {
        TANK_ASPECT_RATIO * self.diameter_m()
    }

    pub fn cross_section_m2(&self) -> f64 {
        let d = self.diameter_m();
        std::f64::consts::PI * d * d / 4.0
    }

    /// Outer surface per node. The end nodes carry the top and bottom caps.
    pub fn node_areas_m2(&self) -> Vec<f64> {
        let n = self.node_count;
        let side = std::f64::consts::PI * self.diameter_m() * self.height_m() / n as f64;
        let cap = self.cross_section_m2();
        let mut areas = vec![side; n];
        if let Some(top) = areas.first_mut() {
            *top += cap;
        }
        if let Some(bottom) = areas.last_mut() {
            *bottom += cap;
        }
        areas
    }

    pub fn conduction_kw_per_k(&self) -> f64 {
        let node_height = self.height_m() / self.node_count as f64;
        WATER_CONDUCTIVITY * self.cross_section_m2() / node_height * self.conduction_multiplier
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalStoreState {
    /// Node temperatures, top first (°C)
    pub node_temps_c: Vec<f64>,
    pub volume_m3: f64,
    pub node_count: usize,
    /// Total tank UA to ambient (kW/K)
    pub loss_kw_per_k: f64,
    /// Fraction of the outer surface belonging to each node
    pub area_shares: Vec<f64>,
    /// Conductance between adjacent nodes (kW/K)
    pub conduction_kw_per_k: f64,
}

impl ThermalStoreState {
    pub fn new(spec: &TankSpec, node_temps_c: Vec<f64>) -> ControlResult<Self> {
        spec.validate()?;
        if node_temps_c.len() != spec.node_count {
            return Err(ControlError::Configuration(format!(
                "{} initial temperatures for {} nodes",
                node_temps_c.len(),
                spec.node_count
            )));
        }
        let areas = spec.node_areas_m2();
        let total_area: f64 = areas.iter().sum();
        Ok(Self {
            node_temps_c,
            volume_m3: spec.volume_m3,
            node_count: spec.node_count,
            loss_kw_per_k: spec.wall_u_value * total_area,
            area_shares: areas.iter().map(|a| a / total_area).collect(),
            conduction_kw_per_k: spec.conduction_kw_per_k(),
        })
    }

    pub fn uniform(spec: &TankSpec, temp_c: f64) -> ControlResult<Self> {
        Self::new(spec, vec![temp_c; spec.node_count])
    }

    /// Heat capacity of a single node (kWh/K)
    pub fn node_capacity_kwh_per_k(&self) -> f64 {
        self.volume_m3 * WATER_DENSITY * WATER_SPECIFIC_HEAT / self.node_count.max(1) as f64
    }

    /// Sensible heat above 0 °C (kWh)
    pub fn stored_energy_kwh(&self) -> f64 {
        self.node_capacity_kwh_per_k() * self.node_temps_c.iter().sum::<f64>()
    }

    pub fn top_temp_c(&self) -> f64 {
        self.node_temps_c.first().copied().unwrap_or(f64::NAN)
    }

    pub fn max_temp_c(&self) -> f64 {
        self.node_temps_c.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min_temp_c(&self) -> f64 {
        self.node_temps_c.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn is_stratified(&self) -> bool {
        self.node_temps_c
            .windows(2)
            .all(|w| w[0] + ORDER_TOLERANCE_C >= w[1])
    }

    fn check(&self) -> ControlResult<()> {
        if self.node_count == 0 || self.node_temps_c.len() != self.node_count {
            return Err(ControlError::InputValidation(format!(
                "store state has {} temperatures for {} nodes",
                self.node_temps_c.len(),
                self.node_count
            )));
        }
        if self.area_shares.len() != self.node_count {
            return Err(ControlError::InputValidation(format!(
                "store state has {} area shares for {} nodes",
                self.area_shares.len(),
                self.node_count
            )));
        }
        if !(self.volume_m3.is_finite() && self.volume_m3 > 0.0) {
            return Err(ControlError::InputValidation(
                "store volume must be positive".into(),
            ));
        }
        if !(self.loss_kw_per_k >= 0.0 && self.conduction_kw_per_k >= 0.0) {
            return Err(ControlError::InputValidation(
                "store coefficients must be non-negative".into(),
            ));
        }
        for (i, t) in self.node_temps_c.iter().enumerate() {
            ensure_finite(&format!("node {i} temperature"), *t)?;
        }
        Ok(())
    }
}

/// Result of one [`ThermalStoreModel::advance`] call. Energies in kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStep {
    pub state: ThermalStoreState,
    pub absorbed_kwh: f64,
    pub extracted_kwh: f64,
    /// Injection the store had no room for
    pub rejected_kwh: f64,
    /// Extraction the store could not supply
    pub unmet_kwh: f64,
    pub ambient_loss_kwh: f64,
    pub mixing_applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalStoreModel {
    /// No node is heated beyond this temperature
    pub max_temp_c: f64,
    pub charge_node: usize,
    pub discharge_node: usize,
    pub min_substeps: usize,
}

impl Default for ThermalStoreModel {
    fn default() -> Self {
        Self {
            max_temp_c: 80.0,
            charge_node: 0,
            discharge_node: 0,
            min_substeps: 4,
        }
    }
}

impl ThermalStoreModel {
    pub fn new(max_temp_c: f64, charge_node: usize, discharge_node: usize) -> Self {
        Self {
            max_temp_c,
            charge_node,
            discharge_node,
            ..Default::default()
        }
    }

    pub fn advance(
        &self,
        state: &ThermalStoreState,
        net_power_kw: f64,
        ambient_c: f64,
        dt_h: f64,
    ) -> ControlResult<StoreStep> {
        if !(dt_h.is_finite() && dt_h > 0.0) {
            return Err(ControlError::InputValidation(format!(
                "time step must be positive, got {dt_h} h"
            )));
        }
        ensure_finite("net thermal power", net_power_kw)?;
        ensure_finite("ambient temperature", ambient_c)?;
        state.check()?;
        let n = state.node_count;
        if self.charge_node >= n || self.discharge_node >= n {
            return Err(ControlError::InputValidation(format!(
                "port nodes {}/{} outside a {n}-node store",
                self.charge_node, self.discharge_node
            )));
        }

        let capacity = state.node_capacity_kwh_per_k();
        let substeps = self.substeps(state, dt_h, capacity);
        let dt_sub = dt_h / substeps as f64;

        let mut temps = state.node_temps_c.clone();
        let mut step = StoreStep {
            state: state.clone(),
            absorbed_kwh: 0.0,
            extracted_kwh: 0.0,
            rejected_kwh: 0.0,
            unmet_kwh: 0.0,
            ambient_loss_kwh: 0.0,
            mixing_applied: false,
        };

        for _ in 0..substeps {
            conduct(&mut temps, state.conduction_kw_per_k * dt_sub / capacity);

            for (t, share) in temps.iter_mut().zip(&state.area_shares) {
                let decay = (-state.loss_kw_per_k * share * dt_sub / capacity).exp();
                let next = ambient_c + (*t - ambient_c) * decay;
                step.ambient_loss_kwh += (*t - next) * capacity;
                *t = next;
            }

            let energy = net_power_kw * dt_sub;
            if energy > 0.0 {
                let left = self.inject(&mut temps, energy, capacity);
                step.absorbed_kwh += energy - left;
                step.rejected_kwh += left;
            } else if energy < 0.0 {
                let left = self.extract(&mut temps, -energy, capacity, ambient_c);
                step.extracted_kwh += -energy - left;
                step.unmet_kwh += left;
            }

            step.mixing_applied |= restore_order(&mut temps);
        }

        step.state.node_temps_c = temps;
        Ok(step)
    }

    fn substeps(&self, state: &ThermalStoreState, dt_h: f64, capacity: f64) -> usize {
        let fourier = state.conduction_kw_per_k * dt_h / capacity;
        let needed = (fourier / MAX_CONDUCTION_FOURIER).ceil();
        let needed = if needed.is_finite() { needed as usize } else { MAX_SUBSTEPS };
        needed.max(self.min_substeps).clamp(1, MAX_SUBSTEPS)
    }

    /// Nodes in the order heat spills from a port: the port, then downward,
    /// then upward.
    fn spill_order(port: usize, n: usize) -> impl Iterator<Item = usize> {
        (port..n).chain((0..port).rev())
    }

    fn inject(&self, temps: &mut [f64], mut energy: f64, capacity: f64) -> f64 {
        for i in Self::spill_order(self.charge_node, temps.len()) {
            if energy <= 0.0 {
                break;
            }
            let room = ((self.max_temp_c - temps[i]) * capacity).max(0.0);
            let taken = energy.min(room);
            temps[i] += taken / capacity;
            energy -= taken;
        }
        energy.max(0.0)
    }

    fn extract(&self, temps: &mut [f64], mut energy: f64, capacity: f64, floor_c: f64) -> f64 {
        for i in Self::spill_order(self.discharge_node, temps.len()) {
            if energy <= 0.0 {
                break;
            }
            let available = ((temps[i] - floor_c) * capacity).max(0.0);
            let taken = energy.min(available);
            temps[i] -= taken / capacity;
            energy -= taken;
        }
        energy.max(0.0)
    }
}

/// Explicit exchange between neighbours. `fourier` is conductance × dt /
/// node capacity and stays at or below 0.25.
fn conduct(temps: &mut [f64], fourier: f64) {
    if fourier <= 0.0 || temps.len() < 2 {
        return;
    }
    let fluxes: Vec<f64> = temps.windows(2).map(|w| fourier * (w[0] - w[1])).collect();
    for (i, flux) in fluxes.into_iter().enumerate() {
        temps[i] -= flux;
        temps[i + 1] += flux;
    }
}

/// Merges inverted neighbours into equal-temperature blocks until the column
/// is non-increasing from the top. Nodes have equal capacity, so each block
/// takes the mean of its members and total energy is unchanged. Returns
/// whether anything moved.
fn restore_order(temps: &mut [f64]) -> bool {
    if temps
        .windows(2)
        .all(|w| w[0] + ORDER_TOLERANCE_C >= w[1])
    {
        return false;
    }
    // (sum, count) per block, top first
    let mut blocks: Vec<(f64, usize)> = Vec::with_capacity(temps.len());
    for &t in temps.iter() {
        blocks.push((t, 1));
        while blocks.len() > 1 {
            let (s1, c1) = blocks[blocks.len() - 1];
            let (s0, c0) = blocks[blocks.len() - 2];
            if s0 / c0 as f64 >= s1 / c1 as f64 {
                break;
            }
            blocks.pop();
            if let Some(last) = blocks.last_mut() {
                *last = (s0 + s1, c0 + c1);
            }
        }
    }
    let mut i = 0;
    for (sum, count) in blocks {
        let mean = sum / count as f64;
        for t in &mut temps[i..i + count] {
            *t = mean;
        }
        i += count;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store(temps: Vec<f64>) -> ThermalStoreState {
        let spec = TankSpec {
            node_count: temps.len(),
            ..Default::default()
        };
        ThermalStoreState::new(&spec, temps).unwrap()
    }

    fn lossless(mut state: ThermalStoreState) -> ThermalStoreState {
        state.loss_kw_per_k = 0.0;
        state
    }

    #[test]
    fn test_geometry_from_volume() {
        let spec = TankSpec::default();
        assert!((spec.height_m() / spec.diameter_m() - 3.0).abs() < 1e-12);
        let volume = spec.cross_section_m2() * spec.height_m();
        assert!((volume - 1.0).abs() < 1e-9);
        let areas = spec.node_areas_m2();
        assert!(areas[0] > areas[2]);
        assert!((areas[0] - areas[4]).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_time_step() {
        let model = ThermalStoreModel::default();
        let s = store(vec![50.0; 3]);
        for dt in [0.0, -1.0, f64::NAN] {
            assert!(matches!(
                model.advance(&s, 1.0, 20.0, dt),
                Err(ControlError::InputValidation(_))
            ));
        }
    }

    #[test]
    fn test_rejects_mismatched_nodes() {
        let model = ThermalStoreModel::default();
        let mut s = store(vec![50.0; 3]);
        s.node_temps_c.push(40.0);
        assert!(matches!(
            model.advance(&s, 0.0, 20.0, 1.0),
            Err(ControlError::InputValidation(_))
        ));
    }

    #[test]
    fn test_zero_nodes_fail_construction() {
        let spec = TankSpec {
            node_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            ThermalStoreState::new(&spec, vec![]),
            Err(ControlError::Configuration(_))
        ));
        let spec = TankSpec {
            volume_m3: -1.0,
            ..Default::default()
        };
        assert!(ThermalStoreState::uniform(&spec, 40.0).is_err());
    }

    #[test]
    fn test_charging_heats_top_first() {
        let model = ThermalStoreModel::default();
        let s = lossless(store(vec![45.0; 5]));
        let out = model.advance(&s, 5.0, 20.0, 1.0).unwrap();
        assert!(out.state.node_temps_c[0] > 45.0);
        assert!((out.absorbed_kwh - 5.0).abs() < 1e-9);
        assert!(out.rejected_kwh.abs() < 1e-12);
        let gained = out.state.stored_energy_kwh() - s.stored_energy_kwh();
        assert!((gained - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_overcharge_is_reported() {
        let model = ThermalStoreModel::default();
        let s = lossless(store(vec![79.0; 5]));
        let out = model.advance(&s, 20.0, 20.0, 1.0).unwrap();
        assert!(out.rejected_kwh > 0.0);
        assert!(out.state.max_temp_c() <= 80.0 + 1e-9);
        assert!((out.absorbed_kwh + out.rejected_kwh - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_discharge_floors_at_ambient() {
        let model = ThermalStoreModel::default();
        let s = lossless(store(vec![22.0; 3]));
        let out = model.advance(&s, -50.0, 20.0, 1.0).unwrap();
        assert!(out.unmet_kwh > 0.0);
        assert!(out.state.min_temp_c() >= 20.0 - 1e-9);
    }

    #[test]
    fn test_inverted_column_is_mixed() {
        let model = ThermalStoreModel::default();
        let s = lossless(store(vec![40.0, 60.0, 50.0]));
        let before = s.stored_energy_kwh();
        let out = model.advance(&s, 0.0, 20.0, 0.1).unwrap();
        assert!(out.mixing_applied);
        assert!(out.state.is_stratified());
        assert!((out.state.stored_energy_kwh() - before).abs() < 1e-9);
    }

    #[test]
    fn test_ambient_loss_cools_tank() {
        let model = ThermalStoreModel::default();
        let mut s = store(vec![60.0; 4]);
        s.loss_kw_per_k *= 1000.0;
        let out = model.advance(&s, 0.0, 20.0, 1.0).unwrap();
        assert!(out.ambient_loss_kwh > 0.0);
        let dropped = s.stored_energy_kwh() - out.state.stored_energy_kwh();
        assert!((dropped - out.ambient_loss_kwh).abs() < 1e-9);
        assert!(out.state.min_temp_c() > 20.0);
    }

    proptest! {
        #[test]
        fn prop_energy_conserved_without_power_or_loss(
            temps in prop::collection::vec(20.0f64..90.0, 1..8),
            dts in prop::collection::vec(0.01f64..4.0, 1..10),
            multiplier in 0.0f64..500.0,
        ) {
            let spec = TankSpec { node_count: temps.len(), conduction_multiplier: multiplier, ..Default::default() };
            let mut s = ThermalStoreState::new(&spec, temps).unwrap();
            s.loss_kw_per_k = 0.0;
            let start = s.stored_energy_kwh();
            let model = ThermalStoreModel { max_temp_c: 95.0, ..Default::default() };
            for dt in dts {
                s = model.advance(&s, 0.0, 20.0, dt).unwrap().state;
            }
            prop_assert!((s.stored_energy_kwh() - start).abs() < 1e-7 * start.abs().max(1.0));
        }

        #[test]
        fn prop_stratified_or_mixing_reported(
            temps in prop::collection::vec(20.0f64..80.0, 1..8),
            power in -30.0f64..30.0,
            dt in 0.05f64..2.0,
        ) {
            let model = ThermalStoreModel::default();
            let out = model.advance(&store(temps), power, 15.0, dt).unwrap();
            prop_assert!(out.state.is_stratified() || out.mixing_applied);
            prop_assert!(out.state.max_temp_c() <= 80.0 + 1e-9);
        }
    }
}
