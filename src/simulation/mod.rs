//! # Plant models
//!
//! - **Thermal store**: stratified tank with conduction, ambient loss, port
//!   injection and mixing
//! - **Heat pump**: modulation and COP curve to thermal and electrical power
//!
//! Both are pure functions of their inputs. The controller owns the live
//! [`ThermalStoreState`] and the optimizer only ever sees copies of it.

pub mod heat_pump;
pub mod thermal_store;

pub use heat_pump::{CopCurve, HeatPumpModel, HeatPumpOutput, HeatPumpSpec};
pub use thermal_store::{StoreStep, TankSpec, ThermalStoreModel, ThermalStoreState};
