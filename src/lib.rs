//! Receding-horizon control of a district heat pump charging a stratified
//! thermal store, steering electrical load toward local wind and solar output.

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod optimizer;
pub mod simulation;
pub mod telemetry;

pub use error::{ControlError, ControlResult, TickFlag};
