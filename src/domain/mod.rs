pub mod plan;
pub mod series;
pub mod trace;

pub use plan::*;
pub use series::*;
pub use trace::*;
