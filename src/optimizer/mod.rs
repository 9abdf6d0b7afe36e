pub mod constraints;
pub mod horizon;
pub mod pattern_search;
pub mod types;

pub use constraints::*;
pub use horizon::*;
pub use pattern_search::*;
pub use types::*;
