//! Grid geometry and region-of-interest modules

pub mod geo;
pub mod region;

// Re-export main types
pub use geo::*;
pub use region::*;
