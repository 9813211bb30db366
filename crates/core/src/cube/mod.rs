//! Reflectance cubes, their channels and where they come from

pub mod channel;
pub mod provider;
pub mod reflectance;

pub use channel::*;
pub use provider::*;
pub use reflectance::*;
