//! Spectral channels of the feature cube
//!
//! Ten Sentinel-2 NBART surface-reflectance bands plus the two derived
//! normalized-difference indices used as model features.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Named channel of a reflectance or feature cube
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    Red,
    Green,
    Blue,
    RedEdge1,
    RedEdge2,
    RedEdge3,
    Nir1,
    Nir2,
    Swir2,
    Swir3,
    /// `(nir1 - swir2) / (nir1 + swir2)`
    Ndii,
    /// `(nir1 - red) / (nir1 + red)`
    Ndvi,
}

/// Reflectance bands in retrieval order
pub const REFLECTANCE_BANDS: [Channel; 10] = [
    Channel::Red,
    Channel::Green,
    Channel::Blue,
    Channel::RedEdge1,
    Channel::RedEdge2,
    Channel::RedEdge3,
    Channel::Nir1,
    Channel::Nir2,
    Channel::Swir2,
    Channel::Swir3,
];

/// Name of the per-pixel quality flag raster accompanying the bands
pub const QUALITY_FLAG_NAME: &str = "oa_fmask";

/// Quality flag value marking a usable observation
pub const QUALITY_VALID: u8 = 1;

/// Channel name not recognised
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown channel '{0}'")]
pub struct UnknownChannel(pub String);

impl Channel {
    /// Canonical name as used in band files and model feature lists
    pub const fn name(self) -> &'static str {
        match self {
            Self::Red => "nbart_red",
            Self::Green => "nbart_green",
            Self::Blue => "nbart_blue",
            Self::RedEdge1 => "nbart_red_edge_1",
            Self::RedEdge2 => "nbart_red_edge_2",
            Self::RedEdge3 => "nbart_red_edge_3",
            Self::Nir1 => "nbart_nir_1",
            Self::Nir2 => "nbart_nir_2",
            Self::Swir2 => "nbart_swir_2",
            Self::Swir3 => "nbart_swir_3",
            Self::Ndii => "ndii",
            Self::Ndvi => "ndvi",
        }
    }

    /// True for the indices computed from other channels
    pub const fn is_derived(self) -> bool {
        matches!(self, Self::Ndii | Self::Ndvi)
    }
}

/// Model predictors in the order the forest was trained with
///
/// `ndvi`, `ndii`, then every reflectance band.
pub fn default_predictors() -> Vec<Channel> {
    let mut predictors = vec![Channel::Ndvi, Channel::Ndii];
    predictors.extend(REFLECTANCE_BANDS);
    predictors
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REFLECTANCE_BANDS
            .iter()
            .chain(&[Self::Ndii, Self::Ndvi])
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| UnknownChannel(s.to_string()))
    }
}

impl TryFrom<String> for Channel {
    type Error = UnknownChannel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.name().to_string()
    }
}
