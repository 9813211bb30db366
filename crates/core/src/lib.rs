//! Live Fuel Moisture Content Mapping Core Library
//!
//! Estimates live fuel moisture content (LFMC) over a square region from a
//! time series of Sentinel-2 surface reflectance, using a pre-trained
//! regression model, and produces one raster per acquisition plus their
//! temporal mean.
//!
//! ## Pipeline
//!
//! - Tree mask and grid from a [`MaskProvider`]
//! - Reflectance cube and quality flags from a [`CubeProvider`]
//! - `ndii` / `ndvi` appended by [`derive_indices`]
//! - Per-timestamp inference with explicit 0-fill and re-masking ([`InferenceEngine`])
//! - Idempotent accumulation and a missing-aware temporal mean ([`TimeSeriesAccumulator`])
//! - GeoTIFF output through a [`RasterWriter`]

// Spatial reference and request geometry
pub mod grid;

// Inputs
pub mod cube;
pub mod mask;
pub mod model;

// Processing
pub mod accumulator;
pub mod features;
pub mod inference;
pub mod pipeline;

// Ambient
pub mod config;
pub mod raster;

// Re-export the types a caller wires together
pub use accumulator::{PredictionSeries, RunState, TimeSeriesAccumulator};
pub use config::{ConfigError, PipelineConfig};
pub use cube::{
    Channel, CubeError, CubeProvider, DirectoryCubeProvider, FeatureCube, InMemoryCubeProvider,
    ReflectanceCube,
};
pub use features::derive_indices;
pub use grid::{DateWindow, GeoTransform, Grid, OutputNaming, Region};
pub use inference::{InferenceEngine, InferenceError, PredictionSlice, SkipReason, SliceOutcome};
pub use mask::{GeoTiffMaskProvider, InMemoryMaskProvider, MaskProvider, TreeMask};
pub use model::{CancelToken, ForestRegressor, ModelConfig, ModelError, RegressionModel};
pub use pipeline::{compute_lfmc_maps, prepare, Pipeline, PipelineError, RunOutput, RunSummary};
pub use raster::{CompressionLevel, GeoTiffWriter, MemoryWriter, RasterError, RasterWriter};
