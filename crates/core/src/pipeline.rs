//! End-to-end LFMC mapping run
//!
//! Startup (all failures fatal):
//! mask → reflectance cube → quality mask → derived indices → inference engine.
//!
//! Loop (strictly sequential, in timestamp order):
//! predict slice → write slice raster → merge into the accumulator.
//! A skipped slice is logged and leaves no trace in the outputs.
//!
//! Finish: finalize the accumulator and write the temporal mean.

use crate::accumulator::{AccumulatorError, PredictionSeries, TimeSeriesAccumulator};
use crate::config::{ConfigError, PipelineConfig};
use crate::cube::{CubeError, CubeProvider, FeatureCube};
use crate::features::{derive_indices, source_bands};
use crate::grid::{date_label, DateWindow, Grid, OutputNaming, Region};
use crate::inference::{InferenceEngine, InferenceError, SliceOutcome};
use crate::mask::{MaskProvider, TreeMask};
use crate::model::{CancelToken, RegressionModel};
use crate::raster::{RasterError, RasterWriter};
use chrono::{DateTime, Utc};
use ndarray::ArrayView2;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Anything that stops a run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load tree mask: {0}")]
    Mask(#[source] RasterError),

    #[error("failed to load reflectance cube: {0}")]
    Cube(#[from] CubeError),

    /// Cube and mask disagree on the grid
    #[error("feature cube is {cube:?} pixels but the mask grid is {mask:?}")]
    GridMismatch {
        cube: (usize, usize),
        mask: (usize, usize),
    },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),

    #[error("failed to write {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: RasterError,
    },
}

/// A timestamp that produced no output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSlice {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// User-facing account of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Timestamps in the feature cube
    pub total: usize,
    /// Timestamps that produced a raster
    pub processed: usize,
    pub skipped: Vec<SkippedSlice>,
    /// Per-timestamp rasters, in timestamp order
    pub outputs: Vec<PathBuf>,
    pub mean_output: PathBuf,
    /// Writer location outputs went to
    pub location: String,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} timestamps produced output",
            self.processed, self.total
        )
    }
}

/// Series plus summary of a finished run
#[derive(Debug)]
pub struct RunOutput {
    pub series: PredictionSeries,
    pub summary: RunSummary,
}

/// The time loop over a prepared feature cube
pub struct Pipeline {
    engine: InferenceEngine,
    naming: OutputNaming,
    window: DateWindow,
    slice_timeout: Option<Duration>,
}

impl Pipeline {
    /// # Errors
    /// - [`PipelineError::Config`] if `config` is invalid
    /// - [`PipelineError::Inference`] if the predictors do not match the model
    pub fn new(
        config: &PipelineConfig,
        region: &Region,
        window: DateWindow,
        model: Arc<dyn RegressionModel>,
        mask: TreeMask,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let engine = InferenceEngine::new(model, mask, config.predictors.clone())?;
        Ok(Self {
            engine,
            naming: OutputNaming::new(region),
            window,
            slice_timeout: config.slice_timeout(),
        })
    }

    fn cancel_token(&self) -> CancelToken {
        self.slice_timeout
            .map_or_else(CancelToken::new, CancelToken::with_deadline)
    }

    /// Process every timestamp of `cube`, then write the mean
    ///
    /// # Errors
    /// Fatal conditions only: grid mismatch, contract violations from the
    /// inference engine, or a failed raster write. Per-timestamp model
    /// failures are reported in [`RunSummary::skipped`].
    pub fn run(
        &self,
        cube: &FeatureCube,
        writer: &mut dyn RasterWriter,
    ) -> Result<RunOutput, PipelineError> {
        let grid = cube.grid();
        if grid.shape() != self.engine.mask().shape() {
            return Err(PipelineError::GridMismatch {
                cube: grid.shape(),
                mask: self.engine.mask().shape(),
            });
        }

        let total = cube.len();
        let mut accumulator = TimeSeriesAccumulator::new(grid.clone());
        let mut outputs = Vec::with_capacity(total);
        let mut skipped = Vec::new();

        for t in 0..total {
            let slice = cube.slice(t)?;
            let timestamp = slice.timestamp();
            accumulator.begin(timestamp);

            let started = Instant::now();
            match self.engine.predict_slice(&slice, &self.cancel_token())? {
                SliceOutcome::Predicted(prediction) => {
                    let name = self.naming.slice_name(&timestamp);
                    let path = write_raster(writer, &name, grid, prediction.values())?;
                    info!(
                        "[{}/{}] {}: {} pixels estimated in {:.2}s",
                        t + 1,
                        total,
                        date_label(&timestamp),
                        prediction.valid_count(),
                        started.elapsed().as_secs_f64()
                    );
                    outputs.push(path);
                    accumulator.merge(prediction)?;
                }
                SliceOutcome::Skipped { timestamp, reason } => {
                    warn!(
                        "[{}/{}] {}: continuing to next timestamp because of error: {}",
                        t + 1,
                        total,
                        date_label(&timestamp),
                        reason
                    );
                    skipped.push(SkippedSlice {
                        timestamp,
                        reason: reason.to_string(),
                    });
                }
            }
        }

        let series = accumulator.finalize();
        let mean_name = self.naming.mean_name(&self.window);
        let mean_output = write_raster(writer, &mean_name, grid, series.mean())?;

        let summary = RunSummary {
            total,
            processed: series.len(),
            skipped,
            outputs,
            mean_output,
            location: writer.location(),
        };
        info!("{}; maps written to {}", summary, summary.location);

        Ok(RunOutput { series, summary })
    }
}

fn write_raster(
    writer: &mut dyn RasterWriter,
    name: &str,
    grid: &Grid,
    values: ArrayView2<'_, f32>,
) -> Result<PathBuf, PipelineError> {
    writer
        .write(name, grid, values)
        .map_err(|source| PipelineError::Write {
            name: name.to_string(),
            source,
        })
}

/// Startup finished: the feature cube and the loop that will consume it
pub struct PreparedRun {
    pub pipeline: Pipeline,
    pub features: FeatureCube,
}

impl PreparedRun {
    /// # Errors
    /// See [`Pipeline::run`]
    pub fn run(&self, writer: &mut dyn RasterWriter) -> Result<RunOutput, PipelineError> {
        self.pipeline.run(&self.features, writer)
    }
}

/// Load every input and build the pipeline
///
/// # Errors
/// Any upstream failure (config, mask, cube, model/predictor mismatch)
pub fn prepare(
    config: &PipelineConfig,
    region: &Region,
    window: DateWindow,
    mask_provider: &dyn MaskProvider,
    cube_provider: &dyn CubeProvider,
    model: Arc<dyn RegressionModel>,
) -> Result<PreparedRun, PipelineError> {
    config.validate()?;

    let (grid, mask) = mask_provider.load(region).map_err(PipelineError::Mask)?;
    let bands = source_bands(&config.predictors);
    let cube = cube_provider.load(&grid, &window, &bands)?;
    if cube.grid().shape() != grid.shape() {
        return Err(PipelineError::GridMismatch {
            cube: cube.grid().shape(),
            mask: grid.shape(),
        });
    }

    let features = derive_indices(cube.apply_quality_mask())?;
    info!(
        "Prepared {} timestamps x {} channels over {}x{} pixels ({} tree pixels) for {} to {}",
        features.len(),
        features.channels().len(),
        grid.rows(),
        grid.cols(),
        mask.retained_count(),
        window.start,
        window.end
    );

    let pipeline = Pipeline::new(config, region, window, model, mask)?;
    Ok(PreparedRun { pipeline, features })
}

/// Compute per-timestamp and mean LFMC maps for a region
///
/// # Errors
/// See [`prepare`] and [`Pipeline::run`]
pub fn compute_lfmc_maps(
    config: &PipelineConfig,
    region: &Region,
    window: DateWindow,
    mask_provider: &dyn MaskProvider,
    cube_provider: &dyn CubeProvider,
    model: Arc<dyn RegressionModel>,
    writer: &mut dyn RasterWriter,
) -> Result<RunOutput, PipelineError> {
    prepare(config, region, window, mask_provider, cube_provider, model)?.run(writer)
}
