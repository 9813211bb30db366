use chrono::{NaiveDate, Utc};
use clap::Parser;
use lfmc_core::pipeline::prepare;
use lfmc_core::{
    ConfigError, DateWindow, DirectoryCubeProvider, ForestRegressor, GeoTiffMaskProvider,
    GeoTiffWriter, ModelError, PipelineConfig, PipelineError, RasterError, Region, RunSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Compute Sentinel-2 LFMC maps around a point, one per acquisition plus the mean
#[derive(Parser, Debug)]
#[command(name = "lfmc-map")]
#[command(about = "Compute S2 LFMC maps for the past month, including the mean", long_about = None)]
struct Args {
    /// Region centre X in the mask CRS (meters)
    #[arg(long, allow_negative_numbers = true)]
    x: f64,

    /// Region centre Y in the mask CRS (meters)
    #[arg(long, allow_negative_numbers = true)]
    y: f64,

    /// Vegetation cover GeoTIFF (non-zero = tree)
    #[arg(long, default_value = "data/nonveg_mask_nve_nsw_v2.tif")]
    mask: PathBuf,

    /// Directory of acquisitions laid out as <YYYY-MM-DD>/<band>.tif
    #[arg(long)]
    cube_dir: PathBuf,

    /// Random forest model (JSON)
    #[arg(long, default_value = "rf_s2fmc_forest.json")]
    model: PathBuf,

    /// Output directory [default: outputs]
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Days of imagery to look back [default: 30]
    #[arg(long)]
    days: Option<u32>,

    /// Last day of the window (YYYY-MM-DD) [default: today]
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Side of the square region in meters [default: 10000]
    #[arg(long)]
    edge: Option<f64>,

    /// Prediction threads [default: all cores]
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Give up on a single acquisition after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load model: {0}")]
    Model(#[from] ModelError),

    #[error("failed to prepare output directory: {0}")]
    Output(#[from] RasterError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl Args {
    /// Config file (or defaults) with command-line overrides applied
    fn config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(dir) = &self.output_dir {
            config.output_dir.clone_from(dir);
        }
        if let Some(days) = self.days {
            config.lookback_days = days;
        }
        if let Some(edge) = self.edge {
            config.edge_length_m = edge;
        }
        if let Some(jobs) = self.jobs {
            config.model.n_jobs = Some(jobs);
        }
        if let Some(secs) = self.timeout_secs {
            config.slice_timeout_secs = Some(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

fn run(args: &Args) -> Result<RunSummary, CliError> {
    let config = args.config()?;
    let region = Region::new(args.x, args.y, config.edge_length_m);
    let end = args.end_date.unwrap_or_else(|| Utc::now().date_naive());
    let window = DateWindow::ending_on(end, config.lookback_days);

    info!(
        "LFMC maps for ({}, {}), {} m square, {} to {}",
        region.center_x, region.center_y, region.edge_length_m, window.start, window.end
    );

    let model = ForestRegressor::load(&args.model, &config.model)?;

    let masks = GeoTiffMaskProvider::new(&args.mask);
    let cubes = DirectoryCubeProvider::new(&args.cube_dir);
    let prepared = prepare(&config, &region, window, &masks, &cubes, Arc::new(model))?;
    println!("Data prepared.");

    let mut writer = GeoTiffWriter::new(&config.output_dir, config.compression)?;
    let output = prepared.run(&mut writer)?;
    Ok(output.summary)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(summary) => {
            for skipped in &summary.skipped {
                println!("  skipped {}: {}", skipped.timestamp.date_naive(), skipped.reason);
            }
            println!("{summary}.");
            println!("Maps written to {}/.", summary.location);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "lfmc-map",
            "--x",
            "1650000.5",
            "--y",
            "-3800000",
            "--cube-dir",
            "cube",
            "--days",
            "14",
            "--jobs",
            "4",
            "--timeout-secs",
            "90",
            "--end-date",
            "2024-03-31",
        ]);
        assert_eq!(args.y, -3_800_000.0);
        assert_eq!(args.end_date, NaiveDate::from_ymd_opt(2024, 3, 31));

        let config = args.config().unwrap();
        assert_eq!(config.lookback_days, 14);
        assert_eq!(config.model.n_jobs, Some(4));
        assert_eq!(config.slice_timeout_secs, Some(90));
        assert_eq!(config.output_dir, PathBuf::from("outputs"));
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let args = Args::parse_from(["lfmc-map", "--x", "0", "--y", "0", "--cube-dir", "c", "-j", "0"]);
        assert!(matches!(args.config(), Err(ConfigError::ZeroJobs)));
    }
}
