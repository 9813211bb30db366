//! Reflectance cube retrieval
//!
//! Providers answer "give me these bands over this grid for these dates".
//! Any failure here is fatal to the run: it happens before the time loop.

use super::channel::{Channel, QUALITY_FLAG_NAME};
use super::reflectance::{CubeError, ReflectanceCube};
use crate::grid::{DateWindow, Grid};
use crate::raster::{read_geotiff, GeoRaster, RasterError};
use chrono::{DateTime, NaiveDate, Utc};
use ndarray::{s, Array2, Array3, Array4};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Date format of acquisition directories
const DATE_DIR_FORMAT: &str = "%Y-%m-%d";

/// Largest origin offset accepted as "same pixel", in pixel widths
const ALIGN_TOLERANCE: f64 = 1e-6;

/// Source of surface reflectance over a region and date window
pub trait CubeProvider {
    /// Load `bands` plus the quality flag for every acquisition in `window`
    ///
    /// The returned cube must be on `grid`.
    ///
    /// # Errors
    /// Any [`CubeError`]; the caller aborts the run.
    fn load(
        &self,
        grid: &Grid,
        window: &DateWindow,
        bands: &[Channel],
    ) -> Result<ReflectanceCube, CubeError>;
}

/// Reads acquisitions laid out as `<root>/<YYYY-MM-DD>/<band>.tif`
///
/// Each acquisition directory holds one single-band raster per channel name
/// (`nbart_red.tif`, ...) and the quality flag `oa_fmask.tif`. Rasters either
/// match the region grid exactly or carry georeferencing that allows them to
/// be clipped to it.
#[derive(Debug, Clone)]
pub struct DirectoryCubeProvider {
    root: PathBuf,
}

impl DirectoryCubeProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquisition dates inside `window`, ascending
    ///
    /// Entries whose name is not a date are ignored.
    ///
    /// # Errors
    /// [`CubeError::Io`] if the root cannot be listed
    pub fn acquisition_dates(&self, window: &DateWindow) -> Result<Vec<NaiveDate>, CubeError> {
        let io_err = |source| CubeError::Io {
            path: self.root.clone(),
            source,
        };

        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|n| NaiveDate::parse_from_str(n, DATE_DIR_FORMAT).ok())
            else {
                debug!("Ignoring non-date entry {:?} in {}", name, self.root.display());
                continue;
            };
            if window.contains_date(date) {
                dates.push(date);
            }
        }
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }

    fn read_layer(
        &self,
        date: NaiveDate,
        name: &str,
        grid: &Grid,
    ) -> Result<Array2<f32>, CubeError> {
        let path = self
            .root
            .join(date.format(DATE_DIR_FORMAT).to_string())
            .join(format!("{name}.tif"));
        fit_to_grid(read_geotiff(&path)?, grid, &path)
    }
}

impl CubeProvider for DirectoryCubeProvider {
    fn load(
        &self,
        grid: &Grid,
        window: &DateWindow,
        bands: &[Channel],
    ) -> Result<ReflectanceCube, CubeError> {
        let dates = self.acquisition_dates(window)?;
        if dates.is_empty() {
            return Err(CubeError::NoAcquisitions {
                root: self.root.clone(),
                start: window.start,
                end: window.end,
            });
        }

        let (rows, cols) = grid.shape();
        let layers = dates
            .par_iter()
            .map(|&date| {
                let reflectance = bands
                    .iter()
                    .map(|band| self.read_layer(date, band.name(), grid))
                    .collect::<Result<Vec<_>, _>>()?;
                let quality = self.read_layer(date, QUALITY_FLAG_NAME, grid)?;
                Ok((reflectance, quality))
            })
            .collect::<Result<Vec<_>, CubeError>>()?;

        let mut data = Array4::<f32>::zeros((dates.len(), bands.len(), rows, cols));
        let mut quality = Array3::<u8>::zeros((dates.len(), rows, cols));
        for (t, (reflectance, flags)) in layers.into_iter().enumerate() {
            for (b, layer) in reflectance.into_iter().enumerate() {
                data.slice_mut(s![t, b, .., ..]).assign(&layer);
            }
            quality
                .slice_mut(s![t, .., ..])
                .assign(&flags.mapv(quality_flag));
        }

        info!(
            "Loaded {} acquisitions x {} bands over {}x{} pixels from {}",
            dates.len(),
            bands.len(),
            rows,
            cols,
            self.root.display()
        );

        let timestamps = dates.iter().map(|d| midnight_utc(*d)).collect();
        ReflectanceCube::new(grid.clone(), timestamps, bands.to_vec(), data, quality)
    }
}

/// Serves a pre-built cube, selecting the requested window
#[derive(Debug, Clone)]
pub struct InMemoryCubeProvider {
    cube: ReflectanceCube,
}

impl InMemoryCubeProvider {
    pub fn new(cube: ReflectanceCube) -> Self {
        Self { cube }
    }
}

impl CubeProvider for InMemoryCubeProvider {
    fn load(
        &self,
        grid: &Grid,
        window: &DateWindow,
        bands: &[Channel],
    ) -> Result<ReflectanceCube, CubeError> {
        if self.cube.grid() != grid {
            return Err(CubeError::GridMismatch);
        }
        if let Some(&missing) = bands.iter().find(|b| !self.cube.bands().contains(b)) {
            return Err(CubeError::MissingChannel(missing));
        }
        self.cube.select_window(window)
    }
}

/// Acquisition timestamp for a dated directory
pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Quality flags are small non-negative integers; anything else is unusable
fn quality_flag(value: f32) -> u8 {
    if value.is_finite() && (0.0..=f32::from(u8::MAX)).contains(&value) {
        value as u8
    } else {
        0
    }
}

/// Place a raster on the grid by georeference, clipping it when larger
///
/// The raster must share the grid's CRS (when it records one) and its
/// pixels must coincide with the grid's; nothing is resampled.
fn fit_to_grid(raster: GeoRaster, grid: &Grid, path: &Path) -> Result<Array2<f32>, CubeError> {
    let misaligned = |reason: String| CubeError::Misaligned {
        path: path.to_path_buf(),
        reason,
    };

    if let (Some(code), Some(expected)) = (raster.epsg, grid.epsg_code()) {
        if code != expected {
            return Err(misaligned(format!("EPSG:{code}, grid is EPSG:{expected}")));
        }
    }
    let Some(transform) = raster.transform else {
        return Err(RasterError::MissingGeoreference(path.to_path_buf()).into());
    };

    let actual = raster.values.dim();
    let full = Grid::new(actual.0, actual.1, grid.crs(), transform)?;
    let window = full
        .window(&grid.bounds())
        .map_err(|err| misaligned(err.to_string()))?;
    grid.check_shape(window.grid.shape())?;

    let tolerance = grid.transform().pixel_size().0.abs() * ALIGN_TOLERANCE;
    if !window.grid.transform().approx_eq(grid.transform(), tolerance) {
        return Err(misaligned(format!(
            "pixels start at {:?}, grid at {:?}",
            window.grid.transform().coefficients(),
            grid.transform().coefficients()
        )));
    }

    if window.grid.shape() == actual {
        return Ok(raster.values);
    }
    Ok(raster
        .values
        .slice(s![window.rows, window.cols])
        .to_owned())
}
