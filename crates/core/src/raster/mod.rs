//! Raster persistence
//!
//! The pipeline hands every finished 2D array to a [`RasterWriter`] together
//! with its grid and a deterministic file name. [`GeoTiffWriter`] is the
//! production backend; [`MemoryWriter`] keeps rasters in memory for tests and
//! embedding.

mod geotiff;

pub use geotiff::{read_geotiff, write_geotiff, GeoRaster, GeoTiffWriter};

use crate::grid::{Grid, GridError};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing rasters
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TIFF error in {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    /// Sample type not convertible to `f32`
    #[error("unsupported pixel format in {0}")]
    UnsupportedPixelFormat(PathBuf),

    /// Multi-sample or truncated image
    #[error("{path} holds {samples} samples, expected {rows}x{cols}")]
    SampleCount {
        path: PathBuf,
        samples: usize,
        rows: usize,
        cols: usize,
    },

    /// Neither ModelTransformation nor ModelPixelScale/ModelTiepoint present
    #[error("{0} carries no georeferencing tags")]
    MissingGeoreference(PathBuf),

    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Deflate effort for written rasters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Lowest effort (zlib level 1)
    #[default]
    Fast,
    Balanced,
    Best,
}

/// Sink for finished rasters
pub trait RasterWriter {
    /// Persist `values` (NaN = missing) under `name`
    ///
    /// # Errors
    /// - [`RasterError::Grid`] if `values` is not on `grid`
    /// - I/O or encoding failures of the backend
    fn write(
        &mut self,
        name: &str,
        grid: &Grid,
        values: ArrayView2<'_, f32>,
    ) -> Result<PathBuf, RasterError>;

    /// Where outputs end up, for user-facing summaries
    fn location(&self) -> String;
}

/// Keeps written rasters in memory, in write order
#[derive(Debug, Default, Clone)]
pub struct MemoryWriter {
    rasters: Vec<(String, Array2<f32>)>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names in the order they were written
    pub fn names(&self) -> Vec<&str> {
        self.rasters.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Most recent raster written under `name`
    pub fn get(&self, name: &str) -> Option<&Array2<f32>> {
        self.rasters
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values)
    }

    pub fn len(&self) -> usize {
        self.rasters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rasters.is_empty()
    }
}

impl RasterWriter for MemoryWriter {
    fn write(
        &mut self,
        name: &str,
        grid: &Grid,
        values: ArrayView2<'_, f32>,
    ) -> Result<PathBuf, RasterError> {
        grid.check_shape(values.dim())?;
        self.rasters.push((name.to_string(), values.to_owned()));
        Ok(PathBuf::from(name))
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GeoTransform;

    #[test]
    fn test_memory_writer_checks_grid() {
        let grid = Grid::new(2, 2, "EPSG:3308", GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0))
            .unwrap();
        let mut writer = MemoryWriter::new();

        let ok = Array2::from_elem((2, 2), 1.0_f32);
        assert!(writer.write("a.tif", &grid, ok.view()).is_ok());

        let wrong = Array2::from_elem((3, 2), 1.0_f32);
        assert!(matches!(
            writer.write("b.tif", &grid, wrong.view()),
            Err(RasterError::Grid(GridError::ShapeMismatch { .. }))
        ));

        assert_eq!(writer.names(), vec!["a.tif"]);
        assert_eq!(writer.get("a.tif"), Some(&ok));
    }
}
