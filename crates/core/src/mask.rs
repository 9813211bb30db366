//! Tree / vegetation cover mask
//!
//! The mask is loaded once, clipped to the region of interest, and defines the
//! grid every other array must match. It is never mutated afterwards.

use crate::grid::{Grid, Region};
use crate::raster::{read_geotiff, RasterError};
use ndarray::{s, Array2, ArrayView2};
use std::path::PathBuf;
use tracing::info;

/// CRS assumed for masks whose GeoKey directory carries no EPSG code
pub const DEFAULT_MASK_CRS: &str = "EPSG:3308";

/// Binary retain/exclude mask over the grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMask {
    retain: Array2<bool>,
}

impl TreeMask {
    pub fn new(retain: Array2<bool>) -> Self {
        Self { retain }
    }

    /// Interpret real-valued cover: non-zero (infinite included) retains, zero or NaN excludes
    pub fn from_values(values: ArrayView2<'_, f32>) -> Self {
        Self {
            retain: values.mapv(|v| !v.is_nan() && v != 0.0),
        }
    }

    /// Mask retaining every pixel
    pub fn all(rows: usize, cols: usize) -> Self {
        Self {
            retain: Array2::from_elem((rows, cols), true),
        }
    }

    #[inline]
    pub fn retains(&self, row: usize, col: usize) -> bool {
        self.retain[[row, col]]
    }

    pub fn retained_count(&self) -> usize {
        self.retain.iter().filter(|&&r| r).count()
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        self.retain.dim()
    }

    pub fn view(&self) -> ArrayView2<'_, bool> {
        self.retain.view()
    }
}

/// Supplies the mask and, through it, the grid of a run
pub trait MaskProvider {
    /// Load the mask covering `region`
    ///
    /// # Errors
    /// Any failure is fatal: the run cannot start without a mask.
    fn load(&self, region: &Region) -> Result<(Grid, TreeMask), RasterError>;
}

/// Reads a vegetation cover GeoTIFF and clips it to the region
#[derive(Debug, Clone)]
pub struct GeoTiffMaskProvider {
    path: PathBuf,
    fallback_crs: String,
}

impl GeoTiffMaskProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_crs: DEFAULT_MASK_CRS.to_string(),
        }
    }

    /// CRS to assume when the file has no EPSG GeoKey
    pub fn with_fallback_crs(mut self, crs: impl Into<String>) -> Self {
        self.fallback_crs = crs.into();
        self
    }
}

impl MaskProvider for GeoTiffMaskProvider {
    fn load(&self, region: &Region) -> Result<(Grid, TreeMask), RasterError> {
        let raster = read_geotiff(&self.path)?;
        let transform = raster
            .transform
            .ok_or_else(|| RasterError::MissingGeoreference(self.path.clone()))?;
        let crs = raster
            .epsg
            .map_or_else(|| self.fallback_crs.clone(), |code| format!("EPSG:{code}"));

        let (rows, cols) = raster.values.dim();
        let full = Grid::new(rows, cols, crs, transform)?;
        let window = full.window(&region.bounds())?;

        let clipped = raster
            .values
            .slice(s![window.rows.clone(), window.cols.clone()]);
        let mask = TreeMask::from_values(clipped);

        info!(
            "Loaded tree mask {}: clipped {}x{} -> {}x{}, {} of {} pixels retained",
            self.path.display(),
            rows,
            cols,
            window.grid.rows(),
            window.grid.cols(),
            mask.retained_count(),
            window.grid.len()
        );

        Ok((window.grid, mask))
    }
}

/// Serves a mask already held in memory
#[derive(Debug, Clone)]
pub struct InMemoryMaskProvider {
    grid: Grid,
    mask: TreeMask,
}

impl InMemoryMaskProvider {
    /// # Errors
    /// [`RasterError::Grid`] if the mask shape differs from the grid
    pub fn new(grid: Grid, mask: TreeMask) -> Result<Self, RasterError> {
        grid.check_shape(mask.shape())?;
        Ok(Self { grid, mask })
    }
}

impl MaskProvider for InMemoryMaskProvider {
    fn load(&self, _region: &Region) -> Result<(Grid, TreeMask), RasterError> {
        Ok((self.grid.clone(), self.mask.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GeoTransform;
    use crate::raster::{write_geotiff, CompressionLevel};
    use ndarray::array;

    #[test]
    fn test_from_values() {
        let values = array![[1.0_f32, 0.0], [f32::NAN, 0.3], [-2.0, f32::INFINITY]];
        let mask = TreeMask::from_values(values.view());
        assert!(mask.retains(0, 0));
        assert!(!mask.retains(0, 1));
        assert!(!mask.retains(1, 0));
        assert!(mask.retains(1, 1));
        assert!(mask.retains(2, 0));
        assert!(mask.retains(2, 1), "infinite cover is non-zero");
        assert_eq!(mask.retained_count(), 3);
    }

    #[test]
    fn test_in_memory_provider_checks_shape() {
        let grid =
            Grid::new(2, 2, "EPSG:3308", GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert!(InMemoryMaskProvider::new(grid.clone(), TreeMask::all(2, 2)).is_ok());
        assert!(InMemoryMaskProvider::new(grid, TreeMask::all(3, 2)).is_err());
    }

    #[test]
    fn test_geotiff_provider_clips_to_region() {
        let dir = std::env::temp_dir().join(format!("lfmc-mask-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nonveg_mask.tif");

        // 100 m pixels, 10×10, top-left at (0, 1000)
        let grid = Grid::new(10, 10, "EPSG:3308", GeoTransform::from_origin(0.0, 1000.0, 100.0, 100.0))
            .unwrap();
        let values = Array2::from_shape_fn((10, 10), |(r, c)| if (r + c) % 2 == 0 { 1.0 } else { 0.0 });
        write_geotiff(&path, &grid, values.view(), CompressionLevel::Fast).unwrap();

        // 400 m square around (500, 500): centres 350..650 → cols 3..7, rows 3..7
        let region = Region::new(500.0, 500.0, 400.0);
        let (clipped, mask) = GeoTiffMaskProvider::new(&path).load(&region).unwrap();

        assert_eq!(clipped.shape(), (4, 4));
        assert_eq!(clipped.crs(), "EPSG:3308");
        assert_eq!(mask.shape(), (4, 4));
        assert!(mask.retains(0, 0)); // parent (3, 3)
        assert!(!mask.retains(0, 1)); // parent (3, 4)
        assert_eq!(mask.retained_count(), 8);

        std::fs::remove_dir_all(&dir).ok();
    }
}
