//! Raster grid geometry
//!
//! Every array in the pipeline (tree mask, reflectance cube, predictions, mean)
//! is defined over one [`Grid`]: a row/column lattice with a coordinate
//! reference system and an affine pixel-to-world transform. Nothing is ever
//! resampled, so grid equality is the alignment check.

use nalgebra::{Matrix3, Point2, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// Errors raised while constructing or querying a grid
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridError {
    /// Grid has no pixels
    #[error("grid must have at least one row and one column, got {rows}x{cols}")]
    Empty {
        /// Requested row count
        rows: usize,
        /// Requested column count
        cols: usize,
    },

    /// Array does not line up with the grid
    #[error("array shape {actual:?} does not match grid shape {expected:?}")]
    ShapeMismatch {
        /// Grid shape as (rows, cols)
        expected: (usize, usize),
        /// Offending array shape as (rows, cols)
        actual: (usize, usize),
    },

    /// Affine transform cannot be inverted (zero pixel size)
    #[error("affine transform is singular")]
    SingularTransform,

    /// Window clipping only supports axis-aligned grids
    #[error("window clipping requires a north-up transform")]
    RotatedTransform,

    /// Requested bounds select no pixel centers
    #[error("bounds {0:?} select no pixels of the grid")]
    OutsideGrid(Bounds),
}

/// Axis-aligned rectangle in world coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Western edge
    pub min_x: f64,
    /// Southern edge
    pub min_y: f64,
    /// Eastern edge
    pub max_x: f64,
    /// Northern edge
    pub max_y: f64,
}

impl Bounds {
    /// Create bounds from edges
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Square of side `edge` centred on `(center_x, center_y)`
    pub fn around(center_x: f64, center_y: f64, edge: f64) -> Self {
        let half = edge / 2.0;
        Self::new(
            center_x - half,
            center_y - half,
            center_x + half,
            center_y + half,
        )
    }

    /// Inclusive point containment
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Affine pixel-to-world transform
///
/// Stored as a homogeneous 3×3 matrix so that
/// `[x, y, 1]ᵀ = M · [col, row, 1]ᵀ`, where `(col, row)` address pixel corners
/// (pixel centres sit at `+0.5`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    matrix: Matrix3<f64>,
}

impl GeoTransform {
    /// Build from the six affine coefficients
    ///
    /// `x = a·col + b·row + c`, `y = d·col + e·row + f`
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self {
            matrix: Matrix3::new(a, b, c, d, e, f, 0.0, 0.0, 1.0),
        }
    }

    /// North-up transform anchored at the top-left corner
    ///
    /// # Arguments
    /// * `origin_x` - World X of the western edge
    /// * `origin_y` - World Y of the northern edge
    /// * `pixel_width` - Pixel size along X (positive)
    /// * `pixel_height` - Pixel size along Y (positive, rows grow southwards)
    pub fn from_origin(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self::new(pixel_width, 0.0, origin_x, 0.0, -pixel_height, origin_y)
    }

    /// The six affine coefficients `[a, b, c, d, e, f]`
    pub fn coefficients(&self) -> [f64; 6] {
        let m = &self.matrix;
        [m[(0, 0)], m[(0, 1)], m[(0, 2)], m[(1, 0)], m[(1, 1)], m[(1, 2)]]
    }

    /// Map fractional pixel coordinates to world coordinates
    pub fn apply(&self, col: f64, row: f64) -> Point2<f64> {
        let v = self.matrix * Vector3::new(col, row, 1.0);
        Point2::new(v.x, v.y)
    }

    /// World coordinates of a pixel centre
    #[inline]
    pub fn pixel_center(&self, row: usize, col: usize) -> Point2<f64> {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Map world coordinates to fractional `(row, col)`
    ///
    /// # Errors
    /// Returns [`GridError::SingularTransform`] if the transform has no inverse
    pub fn to_pixel(&self, x: f64, y: f64) -> Result<(f64, f64), GridError> {
        let inverse = self
            .matrix
            .try_inverse()
            .ok_or(GridError::SingularTransform)?;
        let v = inverse * Vector3::new(x, y, 1.0);
        Ok((v.y, v.x))
    }

    /// Pixel size as `(width, height)`, both positive for north-up grids
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.matrix[(0, 0)], -self.matrix[(1, 1)])
    }

    /// True when rows run north→south and columns west→east without rotation
    pub fn is_north_up(&self) -> bool {
        self.matrix[(0, 1)] == 0.0
            && self.matrix[(1, 0)] == 0.0
            && self.matrix[(0, 0)] > 0.0
            && self.matrix[(1, 1)] < 0.0
    }

    /// Coefficient-wise equality within `tolerance` world units
    pub fn approx_eq(&self, other: &GeoTransform, tolerance: f64) -> bool {
        self.coefficients()
            .iter()
            .zip(other.coefficients())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    /// Transform of a sub-grid whose top-left pixel is `(row, col)` of this one
    pub fn shifted(&self, row: usize, col: usize) -> Self {
        let origin = self.apply(col as f64, row as f64);
        let mut matrix = self.matrix;
        matrix[(0, 2)] = origin.x;
        matrix[(1, 2)] = origin.y;
        Self { matrix }
    }

    /// 4×4 `ModelTransformation` matrix (row-major) as used by GeoTIFF
    pub fn to_model_transformation(&self) -> [f64; 16] {
        let [a, b, c, d, e, f] = self.coefficients();
        [
            a, b, 0.0, c, //
            d, e, 0.0, f, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Spatial lattice shared by every array of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    rows: usize,
    cols: usize,
    crs: String,
    transform: GeoTransform,
}

/// Result of clipping a grid to bounds
#[derive(Debug, Clone, PartialEq)]
pub struct GridWindow {
    /// Selected rows of the parent grid
    pub rows: Range<usize>,
    /// Selected columns of the parent grid
    pub cols: Range<usize>,
    /// The clipped grid
    pub grid: Grid,
}

impl Grid {
    /// Create a grid
    ///
    /// # Errors
    /// Returns [`GridError::Empty`] if either dimension is zero
    pub fn new(
        rows: usize,
        cols: usize,
        crs: impl Into<String>,
        transform: GeoTransform,
    ) -> Result<Self, GridError> {
        if rows == 0 || cols == 0 {
            return Err(GridError::Empty { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            crs: crs.into(),
            transform,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of pixels
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Always false: empty grids are rejected at construction
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    /// EPSG code when the CRS is written as `EPSG:<code>`
    pub fn epsg_code(&self) -> Option<u16> {
        let (authority, code) = self.crs.split_once(':')?;
        if !authority.eq_ignore_ascii_case("epsg") {
            return None;
        }
        code.trim().parse().ok()
    }

    /// World-space extent of the grid
    pub fn bounds(&self) -> Bounds {
        let corners = [
            self.transform.apply(0.0, 0.0),
            self.transform.apply(self.cols as f64, 0.0),
            self.transform.apply(0.0, self.rows as f64),
            self.transform.apply(self.cols as f64, self.rows as f64),
        ];
        let mut bounds = Bounds::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for p in corners {
            bounds.min_x = bounds.min_x.min(p.x);
            bounds.min_y = bounds.min_y.min(p.y);
            bounds.max_x = bounds.max_x.max(p.x);
            bounds.max_y = bounds.max_y.max(p.y);
        }
        bounds
    }

    /// Verify that an array of `shape` lives on this grid
    ///
    /// # Errors
    /// Returns [`GridError::ShapeMismatch`] on any difference
    pub fn check_shape(&self, shape: (usize, usize)) -> Result<(), GridError> {
        if shape == self.shape() {
            Ok(())
        } else {
            Err(GridError::ShapeMismatch {
                expected: self.shape(),
                actual: shape,
            })
        }
    }

    /// Select the pixels whose centres fall inside `bounds` (inclusive)
    ///
    /// # Errors
    /// - [`GridError::RotatedTransform`] for non north-up grids
    /// - [`GridError::OutsideGrid`] when no pixel centre is selected
    pub fn window(&self, bounds: &Bounds) -> Result<GridWindow, GridError> {
        if !self.transform.is_north_up() {
            return Err(GridError::RotatedTransform);
        }

        let (top, left) = self.transform.to_pixel(bounds.min_x, bounds.max_y)?;
        let (bottom, right) = self.transform.to_pixel(bounds.max_x, bounds.min_y)?;

        let rows = center_range(top, bottom, self.rows);
        let cols = center_range(left, right, self.cols);
        if rows.is_empty() || cols.is_empty() {
            return Err(GridError::OutsideGrid(*bounds));
        }

        let grid = Grid {
            rows: rows.len(),
            cols: cols.len(),
            crs: self.crs.clone(),
            transform: self.transform.shifted(rows.start, cols.start),
        };
        Ok(GridWindow { rows, cols, grid })
    }
}

/// Indices `i` in `0..len` with `start <= i + 0.5 <= end`
fn center_range(start: f64, end: f64, len: usize) -> Range<usize> {
    let first = (start - 0.5).ceil().clamp(0.0, len as f64) as usize;
    let last = (end - 0.5).floor();
    if last < 0.0 {
        return 0..0;
    }
    let end = ((last as usize) + 1).min(len);
    first..end.max(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_20m() -> Grid {
        // 10×8 pixels of 20 m, top-left corner at (1000, 2000)
        Grid::new(10, 8, "EPSG:3308", GeoTransform::from_origin(1000.0, 2000.0, 20.0, 20.0))
            .unwrap()
    }

    #[test]
    fn test_pixel_center_and_inverse() {
        let t = GeoTransform::from_origin(1000.0, 2000.0, 20.0, 20.0);
        let p = t.pixel_center(2, 3);
        assert_relative_eq!(p.x, 1070.0);
        assert_relative_eq!(p.y, 1950.0);

        let (row, col) = t.to_pixel(p.x, p.y).unwrap();
        assert_relative_eq!(row, 2.5);
        assert_relative_eq!(col, 3.5);
    }

    #[test]
    fn test_singular_transform() {
        let t = GeoTransform::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert_eq!(t.to_pixel(1.0, 1.0), Err(GridError::SingularTransform));
    }

    #[test]
    fn test_empty_grid_rejected() {
        let t = GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0);
        assert!(matches!(
            Grid::new(0, 4, "EPSG:3308", t),
            Err(GridError::Empty { rows: 0, cols: 4 })
        ));
    }

    #[test]
    fn test_bounds() {
        let b = grid_20m().bounds();
        assert_relative_eq!(b.min_x, 1000.0);
        assert_relative_eq!(b.max_x, 1160.0);
        assert_relative_eq!(b.min_y, 1800.0);
        assert_relative_eq!(b.max_y, 2000.0);
    }

    #[test]
    fn test_epsg_code() {
        assert_eq!(grid_20m().epsg_code(), Some(3308));
        let t = GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0);
        let custom = Grid::new(1, 1, "+proj=longlat", t).unwrap();
        assert_eq!(custom.epsg_code(), None);
    }

    #[test]
    fn test_window_selects_pixel_centers() {
        let grid = grid_20m();
        // Covers centres x ∈ {1050, 1070, 1090}, y ∈ {1950, 1930}
        let bounds = Bounds::new(1045.0, 1925.0, 1095.0, 1955.0);
        let window = grid.window(&bounds).unwrap();

        assert_eq!(window.rows, 2..4);
        assert_eq!(window.cols, 2..5);
        assert_eq!(window.grid.shape(), (2, 3));

        let corner = window.grid.transform().apply(0.0, 0.0);
        assert_relative_eq!(corner.x, 1040.0);
        assert_relative_eq!(corner.y, 1960.0);
    }

    #[test]
    fn test_window_is_clamped_to_grid() {
        let grid = grid_20m();
        let window = grid.window(&Bounds::around(1000.0, 2000.0, 100.0)).unwrap();
        assert_eq!(window.rows, 0..3);
        assert_eq!(window.cols, 0..3);
    }

    #[test]
    fn test_window_outside_grid() {
        let grid = grid_20m();
        let far = Bounds::around(-5000.0, -5000.0, 10.0);
        assert!(matches!(grid.window(&far), Err(GridError::OutsideGrid(_))));
    }

    #[test]
    fn test_check_shape() {
        let grid = grid_20m();
        assert!(grid.check_shape((10, 8)).is_ok());
        assert_eq!(
            grid.check_shape((8, 10)),
            Err(GridError::ShapeMismatch {
                expected: (10, 8),
                actual: (8, 10)
            })
        );
    }
}
