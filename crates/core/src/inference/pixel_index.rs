//! Flatten/unflatten bookkeeping between the 2D grid and the model's pixel axis

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3};

/// Pixel order used to flatten a `(rows, cols)` grid
///
/// Entry `k` holds the `(row, col)` that became matrix row `k`. Pixels are
/// enumerated row by row, and the same mapping is used to place predictions
/// back onto the grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelIndex {
    rows: usize,
    cols: usize,
    order: Vec<(usize, usize)>,
}

impl PixelIndex {
    /// Row-major enumeration of every pixel
    pub fn row_major(rows: usize, cols: usize) -> Self {
        let order = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .collect();
        Self { rows, cols, order }
    }

    /// Number of pixels (matrix rows)
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// `(rows, cols)` of the grid this index was built for
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// `(row, col)` of matrix row `k`
    pub fn position(&self, k: usize) -> (usize, usize) {
        self.order[k]
    }

    /// Flatten one 2D layer to a pixel vector
    pub fn flatten(&self, layer: ArrayView2<'_, f32>) -> Array1<f32> {
        debug_assert_eq!(layer.dim(), self.shape());
        self.order.iter().map(|&(r, c)| layer[[r, c]]).collect()
    }

    /// Stack `(channel, row, col)` layers into a `(pixels, channels)` matrix
    ///
    /// Column `j` holds the layer at position `j` of `channels`.
    pub fn flatten_channels(&self, layers: &[ArrayView2<'_, f32>]) -> Array2<f32> {
        let mut matrix = Array2::<f32>::zeros((self.len(), layers.len()));
        for (j, layer) in layers.iter().enumerate() {
            debug_assert_eq!(layer.dim(), self.shape());
            let mut column = matrix.column_mut(j);
            for (k, &(r, c)) in self.order.iter().enumerate() {
                column[k] = layer[[r, c]];
            }
        }
        matrix
    }

    /// Stack every channel of a `(channel, row, col)` slice
    pub fn flatten_cube(&self, cube: ArrayView3<'_, f32>) -> Array2<f32> {
        let layers: Vec<_> = cube.outer_iter().collect();
        self.flatten_channels(&layers)
    }

    /// Place a pixel vector back on the grid
    ///
    /// Callers check the length first; a mismatch is a contract violation.
    pub fn unflatten(&self, values: ArrayView1<'_, f32>) -> Array2<f32> {
        assert_eq!(values.len(), self.len(), "pixel vector length mismatch");
        let mut grid = Array2::<f32>::from_elem((self.rows, self.cols), f32::NAN);
        for (&(r, c), &v) in self.order.iter().zip(values.iter()) {
            grid[[r, c]] = v;
        }
        grid
    }
}
