//! Derived vegetation indices
//!
//! Both indices are pointwise and time-independent, so they are computed once
//! over the whole cube rather than per slice:
//! - `ndii = (nir1 - swir2) / (nir1 + swir2)`
//! - `ndvi = (nir1 - red) / (nir1 + red)`
//!
//! IEEE semantics are kept on purpose: a zero denominator or a missing input
//! yields NaN/∞, which the inference engine treats as missing.

use crate::cube::{Channel, CubeError, FeatureCube, REFLECTANCE_BANDS};
use ndarray::{Array3, ArrayView3, Zip};
use tracing::debug;

/// Pointwise `(a - b) / (a + b)`
#[inline]
pub fn normalized_difference(a: f32, b: f32) -> f32 {
    (a - b) / (a + b)
}

/// Normalized difference of two `(time, row, col)` channels, in parallel
pub fn normalized_difference_cube(a: ArrayView3<'_, f32>, b: ArrayView3<'_, f32>) -> Array3<f32> {
    Zip::from(&a)
        .and(&b)
        .par_map_collect(|&a, &b| normalized_difference(a, b))
}

/// Reflectance bands to retrieve for a predictor list
///
/// Every non-derived predictor plus the sources of both indices, in
/// retrieval order. `ndii` is always derived since it drives re-masking.
pub fn source_bands(predictors: &[Channel]) -> Vec<Channel> {
    REFLECTANCE_BANDS
        .into_iter()
        .filter(|band| {
            predictors.contains(band) || matches!(band, Channel::Nir1 | Channel::Swir2 | Channel::Red)
        })
        .collect()
}

/// Append `ndii` and `ndvi` to a quality-masked cube
///
/// Existing channels are not touched.
///
/// # Errors
/// - [`CubeError::MissingChannel`] if `nbart_nir_1`, `nbart_swir_2` or `nbart_red` is absent
/// - [`CubeError::DuplicateChannel`] if the indices were already derived
pub fn derive_indices(cube: FeatureCube) -> Result<FeatureCube, CubeError> {
    for derived in [Channel::Ndii, Channel::Ndvi] {
        if cube.channel_index(derived).is_some() {
            return Err(CubeError::DuplicateChannel(derived));
        }
    }

    let nir = cube.channel(Channel::Nir1)?;
    let swir = cube.channel(Channel::Swir2)?;
    let red = cube.channel(Channel::Red)?;

    let ndii = normalized_difference_cube(nir, swir);
    let ndvi = normalized_difference_cube(nir, red);

    debug!(
        "Derived ndii/ndvi over {} timestamps ({} non-finite ndii values)",
        cube.len(),
        ndii.iter().filter(|v| !v.is_finite()).count()
    );

    cube.with_channels(vec![(Channel::Ndii, ndii), (Channel::Ndvi, ndvi)])
}
