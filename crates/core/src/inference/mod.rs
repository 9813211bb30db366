//! Per-timestamp inference
//!
//! For one time slice of the feature cube the engine:
//! 1. selects the predictor channels in model order and flattens the grid into
//!    a `(pixels × channels)` matrix, keeping the [`PixelIndex`] used;
//! 2. replaces every non-finite value with 0 (the model cannot consume missing
//!    values; the 0 is an input fill, not a reflectance claim);
//! 3. runs the model. A model error is a recoverable skip of this timestamp;
//! 4. places predictions back on the grid through the same index;
//! 5. restores missing pixels wherever the *pre-fill* `ndii` was non-finite;
//! 6. excludes pixels outside the tree mask;
//! 7. labels the result with its timestamp.
//!
//! Steps 2 and 5 must stay in this order: the fill hides missing pixels from
//! the model, and only the pre-fill `ndii` knows which ones they were.

mod pixel_index;

pub use pixel_index::PixelIndex;

use crate::cube::{Channel, FeatureSlice};
use crate::grid::{date_label, GridError};
use crate::mask::TreeMask;
use crate::model::{CancelToken, InputLayout, ModelError, RegressionModel};
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView2, Zip};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Fatal contract violations: the run must stop
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Model produced a vector of the wrong length
    #[error("model returned {actual} predictions for {expected} pixels")]
    PredictionLength { expected: usize, actual: usize },

    /// Predictor list disagrees with the features the model was trained on
    #[error("predictors {configured:?} do not match model features {model:?}")]
    FeatureMismatch {
        configured: Vec<String>,
        model: Vec<String>,
    },

    /// Model rejected the matrix width
    #[error("model expects {expected} features, predictors supply {actual}")]
    FeatureCount { expected: usize, actual: usize },

    /// A predictor (or `ndii`, needed for re-masking) is absent from the slice
    #[error("channel '{0}' is missing from the feature slice")]
    MissingChannel(Channel),

    #[error("predictor list is empty")]
    NoPredictors,

    /// Slice and mask are on different grids
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Why a timestamp produced no output
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("model failed: {0}")]
    Model(#[source] ModelError),

    #[error("deadline exceeded after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("cancelled")]
    Cancelled,
}

/// Estimated LFMC over the grid for one timestamp, NaN = missing
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSlice {
    timestamp: DateTime<Utc>,
    values: Array2<f32>,
}

impl PredictionSlice {
    pub fn new(timestamp: DateTime<Utc>, values: Array2<f32>) -> Self {
        Self { timestamp, values }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn values(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    pub fn into_values(self) -> Array2<f32> {
        self.values
    }

    /// ISO date of the acquisition
    pub fn date_label(&self) -> String {
        date_label(&self.timestamp)
    }

    /// Pixels holding an estimate
    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }
}

/// Result of one timestamp that did not violate a contract
#[derive(Debug)]
pub enum SliceOutcome {
    Predicted(PredictionSlice),
    Skipped {
        timestamp: DateTime<Utc>,
        reason: SkipReason,
    },
}

impl SliceOutcome {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Predicted(slice) => slice.timestamp(),
            Self::Skipped { timestamp, .. } => *timestamp,
        }
    }
}

/// Replace NaN/±∞ with 0, returning how many values were filled
pub fn fill_non_finite(matrix: &mut Array2<f32>) -> usize {
    let mut filled = 0;
    for v in matrix.iter_mut() {
        if !v.is_finite() {
            *v = 0.0;
            filled += 1;
        }
    }
    filled
}

/// Set predictions to missing wherever the pre-fill `ndii` was non-finite
pub fn apply_quality_mask(values: &mut Array2<f32>, ndii: ArrayView2<'_, f32>) {
    Zip::from(values).and(ndii).par_for_each(|v, &q| {
        if !q.is_finite() {
            *v = f32::NAN;
        }
    });
}

/// Set predictions to missing outside the tree mask
pub fn apply_tree_mask(values: &mut Array2<f32>, mask: &TreeMask) {
    Zip::from(values).and(mask.view()).par_for_each(|v, &keep| {
        if !keep {
            *v = f32::NAN;
        }
    });
}

/// Runs the model over single time slices
///
/// Holds the read-only model, mask and predictor order for the whole run.
pub struct InferenceEngine {
    model: Arc<dyn RegressionModel>,
    mask: TreeMask,
    predictors: Vec<Channel>,
    index: PixelIndex,
}

impl InferenceEngine {
    /// Bind a model to a mask and predictor order
    ///
    /// # Errors
    /// - [`InferenceError::NoPredictors`] for an empty predictor list
    /// - [`InferenceError::FeatureMismatch`] if the model records different feature names
    pub fn new(
        model: Arc<dyn RegressionModel>,
        mask: TreeMask,
        predictors: Vec<Channel>,
    ) -> Result<Self, InferenceError> {
        if predictors.is_empty() {
            return Err(InferenceError::NoPredictors);
        }
        if let Some(names) = model.feature_names() {
            let matches = names.len() == predictors.len()
                && names.iter().zip(&predictors).all(|(n, p)| n == p.name());
            if !matches {
                return Err(InferenceError::FeatureMismatch {
                    configured: predictors.iter().map(|p| p.name().to_string()).collect(),
                    model: names.to_vec(),
                });
            }
        }

        let (rows, cols) = mask.shape();
        Ok(Self {
            model,
            mask,
            predictors,
            index: PixelIndex::row_major(rows, cols),
        })
    }

    pub fn predictors(&self) -> &[Channel] {
        &self.predictors
    }

    pub fn mask(&self) -> &TreeMask {
        &self.mask
    }

    /// Predict one timestamp
    ///
    /// Model failures, timeouts and cancellation come back as
    /// [`SliceOutcome::Skipped`]; only contract violations are errors.
    ///
    /// # Errors
    /// - [`InferenceError::Grid`] if the slice is not on the mask grid
    /// - [`InferenceError::MissingChannel`] if a predictor or `ndii` is absent
    /// - [`InferenceError::PredictionLength`] if the model returns the wrong number of values
    pub fn predict_slice(
        &self,
        slice: &FeatureSlice<'_>,
        cancel: &CancelToken,
    ) -> Result<SliceOutcome, InferenceError> {
        let timestamp = slice.timestamp();
        let (rows, cols) = self.index.shape();
        if slice.shape() != (rows, cols) {
            return Err(GridError::ShapeMismatch {
                expected: (rows, cols),
                actual: slice.shape(),
            }
            .into());
        }

        // 1. predictors in model order, flattened to (pixels × channels)
        let layers = self
            .predictors
            .iter()
            .map(|&c| slice.channel(c).ok_or(InferenceError::MissingChannel(c)))
            .collect::<Result<Vec<_>, _>>()?;
        let ndii = slice
            .channel(Channel::Ndii)
            .ok_or(InferenceError::MissingChannel(Channel::Ndii))?;
        let mut matrix = self.index.flatten_channels(&layers);

        // 2. model input fill
        let filled = fill_non_finite(&mut matrix);
        debug!(
            "{}: flattened {}x{} grid to {}x{} matrix, filled {} non-finite values",
            date_label(&timestamp),
            rows,
            cols,
            matrix.nrows(),
            matrix.ncols(),
            filled
        );

        // 3. model
        let started = Instant::now();
        let input = match self.model.layout() {
            InputLayout::PixelsByFeatures => matrix.view(),
            InputLayout::FeaturesByPixels => matrix.t(),
        };
        let predictions = match self.model.predict(input, cancel) {
            Ok(predictions) => predictions,
            Err(ModelError::Cancelled) => {
                let reason = if cancel.deadline_passed() {
                    SkipReason::TimedOut {
                        elapsed: started.elapsed(),
                    }
                } else {
                    SkipReason::Cancelled
                };
                return Ok(SliceOutcome::Skipped { timestamp, reason });
            }
            // Predictor width is fixed for the run
            Err(ModelError::FeatureCount { expected, actual }) => {
                return Err(InferenceError::FeatureCount { expected, actual });
            }
            Err(err) => {
                return Ok(SliceOutcome::Skipped {
                    timestamp,
                    reason: SkipReason::Model(err),
                })
            }
        };

        if predictions.len() != self.index.len() {
            return Err(InferenceError::PredictionLength {
                expected: self.index.len(),
                actual: predictions.len(),
            });
        }

        // 4. back onto the grid
        let mut values = self.index.unflatten(predictions.view());

        // 5. restore missing from the pre-fill ndii, then 6. tree cover
        apply_quality_mask(&mut values, ndii);
        apply_tree_mask(&mut values, &self.mask);

        // 7. label
        Ok(SliceOutcome::Predicted(PredictionSlice::new(timestamp, values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::FeatureCube;
    use crate::grid::{GeoTransform, Grid};
    use chrono::TimeZone;
    use ndarray::{array, Array1, Array4};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns the same value for every pixel and remembers its inputs
    struct ConstantModel {
        value: f32,
        calls: AtomicUsize,
        inputs: Mutex<Vec<Array2<f32>>>,
    }

    impl ConstantModel {
        fn new(value: f32) -> Self {
            Self {
                value,
                calls: AtomicUsize::new(0),
                inputs: Mutex::new(Vec::new()),
            }
        }
    }

    impl RegressionModel for ConstantModel {
        fn predict(
            &self,
            features: ArrayView2<'_, f32>,
            _cancel: &CancelToken,
        ) -> Result<Array1<f32>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(features.to_owned());
            Ok(Array1::from_elem(features.nrows(), self.value))
        }
    }

    struct FailingModel;

    impl RegressionModel for FailingModel {
        fn predict(
            &self,
            _features: ArrayView2<'_, f32>,
            _cancel: &CancelToken,
        ) -> Result<Array1<f32>, ModelError> {
            Err(ModelError::Backend("fmask decode error".to_string()))
        }
    }

    struct ShortModel;

    impl RegressionModel for ShortModel {
        fn predict(
            &self,
            features: ArrayView2<'_, f32>,
            _cancel: &CancelToken,
        ) -> Result<Array1<f32>, ModelError> {
            Ok(Array1::zeros(features.nrows() - 1))
        }
    }

    /// Spins until cancelled
    struct StuckModel;

    impl RegressionModel for StuckModel {
        fn predict(
            &self,
            _features: ArrayView2<'_, f32>,
            cancel: &CancelToken,
        ) -> Result<Array1<f32>, ModelError> {
            while !cancel.is_cancelled() {
                std::thread::yield_now();
            }
            Err(ModelError::Cancelled)
        }
    }

    struct NamedModel(Vec<String>);

    impl RegressionModel for NamedModel {
        fn predict(
            &self,
            features: ArrayView2<'_, f32>,
            _cancel: &CancelToken,
        ) -> Result<Array1<f32>, ModelError> {
            Ok(Array1::zeros(features.nrows()))
        }

        fn feature_names(&self) -> Option<&[String]> {
            Some(&self.0)
        }
    }

    /// Trained on a fixed number of features, no names recorded
    struct WidthModel(usize);

    impl RegressionModel for WidthModel {
        fn predict(
            &self,
            features: ArrayView2<'_, f32>,
            _cancel: &CancelToken,
        ) -> Result<Array1<f32>, ModelError> {
            if features.ncols() != self.0 {
                return Err(ModelError::FeatureCount {
                    expected: self.0,
                    actual: features.ncols(),
                });
            }
            Ok(Array1::zeros(features.nrows()))
        }
    }

    /// Takes channels × pixels and echoes its second channel back
    struct TransposedModel {
        inputs: Mutex<Vec<Array2<f32>>>,
    }

    impl RegressionModel for TransposedModel {
        fn predict(
            &self,
            features: ArrayView2<'_, f32>,
            _cancel: &CancelToken,
        ) -> Result<Array1<f32>, ModelError> {
            self.inputs.lock().unwrap().push(features.to_owned());
            Ok(features.row(1).to_owned())
        }

        fn layout(&self) -> InputLayout {
            InputLayout::FeaturesByPixels
        }
    }

    /// 2×2 single-timestamp cube with channels [ndvi, ndii]
    fn cube(ndvi: Array2<f32>, ndii: Array2<f32>) -> FeatureCube {
        let grid =
            Grid::new(2, 2, "EPSG:3308", GeoTransform::from_origin(0.0, 0.0, 20.0, 20.0)).unwrap();
        let mut data = Array4::<f32>::zeros((1, 2, 2, 2));
        data.slice_mut(ndarray::s![0, 0, .., ..]).assign(&ndvi);
        data.slice_mut(ndarray::s![0, 1, .., ..]).assign(&ndii);
        FeatureCube::new(
            grid,
            vec![Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()],
            vec![Channel::Ndvi, Channel::Ndii],
            data,
        )
        .unwrap()
    }

    fn predictors() -> Vec<Channel> {
        vec![Channel::Ndvi, Channel::Ndii]
    }

    fn predicted(outcome: SliceOutcome) -> PredictionSlice {
        match outcome {
            SliceOutcome::Predicted(slice) => slice,
            SliceOutcome::Skipped { reason, .. } => panic!("unexpected skip: {reason}"),
        }
    }

    #[test]
    fn test_non_finite_ndii_is_missing_in_output() {
        let cube = cube(
            array![[0.5, 0.5], [0.5, 0.5]],
            array![[0.1, f32::NAN], [f32::INFINITY, 0.2]],
        );
        let model = Arc::new(ConstantModel::new(42.0));
        let engine = InferenceEngine::new(model, TreeMask::all(2, 2), predictors()).unwrap();

        let slice = predicted(
            engine
                .predict_slice(&cube.slice(0).unwrap(), &CancelToken::new())
                .unwrap(),
        );
        let v = slice.values();
        assert_eq!(v[[0, 0]], 42.0);
        assert!(v[[0, 1]].is_nan());
        assert!(v[[1, 0]].is_nan());
        assert_eq!(v[[1, 1]], 42.0);
        assert_eq!(slice.valid_count(), 2);
    }

    #[test]
    fn test_tree_mask_excludes_valid_pixels() {
        let cube = cube(Array2::from_elem((2, 2), 0.5), Array2::from_elem((2, 2), 0.1));
        let mask = TreeMask::new(array![[true, false], [true, true]]);
        let engine =
            InferenceEngine::new(Arc::new(ConstantModel::new(7.0)), mask, predictors()).unwrap();

        let slice = predicted(
            engine
                .predict_slice(&cube.slice(0).unwrap(), &CancelToken::new())
                .unwrap(),
        );
        assert!(slice.values()[[0, 1]].is_nan());
        assert_eq!(slice.values()[[1, 0]], 7.0);
    }

    #[test]
    fn test_model_sees_zero_filled_matrix_in_predictor_order() {
        let cube = cube(
            array![[0.3, f32::NAN], [0.4, 0.6]],
            array![[0.1, 0.2], [f32::NEG_INFINITY, 0.4]],
        );
        let model = Arc::new(ConstantModel::new(1.0));
        // ndii first, ndvi second: reversed relative to the cube
        let engine = InferenceEngine::new(
            model.clone(),
            TreeMask::all(2, 2),
            vec![Channel::Ndii, Channel::Ndvi],
        )
        .unwrap();
        engine
            .predict_slice(&cube.slice(0).unwrap(), &CancelToken::new())
            .unwrap();

        let inputs = model.inputs.lock().unwrap();
        let matrix = &inputs[0];
        assert_eq!(matrix.dim(), (4, 2));
        assert_eq!(matrix.row(0).to_vec(), vec![0.1, 0.3]);
        assert_eq!(matrix.row(1).to_vec(), vec![0.2, 0.0]);
        assert_eq!(matrix.row(2).to_vec(), vec![0.0, 0.4]);
        assert!(matrix.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_all_missing_slice_still_runs_model() {
        let cube = cube(
            Array2::from_elem((2, 2), f32::NAN),
            Array2::from_elem((2, 2), f32::NAN),
        );
        let model = Arc::new(ConstantModel::new(3.0));
        let engine = InferenceEngine::new(model.clone(), TreeMask::all(2, 2), predictors()).unwrap();

        let slice = predicted(
            engine
                .predict_slice(&cube.slice(0).unwrap(), &CancelToken::new())
                .unwrap(),
        );
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slice.valid_count(), 0);
    }

    #[test]
    fn test_model_error_is_a_skip() {
        let cube = cube(Array2::zeros((2, 2)), Array2::zeros((2, 2)));
        let engine =
            InferenceEngine::new(Arc::new(FailingModel), TreeMask::all(2, 2), predictors()).unwrap();

        let outcome = engine
            .predict_slice(&cube.slice(0).unwrap(), &CancelToken::new())
            .unwrap();
        assert!(matches!(
            outcome,
            SliceOutcome::Skipped {
                reason: SkipReason::Model(ModelError::Backend(_)),
                ..
            }
        ));
    }

    #[test]
    fn test_wrong_prediction_length_is_fatal() {
        let cube = cube(Array2::zeros((2, 2)), Array2::zeros((2, 2)));
        let engine =
            InferenceEngine::new(Arc::new(ShortModel), TreeMask::all(2, 2), predictors()).unwrap();

        let result = engine.predict_slice(&cube.slice(0).unwrap(), &CancelToken::new());
        assert!(matches!(
            result,
            Err(InferenceError::PredictionLength {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_deadline_turns_into_timeout_skip() {
        let cube = cube(Array2::zeros((2, 2)), Array2::zeros((2, 2)));
        let engine =
            InferenceEngine::new(Arc::new(StuckModel), TreeMask::all(2, 2), predictors()).unwrap();

        let outcome = engine
            .predict_slice(
                &cube.slice(0).unwrap(),
                &CancelToken::with_deadline(Duration::from_millis(5)),
            )
            .unwrap();
        assert!(matches!(
            outcome,
            SliceOutcome::Skipped {
                reason: SkipReason::TimedOut { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_feature_names_must_match_predictors() {
        let model = NamedModel(vec!["ndii".to_string(), "ndvi".to_string()]);
        let result = InferenceEngine::new(Arc::new(model), TreeMask::all(2, 2), predictors());
        assert!(matches!(result, Err(InferenceError::FeatureMismatch { .. })));

        let model = NamedModel(vec!["ndvi".to_string(), "ndii".to_string()]);
        assert!(InferenceEngine::new(Arc::new(model), TreeMask::all(2, 2), predictors()).is_ok());
    }

    #[test]
    fn test_missing_predictor_channel_is_fatal() {
        let cube = cube(Array2::zeros((2, 2)), Array2::zeros((2, 2)));
        let engine = InferenceEngine::new(
            Arc::new(ConstantModel::new(1.0)),
            TreeMask::all(2, 2),
            vec![Channel::Ndvi, Channel::Swir2],
        )
        .unwrap();

        let result = engine.predict_slice(&cube.slice(0).unwrap(), &CancelToken::new());
        assert!(matches!(
            result,
            Err(InferenceError::MissingChannel(Channel::Swir2))
        ));
    }

    #[test]
    fn test_mask_grid_mismatch_is_fatal() {
        let cube = cube(Array2::zeros((2, 2)), Array2::zeros((2, 2)));
        let engine = InferenceEngine::new(
            Arc::new(ConstantModel::new(1.0)),
            TreeMask::all(3, 2),
            predictors(),
        )
        .unwrap();
        let result = engine.predict_slice(&cube.slice(0).unwrap(), &CancelToken::new());
        assert!(matches!(result, Err(InferenceError::Grid(_))));
    }

    #[test]
    fn test_feature_count_rejection_is_fatal() {
        let cube = cube(Array2::zeros((2, 2)), Array2::zeros((2, 2)));
        let engine =
            InferenceEngine::new(Arc::new(WidthModel(3)), TreeMask::all(2, 2), predictors())
                .unwrap();

        let result = engine.predict_slice(&cube.slice(0).unwrap(), &CancelToken::new());
        assert!(matches!(
            result,
            Err(InferenceError::FeatureCount {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_features_by_pixels_layout_gets_transposed_matrix() {
        let cube = cube(
            array![[0.3, 0.5], [0.4, 0.6]],
            array![[0.1, 0.2], [0.3, 0.4]],
        );
        let model = Arc::new(TransposedModel {
            inputs: Mutex::new(Vec::new()),
        });
        let engine = InferenceEngine::new(
            model.clone(),
            TreeMask::all(2, 2),
            vec![Channel::Ndii, Channel::Ndvi],
        )
        .unwrap();

        let slice = predicted(
            engine
                .predict_slice(&cube.slice(0).unwrap(), &CancelToken::new())
                .unwrap(),
        );

        let inputs = model.inputs.lock().unwrap();
        assert_eq!(inputs[0].dim(), (2, 4));
        assert_eq!(inputs[0].row(0).to_vec(), vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(inputs[0].row(1).to_vec(), vec![0.3, 0.5, 0.4, 0.6]);
        // second channel is ndvi, echoed back onto its own pixels
        assert_eq!(slice.values(), array![[0.3, 0.5], [0.4, 0.6]].view());
    }
}
