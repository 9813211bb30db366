//! Regression model interface
//!
//! The pipeline treats the LFMC model as an opaque, read-only predictor: a
//! `(pixels × features)` matrix without missing values goes in, one estimate
//! per pixel comes out. The model is loaded once before the time loop and
//! shared by every iteration; only its concurrency hints are configurable at
//! load time.
//!
//! # Implementations
//!
//! - [`ForestRegressor`]: random-forest ensemble persisted as JSON
//! - anything implementing [`RegressionModel`] (test doubles, other backends)

mod forest;

pub use forest::{ForestRegressor, RegressionTree, TreeNode};

use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by model loading or prediction
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Structural problem in a persisted model
    #[error("malformed model: {0}")]
    Malformed(String),

    /// Input matrix width differs from the trained feature count
    #[error("input has {actual} features, model expects {expected}")]
    FeatureCount { expected: usize, actual: usize },

    /// Missing/infinite value reached the model
    #[error("non-finite input at pixel {pixel}, feature {feature}")]
    NonFinite { pixel: usize, feature: usize },

    /// Cancel token fired or deadline passed mid-prediction
    #[error("prediction cancelled")]
    Cancelled,

    /// `n_jobs` of zero
    #[error("n_jobs must be at least 1")]
    InvalidJobs,

    #[error("failed to build prediction thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Backend-specific failure
    #[error("{0}")]
    Backend(String),
}

/// Orientation of the matrix handed to [`RegressionModel::predict`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLayout {
    /// One row per pixel, one column per feature
    #[default]
    PixelsByFeatures,
    /// One row per feature, one column per pixel
    FeaturesByPixels,
}

/// Load-time configuration of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Worker threads used for prediction, `None` = all cores
    pub n_jobs: Option<usize>,
    /// Input matrix orientation the model consumes
    pub layout: InputLayout,
}

/// Cooperative cancellation with an optional deadline
///
/// Cloned handles share the same flag. Models poll [`CancelToken::is_cancelled`]
/// between blocks of work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Token that only fires when [`cancel`](Self::cancel) is called
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also fires once `timeout` has elapsed from now
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline_passed()
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Pre-trained LFMC regression model
pub trait RegressionModel: Send + Sync {
    /// Predict one value per pixel
    ///
    /// `features` is oriented according to [`layout`](Self::layout) and holds
    /// no missing values.
    ///
    /// # Errors
    /// Any error is treated as a recoverable failure of the current time slice
    fn predict(
        &self,
        features: ArrayView2<'_, f32>,
        cancel: &CancelToken,
    ) -> Result<Array1<f32>, ModelError>;

    /// Feature names in training order, when the model records them
    fn feature_names(&self) -> Option<&[String]> {
        None
    }

    fn layout(&self) -> InputLayout {
        InputLayout::PixelsByFeatures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(!token.deadline_passed());
    }

    #[test]
    fn test_cancel_token_deadline() {
        let expired = CancelToken::with_deadline(Duration::ZERO);
        assert!(expired.is_cancelled());
        assert!(expired.deadline_passed());

        let generous = CancelToken::with_deadline(Duration::from_secs(3600));
        assert!(!generous.is_cancelled());
    }

    #[test]
    fn test_model_config_defaults_from_empty_json() {
        let config: ModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ModelConfig::default());
        assert_eq!(config.layout, InputLayout::PixelsByFeatures);
        assert_eq!(config.n_jobs, None);
    }
}
