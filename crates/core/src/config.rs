//! Run configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Command-line flags override individual fields after loading.

use crate::cube::{default_predictors, Channel};
use crate::grid::{DEFAULT_EDGE_LENGTH_M, DEFAULT_LOOKBACK_DAYS};
use crate::model::ModelConfig;
use crate::raster::CompressionLevel;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("edge length must be positive and finite, got {0}")]
    EdgeLength(f64),

    #[error("lookback must cover at least one day")]
    LookbackDays,

    #[error("predictor list is empty")]
    NoPredictors,

    #[error("predictor '{0}' listed more than once")]
    DuplicatePredictor(Channel),

    #[error("model n_jobs must be at least 1 (omit it to use every core)")]
    ZeroJobs,

    #[error("slice timeout must be at least one second")]
    ZeroTimeout,
}

/// Parameters of one LFMC mapping run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Side of the square region, meters
    pub edge_length_m: f64,
    /// Days of imagery ending on the end date
    pub lookback_days: u32,
    /// Model input channels, in training order
    pub predictors: Vec<Channel>,
    pub model: ModelConfig,
    /// Per-timestamp deadline; `None` waits for the model indefinitely
    pub slice_timeout_secs: Option<u64>,
    pub output_dir: PathBuf,
    pub compression: CompressionLevel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            edge_length_m: DEFAULT_EDGE_LENGTH_M,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            predictors: default_predictors(),
            model: ModelConfig::default(),
            slice_timeout_secs: None,
            output_dir: PathBuf::from("outputs"),
            compression: CompressionLevel::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON config file
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or fails [`validate`](Self::validate)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    ///
    /// # Errors
    /// Returns [`ConfigError`] if serialization or the write fails
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// The first violated constraint as a [`ConfigError`]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.edge_length_m.is_finite() && self.edge_length_m > 0.0) {
            return Err(ConfigError::EdgeLength(self.edge_length_m));
        }
        if self.lookback_days == 0 {
            return Err(ConfigError::LookbackDays);
        }
        if self.predictors.is_empty() {
            return Err(ConfigError::NoPredictors);
        }
        let mut seen = FxHashSet::default();
        for &p in &self.predictors {
            if !seen.insert(p) {
                return Err(ConfigError::DuplicatePredictor(p));
            }
        }
        if self.model.n_jobs == Some(0) {
            return Err(ConfigError::ZeroJobs);
        }
        if self.slice_timeout_secs == Some(0) {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn slice_timeout(&self) -> Option<Duration> {
        self.slice_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.edge_length_m, 10_000.0);
        assert_eq!(config.lookback_days, 30);
        assert_eq!(config.predictors.len(), 12);
        assert_eq!(config.predictors[0], Channel::Ndvi);
        assert_eq!(config.predictors[1], Channel::Ndii);
        assert_eq!(config.compression, CompressionLevel::Fast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "lookback_days": 10,
                "predictors": ["ndii", "nbart_swir_2"],
                "model": { "n_jobs": 2, "layout": "features_by_pixels" },
                "slice_timeout_secs": 30
            }"#,
        )
        .unwrap();
        assert_eq!(config.lookback_days, 10);
        assert_eq!(config.predictors, vec![Channel::Ndii, Channel::Swir2]);
        assert_eq!(config.model.n_jobs, Some(2));
        assert_eq!(config.slice_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.edge_length_m, 10_000.0);
    }

    #[test]
    fn test_unknown_predictor_rejected() {
        let result: Result<PipelineConfig, _> =
            serde_json::from_str(r#"{ "predictors": ["nbart_coastal"] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejections() {
        let mut config = PipelineConfig {
            edge_length_m: 0.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EdgeLength(_))));

        config = PipelineConfig {
            predictors: vec![],
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoPredictors)));

        config = PipelineConfig {
            predictors: vec![Channel::Ndii, Channel::Ndii],
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePredictor(Channel::Ndii))
        ));

        config = PipelineConfig::default();
        config.model.n_jobs = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroJobs)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("lfmc-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let config = PipelineConfig {
            lookback_days: 14,
            slice_timeout_secs: Some(120),
            ..PipelineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_file() {
        let result = PipelineConfig::load("/nonexistent/lfmc/config.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
