//! Random-forest regression ensemble
//!
//! Persisted as JSON:
//!
//! ```json
//! {
//!   "features": ["ndvi", "ndii", "nbart_red", ...],
//!   "trees": [
//!     { "nodes": [
//!         { "split": { "feature": 1, "threshold": 0.12, "left": 1, "right": 2 } },
//!         { "leaf": { "value": 84.0 } },
//!         { "leaf": { "value": 131.5 } }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Nodes are stored in topological order (children after their parent), which
//! makes every valid tree acyclic. A sample goes left when
//! `feature <= threshold`. The ensemble prediction is the mean over trees.

use super::{CancelToken, InputLayout, ModelConfig, ModelError, RegressionModel};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Rows predicted between two cancellation checks
const BLOCK_SIZE: usize = 4096;

/// A node of a regression tree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    /// Internal split node
    Split {
        feature: u32,
        threshold: f32,
        left: u32,
        right: u32,
    },
    /// Terminal node
    Leaf { value: f32 },
}

/// Single regression tree, root at index 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    /// Tree with a single leaf
    pub fn constant(value: f32) -> Self {
        Self::new(vec![TreeNode::Leaf { value }])
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    fn validate(&self, tree: usize, n_features: usize) -> Result<(), ModelError> {
        if self.nodes.is_empty() {
            return Err(ModelError::Malformed(format!("tree {tree} has no nodes")));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match *node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if feature as usize >= n_features {
                        return Err(ModelError::Malformed(format!(
                            "tree {tree} node {i} splits on feature {feature}, model has {n_features}"
                        )));
                    }
                    if threshold.is_nan() {
                        return Err(ModelError::Malformed(format!(
                            "tree {tree} node {i} has a NaN threshold"
                        )));
                    }
                    for child in [left, right] {
                        let child = child as usize;
                        if child <= i || child >= self.nodes.len() {
                            return Err(ModelError::Malformed(format!(
                                "tree {tree} node {i} points to invalid child {child}"
                            )));
                        }
                    }
                }
                TreeNode::Leaf { value } => {
                    if !value.is_finite() {
                        return Err(ModelError::Malformed(format!(
                            "tree {tree} leaf {i} is not finite"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    #[inline]
    fn predict_row(&self, row: ArrayView1<'_, f32>) -> f32 {
        let mut index = 0;
        loop {
            match self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[feature as usize] <= threshold {
                        left as usize
                    } else {
                        right as usize
                    };
                }
                TreeNode::Leaf { value } => return value,
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ForestFile {
    features: Vec<String>,
    trees: Vec<RegressionTree>,
}

/// Random-forest regressor with its own prediction thread pool
#[derive(Debug)]
pub struct ForestRegressor {
    features: Vec<String>,
    trees: Vec<RegressionTree>,
    layout: InputLayout,
    pool: ThreadPool,
}

impl ForestRegressor {
    /// Build from trees, validating structure against the feature list
    ///
    /// # Errors
    /// - [`ModelError::Malformed`] for empty forests or invalid nodes
    /// - [`ModelError::InvalidJobs`] / [`ModelError::ThreadPool`] for bad pool settings
    pub fn new(
        features: Vec<String>,
        trees: Vec<RegressionTree>,
        config: &ModelConfig,
    ) -> Result<Self, ModelError> {
        if trees.is_empty() {
            return Err(ModelError::Malformed("forest has no trees".to_string()));
        }
        for (i, tree) in trees.iter().enumerate() {
            tree.validate(i, features.len())?;
        }

        let threads = match config.n_jobs {
            Some(0) => return Err(ModelError::InvalidJobs),
            Some(n) => n,
            None => 0, // rayon default: one per core
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lfmc-forest-{i}"))
            .build()?;

        Ok(Self {
            features,
            trees,
            layout: config.layout,
            pool,
        })
    }

    /// Parse a JSON forest
    ///
    /// # Errors
    /// See [`ForestRegressor::new`]; parse failures are reported against `<memory>`
    pub fn from_json_str(json: &str, config: &ModelConfig) -> Result<Self, ModelError> {
        let file: ForestFile = serde_json::from_str(json).map_err(|source| ModelError::Parse {
            path: "<memory>".into(),
            source,
        })?;
        Self::new(file.features, file.trees, config)
    }

    /// Load a persisted forest
    ///
    /// # Errors
    /// [`ModelError::Io`] / [`ModelError::Parse`] plus the validation errors of [`ForestRegressor::new`]
    pub fn load<P: AsRef<Path>>(path: P, config: &ModelConfig) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ForestFile =
            serde_json::from_str(&contents).map_err(|source| ModelError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let model = Self::new(file.features, file.trees, config)?;

        info!(
            "Loaded forest {}: {} trees, {} features, {} prediction threads",
            path.display(),
            model.trees.len(),
            model.features.len(),
            model.pool.current_num_threads()
        );
        Ok(model)
    }

    /// Persist as JSON
    ///
    /// # Errors
    /// [`ModelError::Io`] if the file cannot be written
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        let path = path.as_ref();
        let file = ForestFile {
            features: self.features.clone(),
            trees: self.trees.clone(),
        };
        let contents = serde_json::to_string(&file).map_err(|source| ModelError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, contents).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn predict_pixel(&self, row: ArrayView1<'_, f32>) -> f32 {
        let sum: f32 = self.trees.iter().map(|tree| tree.predict_row(row)).sum();
        sum / self.trees.len() as f32
    }
}

impl RegressionModel for ForestRegressor {
    fn predict(
        &self,
        features: ArrayView2<'_, f32>,
        cancel: &CancelToken,
    ) -> Result<Array1<f32>, ModelError> {
        let pixels = match self.layout {
            InputLayout::PixelsByFeatures => features,
            InputLayout::FeaturesByPixels => features.reversed_axes(),
        };

        let (n_pixels, n_features) = pixels.dim();
        if n_features != self.features.len() {
            return Err(ModelError::FeatureCount {
                expected: self.features.len(),
                actual: n_features,
            });
        }
        if let Some(((pixel, feature), _)) = pixels.indexed_iter().find(|(_, v)| !v.is_finite())
        {
            return Err(ModelError::NonFinite { pixel, feature });
        }
        if n_pixels == 0 {
            return Ok(Array1::zeros(0));
        }

        let mut out = vec![0.0_f32; n_pixels];
        self.pool.install(|| {
            out.par_chunks_mut(BLOCK_SIZE)
                .enumerate()
                .try_for_each(|(block, chunk)| {
                    if cancel.is_cancelled() {
                        return Err(ModelError::Cancelled);
                    }
                    let start = block * BLOCK_SIZE;
                    for (offset, value) in chunk.iter_mut().enumerate() {
                        *value = self.predict_pixel(pixels.row(start + offset));
                    }
                    Ok(())
                })
        })?;

        Ok(Array1::from(out))
    }

    fn feature_names(&self) -> Option<&[String]> {
        Some(&self.features)
    }

    fn layout(&self) -> InputLayout {
        self.layout
    }
}
