//! Time-series accumulation of prediction slices
//!
//! Slices are keyed by timestamp. Merging a timestamp that is already present
//! replaces it, so re-running an iteration is idempotent. The temporal mean is
//! computed once, at finalization, over every accumulated slice while ignoring
//! missing pixels.
//!
//! ```text
//! Initialized ──begin(t)──▶ Processing(t) ──merge──▶ Processing(t') ...
//!      │                                                  │
//!      └────────────────────finalize──────────────────────┘──▶ Finalizing ──▶ Done
//! ```

use crate::grid::{Grid, GridError};
use crate::inference::PredictionSlice;
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView2, Zip};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AccumulatorError {
    /// Slice is not on the accumulator's grid
    #[error("slice for {timestamp}: {source}")]
    Shape {
        timestamp: DateTime<Utc>,
        #[source]
        source: GridError,
    },
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    /// Currently working on the given timestamp
    Processing(DateTime<Utc>),
    /// Mean in progress; only exists inside [`TimeSeriesAccumulator::finalize`]
    Finalizing,
    Done,
}

/// Collects per-timestamp predictions for one region
#[derive(Debug)]
pub struct TimeSeriesAccumulator {
    grid: Grid,
    slices: BTreeMap<DateTime<Utc>, Array2<f32>>,
    state: RunState,
}

impl TimeSeriesAccumulator {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid,
            slices: BTreeMap::new(),
            state: RunState::Initialized,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Enter processing of `timestamp`
    pub fn begin(&mut self, timestamp: DateTime<Utc>) {
        self.state = RunState::Processing(timestamp);
    }

    /// Add or replace the slice for its timestamp
    ///
    /// Returns `true` if an earlier slice for the same timestamp was replaced.
    ///
    /// # Errors
    /// [`AccumulatorError::Shape`] if the slice is not on the accumulator grid
    pub fn merge(&mut self, slice: PredictionSlice) -> Result<bool, AccumulatorError> {
        let timestamp = slice.timestamp();
        self.grid
            .check_shape(slice.values().dim())
            .map_err(|source| AccumulatorError::Shape { timestamp, source })?;

        self.state = RunState::Processing(timestamp);
        let replaced = self.slices.insert(timestamp, slice.into_values()).is_some();
        if replaced {
            warn!("Replaced existing prediction for {}", timestamp);
        }
        Ok(replaced)
    }

    /// Number of timestamps accumulated so far
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.slices.keys().copied()
    }

    pub fn get(&self, timestamp: &DateTime<Utc>) -> Option<ArrayView2<'_, f32>> {
        self.slices.get(timestamp).map(Array2::view)
    }

    /// Close the run and compute the temporal mean
    ///
    /// The accumulator is [`RunState::Finalizing`] for the duration of this
    /// call; consuming it means no caller observes that state, only the
    /// returned series in [`RunState::Done`].
    pub fn finalize(self) -> PredictionSeries {
        let mean = nan_mean(self.grid.shape(), self.slices.values().map(Array2::view));
        debug!(
            "Finalized {} slices, {} pixels with a mean estimate",
            self.slices.len(),
            mean.iter().filter(|v| !v.is_nan()).count()
        );

        PredictionSeries {
            grid: self.grid,
            slices: self.slices,
            mean,
            state: RunState::Done,
        }
    }
}

/// Per-pixel mean over `frames`, skipping NaN
///
/// Pixels missing in every frame (or with no frames at all) are NaN.
pub fn nan_mean<'a>(
    shape: (usize, usize),
    frames: impl IntoIterator<Item = ArrayView2<'a, f32>>,
) -> Array2<f32> {
    let mut sum = Array2::<f64>::zeros(shape);
    let mut count = Array2::<u32>::zeros(shape);

    for frame in frames {
        Zip::from(&mut sum)
            .and(&mut count)
            .and(&frame)
            .par_for_each(|s, c, &v| {
                if !v.is_nan() {
                    *s += f64::from(v);
                    *c += 1;
                }
            });
    }

    let mut mean = Array2::<f32>::zeros(shape);
    Zip::from(&mut mean)
        .and(&sum)
        .and(&count)
        .par_for_each(|m, &s, &c| {
            *m = if c == 0 {
                f32::NAN
            } else {
                (s / f64::from(c)) as f32
            };
        });
    mean
}

/// Output of a finished run: per-timestamp maps plus their mean
#[derive(Debug, Clone)]
pub struct PredictionSeries {
    grid: Grid,
    slices: BTreeMap<DateTime<Utc>, Array2<f32>>,
    mean: Array2<f32>,
    state: RunState,
}

impl PredictionSeries {
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Always [`RunState::Done`]
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Slices in ascending timestamp order
    pub fn slices(&self) -> impl Iterator<Item = (DateTime<Utc>, ArrayView2<'_, f32>)> {
        self.slices.iter().map(|(t, v)| (*t, v.view()))
    }

    pub fn slice(&self, timestamp: &DateTime<Utc>) -> Option<ArrayView2<'_, f32>> {
        self.slices.get(timestamp).map(Array2::view)
    }

    pub fn mean(&self) -> ArrayView2<'_, f32> {
        self.mean.view()
    }
}
