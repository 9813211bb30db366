//! Reflectance and feature cubes
//!
//! A [`ReflectanceCube`] is what the cube provider hands over: surface
//! reflectance indexed by `(time, band, row, col)` and a quality flag indexed
//! by `(time, row, col)`. Applying the quality flag turns it into a
//! [`FeatureCube`], where unusable observations are NaN ("missing") and the
//! flag itself is gone. The feature deriver then appends the index channels.

use super::channel::{Channel, QUALITY_VALID};
use crate::grid::{DateWindow, Grid, GridError};
use crate::raster::RasterError;
use chrono::{DateTime, NaiveDate, Utc};
use ndarray::{s, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building or loading cubes
#[derive(Debug, Error)]
pub enum CubeError {
    /// A raster or array does not line up with the grid
    #[error(transparent)]
    Grid(#[from] GridError),

    /// Reading a band raster failed
    #[error(transparent)]
    Raster(#[from] RasterError),

    /// Array dimensions disagree with the cube metadata
    #[error("{what} has shape {actual:?}, expected {expected:?}")]
    Shape {
        /// Which array was checked
        what: &'static str,
        /// Shape implied by grid, timestamps and channels
        expected: Vec<usize>,
        /// Shape actually supplied
        actual: Vec<usize>,
    },

    /// Timestamps are not strictly increasing
    #[error("timestamps must be strictly increasing, got {previous} followed by {next}")]
    UnorderedTimestamps {
        previous: DateTime<Utc>,
        next: DateTime<Utc>,
    },

    /// Same channel listed twice
    #[error("channel '{0}' appears more than once")]
    DuplicateChannel(Channel),

    /// A channel needed downstream is absent
    #[error("channel '{0}' is not present in the cube")]
    MissingChannel(Channel),

    /// Time index past the end of the cube
    #[error("time index {index} out of range for {len} timestamps")]
    TimeIndex { index: usize, len: usize },

    /// The provider returned a cube on a different grid
    #[error("cube grid does not match the region grid")]
    GridMismatch,

    /// A band raster is not georeferenced onto the grid
    #[error("{path} is not aligned with the region grid: {reason}")]
    Misaligned { path: PathBuf, reason: String },

    /// Provider found nothing in the requested window
    #[error("no acquisitions under {root} between {start} and {end}")]
    NoAcquisitions {
        root: PathBuf,
        start: NaiveDate,
        end: NaiveDate,
    },

    /// Provider directory listing failed
    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn check_timestamps(timestamps: &[DateTime<Utc>]) -> Result<(), CubeError> {
    for pair in timestamps.windows(2) {
        if pair[1] <= pair[0] {
            return Err(CubeError::UnorderedTimestamps {
                previous: pair[0],
                next: pair[1],
            });
        }
    }
    Ok(())
}

fn channel_lookup(channels: &[Channel]) -> Result<FxHashMap<Channel, usize>, CubeError> {
    let mut index = FxHashMap::default();
    for (i, &channel) in channels.iter().enumerate() {
        if index.insert(channel, i).is_some() {
            return Err(CubeError::DuplicateChannel(channel));
        }
    }
    Ok(index)
}

fn check_dims(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<(), CubeError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CubeError::Shape {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

/// Raw surface reflectance with its quality flag
#[derive(Debug, Clone)]
pub struct ReflectanceCube {
    grid: Grid,
    timestamps: Vec<DateTime<Utc>>,
    bands: Vec<Channel>,
    /// `(time, band, row, col)`
    data: Array4<f32>,
    /// `(time, row, col)`; [`QUALITY_VALID`] marks usable pixels
    quality: Array3<u8>,
}

impl ReflectanceCube {
    /// Assemble a cube, validating every dimension against the metadata
    ///
    /// # Errors
    /// - [`CubeError::Shape`] if `data` or `quality` disagree with grid, bands or timestamps
    /// - [`CubeError::UnorderedTimestamps`] if timestamps are not strictly increasing
    /// - [`CubeError::DuplicateChannel`] if a band is listed twice
    pub fn new(
        grid: Grid,
        timestamps: Vec<DateTime<Utc>>,
        bands: Vec<Channel>,
        data: Array4<f32>,
        quality: Array3<u8>,
    ) -> Result<Self, CubeError> {
        let (rows, cols) = grid.shape();
        check_dims(
            "reflectance",
            &[timestamps.len(), bands.len(), rows, cols],
            data.shape(),
        )?;
        check_dims("quality flag", &[timestamps.len(), rows, cols], quality.shape())?;
        check_timestamps(&timestamps)?;
        channel_lookup(&bands)?;

        Ok(Self {
            grid,
            timestamps,
            bands,
            data,
            quality,
        })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn bands(&self) -> &[Channel] {
        &self.bands
    }

    pub fn data(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn quality(&self) -> ArrayView3<'_, u8> {
        self.quality.view()
    }

    /// Keep only the acquisitions inside `window`
    ///
    /// # Errors
    /// Propagates construction errors (none expected for a valid cube)
    pub fn select_window(&self, window: &DateWindow) -> Result<Self, CubeError> {
        let keep: Vec<usize> = self
            .timestamps
            .iter()
            .enumerate()
            .filter(|(_, t)| window.contains(t))
            .map(|(i, _)| i)
            .collect();

        let (data, quality) = if keep.is_empty() {
            let (_, bands, rows, cols) = self.data.dim();
            (
                Array4::zeros((0, bands, rows, cols)),
                Array3::zeros((0, rows, cols)),
            )
        } else {
            (
                self.data.select(Axis(0), &keep),
                self.quality.select(Axis(0), &keep),
            )
        };

        Self::new(
            self.grid.clone(),
            keep.iter().map(|&i| self.timestamps[i]).collect(),
            self.bands.clone(),
            data,
            quality,
        )
    }

    /// Replace every observation whose quality flag is not usable with NaN
    ///
    /// All bands of a flagged pixel are masked; the flag is consumed.
    pub fn apply_quality_mask(self) -> FeatureCube {
        let Self {
            grid,
            timestamps,
            bands,
            mut data,
            quality,
        } = self;

        Zip::from(data.axis_iter_mut(Axis(0)))
            .and(quality.axis_iter(Axis(0)))
            .par_for_each(|mut slice, flags| {
                for mut band in slice.axis_iter_mut(Axis(0)) {
                    Zip::from(&mut band).and(&flags).for_each(|value, &flag| {
                        if flag != QUALITY_VALID {
                            *value = f32::NAN;
                        }
                    });
                }
            });

        let index = bands
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i))
            .collect();

        FeatureCube {
            grid,
            timestamps,
            channels: bands,
            index,
            data,
        }
    }
}

/// Quality-masked cube of model feature channels
#[derive(Debug, Clone)]
pub struct FeatureCube {
    grid: Grid,
    timestamps: Vec<DateTime<Utc>>,
    channels: Vec<Channel>,
    index: FxHashMap<Channel, usize>,
    /// `(time, channel, row, col)`, NaN = missing
    data: Array4<f32>,
}

impl FeatureCube {
    /// Assemble a feature cube directly (quality already applied)
    ///
    /// # Errors
    /// Same validation as [`ReflectanceCube::new`]
    pub fn new(
        grid: Grid,
        timestamps: Vec<DateTime<Utc>>,
        channels: Vec<Channel>,
        data: Array4<f32>,
    ) -> Result<Self, CubeError> {
        let (rows, cols) = grid.shape();
        check_dims(
            "features",
            &[timestamps.len(), channels.len(), rows, cols],
            data.shape(),
        )?;
        check_timestamps(&timestamps)?;
        let index = channel_lookup(&channels)?;

        Ok(Self {
            grid,
            timestamps,
            channels,
            index,
            data,
        })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Number of timestamps
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn data(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn channel_index(&self, channel: Channel) -> Option<usize> {
        self.index.get(&channel).copied()
    }

    /// One channel across all timestamps, `(time, row, col)`
    ///
    /// # Errors
    /// [`CubeError::MissingChannel`] if the channel is absent
    pub fn channel(&self, channel: Channel) -> Result<ArrayView3<'_, f32>, CubeError> {
        let i = self
            .channel_index(channel)
            .ok_or(CubeError::MissingChannel(channel))?;
        Ok(self.data.index_axis(Axis(1), i))
    }

    /// Append channels, each given as a `(time, row, col)` array
    ///
    /// The existing channels are moved over untouched.
    ///
    /// # Errors
    /// - [`CubeError::DuplicateChannel`] if a channel already exists
    /// - [`CubeError::Shape`] if an array does not match `(time, row, col)`
    pub fn with_channels(self, extra: Vec<(Channel, Array3<f32>)>) -> Result<Self, CubeError> {
        let (times, existing, rows, cols) = self.data.dim();
        let mut channels = self.channels;
        for (channel, values) in &extra {
            check_dims("derived channel", &[times, rows, cols], values.shape())?;
            channels.push(*channel);
        }
        let index = channel_lookup(&channels)?;

        let mut data = Array4::<f32>::zeros((times, channels.len(), rows, cols));
        data.slice_mut(s![.., ..existing, .., ..]).assign(&self.data);
        for (offset, (_, values)) in extra.iter().enumerate() {
            data.index_axis_mut(Axis(1), existing + offset).assign(values);
        }

        Ok(Self {
            grid: self.grid,
            timestamps: self.timestamps,
            channels,
            index,
            data,
        })
    }

    /// Borrow a single time slice
    ///
    /// # Errors
    /// [`CubeError::TimeIndex`] when `t` is out of range
    pub fn slice(&self, t: usize) -> Result<FeatureSlice<'_>, CubeError> {
        let timestamp = *self.timestamps.get(t).ok_or(CubeError::TimeIndex {
            index: t,
            len: self.timestamps.len(),
        })?;
        Ok(FeatureSlice {
            timestamp,
            channels: &self.channels,
            index: &self.index,
            data: self.data.index_axis(Axis(0), t),
        })
    }
}

/// All feature channels of one timestamp, `(channel, row, col)`
#[derive(Debug, Clone)]
pub struct FeatureSlice<'a> {
    timestamp: DateTime<Utc>,
    channels: &'a [Channel],
    index: &'a FxHashMap<Channel, usize>,
    data: ArrayView3<'a, f32>,
}

impl<'a> FeatureSlice<'a> {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn channels(&self) -> &'a [Channel] {
        self.channels
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn channel(&self, channel: Channel) -> Option<ArrayView2<'a, f32>> {
        let i = *self.index.get(&channel)?;
        Some(self.data.index_axis_move(Axis(0), i))
    }
}
