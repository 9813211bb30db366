//! Region of interest, processing date window and output file naming

use super::geo::Bounds;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Default edge length of the square area of interest (meters)
pub const DEFAULT_EDGE_LENGTH_M: f64 = 10_000.0;

/// Default number of days looked back from the end date
pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;

/// Square area of interest centred on a point of the projected CRS
///
/// Coordinates are already in the grid's CRS; reprojection from geographic
/// coordinates happens before the core is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Centre X (projected meters)
    pub center_x: f64,
    /// Centre Y (projected meters)
    pub center_y: f64,
    /// Edge of the square in meters
    pub edge_length_m: f64,
}

impl Region {
    pub fn new(center_x: f64, center_y: f64, edge_length_m: f64) -> Self {
        Self {
            center_x,
            center_y,
            edge_length_m,
        }
    }

    /// Region with the default 10 km edge
    pub fn around(center_x: f64, center_y: f64) -> Self {
        Self::new(center_x, center_y, DEFAULT_EDGE_LENGTH_M)
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::around(self.center_x, self.center_y, self.edge_length_m)
    }
}

/// Inclusive range of acquisition dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Window covering `days` days before `end`, `end` included
    pub fn ending_on(end: NaiveDate, days: u32) -> Self {
        Self {
            start: end - Duration::days(i64::from(days)),
            end,
        }
    }

    /// Window ending today (UTC)
    pub fn last_days(days: u32) -> Self {
        Self::ending_on(Utc::now().date_naive(), days)
    }

    /// Whether the acquisition date of `timestamp` falls in the window
    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        let date = timestamp.date_naive();
        date >= self.start && date <= self.end
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Deterministic output file names for one region
///
/// Names embed the region centre with `.` replaced by `_` so that the
/// coordinates never collide with the file extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNaming {
    x_label: String,
    y_label: String,
}

impl OutputNaming {
    pub fn new(region: &Region) -> Self {
        Self {
            x_label: coordinate_label(region.center_x),
            y_label: coordinate_label(region.center_y),
        }
    }

    /// `lfmc_{x}_{y}_{YYYY-MM-DD}.tif`
    pub fn slice_name(&self, timestamp: &DateTime<Utc>) -> String {
        format!(
            "lfmc_{}_{}_{}.tif",
            self.x_label,
            self.y_label,
            date_label(timestamp)
        )
    }

    /// `lfmc_{x}_{y}_mean_{start}_{end}.tif`
    pub fn mean_name(&self, window: &DateWindow) -> String {
        format!(
            "lfmc_{}_{}_mean_{}_{}.tif",
            self.x_label, self.y_label, window.start, window.end
        )
    }
}

/// ISO date of a timestamp (its first ten characters)
pub fn date_label(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d").to_string()
}

/// Whole coordinates keep one decimal, so `200.0` becomes `200_0`
fn coordinate_label(value: f64) -> String {
    let text = if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    };
    text.replace('.', "_")
}
