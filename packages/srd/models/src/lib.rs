#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the Spatial Regression Discontinuity (SRD) pipeline.
//!
//! Distances are signed kilometres from the policy boundary: negative
//! values lie outside the boundary, positive values inside. Every type in
//! this crate lives for a single request and is serialized as-is onto the
//! NDJSON analysis stream.

use serde::{Deserialize, Serialize};

/// Chart axis label for signed distance.
pub const DISTANCE_LABEL: &str = "Signed distance from boundary (km)";

/// Chart axis label for the rescaled activity value.
pub const ACTIVITY_LABEL: &str = "Activity (0-100)";

/// Chart axis label for per-band sample counts.
pub const COUNT_LABEL: &str = "Valid samples";

/// Title of the combined analysis record.
pub const ANALYSIS_TITLE: &str = "Spatial regression discontinuity";

/// Which side of the boundary a band samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandSide {
    /// Entirely at or below zero (`high <= 0`).
    Outside,
    /// Everything else, including a band straddling zero.
    Inside,
}

/// A ring-shaped sampling region between two signed distances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceBand {
    /// Lower edge in km.
    pub low: f64,
    /// Upper edge in km.
    pub high: f64,
    /// `(low + high) / 2`.
    pub midpoint: f64,
}

impl DistanceBand {
    /// Creates a band from its edges, deriving the midpoint.
    #[must_use]
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            midpoint: f64::midpoint(low, high),
        }
    }

    /// Classifies the band relative to the boundary.
    #[must_use]
    pub fn side(&self) -> BandSide {
        if self.high <= 0.0 {
            BandSide::Outside
        } else {
            BandSide::Inside
        }
    }
}

/// One sampled band.
///
/// `value` is `None` when the statistics source found no valid samples for
/// the band. It must never be read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// Signed distance of the sample in km.
    pub distance_km: f64,
    /// Rescaled outcome value, `null` when the band had no data.
    #[serde(default)]
    pub value: Option<f64>,
    /// Number of valid samples behind `value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// One step of an analysis run, in emission order: `Bins` once, `Point`
/// once per band, then `ImpactScore` once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisEvent {
    /// Distance bin edges for the run.
    Bins(Vec<f64>),
    /// A sampled band.
    Point(SamplePoint),
    /// The estimated discontinuity at distance zero.
    ImpactScore(f64),
}

/// The core result of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Estimated jump at the boundary.
    pub impact_score: f64,
    /// Samples in band order.
    pub points: Vec<SamplePoint>,
    /// Bin edges.
    pub bins: Vec<f64>,
}

/// An `(x, y)` pair on a chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

/// A named line on a chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Legend name.
    pub name: String,
    /// Points in distance order.
    pub points: Vec<ChartPoint>,
}

/// A chart derived from the points of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    /// Stable identifier the frontend keys charts on.
    pub id: String,
    /// Chart title.
    pub title: String,
    /// Horizontal axis label.
    pub x_label: String,
    /// Vertical axis label.
    pub y_label: String,
    /// Lines on the chart.
    pub series: Vec<Series>,
}

impl ChartSeries {
    /// Activity against distance, skipping bands without a value.
    #[must_use]
    pub fn activity_vs_distance(points: &[SamplePoint]) -> Self {
        let points = points
            .iter()
            .filter_map(|p| {
                p.value.map(|value| ChartPoint {
                    x: p.distance_km,
                    y: value,
                })
            })
            .collect();

        Self {
            id: "activity_vs_distance".to_string(),
            title: "Activity vs distance".to_string(),
            x_label: DISTANCE_LABEL.to_string(),
            y_label: ACTIVITY_LABEL.to_string(),
            series: vec![Series {
                name: "activity".to_string(),
                points,
            }],
        }
    }

    /// Sample count against distance. Every band is plotted; a missing
    /// count plots as zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn count_vs_distance(points: &[SamplePoint]) -> Self {
        let points = points
            .iter()
            .map(|p| ChartPoint {
                x: p.distance_km,
                y: p.count.unwrap_or(0) as f64,
            })
            .collect();

        Self {
            id: "count_vs_distance".to_string(),
            title: "Sample count vs distance".to_string(),
            x_label: DISTANCE_LABEL.to_string(),
            y_label: COUNT_LABEL.to_string(),
            series: vec![Series {
                name: "count".to_string(),
                points,
            }],
        }
    }
}

/// The terminal combined record of an analysis stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    /// Policy label echoed from the request.
    pub policy: Option<String>,
    /// Estimated jump at the boundary.
    pub impact_score: f64,
    /// Samples in band order.
    pub points: Vec<SamplePoint>,
    /// Bin edges.
    pub bins: Vec<f64>,
    /// Chart title.
    pub title: String,
    /// Horizontal axis label.
    pub x_label: String,
    /// Vertical axis label.
    pub y_label: String,
    /// Derived charts.
    pub charts: Vec<ChartSeries>,
}

impl AnalyzeResponse {
    /// Builds the combined record, deriving both charts from `result`.
    #[must_use]
    pub fn from_result(policy: Option<String>, result: AnalysisResult) -> Self {
        let charts = vec![
            ChartSeries::activity_vs_distance(&result.points),
            ChartSeries::count_vs_distance(&result.points),
        ];

        Self {
            policy,
            impact_score: result.impact_score,
            points: result.points,
            bins: result.bins,
            title: ANALYSIS_TITLE.to_string(),
            x_label: DISTANCE_LABEL.to_string(),
            y_label: ACTIVITY_LABEL.to_string(),
            charts,
        }
    }
}

/// Identifier of the period the statistics source aggregates over
/// (typically a calendar year). Deserializes from a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Period(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPeriod {
    Text(String),
    Year(i64),
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawPeriod::deserialize(deserializer)? {
            RawPeriod::Text(text) => Self(text),
            RawPeriod::Year(year) => Self(year.to_string()),
        })
    }
}

impl Period {
    /// Returns the period as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Period {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
