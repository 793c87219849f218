//! Oracle-backed analysis engine.
//!
//! [`AnalysisRun`] is a lazy, finite iterator. It yields the bin edges
//! first, then queries the oracle for one band per call to `next`, and
//! finishes with the impact score. Nothing is queried until the caller
//! pulls. After an error the run is exhausted.

use geo::Polygon;
use policy_proof_srd_models::{AnalysisEvent, DistanceBand, Period, SamplePoint};

use crate::SrdError;
use crate::bands::{bands_for, bin_edges, ring_geometry};
use crate::config::{ImpactConfig, SrdConfig};
use crate::oracle::{BandStats, OracleError, StatsOracle};

enum Phase {
    Bins,
    Points(usize),
    Impact,
    Finished,
}

/// A single oracle-backed analysis run over one boundary and period.
pub struct AnalysisRun {
    oracle: Box<dyn StatsOracle>,
    boundary: Polygon<f64>,
    period: Period,
    bands: Vec<DistanceBand>,
    config: SrdConfig,
    points: Vec<SamplePoint>,
    phase: Phase,
}

impl AnalysisRun {
    /// Prepares a run. Bands are derived eagerly; no oracle query is
    /// issued until the first point is pulled.
    ///
    /// # Errors
    ///
    /// Returns [`SrdError::Bands`] if the configured band range is
    /// invalid.
    pub fn new(
        oracle: Box<dyn StatsOracle>,
        boundary: Polygon<f64>,
        period: Period,
        config: SrdConfig,
    ) -> Result<Self, SrdError> {
        let bands = bands_for(&config.bands)?;

        Ok(Self {
            oracle,
            boundary,
            period,
            points: Vec::with_capacity(bands.len()),
            bands,
            config,
            phase: Phase::Bins,
        })
    }

    /// Bands this run samples, in order.
    #[must_use]
    pub fn bands(&self) -> &[DistanceBand] {
        &self.bands
    }

    fn sample(&self, band: &DistanceBand) -> Result<SamplePoint, SrdError> {
        let ring = ring_geometry(&self.boundary, band)?;

        log::debug!(
            "Querying oracle for band [{}, {}] km, period {}",
            band.low,
            band.high,
            self.period
        );

        let stats = match self.oracle.query(&ring, &self.period) {
            Ok(stats) => stats,
            Err(OracleError::NoData { message }) => {
                log::debug!("No data for band [{}, {}]: {message}", band.low, band.high);
                BandStats::empty()
            }
            Err(e) => return Err(e.into()),
        };

        let value = match stats.mean {
            Some(mean) if stats.count > 0 && mean.is_finite() => {
                Some(self.config.rescale.apply(mean))
            }
            _ => None,
        };

        Ok(SamplePoint {
            distance_km: band.midpoint,
            value,
            count: Some(stats.count),
        })
    }

    fn step(&mut self) -> Option<Result<AnalysisEvent, SrdError>> {
        match self.phase {
            Phase::Bins => {
                self.phase = if self.bands.is_empty() {
                    Phase::Impact
                } else {
                    Phase::Points(0)
                };
                Some(Ok(AnalysisEvent::Bins(bin_edges(&self.bands))))
            }
            Phase::Points(index) => {
                let band = self.bands[index];
                let point = match self.sample(&band) {
                    Ok(point) => point,
                    Err(e) => return Some(Err(e)),
                };
                self.points.push(point);
                self.phase = if index + 1 < self.bands.len() {
                    Phase::Points(index + 1)
                } else {
                    Phase::Impact
                };
                Some(Ok(AnalysisEvent::Point(point)))
            }
            Phase::Impact => {
                self.phase = Phase::Finished;
                Some(impact_score(&self.points, &self.config.impact).map(AnalysisEvent::ImpactScore))
            }
            Phase::Finished => None,
        }
    }
}

impl Iterator for AnalysisRun {
    type Item = Result<AnalysisEvent, SrdError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.step();
        if matches!(item, Some(Err(_))) {
            self.phase = Phase::Finished;
        }
        item
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    Some(values.iter().sum::<f64>() / n)
}

/// Gap between the mean value just inside (`0..=window`) and just outside
/// (`-window..0`) the boundary. `None` when either side has no value.
#[must_use]
pub fn near_boundary_gap(points: &[SamplePoint], window_km: f64) -> Option<f64> {
    let inside: Vec<f64> = points
        .iter()
        .filter(|p| (0.0..=window_km).contains(&p.distance_km))
        .filter_map(|p| p.value)
        .collect();
    let outside: Vec<f64> = points
        .iter()
        .filter(|p| p.distance_km >= -window_km && p.distance_km < 0.0)
        .filter_map(|p| p.value)
        .collect();

    Some(mean(&inside)? - mean(&outside)?)
}

/// Impact score for oracle-backed points.
///
/// Falls back to `0` when either near-boundary group is empty.
///
/// # Errors
///
/// Returns [`SrdError::InsufficientData`] if fewer than
/// `min_valid_points` points carry a value.
pub fn impact_score(points: &[SamplePoint], config: &ImpactConfig) -> Result<f64, SrdError> {
    let valid = points.iter().filter(|p| p.value.is_some()).count();

    if valid < config.min_valid_points {
        return Err(SrdError::InsufficientData {
            valid,
            required: config.min_valid_points,
        });
    }

    Ok(near_boundary_gap(points, config.near_window_km).unwrap_or(0.0))
}
