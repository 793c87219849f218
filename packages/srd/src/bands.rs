//! Distance band model.
//!
//! Bands are derived from a `start..=end` range sampled every `step` km.
//! `N + 1` edges produce `N` contiguous bands. Ring geometries are built
//! by buffering the boundary in a local metre plane and differencing the
//! two buffers that bracket the band.

use geo::{BooleanOps as _, Buffer as _, Centroid as _, Coord, MapCoords as _, MultiPolygon, Polygon};
use policy_proof_srd_models::{BandSide, DistanceBand};
use thiserror::Error;

use crate::SrdError;
use crate::config::{BandRange, round_to};

const METERS_PER_KM: f64 = 1000.0;

/// Metres per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Tolerance when deciding whether the last edge reaches `end`.
const EDGE_EPSILON: f64 = 1e-9;

/// Decimal places kept on band edges to avoid float drift.
const EDGE_DECIMALS: u32 = 6;

/// Errors from an invalid band range.
#[derive(Debug, Error, PartialEq)]
pub enum BandError {
    /// Step is zero, negative, or not finite.
    #[error("step must be a positive finite number, got {step}")]
    InvalidStep {
        /// The rejected step.
        step: f64,
    },

    /// Range is empty, inverted, or not finite.
    #[error("start ({start}) must be less than end ({end})")]
    InvalidRange {
        /// Range start.
        start: f64,
        /// Range end.
        end: f64,
    },

    /// The step is wider than the range, so no band fits.
    #[error("step {step} leaves no band between {start} and {end}")]
    Empty {
        /// Range start.
        start: f64,
        /// Range end.
        end: f64,
        /// The step.
        step: f64,
    },
}

/// Generates the edges `start, start + step, ...` up to and including
/// `end` when `end` is reachable.
///
/// # Errors
///
/// Returns [`BandError`] if the step or range is invalid.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn generate_edges(start_km: f64, end_km: f64, step_km: f64) -> Result<Vec<f64>, BandError> {
    if !step_km.is_finite() || step_km <= 0.0 {
        return Err(BandError::InvalidStep { step: step_km });
    }
    if !start_km.is_finite() || !end_km.is_finite() || start_km >= end_km {
        return Err(BandError::InvalidRange {
            start: start_km,
            end: end_km,
        });
    }

    let steps = ((end_km - start_km) / step_km + EDGE_EPSILON).floor() as usize;

    Ok((0..=steps)
        .map(|i| round_to(step_km.mul_add(i as f64, start_km), EDGE_DECIMALS))
        .collect())
}

/// Derives the ordered bands for a range.
///
/// The same inputs always produce the same bands.
///
/// # Errors
///
/// Returns [`BandError`] if the range is invalid or too narrow for a
/// single band.
pub fn generate_bands(
    start_km: f64,
    end_km: f64,
    step_km: f64,
) -> Result<Vec<DistanceBand>, BandError> {
    let edges = generate_edges(start_km, end_km, step_km)?;

    if edges.len() < 2 {
        return Err(BandError::Empty {
            start: start_km,
            end: end_km,
            step: step_km,
        });
    }

    Ok(edges
        .windows(2)
        .map(|pair| DistanceBand::new(pair[0], pair[1]))
        .collect())
}

/// Convenience wrapper over [`generate_bands`] for a configured range.
///
/// # Errors
///
/// See [`generate_bands`].
pub fn bands_for(range: &BandRange) -> Result<Vec<DistanceBand>, BandError> {
    generate_bands(range.start_km, range.end_km, range.step_km)
}

/// Bin edges for a band sequence: the first `low` followed by every
/// `high`.
#[must_use]
pub fn bin_edges(bands: &[DistanceBand]) -> Vec<f64> {
    bands
        .first()
        .map(|first| first.low)
        .into_iter()
        .chain(bands.iter().map(|b| b.high))
        .collect()
}

/// Equirectangular projection into metres around a fixed origin.
///
/// Accurate enough for buffers of a few kilometres, which is the scale
/// bands are sampled at.
struct LocalProjection {
    origin: Coord<f64>,
    meters_per_degree_x: f64,
}

impl LocalProjection {
    fn around(boundary: &Polygon<f64>) -> Result<Self, SrdError> {
        let origin = boundary
            .centroid()
            .ok_or_else(|| SrdError::Geometry {
                message: "boundary has no centroid (empty polygon)".to_string(),
            })?
            .0;

        Ok(Self {
            origin,
            meters_per_degree_x: METERS_PER_DEGREE * origin.y.to_radians().cos(),
        })
    }

    fn forward(&self, c: Coord<f64>) -> Coord<f64> {
        Coord {
            x: (c.x - self.origin.x) * self.meters_per_degree_x,
            y: (c.y - self.origin.y) * METERS_PER_DEGREE,
        }
    }

    fn inverse(&self, c: Coord<f64>) -> Coord<f64> {
        Coord {
            x: c.x / self.meters_per_degree_x + self.origin.x,
            y: c.y / METERS_PER_DEGREE + self.origin.y,
        }
    }
}

/// Buffers a projected polygon by a signed distance in metres; positive
/// grows it outward, negative shrinks it inward.
fn buffered(projected: &Polygon<f64>, distance_m: f64) -> MultiPolygon<f64> {
    if distance_m == 0.0 {
        MultiPolygon(vec![projected.clone()])
    } else {
        projected.buffer(distance_m)
    }
}

/// Builds the ring geometry (lon/lat) that a band samples.
///
/// Outside bands are the difference of outward buffers at `|low|` and
/// `|high|`; inside bands the difference of inward buffers at `low` and
/// `high`. A band straddling zero is treated as inside, so its outer
/// buffer grows and its inner buffer shrinks.
///
/// # Errors
///
/// Returns [`SrdError::Geometry`] if the boundary is empty.
pub fn ring_geometry(
    boundary: &Polygon<f64>,
    band: &DistanceBand,
) -> Result<MultiPolygon<f64>, SrdError> {
    let projection = LocalProjection::around(boundary)?;
    let projected = boundary.map_coords(|c| projection.forward(c));

    let (outer_m, inner_m) = match band.side() {
        BandSide::Outside => (band.low.abs() * METERS_PER_KM, band.high.abs() * METERS_PER_KM),
        BandSide::Inside => (-band.low * METERS_PER_KM, -band.high * METERS_PER_KM),
    };

    let outer = buffered(&projected, outer_m);
    let inner = buffered(&projected, inner_m);
    let ring = outer.difference(&inner);

    Ok(ring.map_coords(|c| projection.inverse(c)))
}
