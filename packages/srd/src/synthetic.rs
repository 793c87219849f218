//! Deterministic synthetic SRD generator.
//!
//! Produces the same event shape as the oracle-backed engine from a
//! simple outcome model: a smooth linear trend, a jump of `delta` at the
//! boundary, and noise that widens with distance. The random source is
//! seeded from a hash of the boundary geometry, so the same boundary
//! always yields the same points.

use geo::Polygon;
use policy_proof_srd_models::{AnalysisEvent, SamplePoint};
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use rand_distr::{Distribution as _, Normal};
use sha2::{Digest as _, Sha256};

use crate::SrdError;
use crate::bands::generate_edges;
use crate::config::{ImpactConfig, SyntheticConfig};
use crate::engine::near_boundary_gap;

/// Characters of the canonical geometry JSON that feed the seed.
const SEED_MATERIAL_LEN: usize = 512;

/// Seed derived from the key-sorted JSON rendering of the boundary.
#[must_use]
pub fn geometry_seed(boundary: &Polygon<f64>) -> u64 {
    let value = geojson::Value::from(boundary);
    let material: String = serde_json::to_value(geojson::Geometry::new(value))
        .map(|json| json.to_string())
        .unwrap_or_else(|_| "default".to_string())
        .chars()
        .take(SEED_MATERIAL_LEN)
        .collect();

    let digest = Sha256::digest(material.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn normal(mean: f64, sigma: f64) -> Result<Normal<f64>, SrdError> {
    Normal::new(mean, sigma).map_err(|e| SrdError::Config {
        message: format!("invalid synthetic noise (sigma {sigma}): {e}"),
    })
}

/// Synthetic points for `config`, drawn from `rng`.
fn sample_points(config: &SyntheticConfig, rng: &mut StdRng) -> Result<Vec<SamplePoint>, SrdError> {
    let distances = generate_edges(config.start_km, config.end_km, config.step_km)?;
    let count_noise = normal(0.0, config.count_noise_sigma)?;

    distances
        .into_iter()
        .map(|distance| {
            let jump = if distance >= 0.0 { config.delta } else { 0.0 };
            let mu = config.slope.mul_add(distance, config.base) + jump;
            let sigma = config.noise_sigma * 0.05f64.mul_add(distance.abs(), 1.0);
            let value = normal(mu, sigma)?.sample(rng);

            let expected = config
                .count_decay_per_km
                .mul_add(-distance.abs(), config.count_base);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let count = (expected + count_noise.sample(rng)).round().max(0.0) as u64;

            Ok(SamplePoint {
                distance_km: distance,
                value: Some(value),
                count: Some(count),
            })
        })
        .collect()
}

/// Coarse bin edges every `bin_width_km` from `floor(start)` to
/// `ceil(end)`.
fn coarse_bins(config: &SyntheticConfig) -> Result<Vec<f64>, SrdError> {
    Ok(generate_edges(
        config.start_km.floor(),
        config.end_km.ceil(),
        config.bin_width_km,
    )?)
}

/// Impact estimate for synthetic points; `delta` when either
/// near-boundary group is empty.
#[must_use]
pub fn synthetic_impact(points: &[SamplePoint], config: &SyntheticConfig, impact: &ImpactConfig) -> f64 {
    near_boundary_gap(points, impact.near_window_km).unwrap_or(config.delta)
}

/// A fully generated synthetic run, replayed as events.
pub struct SyntheticRun {
    events: std::vec::IntoIter<AnalysisEvent>,
}

impl SyntheticRun {
    /// Generates the run for `boundary`.
    ///
    /// # Errors
    ///
    /// Returns [`SrdError`] if the synthetic range or noise parameters
    /// are invalid.
    pub fn new(
        boundary: &Polygon<f64>,
        config: &SyntheticConfig,
        impact: &ImpactConfig,
    ) -> Result<Self, SrdError> {
        let seed = geometry_seed(boundary);
        let mut rng = StdRng::seed_from_u64(seed);

        let bins = coarse_bins(config)?;
        let points = sample_points(config, &mut rng)?;
        let score = synthetic_impact(&points, config, impact);

        log::debug!(
            "Generated synthetic run: seed {seed:#018x}, {} points, impact {score:.3}",
            points.len()
        );

        let events = std::iter::once(AnalysisEvent::Bins(bins))
            .chain(points.into_iter().map(AnalysisEvent::Point))
            .chain(std::iter::once(AnalysisEvent::ImpactScore(score)))
            .collect::<Vec<_>>()
            .into_iter();

        Ok(Self { events })
    }
}

impl Iterator for SyntheticRun {
    type Item = Result<AnalysisEvent, SrdError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.events.next().map(Ok)
    }
}
