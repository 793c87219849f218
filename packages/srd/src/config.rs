//! Analysis configuration.
//!
//! Defaults are embedded from `config/defaults.toml`. Setting `SRD_CONFIG`
//! replaces the whole document with a file; `SRD_ORACLE_URL` and
//! `SRD_DEFAULT_PERIOD` override single values on top of either.

use serde::Deserialize;

use crate::SrdError;

const DEFAULTS_TOML: &str = include_str!("../config/defaults.toml");

/// Complete analysis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SrdConfig {
    /// Period used when a request does not name one.
    pub default_period: String,
    /// Band range for the oracle-backed engine.
    pub bands: BandRange,
    /// Rescale from the oracle's native range onto 0-100.
    pub rescale: Rescale,
    /// Impact estimation settings.
    pub impact: ImpactConfig,
    /// Synthetic generator model.
    pub synthetic: SyntheticConfig,
    /// Statistics oracle endpoint settings.
    pub oracle: OracleConfig,
}

/// A `start..=end` range sampled every `step` km.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BandRange {
    /// First edge in km.
    pub start_km: f64,
    /// Last edge in km (inclusive).
    pub end_km: f64,
    /// Edge spacing in km.
    pub step_km: f64,
}

/// Linear rescale of an oracle mean into a 0-100 score.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Rescale {
    /// Oracle value mapped to 0.
    pub source_min: f64,
    /// Oracle value mapped to 100.
    pub source_max: f64,
    /// Decimal places kept after rescaling.
    pub decimals: u32,
}

impl Rescale {
    /// Maps an oracle mean onto the 0-100 scale, rounded to
    /// [`Self::decimals`] places.
    #[must_use]
    pub fn apply(&self, mean: f64) -> f64 {
        let scaled = (mean - self.source_min) / (self.source_max - self.source_min) * 100.0;
        round_to(scaled, self.decimals)
    }
}

/// Near-boundary window and data sufficiency threshold.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ImpactConfig {
    /// Half-width of the window either side of zero, in km.
    pub near_window_km: f64,
    /// Minimum number of bands with a value.
    pub min_valid_points: usize,
}

/// Parameters of the synthetic outcome model.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SyntheticConfig {
    /// First sampled distance in km.
    pub start_km: f64,
    /// Last sampled distance in km (inclusive).
    pub end_km: f64,
    /// Sampling step in km.
    pub step_km: f64,
    /// Outcome level at the boundary, outside.
    pub base: f64,
    /// Outcome change per km.
    pub slope: f64,
    /// Jump at the boundary for distances `>= 0`.
    pub delta: f64,
    /// Noise standard deviation at the boundary.
    pub noise_sigma: f64,
    /// Sample count at the boundary.
    pub count_base: f64,
    /// Sample count lost per km from the boundary.
    pub count_decay_per_km: f64,
    /// Noise standard deviation of the sample count.
    pub count_noise_sigma: f64,
    /// Width of the coarse bins reported alongside synthetic points.
    pub bin_width_km: f64,
}

/// Statistics oracle endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OracleConfig {
    /// Base URL; `None` leaves the oracle unconfigured.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Path probed when connecting.
    pub health_path: String,
    /// Path receiving per-band reduce requests.
    pub reduce_path: String,
}

impl SrdConfig {
    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`SrdError::Config`] if the document is not valid TOML or
    /// is missing a field.
    pub fn from_toml(document: &str) -> Result<Self, SrdError> {
        toml::de::from_str(document).map_err(|e| SrdError::Config {
            message: e.to_string(),
        })
    }

    /// The embedded defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SrdError::Config`] if the embedded document is malformed.
    pub fn embedded() -> Result<Self, SrdError> {
        Self::from_toml(DEFAULTS_TOML)
    }

    /// Loads configuration from `SRD_CONFIG` (or the embedded defaults)
    /// and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`SrdError::Config`] if the configured file cannot be read
    /// or parsed.
    pub fn from_env() -> Result<Self, SrdError> {
        let mut config = match std::env::var("SRD_CONFIG") {
            Ok(path) => {
                log::info!("Loading analysis configuration from {path}");
                let document = std::fs::read_to_string(&path).map_err(|e| SrdError::Config {
                    message: format!("Failed to read {path}: {e}"),
                })?;
                Self::from_toml(&document)?
            }
            Err(_) => Self::embedded()?,
        };

        if let Ok(url) = std::env::var("SRD_ORACLE_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.is_empty() {
                config.oracle.base_url = Some(url);
            }
        }

        if let Ok(period) = std::env::var("SRD_DEFAULT_PERIOD") {
            config.default_period = period;
        }

        Ok(config)
    }
}

/// Rounds to `decimals` places, ties to even.
#[must_use]
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(i32::try_from(decimals).unwrap_or(i32::MAX));
    (value * factor).round_ties_even() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let config = SrdConfig::embedded().unwrap();
        assert!(config.bands.step_km > 0.0);
        assert!(config.bands.start_km < config.bands.end_km);
        assert!(config.oracle.base_url.is_none());
        assert_eq!(config.impact.min_valid_points, 4);
    }

    #[test]
    fn rescale_maps_source_range_onto_percent() {
        let rescale = SrdConfig::embedded().unwrap().rescale;
        assert!((rescale.apply(-0.3) - 0.0).abs() < 1e-9);
        assert!((rescale.apply(0.0) - 50.0).abs() < 1e-9);
        assert!((rescale.apply(0.3) - 100.0).abs() < 1e-9);
        assert!((rescale.apply(0.123_456) - 70.58).abs() < 1e-9);
    }

    #[test]
    fn ties_round_to_even() {
        assert!((round_to(0.125, 2) - 0.12).abs() < 1e-12);
        assert!((round_to(0.375, 2) - 0.38).abs() < 1e-12);
        assert!((round_to(-2.5, 0) + 2.0).abs() < 1e-12);
        assert!((round_to(70.576, 2) - 70.58).abs() < 1e-12);
    }

    #[test]
    fn malformed_document_is_a_config_error() {
        let err = SrdConfig::from_toml("default_period = ").unwrap_err();
        assert!(matches!(err, SrdError::Config { .. }));
    }
}
