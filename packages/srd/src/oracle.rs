//! Statistics oracle seam.
//!
//! The oracle reduces a raster statistic over a ring geometry for a
//! period and reports the mean and the number of valid samples. Calls are
//! blocking and assumed to be network-bound and rate-limited, so the
//! engine issues them strictly one at a time.

use geo::MultiPolygon;
use policy_proof_srd_models::Period;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::OracleConfig;

/// Errors raised by a statistics oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    /// No oracle endpoint is configured.
    #[error("Statistics oracle is not configured (set SRD_ORACLE_URL)")]
    NotConfigured,

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The oracle answered with an unexpected status.
    #[error("Oracle returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body preview.
        body: String,
    },

    /// The oracle has no data for the requested region and period.
    #[error("No data: {message}")]
    NoData {
        /// Description from the oracle.
        message: String,
    },

    /// The oracle could not be initialised or reached.
    #[error("Oracle unavailable: {message}")]
    Unavailable {
        /// Description of what went wrong.
        message: String,
    },
}

/// Reduced statistics for one ring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    /// Mean of the statistic, `None` when nothing was sampled.
    #[serde(default)]
    pub mean: Option<f64>,
    /// Number of valid samples.
    #[serde(default)]
    pub count: u64,
}

impl BandStats {
    /// Statistics for a ring with no valid samples.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            mean: None,
            count: 0,
        }
    }
}

/// A connected statistics oracle.
pub trait StatsOracle: Send {
    /// Reduces the statistic over `ring` for `period`.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::NoData`] when the oracle has nothing for
    /// the ring, or another [`OracleError`] when the query fails.
    fn query(&self, ring: &MultiPolygon<f64>, period: &Period) -> Result<BandStats, OracleError>;
}

/// Produces connected oracles.
///
/// `connect` is the construction step of an analysis run: a failure here
/// happens before any band is queried.
pub trait OracleSource: Send + Sync {
    /// Connects to the oracle.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError`] if the oracle is not configured or cannot
    /// be reached.
    fn connect(&self) -> Result<Box<dyn StatsOracle>, OracleError>;
}

/// Maximum length of a response body kept in error messages.
const BODY_PREVIEW_LEN: usize = 300;

/// Oracle source backed by an HTTP reduce service.
pub struct HttpOracleSource {
    config: OracleConfig,
}

impl HttpOracleSource {
    /// Creates a source from the oracle configuration.
    #[must_use]
    pub const fn new(config: OracleConfig) -> Self {
        Self { config }
    }
}

impl OracleSource for HttpOracleSource {
    fn connect(&self) -> Result<Box<dyn StatsOracle>, OracleError> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .ok_or(OracleError::NotConfigured)?;

        let client = reqwest::blocking::Client::builder().build()?;

        let health_url = format!("{base_url}{}", self.config.health_path);
        log::debug!("Probing statistics oracle at {health_url}");

        let response = client
            .get(&health_url)
            .send()
            .map_err(|e| OracleError::Unavailable {
                message: format!("{health_url}: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(OracleError::Unavailable {
                message: format!("{health_url} returned HTTP {}", response.status()),
            });
        }

        log::info!("Connected to statistics oracle at {base_url}");

        Ok(Box::new(HttpOracle {
            client,
            reduce_url: format!("{base_url}{}", self.config.reduce_path),
        }))
    }
}

#[derive(Serialize)]
struct ReduceRequest<'a> {
    geometry: geojson::Geometry,
    period: &'a str,
}

/// A connected HTTP oracle.
pub struct HttpOracle {
    client: reqwest::blocking::Client,
    reduce_url: String,
}

impl StatsOracle for HttpOracle {
    fn query(&self, ring: &MultiPolygon<f64>, period: &Period) -> Result<BandStats, OracleError> {
        let request = ReduceRequest {
            geometry: geojson::Geometry::new(geojson::Value::from(ring)),
            period: period.as_str(),
        };

        let response = self.client.post(&self.reduce_url).json(&request).send()?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NO_CONTENT {
            return Err(OracleError::NoData {
                message: format!("no samples for period {period}"),
            });
        }

        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let body = body.chars().take(BODY_PREVIEW_LEN).collect();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<BandStats>()?)
    }
}
