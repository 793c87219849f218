#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Spatial Regression Discontinuity (SRD) analysis pipeline.
//!
//! A boundary polygon is partitioned into concentric distance bands
//! ([`bands`]). The [`engine`] queries an external statistics oracle band
//! by band and yields events lazily so callers can stream them as they
//! arrive. When the oracle cannot be reached at all, the [`fallback`]
//! controller substitutes the deterministic [`synthetic`] generator.
//!
//! All iteration here is blocking. Callers on an async runtime must drive
//! the event sequence from a blocking thread.

pub mod bands;
pub mod config;
pub mod engine;
pub mod fallback;
pub mod oracle;
pub mod synthetic;

use thiserror::Error;

pub use bands::BandError;
pub use oracle::OracleError;

/// Errors produced while constructing or iterating an analysis run.
#[derive(Debug, Error)]
pub enum SrdError {
    /// The band configuration is invalid.
    #[error("Band configuration error: {0}")]
    Bands(#[from] BandError),

    /// The statistics oracle failed.
    #[error("Statistics oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// Too few bands carried a value to estimate a discontinuity.
    #[error("Insufficient data: {valid} bands with a value, at least {required} required")]
    InsufficientData {
        /// Bands with a non-null value.
        valid: usize,
        /// Configured minimum.
        required: usize,
    },

    /// Ring geometry could not be derived from the boundary.
    #[error("Geometry error: {message}")]
    Geometry {
        /// Description of what went wrong.
        message: String,
    },

    /// The analysis configuration could not be loaded.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },
}

/// A lazily evaluated, non-restartable sequence of analysis events.
pub type EventIter =
    Box<dyn Iterator<Item = Result<policy_proof_srd_models::AnalysisEvent, SrdError>> + Send>;
