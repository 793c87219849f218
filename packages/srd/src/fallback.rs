//! Fallback controller.
//!
//! Only construction is supervised: if connecting to the oracle or
//! preparing the run fails, the synthetic generator takes its place. Errors
//! raised while the oracle-backed run is being iterated are passed through
//! to the consumer untouched, since by then events may already have been
//! delivered.

use std::sync::Arc;

use geo::Polygon;
use policy_proof_srd_models::Period;

use crate::config::SrdConfig;
use crate::engine::AnalysisRun;
use crate::oracle::OracleSource;
use crate::synthetic::SyntheticRun;
use crate::{EventIter, SrdError};

/// Where the events of a stream come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOrigin {
    /// The statistics oracle.
    Oracle,
    /// The synthetic generator, substituted because construction failed.
    Synthetic {
        /// Why the oracle path could not be constructed.
        reason: String,
    },
}

/// An event sequence together with its origin.
pub struct AnalysisStream {
    /// Origin of the events.
    pub origin: StreamOrigin,
    /// The events, pulled lazily.
    pub events: EventIter,
}

/// Supervises construction of analysis runs.
pub struct FallbackController {
    source: Arc<dyn OracleSource>,
    config: SrdConfig,
}

impl FallbackController {
    /// Creates a controller over an oracle source.
    #[must_use]
    pub fn new(source: Arc<dyn OracleSource>, config: SrdConfig) -> Self {
        Self { source, config }
    }

    /// The configuration runs are built with.
    #[must_use]
    pub const fn config(&self) -> &SrdConfig {
        &self.config
    }

    fn oracle_run(&self, boundary: &Polygon<f64>, period: &Period) -> Result<AnalysisRun, SrdError> {
        let oracle = self.source.connect()?;
        AnalysisRun::new(oracle, boundary.clone(), period.clone(), self.config.clone())
    }

    /// Begins an analysis. Blocks while the oracle is connected.
    ///
    /// # Errors
    ///
    /// Returns [`SrdError`] only if the synthetic generator itself cannot
    /// be constructed after the oracle path failed.
    pub fn begin(&self, boundary: &Polygon<f64>, period: &Period) -> Result<AnalysisStream, SrdError> {
        match self.oracle_run(boundary, period) {
            Ok(run) => {
                log::info!(
                    "Starting oracle-backed analysis: {} bands, period {period}",
                    run.bands().len()
                );
                Ok(AnalysisStream {
                    origin: StreamOrigin::Oracle,
                    events: Box::new(run),
                })
            }
            Err(e) => {
                log::warn!("Oracle analysis unavailable, using synthetic data: {e}");
                let run = SyntheticRun::new(boundary, &self.config.synthetic, &self.config.impact)?;
                Ok(AnalysisStream {
                    origin: StreamOrigin::Synthetic {
                        reason: e.to_string(),
                    },
                    events: Box::new(run),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{MultiPolygon, polygon};
    use policy_proof_srd_models::AnalysisEvent;

    use crate::oracle::{BandStats, OracleError, StatsOracle};

    struct DownSource;

    impl OracleSource for DownSource {
        fn connect(&self) -> Result<Box<dyn StatsOracle>, OracleError> {
            Err(OracleError::Unavailable {
                message: "credentials rejected".to_string(),
            })
        }
    }

    /// Connects fine, then fails every query.
    struct FlakySource;

    struct FlakyOracle;

    impl StatsOracle for FlakyOracle {
        fn query(&self, _ring: &MultiPolygon<f64>, _period: &Period) -> Result<BandStats, OracleError> {
            Err(OracleError::Unavailable {
                message: "initialization failed".to_string(),
            })
        }
    }

    impl OracleSource for FlakySource {
        fn connect(&self) -> Result<Box<dyn StatsOracle>, OracleError> {
            Ok(Box::new(FlakyOracle))
        }
    }

    fn boundary() -> Polygon<f64> {
        polygon![
            (x: -73.99, y: 40.73),
            (x: -73.97, y: 40.73),
            (x: -73.97, y: 40.75),
            (x: -73.99, y: 40.75),
            (x: -73.99, y: 40.73),
        ]
    }

    fn controller(source: Arc<dyn OracleSource>) -> FallbackController {
        FallbackController::new(source, SrdConfig::embedded().unwrap())
    }

    #[test]
    fn construction_failure_substitutes_synthetic() {
        let stream = controller(Arc::new(DownSource))
            .begin(&boundary(), &Period::from("2024"))
            .unwrap();

        assert!(matches!(
            &stream.origin,
            StreamOrigin::Synthetic { reason } if reason.contains("credentials rejected")
        ));

        let events: Vec<AnalysisEvent> = stream.events.map(Result::unwrap).collect();
        let points = events
            .iter()
            .filter(|e| matches!(e, AnalysisEvent::Point(_)))
            .count();
        assert_eq!(points, 41);
    }

    #[test]
    fn iteration_failure_is_not_recovered() {
        let stream = controller(Arc::new(FlakySource))
            .begin(&boundary(), &Period::from("2024"))
            .unwrap();
        assert_eq!(stream.origin, StreamOrigin::Oracle);

        let mut events = stream.events;
        assert!(matches!(events.next(), Some(Ok(AnalysisEvent::Bins(_)))));
        assert!(matches!(events.next(), Some(Err(SrdError::Oracle(_)))));
        assert!(events.next().is_none());
    }
}
