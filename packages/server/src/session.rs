//! Streaming session for one analyze request.
//!
//! Turns pipeline messages into NDJSON records, one record per event,
//! and accumulates points so the terminal combined record can be built
//! when the impact score arrives. Once the session is `Done` or
//! `Aborted` it produces nothing further.

use policy_proof_srd::fallback::StreamOrigin;
use policy_proof_srd_models::{AnalysisEvent, AnalysisResult, AnalyzeResponse, SamplePoint};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::PipelineMessage;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing received yet.
    Init,
    /// Origin known, waiting for bin edges.
    StreamingBins,
    /// Bins received; `0` counts points received so far.
    StreamingPoints(usize),
    /// Impact score received, building the combined record.
    Finalizing,
    /// Combined record emitted.
    Done,
    /// Stopped early; an error record was emitted.
    Aborted,
}

impl SessionState {
    /// Whether the session will produce no more records.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

/// Which records reach the primary caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitMode {
    /// Every event becomes a record.
    Incremental,
    /// Only the combined record is written (synthetic fallback).
    TerminalOnly,
}

/// An out-of-order event.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The event is not valid in the current state.
    #[error("unexpected {event} while {state:?}")]
    UnexpectedEvent {
        /// State the session was in.
        state: SessionState,
        /// Kind of event received.
        event: &'static str,
    },
}

/// One line of the analyze stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamRecord {
    /// Bin edges.
    Bins {
        /// Edges in km.
        bins: Vec<f64>,
    },
    /// A sampled band.
    Point {
        /// The sample.
        point: SamplePoint,
    },
    /// Terminal combined record.
    Complete(Box<AnalyzeResponse>),
    /// Terminal error record.
    Aborted {
        /// Always `"aborted"`.
        status: &'static str,
        /// What went wrong.
        error: String,
    },
}

impl StreamRecord {
    fn aborted(error: impl Into<String>) -> Self {
        Self::Aborted {
            status: "aborted",
            error: error.into(),
        }
    }

    /// Serializes the record as one NDJSON line.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the record cannot be serialized.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

fn event_kind(event: &AnalysisEvent) -> &'static str {
    match event {
        AnalysisEvent::Bins(_) => "bins",
        AnalysisEvent::Point(_) => "point",
        AnalysisEvent::ImpactScore(_) => "impact_score",
    }
}

/// State for one analyze request.
pub struct StreamingSession {
    policy: Option<String>,
    mode: EmitMode,
    state: SessionState,
    bins: Vec<f64>,
    points: Vec<SamplePoint>,
}

impl StreamingSession {
    /// Creates a session for a request carrying `policy`.
    #[must_use]
    pub const fn new(policy: Option<String>) -> Self {
        Self {
            policy,
            mode: EmitMode::Incremental,
            state: SessionState::Init,
            bins: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session will produce no more records.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Feeds one pipeline message and returns the record to write, if any.
    pub fn accept(&mut self, message: PipelineMessage) -> Option<StreamRecord> {
        if self.is_terminal() {
            return None;
        }

        match message {
            PipelineMessage::Started(origin) => {
                if self.state != SessionState::Init {
                    return Some(self.abort("analysis started twice"));
                }
                if matches!(origin, StreamOrigin::Synthetic { .. }) {
                    self.mode = EmitMode::TerminalOnly;
                }
                self.state = SessionState::StreamingBins;
                None
            }
            PipelineMessage::Event(event) => match self.advance(event) {
                Ok(record) => record,
                Err(e) => Some(self.abort(e.to_string())),
            },
            PipelineMessage::Failed(e) => Some(self.abort(e.to_string())),
        }
    }

    /// Closes the session when the pipeline ends. Returns an error record
    /// if it ended before the combined record was produced.
    pub fn finish(&mut self) -> Option<StreamRecord> {
        if self.is_terminal() {
            None
        } else {
            Some(self.abort("analysis ended before an impact score was produced"))
        }
    }

    fn abort(&mut self, error: impl Into<String>) -> StreamRecord {
        let error = error.into();
        log::error!("Analysis stream aborted in {:?}: {error}", self.state);
        self.state = SessionState::Aborted;
        StreamRecord::aborted(error)
    }

    fn emit(&self, record: StreamRecord) -> Option<StreamRecord> {
        match self.mode {
            EmitMode::Incremental => Some(record),
            EmitMode::TerminalOnly => None,
        }
    }

    fn advance(&mut self, event: AnalysisEvent) -> Result<Option<StreamRecord>, SessionError> {
        match (self.state, event) {
            (SessionState::StreamingBins, AnalysisEvent::Bins(bins)) => {
                self.bins.clone_from(&bins);
                self.state = SessionState::StreamingPoints(0);
                Ok(self.emit(StreamRecord::Bins { bins }))
            }
            (SessionState::StreamingPoints(received), AnalysisEvent::Point(point)) => {
                self.points.push(point);
                self.state = SessionState::StreamingPoints(received + 1);
                Ok(self.emit(StreamRecord::Point { point }))
            }
            (SessionState::StreamingPoints(_), AnalysisEvent::ImpactScore(impact_score)) => {
                self.state = SessionState::Finalizing;
                let result = AnalysisResult {
                    impact_score,
                    points: std::mem::take(&mut self.points),
                    bins: std::mem::take(&mut self.bins),
                };
                let response = AnalyzeResponse::from_result(self.policy.clone(), result);
                self.state = SessionState::Done;
                Ok(Some(StreamRecord::Complete(Box::new(response))))
            }
            (state, event) => Err(SessionError::UnexpectedEvent {
                state,
                event: event_kind(&event),
            }),
        }
    }
}
