//! Hands analysis events from the blocking compute side to the async
//! delivery side.
//!
//! The SRD engine blocks on the oracle for every band, so each request
//! drives its run on a blocking thread and pushes messages through a
//! bounded channel. When the receiving side is dropped (the caller went
//! away) the next send fails and the run stops pulling from the oracle.

use std::sync::Arc;

use geo::Polygon;
use policy_proof_server_models::ServerFrame;
use policy_proof_srd::SrdError;
use policy_proof_srd::fallback::{FallbackController, StreamOrigin};
use policy_proof_srd_models::{AnalysisEvent, AnalyzeResponse, Period};
use tokio::sync::mpsc;

/// Messages buffered between the compute thread and the response stream.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// One step of a running analysis.
#[derive(Debug)]
pub enum PipelineMessage {
    /// The run was constructed.
    Started(StreamOrigin),
    /// An event from the run.
    Event(AnalysisEvent),
    /// The run failed; nothing follows.
    Failed(SrdError),
}

/// Starts an analysis on a blocking thread and returns the receiving end
/// of its message channel.
pub fn spawn_analysis(
    controller: Arc<FallbackController>,
    boundary: Polygon<f64>,
    period: Period,
) -> mpsc::Receiver<PipelineMessage> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || drive(&controller, &boundary, &period, &tx));
    rx
}

fn drive(
    controller: &FallbackController,
    boundary: &Polygon<f64>,
    period: &Period,
    tx: &mpsc::Sender<PipelineMessage>,
) {
    let stream = match controller.begin(boundary, period) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.blocking_send(PipelineMessage::Failed(e));
            return;
        }
    };

    if tx.blocking_send(PipelineMessage::Started(stream.origin)).is_err() {
        return;
    }

    for item in stream.events {
        let (message, last) = match item {
            Ok(event) => (PipelineMessage::Event(event), false),
            Err(e) => (PipelineMessage::Failed(e), true),
        };
        if tx.blocking_send(message).is_err() {
            log::debug!("Analysis consumer disconnected, stopping run");
            return;
        }
        if last {
            return;
        }
    }
}

/// Status frame broadcast to observers for one pipeline message.
#[must_use]
pub fn status_frame(message: &PipelineMessage) -> ServerFrame {
    match message {
        PipelineMessage::Started(StreamOrigin::Oracle) => {
            ServerFrame::info("Analysis started: querying statistics oracle.")
        }
        PipelineMessage::Started(StreamOrigin::Synthetic { reason }) => ServerFrame::info(format!(
            "Statistics oracle unavailable ({reason}); using synthetic data."
        )),
        PipelineMessage::Event(AnalysisEvent::Bins(bins)) => match (bins.first(), bins.last()) {
            (Some(first), Some(last)) => ServerFrame::info(format!(
                "Bins initialized: {} edges from {first} km to {last} km.",
                bins.len()
            )),
            _ => ServerFrame::info("Bins initialized."),
        },
        PipelineMessage::Event(AnalysisEvent::Point(point)) => {
            let count = point.count.unwrap_or(0);
            match point.value {
                Some(value) => ServerFrame::info(format!(
                    "Sampled {:+.2} km: value {value:.2} from {count} samples.",
                    point.distance_km
                )),
                None => ServerFrame::info(format!(
                    "Sampled {:+.2} km: no data.",
                    point.distance_km
                )),
            }
        }
        PipelineMessage::Event(AnalysisEvent::ImpactScore(score)) => {
            ServerFrame::info(format!("Impact score: {score:.3}."))
        }
        PipelineMessage::Failed(e) => ServerFrame::error(format!("Analysis failed: {e}")),
    }
}

/// Status frame broadcast once the combined result is ready.
#[must_use]
pub fn completion_frame(response: &AnalyzeResponse) -> ServerFrame {
    let policy = response
        .policy
        .as_deref()
        .map_or_else(String::new, |p| format!(" for {p}"));
    ServerFrame::info(format!(
        "Analysis complete{policy}: {} points, impact score {:.3}.",
        response.points.len(),
        response.impact_score
    ))
}
