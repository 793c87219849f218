//! HTTP handler functions for the policy-proof API.

use std::sync::Arc;

use actix_web::{HttpResponse, web};
use geo::Polygon;
use policy_proof_broadcast::ObserverHub;
use policy_proof_server_models::{AnalyzeRequest, ApiHealth, ServerFrame};
use policy_proof_srd_models::Period;
use serde_json::json;
use tokio::sync::mpsc;

use crate::AppState;
use crate::pipeline::{self, PipelineMessage};
use crate::session::{StreamRecord, StreamingSession};

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Resolves the boundary and period, or the 400 response to send instead.
fn prepare(state: &AppState, request: &AnalyzeRequest) -> Result<(Polygon<f64>, Period), HttpResponse> {
    let boundary = request.boundary().map_err(|e| {
        log::warn!("Rejected analyze request: {e}");
        HttpResponse::BadRequest().json(json!({ "error": e.to_string() }))
    })?;
    let period = request.period_or(state.default_period());
    Ok((boundary, period))
}

/// Mirrors `message` to observers and feeds it to the session.
fn relay(
    hub: &ObserverHub<ServerFrame>,
    session: &mut StreamingSession,
    message: PipelineMessage,
) -> Option<StreamRecord> {
    hub.broadcast(&pipeline::status_frame(&message));
    let record = session.accept(message);
    if let Some(StreamRecord::Complete(response)) = &record {
        log::info!(
            "Analysis complete: {} points, impact score {:.3}",
            response.points.len(),
            response.impact_score
        );
        hub.broadcast(&pipeline::completion_frame(response));
    }
    record
}

/// Next record from the pipeline, or the session's closing record once
/// the pipeline is exhausted.
async fn next_record(
    rx: &mut mpsc::Receiver<PipelineMessage>,
    hub: &ObserverHub<ServerFrame>,
    session: &mut StreamingSession,
) -> Option<StreamRecord> {
    while !session.is_terminal() {
        let Some(message) = rx.recv().await else {
            return session.finish();
        };
        if let Some(record) = relay(hub, session, message) {
            return Some(record);
        }
    }
    None
}

/// Starts the analysis and a delivery task that mirrors it to observers
/// until the session ends, whether or not the caller is still reading.
/// Returns the caller's record channel.
fn start_delivery(
    state: &AppState,
    boundary: Polygon<f64>,
    period: Period,
    policy: Option<String>,
) -> mpsc::Receiver<StreamRecord> {
    let mut rx = pipeline::spawn_analysis(Arc::clone(&state.controller), boundary, period);
    let hub = Arc::clone(&state.hub);
    let (records_tx, records_rx) = mpsc::channel(pipeline::EVENT_CHANNEL_CAPACITY);

    actix_rt::spawn(async move {
        let mut session = StreamingSession::new(policy);
        let mut caller_connected = true;

        while let Some(record) = next_record(&mut rx, &hub, &mut session).await {
            if caller_connected && records_tx.send(record).await.is_err() {
                log::info!("Caller disconnected, finishing analysis for observers");
                caller_connected = false;
            }
        }
    });

    records_rx
}

/// `POST /api/analyze`
///
/// Runs the analysis to completion and returns the combined result.
pub async fn analyze(state: web::Data<AppState>, body: web::Json<AnalyzeRequest>) -> HttpResponse {
    let request = body.into_inner();
    let (boundary, period) = match prepare(&state, &request) {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };

    let mut records = start_delivery(&state, boundary, period, request.policy);

    while let Some(record) = records.recv().await {
        match record {
            StreamRecord::Complete(response) => return HttpResponse::Ok().json(response),
            StreamRecord::Aborted { error, .. } => {
                return HttpResponse::BadGateway().json(json!({ "error": error }));
            }
            StreamRecord::Bins { .. } | StreamRecord::Point { .. } => {}
        }
    }

    HttpResponse::BadGateway().json(json!({ "error": "analysis produced no result" }))
}

/// `POST /api/analyze/stream`
///
/// Streams the analysis as newline-delimited JSON: bin edges, one record
/// per point, then the combined result. A failure after the stream has
/// started ends it with a single `{"status":"aborted"}` record.
pub async fn analyze_stream(
    state: web::Data<AppState>,
    body: web::Json<AnalyzeRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let (boundary, period) = match prepare(&state, &request) {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };

    log::info!("Streaming analysis for period {period}");

    let mut records = start_delivery(&state, boundary, period, request.policy);

    let stream = async_stream::stream! {
        while let Some(record) = records.recv().await {
            yield record
                .to_line()
                .map(web::Bytes::from)
                .map_err(actix_web::error::ErrorInternalServerError);
        }
    };

    HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, test};
    use geo::MultiPolygon;
    use policy_proof_broadcast::ChannelObserver;
    use policy_proof_srd::config::SrdConfig;
    use policy_proof_srd::fallback::FallbackController;
    use policy_proof_srd::oracle::{BandStats, OracleError, OracleSource, StatsOracle};

    use crate::assistant::RuleBasedResponder;

    struct DownSource;

    impl OracleSource for DownSource {
        fn connect(&self) -> Result<Box<dyn StatsOracle>, OracleError> {
            Err(OracleError::NotConfigured)
        }
    }

    /// Every band answers with the same statistics.
    struct ConstantSource {
        mean: Option<f64>,
        count: u64,
    }

    struct ConstantOracle {
        stats: BandStats,
    }

    impl StatsOracle for ConstantOracle {
        fn query(&self, _ring: &MultiPolygon<f64>, _period: &Period) -> Result<BandStats, OracleError> {
            Ok(self.stats)
        }
    }

    impl OracleSource for ConstantSource {
        fn connect(&self) -> Result<Box<dyn StatsOracle>, OracleError> {
            Ok(Box::new(ConstantOracle {
                stats: BandStats {
                    mean: self.mean,
                    count: self.count,
                },
            }))
        }
    }

    fn state(source: Arc<dyn OracleSource>) -> web::Data<AppState> {
        let controller = FallbackController::new(source, SrdConfig::embedded().unwrap());
        web::Data::new(AppState::new(
            Arc::new(controller),
            Arc::new(ObserverHub::new()),
            Arc::new(RuleBasedResponder),
        ))
    }

    fn body() -> serde_json::Value {
        json!({
            "geometry": {
                "type": "Polygon",
                "coordinates": [[
                    [-0.13, 51.50], [-0.11, 51.50], [-0.11, 51.52], [-0.13, 51.52], [-0.13, 51.50]
                ]]
            },
            "policy": "ULEZ"
        })
    }

    fn lines(bytes: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[actix_web::test]
    async fn health_reports_version() {
        let app = test::init_service(App::new().configure(crate::configure)).await;
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp["healthy"], true);
        assert_eq!(resp["version"], env!("CARGO_PKG_VERSION"));
    }

    #[actix_web::test]
    async fn oracle_stream_has_bins_points_and_one_terminal_record() {
        let source = ConstantSource {
            mean: Some(0.12),
            count: 30,
        };
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(source)))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/analyze/stream")
            .set_json(body())
            .to_request();
        let records = lines(&test::call_and_read_body(&app, req).await);

        assert_eq!(records.len(), 1 + 40 + 1);
        assert_eq!(records[0]["bins"].as_array().unwrap().len(), 41);
        assert!(records[1..41].iter().all(|r| r.get("point").is_some()));

        let last = &records[41];
        assert_eq!(last["policy"], "ULEZ");
        assert_eq!(last["points"].as_array().unwrap().len(), 40);
        // A flat field has no discontinuity.
        assert!(last["impact_score"].as_f64().unwrap().abs() < 1e-9);
        assert_eq!(records.iter().filter(|r| r.get("impact_score").is_some()).count(), 1);
    }

    #[actix_web::test]
    async fn fallback_stream_has_only_the_terminal_record() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(DownSource)))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/analyze/stream")
            .set_json(body())
            .to_request();
        let records = lines(&test::call_and_read_body(&app, req).await);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["points"].as_array().unwrap().len(), 41);
        assert!(records[0]["impact_score"].is_f64());
        assert_eq!(records[0]["charts"].as_array().unwrap().len(), 2);
    }

    #[actix_web::test]
    async fn empty_oracle_aborts_after_partial_output() {
        let source = ConstantSource {
            mean: None,
            count: 0,
        };
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(source)))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/analyze/stream")
            .set_json(body())
            .to_request();
        let records = lines(&test::call_and_read_body(&app, req).await);

        assert_eq!(records.len(), 1 + 40 + 1);
        assert!(records[40]["point"]["value"].is_null());
        assert_eq!(records[41]["status"], "aborted");
        assert!(records[41]["error"].as_str().unwrap().contains("Insufficient data"));
    }

    #[actix_web::test]
    async fn missing_geometry_is_rejected_before_streaming() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(DownSource)))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/analyze/stream")
            .set_json(json!({ "policy": "nothing" }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("No valid GeoJSON geometry"));
    }

    #[actix_web::test]
    async fn analyze_returns_the_combined_result() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(DownSource)))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/analyze")
            .set_json(body())
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp["policy"], "ULEZ");
        assert_eq!(resp["points"].as_array().unwrap().len(), 41);
        assert_eq!(resp["bins"].as_array().unwrap().len(), 11);
    }

    #[actix_web::test]
    async fn analyze_maps_abort_to_bad_gateway() {
        let source = ConstantSource {
            mean: None,
            count: 0,
        };
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(source)))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/analyze")
            .set_json(body())
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn observers_see_every_synthetic_event() {
        let state = state(Arc::new(DownSource));
        let (tx, mut rx) = mpsc::channel(128);
        state.hub.register(Arc::new(ChannelObserver::new(tx)));

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(crate::configure),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/api/analyze/stream")
            .set_json(body())
            .to_request();
        test::call_and_read_body(&app, req).await;

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }

        // started + bins + 41 points + impact + completion
        assert_eq!(frames.len(), 45);
        assert!(matches!(
            &frames[0],
            ServerFrame::Info { message } if message.contains("synthetic data")
        ));
        assert!(matches!(
            frames.last(),
            Some(ServerFrame::Info { message }) if message.contains("for ULEZ")
        ));
    }

    #[actix_web::test]
    async fn empty_polygon_is_rejected_before_streaming() {
        let state = state(Arc::new(DownSource));
        let (tx, mut rx) = mpsc::channel(8);
        state.hub.register(Arc::new(ChannelObserver::new(tx)));

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(crate::configure),
        )
        .await;

        for uri in ["/api/analyze/stream", "/api/analyze"] {
            let req = test::TestRequest::post()
                .uri(uri)
                .set_json(json!({ "geometry": { "type": "Polygon", "coordinates": [] } }))
                .to_request();
            let resp = test::call_service(&app, req).await;

            assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
            let body: serde_json::Value = test::read_body_json(resp).await;
            assert!(body["error"].as_str().unwrap().contains("empty"));
        }

        // Nothing was started, so observers heard nothing.
        assert!(rx.try_recv().is_err());
    }

    #[actix_web::test]
    async fn observers_get_the_completion_after_the_caller_leaves() {
        let source = ConstantSource {
            mean: Some(0.05),
            count: 12,
        };
        let state = state(Arc::new(source));
        let (tx, mut rx) = mpsc::channel(128);
        state.hub.register(Arc::new(ChannelObserver::new(tx)));

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(crate::configure),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/api/analyze/stream")
            .set_json(body())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        drop(resp);

        let mut frames = Vec::new();
        for _ in 0..100 {
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
            if frames.len() >= 44 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        // started + bins + 40 points + impact + completion
        assert_eq!(frames.len(), 44);
        assert!(matches!(
            frames.last(),
            Some(ServerFrame::Info { message }) if message.starts_with("Analysis complete for ULEZ")
        ));
    }
}
