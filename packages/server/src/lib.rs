#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for policy-proof SRD analyses.
//!
//! Analyses are served as a single JSON result from `/api/analyze` or as
//! an NDJSON stream from `/api/analyze/stream`. Every step of every
//! analysis is also mirrored as a short status frame to all clients
//! connected to the `/ws/observe` WebSocket, which doubles as a chat
//! channel for the assistant.

pub mod assistant;
mod handlers;
mod observer;
pub mod pipeline;
pub mod session;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use policy_proof_broadcast::ObserverHub;
use policy_proof_server_models::ServerFrame;
use policy_proof_srd::config::SrdConfig;
use policy_proof_srd::fallback::FallbackController;
use policy_proof_srd::oracle::{HttpOracleSource, OracleSource};

use crate::assistant::{ChatResponder, RuleBasedResponder};

/// Origins allowed when `ALLOWED_ORIGINS` is unset.
const DEFAULT_ALLOWED_ORIGINS: &str =
    "http://localhost:3000,http://127.0.0.1:3000,http://localhost:5173,http://127.0.0.1:5173";

/// Shared application state.
pub struct AppState {
    /// Builds analysis runs, falling back to synthetic data.
    pub controller: Arc<FallbackController>,
    /// Observers connected to `/ws/observe`.
    pub hub: Arc<ObserverHub<ServerFrame>>,
    /// Answers chat messages from observers.
    pub responder: Arc<dyn ChatResponder>,
}

impl AppState {
    /// Bundles the shared components.
    #[must_use]
    pub fn new(
        controller: Arc<FallbackController>,
        hub: Arc<ObserverHub<ServerFrame>>,
        responder: Arc<dyn ChatResponder>,
    ) -> Self {
        Self {
            controller,
            hub,
            responder,
        }
    }

    /// Period used when a request does not name one.
    #[must_use]
    pub fn default_period(&self) -> &str {
        &self.controller.config().default_period
    }
}

/// Registers every route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/analyze", web::post().to(handlers::analyze))
            .route("/analyze/stream", web::post().to(handlers::analyze_stream)),
    )
    .route("/ws/observe", web::get().to(observer::observe));
}

fn allowed_origins() -> Vec<String> {
    std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string())
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn cors(origins: &[String]) -> Cors {
    if origins.iter().any(|origin| origin == "*") {
        return Cors::permissive();
    }

    origins.iter().fold(
        Cors::default()
            .allow_any_method()
            .allow_any_header()
            .supports_credentials(),
        |cors, origin| cors.allowed_origin(origin),
    )
}

/// Starts the HTTP server and blocks until it shuts down.
///
/// # Errors
///
/// Returns an error if the analysis configuration cannot be loaded or the
/// server fails to bind.
#[allow(clippy::future_not_send)]
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let config = SrdConfig::from_env().map_err(std::io::Error::other)?;
    match &config.oracle.base_url {
        Some(url) => log::info!("Statistics oracle at {url}"),
        None => log::warn!("SRD_ORACLE_URL not set, every analysis will use synthetic data"),
    }

    let source: Arc<dyn OracleSource> = Arc::new(HttpOracleSource::new(config.oracle.clone()));
    let state = web::Data::new(AppState::new(
        Arc::new(FallbackController::new(source, config)),
        Arc::new(ObserverHub::new()),
        Arc::new(RuleBasedResponder),
    ));

    let origins = allowed_origins();
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        App::new()
            .wrap(cors(&origins))
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
