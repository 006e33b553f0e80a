//! # ASR Relay - Main Application Entry Point
//!
//! Relays realtime audio to the DashScope speech recognition service and streams the
//! recognized text back.
//!
//! ## Run Modes:
//! - **serve** (default): an Actix-web server accepts audio clients over WebSocket and
//!   runs one relay session per connection, next to health/metrics/config endpoints
//! - **playback**: relays one local PCM file, logs every result and exits
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared state, metrics and the session limit
//! - **relay**: Upstream protocol, session coordinator and its seams
//! - **websocket**: Client WebSocket actor and upgrade handler
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Runtime configuration endpoints
//! - **error**: Error types and HTTP error responses

mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod relay;       // Relay sessions (relay/ directory)
mod state;       // Application state management (state.rs)
mod websocket;   // Client WebSocket handling (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{bail, Result};
use config::{AppConfig, RunMode};
use relay::{DashScopeConnector, FileAudioSource, LogResultSink, RecognitionParams, SessionCoordinator};
use state::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use websocket::OriginPolicy;

/// The main application entry point.
///
/// ## Startup:
/// 1. Load `.env`, then set up logging
/// 2. Load and validate configuration; a missing API key stops here
/// 3. Run the selected mode
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    config.require_api_key()?;

    info!("Starting asr-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        upstream = %config.upstream.url,
        model = %config.upstream.model,
        sample_rate = config.upstream.sample_rate,
        "Upstream recognition service configured"
    );

    match config.mode {
        RunMode::Serve => run_server(config).await,
        RunMode::Playback => run_playback(&config).await,
    }
}

/// Serve audio clients until SIGINT/SIGTERM.
async fn run_server(config: AppConfig) -> Result<()> {
    let policy = OriginPolicy::from_origins(&config.server.allowed_origins);
    if policy.is_allow_any() {
        warn!("server.allowed_origins allows any origin; restrict it for browser-facing deployments");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let ws_path = config.server.ws_path.clone();

    info!("Starting HTTP server on {} (WebSocket path {})", bind_addr, ws_path);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors_for(&policy))
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route(&ws_path, web::get().to(websocket::relay_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Relay `playback.file` once. Any session error ends the process with an error.
async fn run_playback(config: &AppConfig) -> Result<()> {
    info!(file = %config.playback.file, "Running offline playback");

    let source = FileAudioSource::open(
        &config.playback.file,
        config.playback.chunk_size,
        config.playback.chunk_interval(),
    )
    .await?;

    let report = SessionCoordinator::new(
        DashScopeConnector::new(&config.upstream),
        RecognitionParams::from_config(&config.upstream),
    )
    .with_timeouts(config.upstream.task_start_timeout(), config.upstream.finish_timeout())
    .run(source, LogResultSink)
    .await?;

    if !report.end.is_success() {
        bail!("playback session ended: {}", report.end.describe());
    }

    info!(
        task_id = %report.task_id,
        bytes = report.audio_bytes,
        results = report.listener.results_emitted,
        "Playback finished"
    );
    Ok(())
}

/// CORS for the HTTP endpoints, following the same origin policy as the relay.
fn cors_for(policy: &OriginPolicy) -> Cors {
    let cors = match policy {
        OriginPolicy::AllowAny => Cors::default().allow_any_origin(),
        OriginPolicy::AllowList(origins) => origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin)),
    };

    cors.allow_any_method().allow_any_header().max_age(3600)
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "asr_relay=trace")
/// - If not set, defaults to "asr_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}; falling back to Ctrl+C", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
