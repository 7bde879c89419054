//! Router assembly and server lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::get;
use spillway_core::capture::SessionManager;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::handlers;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Root of the segmented-output tree served under `/hls`.
    pub hls_dir: PathBuf,
    /// Base URL used when a request carries no Host header.
    pub fallback_base_url: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let hls_dir = manager.config().transcode.hls_dir.clone();
        let fallback_base_url = manager.config().tvheadend.stream_base_url.clone();
        Self {
            manager,
            hls_dir,
            fallback_base_url,
            started_at: Instant::now(),
        }
    }
}

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::server_status))
        .route("/streams", get(handlers::streams_list))
        .route("/playlist.m3u", get(handlers::playlist_m3u))
        .route("/hls/{site_id}/{file}", get(handlers::hls_file))
        .route("/{site_id}/stream", get(handlers::stream))
        .route("/{site_id}/status", get(handlers::site_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves until ctrl-c or SIGTERM.
///
/// # Errors
/// - `Box<dyn std::error::Error>` - Bind or serve failure
pub async fn run_server(
    manager: Arc<SessionManager>,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(AppState::new(manager));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP relay listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/ctrl-c).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install ctrl-c handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received ctrl-c, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
