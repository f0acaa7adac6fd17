//! Router assembly and the HTTP server loop.

use axum::Router;
use axum::routing::{get, post};
use eddy_core::EddyConfig;
use tower_http::cors::CorsLayer;

use crate::error::WebError;
use crate::handlers::{
    execute, head_file, remux_status, status_events, stream_file, stream_remuxed,
};
use crate::state::AppState;

/// Routes of the streaming server.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/stream/{info_hash}/{file_index}",
            get(stream_file).head(head_file),
        )
        .route("/remux/{info_hash}/{file_index}", get(stream_remuxed))
        .route("/remux/{info_hash}/{file_index}/status", get(remux_status))
        .route("/status/{info_hash}/{file_index}", get(status_events))
        .route("/api/execute", post(execute))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until Ctrl-C, then closes every session.
///
/// # Errors
/// - `WebError::Internal` - HTTP clients could not be built
/// - `WebError::Unavailable` - The bind address is in use
pub async fn run_server(config: EddyConfig) -> Result<(), WebError> {
    let bind_address = config.streaming.bind_address;
    let state = AppState::production(config)?;
    let engine = state.engine.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| WebError::Unavailable {
            reason: format!("cannot bind {bind_address}: {e}"),
        })?;
    tracing::info!(address = %bind_address, "Eddy streaming server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .map_err(|e| WebError::Internal {
            reason: e.to_string(),
        })?;

    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "Engine shutdown failed");
    }
    Ok(())
}
