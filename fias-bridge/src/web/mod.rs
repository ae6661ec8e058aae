//! Admin web API for monitoring the PMS link and the guest registry.

pub mod api;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub use state::WebState;

/// Build the API router.
pub fn router(web_state: Arc<WebState>) -> Router {
    Router::new()
        // Server
        .route("/api/server/status", get(api::get_server_status))
        .route("/api/server/disconnect", post(api::disconnect))
        // Guests
        .route("/api/guests", get(api::get_guests).delete(api::clear_guests))
        .route("/api/guests/search", get(api::search_guests))
        .route("/api/guests/test", post(api::add_test_guest).delete(api::clear_guests))
        .route("/api/guests/:reservation", get(api::get_guest))
        // Database
        .route("/api/database/resync", post(api::request_resync))
        .route("/api/database/start-sync", post(api::start_sync))
        .route("/api/database/push-guests", post(api::push_guests))
        .route("/api/database/stats", get(api::get_stats))
        .route("/api/database/clear", delete(api::clear_database))
        // Logs
        .route("/api/logs", get(api::get_logs).delete(api::clear_logs))
        .with_state(web_state)
        .layer(CorsLayer::permissive())
}

/// Serve the admin API until `shutdown` is cancelled.
pub async fn start_web_server(
    listen_addr: SocketAddr,
    web_state: Arc<WebState>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(web_state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("Admin API listening on http://{}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    log::info!("Admin API stopped");
    Ok(())
}
