use anyhow::Result;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::{handlers, websocket};
use crate::engine::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/state", get(handlers::get_state))
        .route("/api/onboard", post(handlers::onboard_agent))
        .route(
            "/api/agent/:agent_id",
            get(handlers::get_agent).delete(handlers::delete_agent),
        )
        .route(
            "/api/agent/:agent_id/position",
            put(handlers::update_position),
        )
        .route(
            "/api/agent/:agent_id/metric_mapping",
            put(handlers::update_metric_mapping),
        )
        .route(
            "/api/agent/:agent_id/planet/:planet_id/status",
            put(handlers::set_planet_status),
        )
        .route(
            "/api/agent/:agent_id/planet/:planet_id/generate",
            post(handlers::generate_variant),
        )
        .route(
            "/api/agent/:agent_id/planet/:planet_id/deploy",
            post(handlers::deploy_variant),
        )
        .route("/api/telemetry", post(handlers::ingest_telemetry))
        .route("/api/optimizer", get(handlers::optimizer_status))
        .route("/api/optimizer/start", post(handlers::start_optimization))
        .route("/api/optimizer/stop", post(handlers::stop_optimization))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.hub)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(state: AppState, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(addr = %listener.local_addr()?, "Cockpit hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
