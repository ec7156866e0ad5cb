//! Router construction and the serve loop.

use crate::routes;
use crate::state::AppState;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use kbqa_core::{AppConfig, AppError, AppResult};
use kbqa_knowledge::Services;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the router. An empty `cors_origins` allows any origin.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    let cors = if cors_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|origin| match origin.trim().parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        cors.allow_origin(origins)
    };

    Router::new()
        .route("/search", post(routes::search))
        .route("/conversation", post(routes::search))
        .route("/feedback", post(routes::feedback).get(routes::list_feedback))
        .route("/feedback/stats", get(routes::feedback_stats))
        .route("/metrics", get(routes::metrics))
        .route("/health", get(routes::health))
        .route("/admin/index/rebuild", post(routes::rebuild_index))
        .route("/admin/index/status", get(routes::index_status))
        .route("/admin/evaluation", get(routes::evaluation))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
///
/// Installs the persisted index snapshot, starts the synchronizer loop,
/// then accepts connections on `listen`. The synchronizer is stopped after
/// in-flight requests finish.
pub async fn serve(
    config: &AppConfig,
    services: Services,
    listen: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> AppResult<()> {
    match services.synchronizer.load_persisted().await {
        Ok(true) => tracing::info!(
            entries = services.index.len(),
            "Serving persisted index until the first sync"
        ),
        Ok(false) => tracing::info!("No persisted index; building from the store"),
        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable index snapshot"),
    }

    let handle = Arc::new(services.synchronizer.clone().spawn(services.sync_interval));
    if services.sync_interval.is_none() {
        // Without the periodic loop nothing else builds the first index.
        if let Err(e) = services.synchronizer.sync_once().await {
            tracing::error!(error = %e, "Initial index build failed");
        }
    }

    let state = AppState::new(&services, handle.clone());
    let router = build_router(state, &config.server.cors_origins);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| AppError::Config(format!("Cannot listen on {}: {}", listen, e)))?;
    tracing::info!(address = %listen, "HTTP server listening");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;

    handle.shutdown().await;
    tracing::info!("HTTP server stopped");

    result.map_err(AppError::Io)
}
