use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatekeeper_ratelimit::{
    config::load_settings,
    metrics::Metrics,
    middleware::gatekeeper,
    service::RateLimitService,
};

#[derive(Clone)]
struct AppState {
    service: Arc<RateLimitService>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatekeeper_ratelimit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gatekeeper Rate Limit demo server");

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let settings = load_settings(config_path.as_deref())?;

    let metrics = Arc::new(Metrics::new()?);
    let service = Arc::new(RateLimitService::new(settings, metrics.clone()).await?);
    let state = AppState {
        service: service.clone(),
        metrics,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = service.spawn_maintenance(shutdown_rx);

    let http_addr = std::env::var("HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    let app = router(state);
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    maintenance.await?;

    info!("Service stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    let gate = state.service.gatekeeper_state();

    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/documents", get(list_documents))
        .route("/admin/users", get(list_users))
        .layer(axum::middleware::from_fn_with_state(gate, gatekeeper))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.service.engine().store_health();
    Json(json!({
        "status": "ok",
        "counter_store": if health.is_healthy() { "healthy" } else { "degraded" },
        "last_probe": health.last_probe().map(|t| t.to_rfc3339()),
        "rate_limiting_enabled": state.service.settings().enabled,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn list_documents() -> Json<serde_json::Value> {
    Json(json!({ "documents": [] }))
}

async fn list_users() -> Json<serde_json::Value> {
    Json(json!({ "users": [] }))
}
