//! Alert gateway: ingests alerts from both detection engines, persists
//! them to an append-only log, and serves query/aggregation endpoints.

mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn, Level};

use crate::store::AlertStore;

#[derive(Clone)]
struct AppState {
    store: Arc<AlertStore>,
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
    engine: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let log_dir = std::env::var("ALERT_GATEWAY_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let host = std::env::var("ALERT_GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("ALERT_GATEWAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let state = AppState {
        store: Arc::new(AlertStore::new(&log_dir)),
    };

    let app = Router::new()
        .route("/alerts", post(ingest_alert))
        .route("/alerts", get(list_alerts))
        .route("/stats", get(get_stats))
        .route("/attack-details", get(get_attack_details))
        .route("/attack-type/:name", get(get_attack_type))
        .route("/health", get(get_health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Alert gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

/// Ingest one alert. Always answers 202, even for garbage, so detector
/// clients never enter a retry storm.
async fn ingest_alert(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => {
            let alert_id = state.store.ingest(&value);
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "accepted",
                    "alert_id": alert_id,
                    "message": "alert stored"
                })),
            )
        }
        Err(e) => {
            warn!("Discarding unparseable alert body: {}", e);
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "error",
                    "alert_id": serde_json::Value::Null,
                    "message": format!("invalid JSON: {}", e)
                })),
            )
        }
    }
}

async fn list_alerts(
    Query(params): Query<AlertsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let (total, alerts) = state.store.list(params.limit, params.engine.as_deref());
    Json(json!({
        "total": total,
        "alerts": alerts
    }))
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.stats())
}

async fn get_attack_details(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.attack_details())
}

async fn get_attack_type(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let alerts = state.store.by_attack_type(&name);
    Json(json!({
        "attack_type": name,
        "total": alerts.len(),
        "alerts": alerts
    }))
}

async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "alerts_count": state.store.len(),
        "timestamp": Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }))
}
