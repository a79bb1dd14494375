/// Operator HTTP API: `/health`, `/metrics` and `/stats`

use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::metrics::prometheus as metrics;
use crate::stratum::PoolContext;

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<PoolContext>,
    pub start_time: i64,
}

impl ApiState {
    pub fn new(ctx: Arc<PoolContext>) -> Self {
        Self { ctx, start_time: Utc::now().timestamp() }
    }
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn api_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let ledger = state.ctx.ledger.snapshot();
    let job = state.ctx.jobs.current_job();
    let uptime_secs = Utc::now().timestamp().saturating_sub(state.start_time);

    Json(json!({
        "ok": true,
        "pool": {
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": state.start_time,
            "uptime_secs": uptime_secs,
            "difficulty": state.ctx.config.difficulty,
            "share_validation": format!("{:?}", state.ctx.validator.policy()).to_lowercase(),
            "connections": metrics::active_connection_count(),
        },
        "job": {
            "id": job.job_id.to_string(),
            "time": job.time,
            "bits": job.bits,
        },
        "shares": {
            "accepted": ledger.total_accepted,
            "rejected": ledger.total_rejected,
        },
        "sessions": ledger.sessions,
    }))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .route("/stats", get(api_stats))
        .with_state(state)
}

pub async fn serve(listen: &str, state: ApiState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("📡 Pool API listening on {}", listen);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
