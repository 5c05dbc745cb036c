//! Health check endpoints for liveness and readiness probes.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::errors::ApiResponse;
use crate::services::tester::TesterStatus;
use crate::AppState;

/// Readiness probe detail.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub tester: TesterStatus,
    pub redis: String,
}

/// Liveness probe. Always OK while the process runs.
pub async fn live() -> &'static str {
    "OK"
}

/// Readiness probe. Reports the tester state and Redis connectivity.
pub async fn ready(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    let redis_status = match state.config.redis_url.as_deref() {
        None => "not configured".to_string(),
        Some(url) => match redis::Client::open(url) {
            Ok(client) => match client.get_multiplexed_async_connection().await {
                Ok(_) => "connected".to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis health check failed");
                    format!("error: {e}")
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Redis client creation failed");
                format!("error: {e}")
            }
        },
    };

    ApiResponse::success(HealthStatus {
        status: "ok".to_string(),
        tester: state.tester.status(),
        redis: redis_status,
    })
}
