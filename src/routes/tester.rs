//! Tester routes: job submission and lifecycle control.

use axum::{extract::State, Json};

use crate::errors::{ApiResponse, AppError};
use crate::models::job::Job;
use crate::services::tester::{InitOutcome, RunStatus};
use crate::AppState;

/// POST /api/v1/tester/run-job: initialise and start a job in one call.
pub async fn run_job(
    State(state): State<AppState>,
    Json(job): Json<Job>,
) -> Result<Json<ApiResponse<RunStatus>>, AppError> {
    let status = state.tester.run_job(job).await?;
    Ok(ApiResponse::success(status))
}

/// POST /api/v1/tester/init: provision and ready workers for every session.
pub async fn init_tester(
    State(state): State<AppState>,
    Json(job): Json<Job>,
) -> Result<Json<ApiResponse<InitOutcome>>, AppError> {
    let outcome = state.tester.init_tester(job).await?;
    Ok(ApiResponse::success(outcome))
}

/// POST /api/v1/tester/start: launch the initialised sessions.
pub async fn start_sessions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<RunStatus>>, AppError> {
    Ok(ApiResponse::success(state.tester.start_sessions()?))
}

/// POST /api/v1/tester/reset: release an initialised run.
pub async fn reset_tester(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<RunStatus>>, AppError> {
    let status = state.tester.reset_tester().await?;
    Ok(ApiResponse::success(status))
}
