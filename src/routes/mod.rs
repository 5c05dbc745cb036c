//! Route definitions for the scanner orchestration API.

pub mod health;
pub mod tester;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

/// Assemble the full API router.
pub fn router(state: AppState) -> Router {
    let tester = Router::new()
        .route("/run-job", post(tester::run_job))
        .route("/init", post(tester::init_tester))
        .route("/start", post(tester::start_sessions))
        .route("/reset", post(tester::reset_tester));

    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .nest("/api/v1/tester", tester)
        .with_state(state)
}
