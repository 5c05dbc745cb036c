//! Runs one session's strategy pipeline.
//!
//! Reads a `RunnableSession` as JSON on stdin. Exits 0 when the session
//! passes its alert threshold, 1 when it fails it, 2 on any error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use app_scanner::errors::AppError;
use app_scanner::models::job::SutKind;
use app_scanner::models::scan::{SessionExit, Verdict};
use app_scanner::models::session::RunnableSession;
use app_scanner::services::browser::{BrowserDriver, WebDriverSession};
use app_scanner::services::emissary::{EmissaryApi, HttpEmissary};
use app_scanner::services::publisher::{self, ProgressPublisher, EVENT_TESTER_MESSAGE};
use app_scanner::services::session_state::SessionState;
use app_scanner::services::strategies::{Pipeline, StageContext};
use mimalloc::MiMalloc;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "app_scanner=debug,session_runner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let session = match read_session().await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "Could not read the session from stdin");
            return exit_code(SessionExit::ERROR_CODE);
        }
    };
    let session_id = session.session_id().to_string();
    let publisher: Arc<dyn ProgressPublisher> =
        Arc::from(publisher::from_config(session.redis_url.as_deref()).await);

    match run(session, publisher.clone()).await {
        Ok(verdict) => {
            tracing::info!(
                session_id = %session_id,
                alert_count = verdict.alert_count,
                alert_threshold = verdict.alert_threshold,
                passed = verdict.passed,
                "Session finished"
            );
            exit_code(if verdict.passed {
                SessionExit::PASS_CODE
            } else {
                SessionExit::FAIL_CODE
            })
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Session errored");
            publisher
                .publish(
                    &session_id,
                    json!({ "message": format!("Tester error: {}", e.build_user_message()) }),
                    EVENT_TESTER_MESSAGE,
                )
                .await;
            exit_code(SessionExit::ERROR_CODE)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

async fn read_session() -> anyhow::Result<RunnableSession> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    Ok(serde_json::from_slice(&input)?)
}

async fn run(
    session: RunnableSession,
    publisher: Arc<dyn ProgressPublisher>,
) -> Result<Verdict, AppError> {
    let session_id = session.session_id().to_string();
    session
        .emissary
        .validate()
        .map_err(|e| e.in_session(&session_id))?;
    let emissary: Arc<dyn EmissaryApi> = Arc::new(HttpEmissary::new(
        &session.endpoints.emissary,
        &session.emissary.api_key,
    )?);

    let browser: Option<Arc<dyn BrowserDriver>> = match (
        session.sut.kind,
        session.sut.browser,
        &session.endpoints.selenium,
    ) {
        (SutKind::BrowserApp, Some(browser), Some(sidecar)) => {
            let driver = WebDriverSession::start(sidecar, browser, &session.endpoints.emissary)
                .await
                .map_err(|e| e.in_session(&session_id))?;
            Some(Arc::new(driver) as Arc<dyn BrowserDriver>)
        }
        _ => None,
    };

    let ctx = StageContext {
        sut: session.sut,
        routes: session.routes,
        emissary,
        browser: browser.clone(),
        publisher,
        state: Arc::new(SessionState::new()),
        settings: session.emissary,
        report_dir: PathBuf::from(session.report_dir),
    };

    let outcome = match Pipeline::build(&ctx) {
        Ok(pipeline) => {
            tracing::info!(session_id = %session_id, plan = ?pipeline.plan(), "Pipeline resolved");
            pipeline.run().await
        }
        Err(e) => Err(e.in_session(&session_id)),
    };

    if let Some(browser) = browser {
        if let Err(e) = browser.quit().await {
            tracing::warn!(session_id = %session_id, error = %e, "Browser session did not quit cleanly");
        }
    }
    outcome
}
