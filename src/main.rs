use std::sync::Arc;

use app_scanner::config::AppConfig;
use app_scanner::routes;
use app_scanner::services::tester::Tester;
use app_scanner::AppState;
use mimalloc::MiMalloc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "app_scanner=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = AppConfig::from_env()?;
    let tester = Arc::new(Tester::from_config(config.clone()).await?);
    let state = AppState {
        config: config.clone(),
        tester,
    };

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(host = %addr, run_mode = ?config.run_mode, "Starting app scanner orchestrator");

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
