//! End-to-end tests over real HTTP.
//!
//! A fake Emissary is served by axum on a random port; the session pipeline
//! talks to it through `HttpEmissary` exactly as the `session-runner` does.
//! The orchestration API is exercised in-process through the router.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use app_scanner::config::{AppConfig, EmissaryConfig, ProvisioningConfig, RunMode};
use app_scanner::errors::AppError;
use app_scanner::models::job::Job;
use app_scanner::models::sut::Sut;
use app_scanner::services::emissary::HttpEmissary;
use app_scanner::services::publisher::LogPublisher;
use app_scanner::services::session_state::SessionState;
use app_scanner::services::strategies::{Pipeline, StageContext};
use app_scanner::services::tester::Tester;
use app_scanner::{routes, AppState};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

#[derive(Debug, Clone)]
struct Call {
    path: String,
    params: HashMap<String, String>,
    api_key: Option<String>,
}

#[derive(Clone, Default)]
struct FakeEmissary {
    calls: Arc<Mutex<Vec<Call>>>,
    /// Paths that answer with a structured Emissary error.
    failing: Arc<Vec<&'static str>>,
}

impl FakeEmissary {
    fn paths(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.path.clone()).collect()
    }

    fn call(&self, path: &str) -> Call {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.path == path)
            .cloned()
            .unwrap_or_else(|| panic!("no call to {path}"))
    }
}

async fn emissary_api(
    State(fake): State<FakeEmissary>,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let path = uri
        .path()
        .trim_start_matches("/JSON/")
        .trim_start_matches("/OTHER/")
        .trim_end_matches('/')
        .to_string();
    fake.calls.lock().unwrap().push(Call {
        path: path.clone(),
        params,
        api_key: headers
            .get("X-ZAP-API-Key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    if fake.failing.contains(&path.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": "illegal_parameter", "message": "Provided parameter has illegal or unrecognized value" })),
        )
            .into_response();
    }

    let body = match path.as_str() {
        "context/action/newContext" => json!({ "contextId": "1" }),
        "users/action/newUser" => json!({ "userId": "5" }),
        "spider/action/scanAsUser" | "ascan/action/scanAsUser" => json!({ "scanAsUser": "0" }),
        "spider/view/status" | "ascan/view/status" => json!({ "status": "100" }),
        "ascan/view/alertsIds" => json!({ "alertsIds": ["7", "8"] }),
        "core/view/alerts" => json!({
            "alerts": [
                { "id": "7", "pluginId": "40012", "alert": "Cross Site Scripting (Reflected)", "risk": "High" },
                { "id": "8", "pluginId": "40026", "alert": "Cross Site Scripting (DOM Based)", "risk": "High" }
            ]
        }),
        "core/other/mdreport" => return "# Emissary report".into_response(),
        _ => json!({ "Result": "OK" }),
    };
    Json(body).into_response()
}

async fn start_emissary(fake: FakeEmissary) -> SocketAddr {
    let app = axum::Router::new()
        .fallback(emissary_api)
        .with_state(fake);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn api_job(alert_threshold: u32) -> Job {
    serde_json::from_value(json!({
        "data": {
            "type": "Api",
            "attributes": {
                "sutIp": "pt-sut-api",
                "sutPort": 443,
                "sutProtocol": "https",
                "loggedOutIndicator": "401 Unauthorized",
                "openApi": { "importUrl": "https://pt-sut-api/openapi.json" },
                "bearerToken": "eyJhbGciOi",
                "reportFormats": ["md"]
            }
        },
        "included": [
            {
                "type": "appScanner",
                "id": "apiUser",
                "attributes": {
                    "username": "api-user",
                    "alertThreshold": alert_threshold,
                    "aScannerAttackStrength": "MEDIUM",
                    "aScannerAlertThreshold": "MEDIUM"
                }
            }
        ]
    }))
    .unwrap()
}

fn emissary_settings() -> EmissaryConfig {
    EmissaryConfig {
        api_key: "secret-key".to_string(),
        port: 8080,
        poll_interval_ms: 20,
        spider_timeout_secs: 30,
        scan_timeout_secs: 30,
        spider_max_children: 10,
        spider_subtree_only_api: true,
        spider_subtree_only_browser_app: false,
    }
}

fn context(addr: SocketAddr, job: &Job, report_dir: &Path) -> StageContext {
    let (sut, routes) = Sut::all_for_job(job).remove(0);
    StageContext {
        sut,
        routes,
        emissary: Arc::new(
            HttpEmissary::with_base_url(format!("http://{addr}"), "secret-key").unwrap(),
        ),
        browser: None,
        publisher: Arc::new(LogPublisher),
        state: Arc::new(SessionState::new()),
        settings: emissary_settings(),
        report_dir: report_dir.to_path_buf(),
    }
}

#[tokio::test]
async fn api_session_runs_every_stage_against_emissary() {
    let fake = FakeEmissary::default();
    let addr = start_emissary(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(addr, &api_job(1), dir.path());

    let pipeline = Pipeline::build(&ctx).unwrap();
    let verdict = tokio::time::timeout(Duration::from_secs(20), pipeline.run())
        .await
        .expect("pipeline did not finish")
        .unwrap();

    // The DOM-based XSS alert is browser-only and ignored for an API.
    assert_eq!(verdict.alert_count, 1);
    assert!(verdict.passed);

    let paths = fake.paths();
    let position = |p: &str| paths.iter().position(|x| x == p).unwrap();
    assert!(position("openapi/action/importUrl") < position("context/action/newContext"));
    assert!(position("replacer/action/addRule") < position("spider/action/scanAsUser"));
    assert!(position("spider/action/scanAsUser") < position("ascan/action/addScanPolicy"));
    assert!(position("ascan/action/scanAsUser") < position("core/view/alerts"));
    assert!(position("core/view/alerts") < position("core/other/mdreport"));

    let import = fake.call("openapi/action/importUrl");
    assert_eq!(import.params["hostOverride"], "pt-sut-api:443");
    let header = fake.call("replacer/action/addRule");
    assert_eq!(header.params["replacement"], "Bearer eyJhbGciOi");
    let spider = fake.call("spider/action/scanAsUser");
    assert_eq!(spider.params["subtreeOnly"], "true");
    assert_eq!(spider.params["contextId"], "1");
    assert_eq!(spider.params["userId"], "5");
    let scan = fake.call("ascan/action/scanAsUser");
    assert_eq!(scan.params["scanPolicyName"], "apiUser-policy");
    assert_eq!(scan.params["method"], "GET");
    assert!(fake
        .calls
        .lock()
        .unwrap()
        .iter()
        .all(|c| c.api_key.as_deref() == Some("secret-key")));

    let reports: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        std::fs::read_to_string(&reports[0]).unwrap(),
        "# Emissary report"
    );
}

#[tokio::test]
async fn alerts_above_threshold_fail_the_session() {
    let fake = FakeEmissary::default();
    let addr = start_emissary(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(addr, &api_job(0), dir.path());

    let verdict = Pipeline::build(&ctx).unwrap().run().await.unwrap();
    assert_eq!(verdict.alert_count, 1);
    assert!(!verdict.passed);
}

#[tokio::test]
async fn emissary_rejection_stops_the_pipeline() {
    let fake = FakeEmissary {
        failing: Arc::new(vec!["ascan/action/addScanPolicy"]),
        ..FakeEmissary::default()
    };
    let addr = start_emissary(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(addr, &api_job(1), dir.path());

    let err = Pipeline::build(&ctx).unwrap().run().await.unwrap_err();
    assert!(matches!(err, AppError::Session { ref session_id, .. } if session_id == "apiUser"));
    assert!(err.to_string().contains("illegal_parameter"));
    assert!(!fake.paths().iter().any(|p| p == "ascan/action/scanAsUser"));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

async fn app() -> axum::Router {
    let config = AppConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        emissary: emissary_settings(),
        provisioning: ProvisioningConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            clustered: false,
            service_registry_endpoint: "http://127.0.0.1:9".to_string(),
            selenium_port: 4444,
            readiness_timeout: Duration::from_secs(1),
            readiness_retry_interval: Duration::from_secs(1),
            availability_timeout: Duration::from_secs(1),
            availability_retry_interval: Duration::from_secs(1),
        },
        run_mode: RunMode::Parallel,
        deprovision_on_completion: true,
        session_runner_path: "session-runner".to_string(),
        report_dir: "./reports".to_string(),
        redis_url: None,
    };
    let tester = Arc::new(Tester::from_config(config.clone()).await.unwrap());
    routes::router(AppState { config, tester })
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn readiness_reports_idle_tester() {
    let response = app()
        .await
        .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["tester"], "idle");
    assert_eq!(body["data"]["redis"], "not configured");
}

#[tokio::test]
async fn job_without_sessions_is_rejected() {
    let mut job = serde_json::to_value(api_job(1)).unwrap();
    job["included"] = json!([]);
    let response = app()
        .await
        .oneshot(
            Request::post("/api/v1/tester/run-job")
                .header("content-type", "application/json")
                .body(Body::from(job.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn start_before_init_conflicts() {
    let response = app()
        .await
        .oneshot(
            Request::post("/api/v1/tester/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
