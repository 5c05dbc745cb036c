use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// How session processes are launched relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Parallel,
    Sequential,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown run mode '{other}'")),
        }
    }
}

/// Emissary access and polling budgets, shared by the server and every session process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissaryConfig {
    pub api_key: String,
    pub port: u16,
    pub poll_interval_ms: u64,
    pub spider_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    pub spider_max_children: u32,
    pub spider_subtree_only_api: bool,
    pub spider_subtree_only_browser_app: bool,
}

impl EmissaryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn spider_timeout(&self) -> Duration {
        Duration::from_secs(self.spider_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Polling loops need a non-zero interval to make progress.
    pub fn validate(&self) -> Result<(), AppError> {
        require_non_zero("EMISSARY_POLL_INTERVAL_MS", self.poll_interval())
    }
}

/// Provisioning, endpoint resolution and readiness budgets.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub endpoint: String,
    pub clustered: bool,
    pub service_registry_endpoint: String,
    pub selenium_port: u16,
    pub readiness_timeout: Duration,
    pub readiness_retry_interval: Duration,
    pub availability_timeout: Duration,
    pub availability_retry_interval: Duration,
}

impl ProvisioningConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        require_non_zero("READINESS_RETRY_INTERVAL_SECS", self.readiness_retry_interval)?;
        require_non_zero(
            "AVAILABILITY_RETRY_INTERVAL_SECS",
            self.availability_retry_interval,
        )
    }
}

fn require_non_zero(key: &str, interval: Duration) -> Result<(), AppError> {
    if interval.is_zero() {
        return Err(AppError::Validation(format!("{key} must be greater than zero")));
    }
    Ok(())
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub emissary: EmissaryConfig,
    pub provisioning: ProvisioningConfig,
    pub run_mode: RunMode,
    pub deprovision_on_completion: bool,
    pub session_runner_path: String,
    pub report_dir: String,
    pub redis_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: var_or("PORT", 3000),
            emissary: EmissaryConfig {
                api_key: env::var("EMISSARY_API_KEY").map_err(|_| {
                    AppError::Validation("EMISSARY_API_KEY must be set".to_string())
                })?,
                port: var_or("EMISSARY_PORT", 8080),
                poll_interval_ms: var_or("EMISSARY_POLL_INTERVAL_MS", 5000),
                spider_timeout_secs: var_or("EMISSARY_SPIDER_TIMEOUT_SECS", 600),
                scan_timeout_secs: var_or("EMISSARY_SCAN_TIMEOUT_SECS", 3600),
                spider_max_children: var_or("SPIDER_MAX_CHILDREN", 10),
                spider_subtree_only_api: var_or("SPIDER_SUBTREE_ONLY_API", true),
                spider_subtree_only_browser_app: var_or("SPIDER_SUBTREE_ONLY_BROWSER_APP", false),
            },
            provisioning: ProvisioningConfig {
                endpoint: env::var("PROVISIONING_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:3001".to_string()),
                clustered: var_or("PROVISIONING_CLUSTERED", false),
                service_registry_endpoint: env::var("SERVICE_REGISTRY_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:3002".to_string()),
                selenium_port: var_or("SELENIUM_PORT", 4444),
                readiness_timeout: Duration::from_secs(var_or("READINESS_TIMEOUT_SECS", 120)),
                readiness_retry_interval: Duration::from_secs(var_or(
                    "READINESS_RETRY_INTERVAL_SECS",
                    5,
                )),
                availability_timeout: Duration::from_secs(var_or(
                    "AVAILABILITY_TIMEOUT_SECS",
                    300,
                )),
                availability_retry_interval: Duration::from_secs(var_or(
                    "AVAILABILITY_RETRY_INTERVAL_SECS",
                    10,
                )),
            },
            run_mode: var_or("RUN_MODE", RunMode::Parallel),
            deprovision_on_completion: var_or("DEPROVISION_ON_COMPLETION", true),
            session_runner_path: env::var("SESSION_RUNNER_PATH")
                .unwrap_or_else(|_| default_session_runner_path()),
            report_dir: env::var("REPORT_DIR").unwrap_or_else(|_| "./reports".to_string()),
            redis_url: env::var("REDIS_URL").ok(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.emissary.validate()?;
        self.provisioning.validate()
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure.
fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The `session-runner` binary installed next to the running executable.
fn default_session_runner_path() -> String {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("session-runner")))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session-runner".to_string())
}
