//! Provisioning request/result items and resolved worker endpoints.

use serde::{Deserialize, Serialize};

use super::job::Browser;

/// One request item per session. Worker identifier slots are left empty for
/// the provisioning function to fill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequestItem {
    pub app_scanner_session_id: String,
    pub browser: Option<Browser>,
    pub emissary_container_name: Option<String>,
    pub selenium_container_name: Option<String>,
}

impl ProvisionRequestItem {
    pub fn new(session_id: &str, browser: Option<Browser>) -> Self {
        Self {
            app_scanner_session_id: session_id.to_string(),
            browser,
            emissary_container_name: None,
            selenium_container_name: None,
        }
    }
}

/// Merged per-session provisioning result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedSession {
    pub app_scanner_session_id: String,
    pub browser: Option<Browser>,
    pub emissary_container_name: Option<String>,
    pub selenium_container_name: Option<String>,
    pub emissary_service_discovery_service_instance_id: Option<String>,
    pub selenium_service_discovery_service_instance_id: Option<String>,
}

impl From<&ProvisionRequestItem> for ProvisionedSession {
    fn from(item: &ProvisionRequestItem) -> Self {
        Self {
            app_scanner_session_id: item.app_scanner_session_id.clone(),
            browser: item.browser,
            emissary_container_name: item.emissary_container_name.clone(),
            selenium_container_name: item.selenium_container_name.clone(),
            ..Self::default()
        }
    }
}

/// A resolved `{host, port}` for one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
}

impl WorkerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Worker endpoints bound to one session for the remainder of its pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndpoints {
    pub session_id: String,
    pub emissary: WorkerEndpoint,
    pub selenium: Option<WorkerEndpoint>,
}

/// Kind of ephemeral worker a session needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Emissary,
    Selenium,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emissary => write!(f, "emissary"),
            Self::Selenium => write!(f, "selenium"),
        }
    }
}
