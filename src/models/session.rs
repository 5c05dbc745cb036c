//! What a session process needs to run its pipeline.

use serde::{Deserialize, Serialize};

use super::job::Route;
use super::provisioning::SessionEndpoints;
use super::sut::Sut;
use crate::config::EmissaryConfig;

/// Handed to the `session-runner` process on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableSession {
    pub sut: Sut,
    pub routes: Vec<Route>,
    pub endpoints: SessionEndpoints,
    pub emissary: EmissaryConfig,
    pub report_dir: String,
    pub redis_url: Option<String>,
}

impl RunnableSession {
    pub fn session_id(&self) -> &str {
        self.sut.session_id()
    }
}
