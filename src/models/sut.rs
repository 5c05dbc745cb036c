//! Per-session System Under Test.

use serde::{Deserialize, Serialize};

use super::job::{
    Browser, Job, OpenApiSource, ReportFormat, Route, SutAuthentication, SutKind, TestSession,
};

/// The Emissary's grouping for one session's in-scope URLs and authentication.
///
/// `name` is assigned locally, `id` is learned from the Emissary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: Option<String>,
    pub name: String,
}

/// Whether the Emissary recognises a session by a logged-in or a logged-out marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indicator {
    LoggedIn(String),
    LoggedOut(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sut {
    pub kind: SutKind,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub browser: Option<Browser>,
    pub authentication: Option<SutAuthentication>,
    pub logged_in_indicator: Option<String>,
    pub logged_out_indicator: Option<String>,
    pub open_api: Option<OpenApiSource>,
    pub bearer_token: Option<String>,
    pub report_formats: Vec<ReportFormat>,
    pub context: Context,
    pub user_id: Option<String>,
    pub test_session: TestSession,
}

impl Sut {
    /// Build the SUT for one session of an accepted job.
    pub fn for_session(job: &Job, session: &TestSession) -> Self {
        let attrs = &job.sut.attributes;
        Self {
            kind: job.sut.kind,
            protocol: attrs.sut_protocol.clone(),
            host: attrs.sut_ip.clone(),
            port: attrs.sut_port,
            browser: attrs.browser,
            authentication: attrs.sut_authentication.clone(),
            logged_in_indicator: attrs.logged_in_indicator.clone(),
            logged_out_indicator: attrs.logged_out_indicator.clone(),
            open_api: attrs.open_api.clone(),
            bearer_token: attrs.bearer_token.clone(),
            report_formats: attrs.report_formats.clone(),
            context: Context {
                id: None,
                name: format!("{}_Context", session.id),
            },
            user_id: None,
            test_session: session.clone(),
        }
    }

    /// One SUT per session, with the routes each session is related to.
    pub fn all_for_job(job: &Job) -> Vec<(Sut, Vec<Route>)> {
        job.sessions()
            .map(|session| (Self::for_session(job, session), job.routes_for(session)))
            .collect()
    }

    pub fn session_id(&self) -> &str {
        &self.test_session.id
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// The single configured indicator. Job validation guarantees exactly one is set.
    pub fn indicator(&self) -> Option<Indicator> {
        match (&self.logged_in_indicator, &self.logged_out_indicator) {
            (Some(regex), None) => Some(Indicator::LoggedIn(regex.clone())),
            (None, Some(regex)) => Some(Indicator::LoggedOut(regex.clone())),
            _ => None,
        }
    }
}
