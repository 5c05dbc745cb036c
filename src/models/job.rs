//! Job description as accepted from the Build User.
//!
//! The wire shape is a JSON:API-style document: a `data` (or `sut`) resource
//! describing the System Under Test, and an `included` array carrying
//! `appScanner` test sessions and `route` resources.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SutKind {
    Api,
    BrowserApp,
}

impl std::fmt::Display for SutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => write!(f, "Api"),
            Self::BrowserApp => write!(f, "BrowserApp"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chrome,
    Firefox,
}

impl std::fmt::Display for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chrome => write!(f, "chrome"),
            Self::Firefox => write!(f, "firefox"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Html,
    Json,
    Md,
    Xml,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Json => "json",
            Self::Md => "md",
            Self::Xml => "xml",
        }
    }
}

fn default_report_formats() -> Vec<ReportFormat> {
    vec![ReportFormat::Html, ReportFormat::Json]
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttackStrength {
    Low,
    #[default]
    Medium,
    High,
    Insane,
}

impl std::fmt::Display for AttackStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Insane => write!(f, "INSANE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertThreshold {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for AlertThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// How a browser-driven SUT's login form is located and submitted.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SutAuthentication {
    #[validate(custom(function = "validate_path"))]
    pub route: String,
    #[validate(length(min = 1))]
    pub username_field_locater: String,
    #[validate(length(min = 1))]
    pub password_field_locater: String,
    pub submit: String,
    pub expected_page_source_success: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiSource {
    pub import_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_indicators"))]
pub struct SutAttributes {
    #[validate(length(min = 1, max = 253))]
    pub sut_ip: String,
    #[validate(range(min = 1))]
    pub sut_port: u16,
    #[validate(custom(function = "validate_protocol"))]
    pub sut_protocol: String,
    pub browser: Option<Browser>,
    pub logged_in_indicator: Option<String>,
    pub logged_out_indicator: Option<String>,
    #[validate(nested)]
    pub sut_authentication: Option<SutAuthentication>,
    pub open_api: Option<OpenApiSource>,
    pub bearer_token: Option<String>,
    #[serde(default = "default_report_formats")]
    pub report_formats: Vec<ReportFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SutDescription {
    #[serde(rename = "type")]
    pub kind: SutKind,
    #[validate(nested)]
    pub attributes: SutAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub visible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteAttributes {
    #[serde(default)]
    pub attack_fields: Vec<AttackField>,
    #[serde(default = "default_method")]
    pub method: String,
    pub submit: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// An attackable endpoint. `id` is the path relative to the SUT base URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub attributes: RouteAttributes,
}

impl Route {
    /// Attack fields rendered as an `application/x-www-form-urlencoded` body.
    pub fn post_data(&self) -> String {
        self.attributes
            .attack_fields
            .iter()
            .map(|f| format!("{}={}", f.name, f.value))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn is_post(&self) -> bool {
        self.attributes.method.eq_ignore_ascii_case("POST")
    }
}

/// Per-stage strategy names; absent names take the SUT variant's default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyNames {
    pub sites_tree_sut_authentication_population_strategy: Option<String>,
    pub sites_tree_population_strategy: Option<String>,
    pub emissary_authentication_strategy: Option<String>,
    pub spider_strategy: Option<String>,
    pub scanners_strategy: Option<String>,
    pub scanning_strategy: Option<String>,
    pub post_scanning_strategy: Option<String>,
    pub reporting_strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SessionAttributes {
    #[validate(length(min = 1))]
    pub username: String,
    pub password: Option<String>,
    /// Maximum number of alerts tolerated before the session fails.
    #[serde(default)]
    pub alert_threshold: u32,
    #[serde(default)]
    pub a_scanner_attack_strength: AttackStrength,
    #[serde(default)]
    pub a_scanner_alert_threshold: AlertThreshold,
    #[serde(default)]
    pub excluded_routes: Vec<String>,
    #[serde(flatten)]
    pub strategies: StrategyNames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationships {
    #[serde(default)]
    pub data: Vec<ResourceRef>,
}

/// One scan run within a Job: the unit of concurrency and teardown accounting.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TestSession {
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    #[validate(nested)]
    pub attributes: SessionAttributes,
    pub relationships: Option<Relationships>,
}

impl TestSession {
    /// Ids of the routes this session is related to, in declaration order.
    pub fn route_ids(&self) -> impl Iterator<Item = &str> {
        self.relationships
            .iter()
            .flat_map(|r| r.data.iter())
            .filter(|r| r.kind == "route")
            .map(|r| r.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Included {
    #[serde(rename = "appScanner")]
    AppScanner(TestSession),
    #[serde(rename = "route")]
    Route(Route),
}

/// The Build User's scan request. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(alias = "data")]
    pub sut: SutDescription,
    #[serde(default)]
    pub included: Vec<Included>,
}

impl Job {
    pub fn sessions(&self) -> impl Iterator<Item = &TestSession> {
        self.included.iter().filter_map(|i| match i {
            Included::AppScanner(s) => Some(s),
            Included::Route(_) => None,
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.included.iter().filter_map(|i| match i {
            Included::Route(r) => Some(r),
            Included::AppScanner(_) => None,
        })
    }

    /// Routes related to `session`, in the session's relationship order.
    pub fn routes_for(&self, session: &TestSession) -> Vec<Route> {
        session
            .route_ids()
            .filter_map(|id| self.routes().find(|r| r.id == id).cloned())
            .collect()
    }

    /// Schema validation plus the cross-resource invariants the schema cannot express.
    pub fn validate_job(&self) -> Result<(), AppError> {
        self.sut
            .validate()
            .map_err(|e| AppError::Validation(format!("SUT: {e}")))?;

        let mut seen = HashSet::new();
        let mut count = 0usize;
        for session in self.sessions() {
            count += 1;
            session
                .validate()
                .map_err(|e| AppError::Validation(format!("Session {}: {e}", session.id)))?;
            if !seen.insert(session.id.as_str()) {
                return Err(AppError::Validation(format!(
                    "Duplicate test session id '{}'",
                    session.id
                )));
            }
            for route_id in session.route_ids() {
                if !self.routes().any(|r| r.id == route_id) {
                    return Err(AppError::Validation(format!(
                        "Session {} references unknown route '{route_id}'",
                        session.id
                    )));
                }
            }
        }

        if count == 0 {
            return Err(AppError::Validation(
                "A job requires at least one test session".to_string(),
            ));
        }

        if self.sut.kind == SutKind::BrowserApp && self.sut.attributes.browser.is_none() {
            return Err(AppError::Validation(
                "A BrowserApp SUT requires a browser".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_protocol(protocol: &str) -> Result<(), ValidationError> {
    match protocol {
        "http" | "https" => Ok(()),
        _ => Err(ValidationError::new("protocol_must_be_http_or_https")),
    }
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::new("path_must_start_with_slash"))
    }
}

fn validate_indicators(attributes: &SutAttributes) -> Result<(), ValidationError> {
    match (
        &attributes.logged_in_indicator,
        &attributes.logged_out_indicator,
    ) {
        (Some(_), None) | (None, Some(_)) => Ok(()),
        _ => Err(ValidationError::new(
            "exactly_one_of_logged_in_or_logged_out_indicator",
        )),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;

    use super::Job;

    pub fn browser_app_job_json() -> serde_json::Value {
        json!({
            "data": {
                "type": "BrowserApp",
                "attributes": {
                    "sutIp": "pt-sut-cont",
                    "sutPort": 4000,
                    "sutProtocol": "http",
                    "browser": "chrome",
                    "loggedInIndicator": "<p>Found. Redirecting to <a href=\"\\/dashboard\">",
                    "sutAuthentication": {
                        "route": "/login",
                        "usernameFieldLocater": "userName",
                        "passwordFieldLocater": "password",
                        "submit": "btn btn-danger",
                        "expectedPageSourceSuccess": "Log Out"
                    },
                    "reportFormats": ["html", "md"]
                }
            },
            "included": [
                {
                    "type": "appScanner",
                    "id": "lowPrivUser",
                    "attributes": {
                        "username": "user1",
                        "password": "User1_123",
                        "alertThreshold": 12,
                        "aScannerAttackStrength": "HIGH",
                        "aScannerAlertThreshold": "LOW",
                        "excludedRoutes": ["/logout"]
                    },
                    "relationships": {
                        "data": [
                            { "type": "route", "id": "/profile" },
                            { "type": "route", "id": "/memos" }
                        ]
                    }
                },
                {
                    "type": "appScanner",
                    "id": "adminUser",
                    "attributes": {
                        "username": "admin",
                        "password": "Admin_123",
                        "sitesTreePopulationStrategy": "WebDriverStandard",
                        "spiderStrategy": "Standard"
                    },
                    "relationships": {
                        "data": [{ "type": "route", "id": "/memos" }]
                    }
                },
                {
                    "type": "route",
                    "id": "/profile",
                    "attributes": {
                        "attackFields": [
                            { "name": "firstName", "value": "PurpleJohn", "visible": true },
                            { "name": "lastName", "value": "PurpleDoe", "visible": true }
                        ],
                        "method": "POST",
                        "submit": "submit"
                    }
                },
                {
                    "type": "route",
                    "id": "/memos",
                    "attributes": {
                        "attackFields": [{ "name": "memo", "value": "PurpleMemo", "visible": true }],
                        "method": "POST",
                        "submit": "btn btn-primary"
                    }
                }
            ]
        })
    }

    pub fn api_job_json() -> serde_json::Value {
        json!({
            "data": {
                "type": "Api",
                "attributes": {
                    "sutIp": "pt-sut-api",
                    "sutPort": 443,
                    "sutProtocol": "https",
                    "loggedOutIndicator": "401 Unauthorized",
                    "openApi": { "importUrl": "https://pt-sut-api/openapi.json" },
                    "bearerToken": "eyJhbGciOi"
                }
            },
            "included": [
                {
                    "type": "appScanner",
                    "id": "apiUser",
                    "attributes": {
                        "username": "api-user",
                        "emissaryAuthenticationStrategy": "BearerToken",
                        "sitesTreePopulationStrategy": "OpenApi",
                        "alertThreshold": 0
                    }
                }
            ]
        })
    }

    pub fn browser_app_job() -> Job {
        serde_json::from_value(browser_app_job_json()).unwrap()
    }

    pub fn api_job() -> Job {
        serde_json::from_value(api_job_json()).unwrap()
    }
}
