//! Provisioning Coordinator.
//!
//! Requests one Emissary (and, for browser-driven SUTs, one browser sidecar)
//! per session from the remote provisioning functions, merges the per-function
//! results, resolves each worker's `{host, port}`, and waits until every worker
//! answers its readiness probe. Deprovisioning hands back whatever partial
//! identifiers exist.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::ProvisioningConfig;
use crate::errors::AppError;
use crate::models::provisioning::{
    ProvisionRequestItem, ProvisionedSession, SessionEndpoints, WorkerEndpoint, WorkerKind,
};
use crate::services::polling::{ticker, Countdown};

pub const PROVISION_APP_EMISSARIES: &str = "provisionAppEmissaries";
pub const PROVISION_SELENIUM_STANDALONES: &str = "provisionSeleniumStandalones";
pub const PROVISION_FARGATE_TASKS: &str = "provisionFargateTasks";
pub const DEPROVISION_S2_CONTAINERS: &str = "deprovisionS2Containers";

/// Body marker served by a ready Emissary's API UI.
pub const EMISSARY_READY_MARKER: &str = "ZAP API UI";

const HTTP_TIMEOUT_SECS: u64 = 30;

/// `{items}` on success, `{error}` on a function-level failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionResponse {
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default, alias = "errorMessage")]
    pub error: Option<String>,
}

/// Function-as-a-service invocation boundary.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, function_name: &str, payload: Value)
        -> Result<FunctionResponse, AppError>;
}

/// Service-registry lookup, clustered mode only.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn list_instances(&self, service_id: &str) -> Result<Vec<WorkerEndpoint>, AppError>;
}

/// One readiness check against one worker. Any failure means "not yet".
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    async fn is_ready(&self, kind: WorkerKind, endpoint: &WorkerEndpoint) -> bool;
}

fn http_client() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))
}

fn unreachable(service: &str, e: reqwest::Error) -> AppError {
    AppError::RemoteUnreachable {
        service: service.to_string(),
        detail: e.to_string(),
    }
}

pub struct HttpFunctionInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFunctionInvoker {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    async fn invoke(
        &self,
        function_name: &str,
        payload: Value,
    ) -> Result<FunctionResponse, AppError> {
        let url = format!(
            "{}/2015-03-31/functions/{function_name}/invocations",
            self.endpoint
        );
        tracing::debug!(function_name, "Invoking provisioning function");
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| unreachable("provisioning service", e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| unreachable("provisioning service", e))?;
        match serde_json::from_str::<FunctionResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Ok(FunctionResponse {
                items: None,
                error: Some(format!("HTTP {status}: {body}")),
            }),
            Err(e) => Err(AppError::RemoteOperation {
                service: "provisioning service".to_string(),
                detail: format!("{function_name} returned an unparsable body: {e}"),
            }),
        }
    }
}

pub struct HttpServiceRegistry {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpServiceRegistry {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ServiceRegistry for HttpServiceRegistry {
    async fn list_instances(&self, service_id: &str) -> Result<Vec<WorkerEndpoint>, AppError> {
        let response = self
            .client
            .get(format!("{}/services/{service_id}/instances", self.endpoint))
            .send()
            .await
            .map_err(|e| unreachable("service registry", e))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(AppError::RemoteOperation {
                service: "service registry".to_string(),
                detail: format!("HTTP {status} listing instances of {service_id}"),
            });
        }
        response
            .json()
            .await
            .map_err(|e| AppError::RemoteOperation {
                service: "service registry".to_string(),
                detail: format!("unparsable instance list for {service_id}: {e}"),
            })
    }
}

pub struct HttpWorkerProbe {
    client: reqwest::Client,
}

impl HttpWorkerProbe {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            client: http_client()?,
        })
    }

    async fn emissary_ready(&self, endpoint: &WorkerEndpoint) -> Result<bool, reqwest::Error> {
        let body = self
            .client
            .get(format!("{}/", endpoint.base_url()))
            .send()
            .await?
            .text()
            .await?;
        Ok(body.contains(EMISSARY_READY_MARKER))
    }

    async fn selenium_ready(&self, endpoint: &WorkerEndpoint) -> Result<bool, reqwest::Error> {
        let status: Value = self
            .client
            .get(format!("{}/wd/hub/status", endpoint.base_url()))
            .send()
            .await?
            .json()
            .await?;
        Ok(status["value"]["ready"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl WorkerProbe for HttpWorkerProbe {
    async fn is_ready(&self, kind: WorkerKind, endpoint: &WorkerEndpoint) -> bool {
        let result = match kind {
            WorkerKind::Emissary => self.emissary_ready(endpoint).await,
            WorkerKind::Selenium => self.selenium_ready(endpoint).await,
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(%kind, %endpoint, error = %e, "Worker not ready yet");
            false
        })
    }
}

struct ErrorRule {
    pattern: &'static str,
    fatal: bool,
    build_user_message: &'static str,
}

/// Substring (case-insensitive) → severity and Build User message.
const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule {
        pattern: "was not idempotent",
        fatal: true,
        build_user_message: "A test for this job is already being provisioned. Wait for it to finish before starting another.",
    },
    ErrorRule {
        pattern: "draining",
        fatal: false,
        build_user_message: "Scanner capacity is being recycled. Please retry in a few minutes.",
    },
    ErrorRule {
        pattern: "timed out",
        fatal: true,
        build_user_message: "Provisioning the scanners took too long.",
    },
    ErrorRule {
        pattern: "throttlingexception",
        fatal: false,
        build_user_message: "The provisioning service is busy. Please retry shortly.",
    },
    ErrorRule {
        pattern: "rate exceeded",
        fatal: false,
        build_user_message: "The provisioning service is busy. Please retry shortly.",
    },
];

const UNKNOWN_ERROR_MESSAGE: &str = "Provisioning the scanners failed.";

/// Classify a provisioning function's structured error. Unknown errors are fatal.
pub fn classify_error(function_name: &str, error: &str) -> AppError {
    let lowered = error.to_ascii_lowercase();
    let detail = format!("{function_name}: {error}");
    match ERROR_RULES.iter().find(|rule| lowered.contains(rule.pattern)) {
        Some(rule) if !rule.fatal => AppError::ProvisioningRecoverable {
            build_user_message: rule.build_user_message.to_string(),
            detail,
        },
        Some(rule) => AppError::ProvisioningFatal {
            build_user_message: rule.build_user_message.to_string(),
            detail,
        },
        None => AppError::ProvisioningFatal {
            build_user_message: UNKNOWN_ERROR_MESSAGE.to_string(),
            detail,
        },
    }
}

/// Turn one function response into its item list.
fn items_of(function_name: &str, response: FunctionResponse) -> Result<Vec<Value>, AppError> {
    if let Some(error) = response.error {
        return Err(classify_error(function_name, &error));
    }
    match response.items {
        Some(items) if !items.is_empty() => Ok(items),
        _ => Err(AppError::ProvisioningFatal {
            build_user_message: UNKNOWN_ERROR_MESSAGE.to_string(),
            detail: format!("{function_name} returned no items"),
        }),
    }
}

/// A failed `provision` call and the identifiers that still need releasing.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub error: AppError,
    pub partial: Vec<ProvisionedSession>,
}

fn check_order(
    items: &[ProvisionRequestItem],
    merged: Vec<ProvisionedSession>,
) -> Result<Vec<ProvisionedSession>, AppError> {
    if merged.len() != items.len() {
        return Err(AppError::Validation(format!(
            "provisioned {} sessions, requested {}",
            merged.len(),
            items.len()
        )));
    }
    for (index, (requested, provisioned)) in items.iter().zip(&merged).enumerate() {
        if requested.app_scanner_session_id != provisioned.app_scanner_session_id {
            return Err(AppError::Validation(format!(
                "provisioned item {index} is for session '{}', requested '{}'",
                provisioned.app_scanner_session_id, requested.app_scanner_session_id
            )));
        }
    }
    Ok(merged)
}

/// Best-effort merge for deprovisioning: start from each request item and
/// fill absent keys from whatever the functions returned at the same index.
/// Conflicts and malformed items are skipped.
pub fn salvage(
    items: &[ProvisionRequestItem],
    results: &[(&str, Vec<Value>)],
) -> Vec<ProvisionedSession> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let base = ProvisionedSession::from(item);
            let Ok(Value::Object(mut record)) = serde_json::to_value(&base) else {
                return base;
            };
            for (_, function_items) in results {
                let Some(Value::Object(returned)) = function_items.get(index) else {
                    continue;
                };
                for (key, value) in returned.iter().filter(|(_, v)| !v.is_null()) {
                    if record.get(key).map_or(true, Value::is_null) {
                        record.insert(key.clone(), value.clone());
                    }
                }
            }
            serde_json::from_value(Value::Object(record)).unwrap_or(base)
        })
        .collect()
}

/// Zip per-function item arrays index by index into one record per session.
///
/// Null values are treated as absent. Two functions disagreeing on a non-null
/// value for the same key, or arrays of different lengths, is a validation
/// failure.
pub fn merge(results: &[(&str, Vec<Value>)]) -> Result<Vec<ProvisionedSession>, AppError> {
    let Some((_, first)) = results.first() else {
        return Ok(Vec::new());
    };
    let len = first.len();
    if let Some((name, items)) = results.iter().find(|(_, items)| items.len() != len) {
        return Err(AppError::Validation(format!(
            "{name} returned {} items, expected {len}",
            items.len()
        )));
    }

    (0..len)
        .map(|index| {
            let mut merged = Map::new();
            for (name, items) in results {
                let Value::Object(item) = &items[index] else {
                    return Err(AppError::Validation(format!(
                        "{name} item {index} is not an object"
                    )));
                };
                for (key, value) in item.iter().filter(|(_, v)| !v.is_null()) {
                    match merged.get(key) {
                        Some(existing) if existing != value => {
                            return Err(AppError::Validation(format!(
                                "conflicting values for '{key}' at item {index}: {existing} vs {value} from {name}"
                            )));
                        }
                        Some(_) => {}
                        None => {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            serde_json::from_value::<ProvisionedSession>(Value::Object(merged)).map_err(|e| {
                AppError::Validation(format!("merged provisioning item {index} is malformed: {e}"))
            })
        })
        .collect()
}

pub struct ProvisioningCoordinator {
    config: ProvisioningConfig,
    emissary_port: u16,
    invoker: Arc<dyn FunctionInvoker>,
    registry: Arc<dyn ServiceRegistry>,
    probe: Arc<dyn WorkerProbe>,
}

impl ProvisioningCoordinator {
    pub fn new(
        config: ProvisioningConfig,
        emissary_port: u16,
        invoker: Arc<dyn FunctionInvoker>,
        registry: Arc<dyn ServiceRegistry>,
        probe: Arc<dyn WorkerProbe>,
    ) -> Self {
        Self {
            config,
            emissary_port,
            invoker,
            registry,
            probe,
        }
    }

    /// Build the production coordinator over HTTP.
    pub fn over_http(config: ProvisioningConfig, emissary_port: u16) -> Result<Self, AppError> {
        let invoker = Arc::new(HttpFunctionInvoker::new(config.endpoint.clone())?);
        let registry = Arc::new(HttpServiceRegistry::new(
            config.service_registry_endpoint.clone(),
        )?);
        let probe = Arc::new(HttpWorkerProbe::new()?);
        Ok(Self::new(config, emissary_port, invoker, registry, probe))
    }

    fn functions_for(&self, items: &[ProvisionRequestItem]) -> Vec<&'static str> {
        if self.config.clustered {
            vec![PROVISION_FARGATE_TASKS]
        } else if items.iter().any(|item| item.browser.is_some()) {
            vec![PROVISION_APP_EMISSARIES, PROVISION_SELENIUM_STANDALONES]
        } else {
            vec![PROVISION_APP_EMISSARIES]
        }
    }

    /// Invoke the provisioning functions in parallel and merge their results.
    ///
    /// On failure the error carries one record per requested session holding
    /// whatever identifiers the successful functions returned.
    pub async fn provision(
        &self,
        items: &[ProvisionRequestItem],
    ) -> Result<Vec<ProvisionedSession>, ProvisionFailure> {
        let functions = self.functions_for(items);
        let payload = json!({ "items": items });
        tracing::info!(
            sessions = items.len(),
            functions = ?functions,
            "Provisioning workers"
        );

        let responses = join_all(
            functions
                .iter()
                .map(|name| self.invoker.invoke(name, payload.clone())),
        )
        .await;

        let mut results = Vec::with_capacity(functions.len());
        let mut first_error = None;
        for (name, response) in functions.iter().zip(responses) {
            match response.and_then(|response| items_of(name, response)) {
                Ok(function_items) => results.push((*name, function_items)),
                Err(e) => {
                    tracing::warn!(function_name = *name, error = %e, "Provisioning function failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(ProvisionFailure {
                error,
                partial: salvage(items, &results),
            });
        }

        merge(&results)
            .and_then(|merged| check_order(items, merged))
            .map_err(|error| ProvisionFailure {
                error,
                partial: salvage(items, &results),
            })
    }

    /// Bind each session to concrete worker addresses.
    pub async fn resolve_endpoints(
        &self,
        sessions: &[ProvisionedSession],
    ) -> Result<Vec<SessionEndpoints>, AppError> {
        if self.config.clustered {
            return self.await_registration(sessions).await;
        }
        sessions
            .iter()
            .map(|session| {
                let emissary = session.emissary_container_name.as_ref().ok_or_else(|| {
                    AppError::Validation(format!(
                        "no Emissary container provisioned for session '{}'",
                        session.app_scanner_session_id
                    ))
                })?;
                Ok(SessionEndpoints {
                    session_id: session.app_scanner_session_id.clone(),
                    emissary: WorkerEndpoint::new(emissary.clone(), self.emissary_port),
                    selenium: session
                        .selenium_container_name
                        .as_ref()
                        .map(|name| WorkerEndpoint::new(name.clone(), self.config.selenium_port)),
                })
            })
            .collect()
    }

    /// Poll the service registry until every required worker has an instance.
    async fn await_registration(
        &self,
        sessions: &[ProvisionedSession],
    ) -> Result<Vec<SessionEndpoints>, AppError> {
        let interval_period = self.config.availability_retry_interval;
        let mut interval = ticker(interval_period);
        let mut countdown = Countdown::new(self.config.availability_timeout, interval_period);

        loop {
            interval.tick().await;

            let mut resolved = Vec::with_capacity(sessions.len());
            for session in sessions {
                match self.lookup(session).await? {
                    Some(endpoints) => resolved.push(endpoints),
                    None => break,
                }
            }
            if resolved.len() == sessions.len() {
                tracing::info!(sessions = sessions.len(), "All workers registered");
                return Ok(resolved);
            }

            if countdown.elapse() {
                return Err(AppError::Timeout(format!(
                    "{} of {} sessions had workers registered after {}s",
                    resolved.len(),
                    sessions.len(),
                    self.config.availability_timeout.as_secs()
                )));
            }
            tracing::debug!(
                registered = resolved.len(),
                total = sessions.len(),
                remaining_secs = countdown.remaining().as_secs(),
                "Waiting for worker registration"
            );
        }
    }

    async fn lookup(
        &self,
        session: &ProvisionedSession,
    ) -> Result<Option<SessionEndpoints>, AppError> {
        let Some(emissary_id) = &session.emissary_service_discovery_service_instance_id else {
            return Err(AppError::Validation(format!(
                "no Emissary service id provisioned for session '{}'",
                session.app_scanner_session_id
            )));
        };
        let Some(emissary) = self.registry.list_instances(emissary_id).await?.into_iter().next()
        else {
            return Ok(None);
        };
        let selenium = match &session.selenium_service_discovery_service_instance_id {
            Some(id) => match self.registry.list_instances(id).await?.into_iter().next() {
                Some(endpoint) => Some(endpoint),
                None => return Ok(None),
            },
            None => None,
        };
        Ok(Some(SessionEndpoints {
            session_id: session.app_scanner_session_id.clone(),
            emissary,
            selenium,
        }))
    }

    /// Poll every worker until all of them are ready in the same tick.
    pub async fn await_readiness(&self, endpoints: &[SessionEndpoints]) -> Result<(), AppError> {
        let workers: Vec<(WorkerKind, &WorkerEndpoint)> = endpoints
            .iter()
            .flat_map(|session| {
                std::iter::once((WorkerKind::Emissary, &session.emissary)).chain(
                    session
                        .selenium
                        .as_ref()
                        .map(|endpoint| (WorkerKind::Selenium, endpoint)),
                )
            })
            .collect();

        let period = self.config.readiness_retry_interval;
        let mut interval = ticker(period);
        let mut countdown = Countdown::new(self.config.readiness_timeout, period);

        loop {
            interval.tick().await;

            let ready = join_all(
                workers
                    .iter()
                    .map(|(kind, endpoint)| self.probe.is_ready(*kind, endpoint)),
            )
            .await;
            let not_ready: Vec<String> = workers
                .iter()
                .zip(&ready)
                .filter(|(_, ready)| !**ready)
                .map(|((kind, endpoint), _)| format!("{kind}@{endpoint}"))
                .collect();

            if not_ready.is_empty() {
                tracing::info!(workers = workers.len(), "All workers ready");
                return Ok(());
            }
            if countdown.elapse() {
                return Err(AppError::Timeout(format!(
                    "workers not ready after {}s: {}",
                    self.config.readiness_timeout.as_secs(),
                    not_ready.join(", ")
                )));
            }
            tracing::debug!(not_ready = ?not_ready, "Waiting for workers");
        }
    }

    /// Release workers using whatever identifiers were obtained.
    pub async fn deprovision(&self, sessions: &[ProvisionedSession]) -> Result<(), AppError> {
        if sessions.is_empty() {
            return Ok(());
        }
        tracing::info!(sessions = sessions.len(), "Deprovisioning workers");
        let response = self
            .invoker
            .invoke(DEPROVISION_S2_CONTAINERS, json!({ "items": sessions }))
            .await?;
        if let Some(error) = response.error {
            return Err(classify_error(DEPROVISION_S2_CONTAINERS, &error));
        }
        Ok(())
    }
}
