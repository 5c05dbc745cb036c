//! Typed request layer over the Emissary's HTTP API.
//!
//! The `EmissaryApi` trait is the seam every pipeline stage and the scan
//! tracker talk through; `HttpEmissary` is the production implementation.
//! Status values come back as the raw strings the Emissary sends so the
//! tracker owns the parse-or-fail decision.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AppError;
use crate::models::job::{AlertThreshold, AttackStrength, ReportFormat};
use crate::models::provisioning::WorkerEndpoint;
use crate::models::sut::Indicator;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const API_KEY_HEADER: &str = "X-ZAP-API-Key";

/// Parameters for a spider-as-user scan.
#[derive(Debug, Clone, PartialEq)]
pub struct SpiderRequest {
    pub context_id: String,
    pub user_id: String,
    pub url: String,
    pub max_children: u32,
    pub recurse: bool,
    pub subtree_only: bool,
}

/// Parameters for an active-scan-as-user.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveScanRequest {
    pub context_id: String,
    pub user_id: String,
    pub url: String,
    pub recurse: bool,
    pub scan_policy_name: String,
    pub method: String,
    pub post_data: Option<String>,
}

/// An alert raised by the Emissary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub plugin_id: String,
    #[serde(default)]
    pub alert: String,
    #[serde(default)]
    pub risk: String,
    #[serde(default)]
    pub confidence: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub param: String,
}

#[async_trait]
pub trait EmissaryApi: Send + Sync {
    /// Create a context, returning its Emissary-assigned id.
    async fn new_context(&self, context_name: &str) -> Result<String, AppError>;
    async fn include_in_context(&self, context_name: &str, regex: &str) -> Result<(), AppError>;
    async fn exclude_from_context(&self, context_name: &str, regex: &str) -> Result<(), AppError>;
    /// Create a user within a context, returning its id.
    async fn new_user(&self, context_id: &str, name: &str) -> Result<String, AppError>;
    async fn set_authentication_method(
        &self,
        context_id: &str,
        method_name: &str,
        config_params: &str,
    ) -> Result<(), AppError>;
    async fn set_indicator(&self, context_id: &str, indicator: &Indicator)
        -> Result<(), AppError>;
    async fn set_authentication_credentials(
        &self,
        context_id: &str,
        user_id: &str,
        config_params: &str,
    ) -> Result<(), AppError>;
    async fn set_user_enabled(
        &self,
        context_id: &str,
        user_id: &str,
        enabled: bool,
    ) -> Result<(), AppError>;
    async fn set_forced_user(&self, context_id: &str, user_id: &str) -> Result<(), AppError>;
    async fn set_forced_user_mode_enabled(&self, enabled: bool) -> Result<(), AppError>;
    /// Add a request-header replacement rule applied to every proxied request.
    async fn add_header_rule(
        &self,
        description: &str,
        header: &str,
        value: &str,
    ) -> Result<(), AppError>;
    async fn access_url(&self, url: &str) -> Result<(), AppError>;
    async fn import_open_api(&self, url: &str, host_override: &str) -> Result<(), AppError>;
    async fn add_scan_policy(
        &self,
        policy_name: &str,
        attack_strength: AttackStrength,
        alert_threshold: AlertThreshold,
    ) -> Result<(), AppError>;
    async fn disable_scanners(&self, ids: &[&str], policy_name: &str) -> Result<(), AppError>;
    async fn exclude_from_scan(&self, regex: &str) -> Result<(), AppError>;
    /// Start a spider-as-user scan, returning the scan id.
    async fn spider_scan_as_user(&self, request: &SpiderRequest) -> Result<String, AppError>;
    /// Raw status string, `None` when the Emissary omitted it.
    async fn spider_status(&self, scan_id: &str) -> Result<Option<String>, AppError>;
    /// Start an active-scan-as-user, returning the scan id.
    async fn active_scan_as_user(&self, request: &ActiveScanRequest) -> Result<String, AppError>;
    async fn active_scan_status(&self, scan_id: &str) -> Result<Option<String>, AppError>;
    /// Number of alerts raised so far by one active scan.
    async fn active_scan_alert_count(&self, scan_id: &str) -> Result<Option<u64>, AppError>;
    async fn alerts(&self, base_url: &str) -> Result<Vec<Alert>, AppError>;
    async fn report(&self, format: ReportFormat) -> Result<String, AppError>;
}

/// Emissary client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEmissary {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmissary {
    pub fn new(endpoint: &WorkerEndpoint, api_key: &str) -> Result<Self, AppError> {
        Self::with_base_url(endpoint.base_url(), api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build Emissary client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Call `/JSON/<component>/<kind>/<name>/` and return the parsed body.
    async fn call(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, AppError> {
        let url = reqwest::Url::parse_with_params(&format!("{}/JSON/{path}/", self.base_url), params)
            .map_err(|e| AppError::Internal(format!("Invalid Emissary URL: {e}")))?;
        tracing::trace!(%url, "Emissary request");
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            return Err(remote_error(path, status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| AppError::RemoteOperation {
            service: "Emissary".to_string(),
            detail: format!("{path}: unparsable response ({e}): {body}"),
        })
    }

    async fn action(&self, path: &str, params: &[(&str, &str)]) -> Result<(), AppError> {
        self.call(path, params).await.map(|_| ())
    }

    async fn scalar(&self, path: &str, params: &[(&str, &str)], field: &str) -> Result<String, AppError> {
        let value = self.call(path, params).await?;
        scalar_field(&value, field).ok_or_else(|| AppError::RemoteOperation {
            service: "Emissary".to_string(),
            detail: format!("{path}: response is missing '{field}': {value}"),
        })
    }
}

fn map_send_error(e: reqwest::Error) -> AppError {
    if e.is_connect() || e.is_timeout() {
        AppError::emissary_unreachable(e.to_string())
    } else {
        AppError::RemoteOperation {
            service: "Emissary".to_string(),
            detail: e.to_string(),
        }
    }
}

/// Turn a non-2xx Emissary response into a `RemoteOperation` error, keeping
/// the structured `{code, message}` body when present.
fn remote_error(path: &str, status: u16, body: &str) -> AppError {
    let detail = match serde_json::from_str::<Value>(body) {
        Ok(v) if v.get("code").is_some() => format!(
            "{path}: HTTP {status}: {} ({})",
            v["message"].as_str().unwrap_or_default(),
            v["code"].as_str().unwrap_or_default()
        ),
        _ => format!("{path}: HTTP {status}: {body}"),
    };
    AppError::RemoteOperation {
        service: "Emissary".to_string(),
        detail,
    }
}

/// Read a field the Emissary may send as a string or a number.
fn scalar_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

#[async_trait]
impl EmissaryApi for HttpEmissary {
    async fn new_context(&self, context_name: &str) -> Result<String, AppError> {
        self.scalar(
            "context/action/newContext",
            &[("contextName", context_name)],
            "contextId",
        )
        .await
    }

    async fn include_in_context(&self, context_name: &str, regex: &str) -> Result<(), AppError> {
        self.action(
            "context/action/includeInContext",
            &[("contextName", context_name), ("regex", regex)],
        )
        .await
    }

    async fn exclude_from_context(&self, context_name: &str, regex: &str) -> Result<(), AppError> {
        self.action(
            "context/action/excludeFromContext",
            &[("contextName", context_name), ("regex", regex)],
        )
        .await
    }

    async fn new_user(&self, context_id: &str, name: &str) -> Result<String, AppError> {
        self.scalar(
            "users/action/newUser",
            &[("contextId", context_id), ("name", name)],
            "userId",
        )
        .await
    }

    async fn set_authentication_method(
        &self,
        context_id: &str,
        method_name: &str,
        config_params: &str,
    ) -> Result<(), AppError> {
        self.action(
            "authentication/action/setAuthenticationMethod",
            &[
                ("contextId", context_id),
                ("authMethodName", method_name),
                ("authMethodConfigParams", config_params),
            ],
        )
        .await
    }

    async fn set_indicator(
        &self,
        context_id: &str,
        indicator: &Indicator,
    ) -> Result<(), AppError> {
        match indicator {
            Indicator::LoggedIn(regex) => {
                self.action(
                    "authentication/action/setLoggedInIndicator",
                    &[("contextId", context_id), ("loggedInIndicatorRegex", regex)],
                )
                .await
            }
            Indicator::LoggedOut(regex) => {
                self.action(
                    "authentication/action/setLoggedOutIndicator",
                    &[("contextId", context_id), ("loggedOutIndicatorRegex", regex)],
                )
                .await
            }
        }
    }

    async fn set_authentication_credentials(
        &self,
        context_id: &str,
        user_id: &str,
        config_params: &str,
    ) -> Result<(), AppError> {
        self.action(
            "users/action/setAuthenticationCredentials",
            &[
                ("contextId", context_id),
                ("userId", user_id),
                ("authCredentialsConfigParams", config_params),
            ],
        )
        .await
    }

    async fn set_user_enabled(
        &self,
        context_id: &str,
        user_id: &str,
        enabled: bool,
    ) -> Result<(), AppError> {
        self.action(
            "users/action/setUserEnabled",
            &[
                ("contextId", context_id),
                ("userId", user_id),
                ("enabled", bool_str(enabled)),
            ],
        )
        .await
    }

    async fn set_forced_user(&self, context_id: &str, user_id: &str) -> Result<(), AppError> {
        self.action(
            "forcedUser/action/setForcedUser",
            &[("contextId", context_id), ("userId", user_id)],
        )
        .await
    }

    async fn set_forced_user_mode_enabled(&self, enabled: bool) -> Result<(), AppError> {
        self.action(
            "forcedUser/action/setForcedUserModeEnabled",
            &[("boolean", bool_str(enabled))],
        )
        .await
    }

    async fn add_header_rule(
        &self,
        description: &str,
        header: &str,
        value: &str,
    ) -> Result<(), AppError> {
        self.action(
            "replacer/action/addRule",
            &[
                ("description", description),
                ("enabled", "true"),
                ("matchType", "REQ_HEADER"),
                ("matchRegex", "false"),
                ("matchString", header),
                ("replacement", value),
            ],
        )
        .await
    }

    async fn access_url(&self, url: &str) -> Result<(), AppError> {
        self.action(
            "core/action/accessUrl",
            &[("url", url), ("followRedirects", "true")],
        )
        .await
    }

    async fn import_open_api(&self, url: &str, host_override: &str) -> Result<(), AppError> {
        self.action(
            "openapi/action/importUrl",
            &[("url", url), ("hostOverride", host_override)],
        )
        .await
    }

    async fn add_scan_policy(
        &self,
        policy_name: &str,
        attack_strength: AttackStrength,
        alert_threshold: AlertThreshold,
    ) -> Result<(), AppError> {
        let strength = attack_strength.to_string();
        let threshold = alert_threshold.to_string();
        self.action(
            "ascan/action/addScanPolicy",
            &[
                ("scanPolicyName", policy_name),
                ("attackStrength", &strength),
                ("alertThreshold", &threshold),
            ],
        )
        .await
    }

    async fn disable_scanners(&self, ids: &[&str], policy_name: &str) -> Result<(), AppError> {
        let ids = ids.join(",");
        self.action(
            "ascan/action/disableScanners",
            &[("ids", &ids), ("scanPolicyName", policy_name)],
        )
        .await
    }

    async fn exclude_from_scan(&self, regex: &str) -> Result<(), AppError> {
        self.action("ascan/action/excludeFromScan", &[("regex", regex)])
            .await
    }

    async fn spider_scan_as_user(&self, request: &SpiderRequest) -> Result<String, AppError> {
        let max_children = request.max_children.to_string();
        self.scalar(
            "spider/action/scanAsUser",
            &[
                ("contextId", &request.context_id),
                ("userId", &request.user_id),
                ("url", &request.url),
                ("maxChildren", &max_children),
                ("recurse", bool_str(request.recurse)),
                ("subtreeOnly", bool_str(request.subtree_only)),
            ],
            "scanAsUser",
        )
        .await
    }

    async fn spider_status(&self, scan_id: &str) -> Result<Option<String>, AppError> {
        let value = self.call("spider/view/status", &[("scanId", scan_id)]).await?;
        Ok(scalar_field(&value, "status"))
    }

    async fn active_scan_as_user(&self, request: &ActiveScanRequest) -> Result<String, AppError> {
        let mut params = vec![
            ("url", request.url.as_str()),
            ("contextId", request.context_id.as_str()),
            ("userId", request.user_id.as_str()),
            ("recurse", bool_str(request.recurse)),
            ("scanPolicyName", request.scan_policy_name.as_str()),
            ("method", request.method.as_str()),
        ];
        if let Some(post_data) = &request.post_data {
            params.push(("postData", post_data.as_str()));
        }
        self.scalar("ascan/action/scanAsUser", &params, "scanAsUser")
            .await
    }

    async fn active_scan_status(&self, scan_id: &str) -> Result<Option<String>, AppError> {
        let value = self.call("ascan/view/status", &[("scanId", scan_id)]).await?;
        Ok(scalar_field(&value, "status"))
    }

    async fn active_scan_alert_count(&self, scan_id: &str) -> Result<Option<u64>, AppError> {
        let value = self
            .call("ascan/view/alertsIds", &[("scanId", scan_id)])
            .await?;
        Ok(value
            .get("alertsIds")
            .and_then(Value::as_array)
            .map(|ids| ids.len() as u64))
    }

    async fn alerts(&self, base_url: &str) -> Result<Vec<Alert>, AppError> {
        let value = self.call("core/view/alerts", &[("baseurl", base_url)]).await?;
        let alerts = value.get("alerts").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(alerts).map_err(|e| AppError::RemoteOperation {
            service: "Emissary".to_string(),
            detail: format!("core/view/alerts: unparsable alerts: {e}"),
        })
    }

    async fn report(&self, format: ReportFormat) -> Result<String, AppError> {
        let url = format!(
            "{}/OTHER/core/other/{}report/",
            self.base_url,
            format.extension()
        );
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(map_send_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            return Err(remote_error("core/other/report", status.as_u16(), &body));
        }
        Ok(body)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    type Scripted = Result<Option<String>, AppError>;

    /// Scripted Emissary. Status queues are consumed across all scans in
    /// issue order; an exhausted queue reports `100` so loops terminate.
    #[derive(Debug, Default)]
    pub struct FakeEmissary {
        calls: Mutex<Vec<String>>,
        spider_statuses: Mutex<VecDeque<Scripted>>,
        scan_statuses: Mutex<VecDeque<Scripted>>,
        alert_counts: Mutex<VecDeque<Option<u64>>>,
        alerts: Mutex<Vec<Alert>>,
        next_id: AtomicUsize,
    }

    impl FakeEmissary {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_spider_statuses(self, statuses: &[&str]) -> Self {
            self.spider_statuses
                .lock()
                .unwrap()
                .extend(statuses.iter().map(|s| Ok(Some(s.to_string()))));
            self
        }

        /// Queue one active-scan tick: the status and the alert count read with it.
        pub fn with_scan_tick(self, status: &str, alerts: u64) -> Self {
            self.scan_statuses
                .lock()
                .unwrap()
                .push_back(Ok(Some(status.to_string())));
            self.alert_counts.lock().unwrap().push_back(Some(alerts));
            self
        }

        pub fn with_scan_status(self, status: Scripted) -> Self {
            self.scan_statuses.lock().unwrap().push_back(status);
            self
        }

        pub fn with_spider_status(self, status: Scripted) -> Self {
            self.spider_statuses.lock().unwrap().push_back(status);
            self
        }

        pub fn with_alerts(self, count: usize) -> Self {
            self.alerts.lock().unwrap().extend((0..count).map(|i| Alert {
                id: i.to_string(),
                plugin_id: "40012".to_string(),
                alert: "Cross Site Scripting (Reflected)".to_string(),
                risk: "High".to_string(),
                ..Alert::default()
            }));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with(prefix))
                .collect()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn next_id(&self) -> String {
            self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
        }
    }

    #[async_trait]
    impl EmissaryApi for FakeEmissary {
        async fn new_context(&self, context_name: &str) -> Result<String, AppError> {
            self.record(format!("newContext:{context_name}"));
            Ok("1".to_string())
        }

        async fn include_in_context(&self, _: &str, regex: &str) -> Result<(), AppError> {
            self.record(format!("includeInContext:{regex}"));
            Ok(())
        }

        async fn exclude_from_context(&self, _: &str, regex: &str) -> Result<(), AppError> {
            self.record(format!("excludeFromContext:{regex}"));
            Ok(())
        }

        async fn new_user(&self, context_id: &str, name: &str) -> Result<String, AppError> {
            self.record(format!("newUser:{context_id}:{name}"));
            Ok("5".to_string())
        }

        async fn set_authentication_method(
            &self,
            _: &str,
            method_name: &str,
            config_params: &str,
        ) -> Result<(), AppError> {
            self.record(format!("setAuthenticationMethod:{method_name}:{config_params}"));
            Ok(())
        }

        async fn set_indicator(&self, _: &str, indicator: &Indicator) -> Result<(), AppError> {
            self.record(format!("setIndicator:{indicator:?}"));
            Ok(())
        }

        async fn set_authentication_credentials(
            &self,
            _: &str,
            user_id: &str,
            config_params: &str,
        ) -> Result<(), AppError> {
            self.record(format!("setAuthenticationCredentials:{user_id}:{config_params}"));
            Ok(())
        }

        async fn set_user_enabled(&self, _: &str, user_id: &str, enabled: bool) -> Result<(), AppError> {
            self.record(format!("setUserEnabled:{user_id}:{enabled}"));
            Ok(())
        }

        async fn set_forced_user(&self, _: &str, user_id: &str) -> Result<(), AppError> {
            self.record(format!("setForcedUser:{user_id}"));
            Ok(())
        }

        async fn set_forced_user_mode_enabled(&self, enabled: bool) -> Result<(), AppError> {
            self.record(format!("setForcedUserModeEnabled:{enabled}"));
            Ok(())
        }

        async fn add_header_rule(&self, _: &str, header: &str, value: &str) -> Result<(), AppError> {
            self.record(format!("addHeaderRule:{header}:{value}"));
            Ok(())
        }

        async fn access_url(&self, url: &str) -> Result<(), AppError> {
            self.record(format!("accessUrl:{url}"));
            Ok(())
        }

        async fn import_open_api(&self, url: &str, host_override: &str) -> Result<(), AppError> {
            self.record(format!("importOpenApi:{url}:{host_override}"));
            Ok(())
        }

        async fn add_scan_policy(
            &self,
            policy_name: &str,
            attack_strength: AttackStrength,
            alert_threshold: AlertThreshold,
        ) -> Result<(), AppError> {
            self.record(format!("addScanPolicy:{policy_name}:{attack_strength}:{alert_threshold}"));
            Ok(())
        }

        async fn disable_scanners(&self, ids: &[&str], policy_name: &str) -> Result<(), AppError> {
            self.record(format!("disableScanners:{}:{policy_name}", ids.join(",")));
            Ok(())
        }

        async fn exclude_from_scan(&self, regex: &str) -> Result<(), AppError> {
            self.record(format!("excludeFromScan:{regex}"));
            Ok(())
        }

        async fn spider_scan_as_user(&self, request: &SpiderRequest) -> Result<String, AppError> {
            self.record(format!(
                "spiderScanAsUser:{}:subtreeOnly={}",
                request.url, request.subtree_only
            ));
            Ok(self.next_id())
        }

        async fn spider_status(&self, scan_id: &str) -> Result<Option<String>, AppError> {
            self.record(format!("spiderStatus:{scan_id}"));
            self.spider_statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Some("100".to_string())))
        }

        async fn active_scan_as_user(&self, request: &ActiveScanRequest) -> Result<String, AppError> {
            self.record(format!("activeScanAsUser:{}:{}", request.method, request.url));
            Ok(self.next_id())
        }

        async fn active_scan_status(&self, scan_id: &str) -> Result<Option<String>, AppError> {
            self.record(format!("activeScanStatus:{scan_id}"));
            self.scan_statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Some("100".to_string())))
        }

        async fn active_scan_alert_count(&self, scan_id: &str) -> Result<Option<u64>, AppError> {
            self.record(format!("activeScanAlertCount:{scan_id}"));
            Ok(self.alert_counts.lock().unwrap().pop_front().unwrap_or(Some(0)))
        }

        async fn alerts(&self, base_url: &str) -> Result<Vec<Alert>, AppError> {
            self.record(format!("alerts:{base_url}"));
            Ok(self.alerts.lock().unwrap().clone())
        }

        async fn report(&self, format: ReportFormat) -> Result<String, AppError> {
            self.record(format!("report:{}", format.extension()));
            Ok(format!("<{} report>", format.extension()))
        }
    }
}
