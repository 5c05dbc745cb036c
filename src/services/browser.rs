//! Minimal WebDriver boundary to the browser-automation sidecar.
//!
//! The browser is proxied through the session's Emissary so every page it
//! loads lands in the Emissary's sites tree.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::models::job::Browser;
use crate::models::provisioning::WorkerEndpoint;

/// W3C WebDriver element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), AppError>;
    /// Type into the element located by `locator` (see [`css_for_locator`]).
    async fn type_into(&self, locator: &str, text: &str) -> Result<(), AppError>;
    async fn click(&self, locator: &str) -> Result<(), AppError>;
    async fn page_source(&self) -> Result<String, AppError>;
    async fn quit(&self) -> Result<(), AppError>;
}

/// Job locators are an element name/id, or a space separated class list.
pub fn css_for_locator(locator: &str) -> String {
    let locator = locator.trim();
    if locator.contains(char::is_whitespace) {
        locator
            .split_whitespace()
            .map(|class| format!(".{class}"))
            .collect()
    } else {
        format!("[name=\"{locator}\"],#{locator}")
    }
}

pub struct WebDriverSession {
    client: reqwest::Client,
    session_url: String,
}

impl WebDriverSession {
    pub async fn start(
        sidecar: &WorkerEndpoint,
        browser: Browser,
        proxy: &WorkerEndpoint,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build WebDriver client: {e}")))?;
        let hub = format!("{}/wd/hub", sidecar.base_url());
        let proxy_address = proxy.to_string();
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": browser.to_string(),
                    "acceptInsecureCerts": true,
                    "proxy": {
                        "proxyType": "manual",
                        "httpProxy": proxy_address,
                        "sslProxy": proxy_address
                    }
                }
            }
        });

        let value = send(client.post(format!("{hub}/session")).json(&capabilities)).await?;
        let session_id = value["sessionId"].as_str().ok_or_else(|| AppError::RemoteOperation {
            service: "browser sidecar".to_string(),
            detail: format!("new session response has no sessionId: {value}"),
        })?;
        tracing::debug!(session_id, %sidecar, "WebDriver session started");

        Ok(Self {
            client,
            session_url: format!("{hub}/session/{session_id}"),
        })
    }

    async fn find(&self, locator: &str) -> Result<String, AppError> {
        let value = send(
            self.client
                .post(format!("{}/element", self.session_url))
                .json(&json!({ "using": "css selector", "value": css_for_locator(locator) })),
        )
        .await?;
        value[ELEMENT_KEY]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::RemoteOperation {
                service: "browser sidecar".to_string(),
                detail: format!("no element found for locator '{locator}'"),
            })
    }
}

/// Send a WebDriver command and unwrap its `value`.
async fn send(request: reqwest::RequestBuilder) -> Result<Value, AppError> {
    let response = request.send().await.map_err(|e| {
        if e.is_connect() {
            AppError::RemoteUnreachable {
                service: "browser sidecar".to_string(),
                detail: e.to_string(),
            }
        } else {
            AppError::RemoteOperation {
                service: "browser sidecar".to_string(),
                detail: e.to_string(),
            }
        }
    })?;
    let status = response.status();
    let body: Value = response.json().await.map_err(|e| AppError::RemoteOperation {
        service: "browser sidecar".to_string(),
        detail: format!("unparsable WebDriver response: {e}"),
    })?;
    if !status.is_success() {
        return Err(AppError::RemoteOperation {
            service: "browser sidecar".to_string(),
            detail: format!("HTTP {status}: {}", body["value"]["message"]),
        });
    }
    Ok(body["value"].clone())
}

#[async_trait]
impl BrowserDriver for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), AppError> {
        send(
            self.client
                .post(format!("{}/url", self.session_url))
                .json(&json!({ "url": url })),
        )
        .await
        .map(|_| ())
    }

    async fn type_into(&self, locator: &str, text: &str) -> Result<(), AppError> {
        let element = self.find(locator).await?;
        send(
            self.client
                .post(format!("{}/element/{element}/value", self.session_url))
                .json(&json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    async fn click(&self, locator: &str) -> Result<(), AppError> {
        let element = self.find(locator).await?;
        send(
            self.client
                .post(format!("{}/element/{element}/click", self.session_url))
                .json(&json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn page_source(&self) -> Result<String, AppError> {
        let value = send(self.client.get(format!("{}/source", self.session_url))).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn quit(&self) -> Result<(), AppError> {
        send(self.client.delete(&self.session_url)).await.map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_locator_matches_name_or_id() {
        assert_eq!(css_for_locator("userName"), "[name=\"userName\"],#userName");
    }

    #[test]
    fn class_list_locator_becomes_compound_class_selector() {
        assert_eq!(css_for_locator("btn btn-danger"), ".btn.btn-danger");
    }
}
