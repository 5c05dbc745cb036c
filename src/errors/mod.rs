//! Unified error handling with consistent API response envelope.
//!
//! Every error renders twice: `Display` carries the operator detail (remote
//! payloads, container names), `build_user_message` is the sanitized text
//! handed back to the Build User.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Error detail in the API response envelope.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Consistent JSON envelope for all API responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wrap a successful result in the envelope.
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            data: Some(data),
            error: None,
        })
    }

    /// Wrap an error in the envelope.
    pub fn error(code: &str, message: &str) -> Json<Self> {
        Json(Self {
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        })
    }
}

/// Orchestration error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Remote unreachable: {service}: {detail}")]
    RemoteUnreachable { service: String, detail: String },

    #[error("Remote operation failed: {service}: {detail}")]
    RemoteOperation { service: String, detail: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Provisioning failed (fatal): {detail}")]
    ProvisioningFatal {
        build_user_message: String,
        detail: String,
    },

    #[error("Provisioning failed (retry-worthy): {detail}")]
    ProvisioningRecoverable {
        build_user_message: String,
        detail: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Session process error: {0}")]
    Process(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Session {session_id}: {source}")]
    Session {
        session_id: String,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Shorthand for an Emissary connection-level failure.
    pub fn emissary_unreachable(detail: impl Into<String>) -> Self {
        Self::RemoteUnreachable {
            service: "Emissary".to_string(),
            detail: detail.into(),
        }
    }

    /// Tag this error with the session it originated in.
    ///
    /// Already-tagged errors are returned unchanged.
    pub fn in_session(self, session_id: &str) -> Self {
        match self {
            tagged @ Self::Session { .. } => tagged,
            other => Self::Session {
                session_id: session_id.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The error with any session tagging peeled off.
    pub fn root(&self) -> &AppError {
        match self {
            Self::Session { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is a polling budget expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout(_))
    }

    /// Check if this error is a connection-level remote failure.
    pub fn is_unreachable(&self) -> bool {
        matches!(self.root(), Self::RemoteUnreachable { .. })
    }

    /// Check if this error is a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self.root(), Self::Validation(_))
    }

    /// Stable machine-readable code for the envelope.
    pub fn code(&self) -> &'static str {
        match self.root() {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RemoteUnreachable { .. } => "REMOTE_UNREACHABLE",
            Self::RemoteOperation { .. } => "REMOTE_OPERATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::ProvisioningFatal { .. } => "PROVISIONING_FATAL",
            Self::ProvisioningRecoverable { .. } => "PROVISIONING_RETRY",
            Self::Conflict(_) => "CONFLICT",
            Self::Process(_) | Self::Io(_) | Self::Internal(_) | Self::Session { .. } => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Sanitized message for the Build User: no container names, no remote payloads.
    pub fn build_user_message(&self) -> String {
        let message = match self.root() {
            Self::Validation(msg) => msg.clone(),
            Self::RemoteUnreachable { service, .. } => {
                format!("The {service} could not be reached. Please try again.")
            }
            Self::RemoteOperation { service, .. } => {
                format!("The {service} rejected a request while running your test.")
            }
            Self::Timeout(_) => "An operation did not complete within its time budget.".to_string(),
            Self::ProvisioningFatal {
                build_user_message, ..
            }
            | Self::ProvisioningRecoverable {
                build_user_message, ..
            } => build_user_message.clone(),
            Self::Conflict(msg) => msg.clone(),
            Self::Process(_) | Self::Io(_) | Self::Internal(_) | Self::Session { .. } => {
                "An internal error occurred".to_string()
            }
        };

        match self {
            Self::Session { session_id, .. } => format!("Session {session_id}: {message}"),
            _ => message,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.root() {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::RemoteUnreachable { .. }
            | AppError::RemoteOperation { .. }
            | AppError::ProvisioningFatal { .. }
            | AppError::ProvisioningRecoverable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ApiResponse::<()> {
            data: None,
            error: Some(ApiError {
                code: self.code().to_string(),
                message: self.build_user_message(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_response_success() {
        let response = ApiResponse::success("hello");
        let json = serde_json::to_value(&response.0).unwrap();
        assert_eq!(json["data"], "hello");
        assert!(json["error"].is_null());
    }

    #[test]
    fn api_response_error() {
        let response = ApiResponse::<()>::error("CONFLICT", "Already running");
        let json = serde_json::to_value(&response.0).unwrap();
        assert!(json["data"].is_null());
        assert_eq!(json["error"]["code"], "CONFLICT");
        assert_eq!(json["error"]["message"], "Already running");
    }

    #[test]
    fn build_user_message_hides_remote_detail() {
        let err = AppError::emissary_unreachable("connect ECONNREFUSED 10.0.0.4:8080");
        assert!(!err.build_user_message().contains("10.0.0.4"));
        assert!(err.to_string().contains("10.0.0.4"));
    }

    #[test]
    fn session_tag_prefixes_both_renderings() {
        let err = AppError::Timeout("active scan".to_string()).in_session("lowPrivUser");
        assert!(err.to_string().starts_with("Session lowPrivUser"));
        assert!(err.build_user_message().starts_with("Session lowPrivUser"));
        assert!(err.is_timeout());
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[test]
    fn in_session_does_not_double_tag() {
        let err = AppError::Validation("bad".to_string())
            .in_session("a")
            .in_session("b");
        assert!(matches!(&err, AppError::Session { session_id, .. } if session_id == "a"));
    }

    #[test]
    fn provisioning_message_is_the_classified_one() {
        let err = AppError::ProvisioningFatal {
            build_user_message: "Please contact support.".to_string(),
            detail: "InvalidParameterException: Creation of service was not idempotent".to_string(),
        };
        assert_eq!(err.build_user_message(), "Please contact support.");
        assert!(err.to_string().contains("not idempotent"));
    }

    #[test]
    fn app_error_from_io() {
        let err: AppError = std::io::Error::other("disk full").into();
        assert!(matches!(err, AppError::Io(_)));
    }
}
