//! Error taxonomy shared by the tool proxy HTTP surface.
//!
//! Errors that reach a caller before the event stream opens are rendered as
//! RFC 7807 problem details. Everything that happens after the stream opens is
//! reported in-band and never uses these types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    NotFound,
    UpstreamNotConfigured,
    UpstreamUnavailable,
    UpstreamStatus,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:tool-proxy:error:invalid_request",
            Self::NotFound => "urn:tool-proxy:error:not_found",
            Self::UpstreamNotConfigured => "urn:tool-proxy:error:upstream_not_configured",
            Self::UpstreamUnavailable => "urn:tool-proxy:error:upstream_unavailable",
            Self::UpstreamStatus => "urn:tool-proxy:error:upstream_status",
            Self::StreamError => "urn:tool-proxy:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::NotFound => "Not Found",
            Self::UpstreamNotConfigured => "Upstream Not Configured",
            Self::UpstreamUnavailable => "Upstream Unavailable",
            Self::UpstreamStatus => "Upstream Error",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::UpstreamNotConfigured => 500,
            Self::UpstreamUnavailable => 502,
            Self::UpstreamStatus => 502,
            Self::StreamError => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("{path} not found; this proxy only serves /v1/chat/completions and /healthz")]
    NotFound { path: String },
    #[error("UPSTREAM_URL not configured")]
    UpstreamNotConfigured,
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },
    #[error("upstream error: {status} {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl ProxyError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::UpstreamNotConfigured => ErrorType::UpstreamNotConfigured,
            Self::UpstreamUnavailable { .. } => ErrorType::UpstreamUnavailable,
            Self::UpstreamStatus { .. } => ErrorType::UpstreamStatus,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        match self {
            Self::UpstreamStatus { status, .. } => {
                problem
                    .extensions
                    .insert("upstreamStatus".to_string(), Value::from(*status));
            }
            Self::NotFound { path } => {
                problem
                    .extensions
                    .insert("path".to_string(), Value::String(path.clone()));
            }
            _ => {}
        }
        problem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_maps_to_bad_gateway() {
        let err = ProxyError::UpstreamStatus {
            status: 503,
            body: "overloaded".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(problem.type_, "urn:tool-proxy:error:upstream_status");
        assert_eq!(problem.extensions.get("upstreamStatus"), Some(&Value::from(503)));
        assert_eq!(problem.detail.as_deref(), Some("upstream error: 503 overloaded"));
    }

    #[test]
    fn missing_upstream_is_a_server_fault() {
        let problem = ProxyError::UpstreamNotConfigured.to_problem_details();
        assert_eq!(problem.status, 500);
        assert_eq!(problem.title, "Upstream Not Configured");
    }

    #[test]
    fn problem_serializes_type_field() {
        let problem = ProxyError::InvalidRequest {
            message: "Invalid messages format".to_string(),
        }
        .to_problem_details();
        let value = serde_json::to_value(&problem).expect("serialize");
        assert_eq!(value["type"], "urn:tool-proxy:error:invalid_request");
        assert_eq!(value["status"], 400);
        assert!(value.get("path").is_none());
    }
}
