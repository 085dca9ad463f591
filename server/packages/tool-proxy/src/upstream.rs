//! Mode selection, outbound request shaping and the upstream HTTP seam.

use axum::body::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use reqwest::Client;
use serde_json::{Map, Value};
use tool_proxy_error::ProxyError;
use tracing::{debug, warn};

pub type ByteStream = BoxStream<'static, Result<Bytes, ProxyError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The caller speaks native tool calling; relay upstream untouched.
    Agent,
    /// Emulate tool calling with fenced JSON blocks.
    Local,
}

/// Agent mode when the caller declares `tools` or `tool_choice`. A JSON
/// `null` counts as absent; an empty `tools` array is still a declaration.
pub fn select_mode(body: &Map<String, Value>) -> Mode {
    let declared = |key: &str| body.get(key).map(|value| !value.is_null()).unwrap_or(false);
    if declared("tools") || declared("tool_choice") {
        Mode::Agent
    } else {
        Mode::Local
    }
}

/// Inbound body after the minimal shape check.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    body: Map<String, Value>,
}

impl ChatRequest {
    /// Requires a JSON object with a `messages` array.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidRequest {
            message: "Invalid messages format".to_string(),
        };
        let value: Value = serde_json::from_slice(bytes).map_err(|_| invalid())?;
        let Value::Object(body) = value else {
            return Err(invalid());
        };
        if !body.get("messages").map(Value::is_array).unwrap_or(false) {
            return Err(invalid());
        }
        Ok(Self { body })
    }

    pub fn mode(&self) -> Mode {
        select_mode(&self.body)
    }

    /// Requested model, falling back to `default_model`.
    pub fn model<'a>(&'a self, default_model: &'a str) -> &'a str {
        self.body
            .get("model")
            .and_then(Value::as_str)
            .filter(|model| !model.is_empty())
            .unwrap_or(default_model)
    }

    /// Outbound body for Agent mode: everything verbatim except `stream` and
    /// a defaulted `model`.
    pub fn into_agent_body(self, default_model: &str) -> Value {
        let model = self.model(default_model).to_string();
        let mut body = self.body;
        body.insert("model".to_string(), Value::String(model));
        body.insert("stream".to_string(), Value::Bool(true));
        Value::Object(body)
    }

    /// Outbound body for Local mode: the instruction message goes first,
    /// caller system messages and tool declarations are dropped.
    pub fn into_local_body(self, default_model: &str, system_prompt: &str) -> Value {
        let model = self.model(default_model).to_string();
        let mut body = self.body;
        let caller_messages = match body.remove("messages") {
            Some(Value::Array(messages)) => messages,
            _ => Vec::new(),
        };
        let mut messages = Vec::with_capacity(caller_messages.len() + 1);
        messages.push(serde_json::json!({"role": "system", "content": system_prompt}));
        messages.extend(
            caller_messages
                .into_iter()
                .filter(|message| message.get("role").and_then(Value::as_str) != Some("system")),
        );
        body.remove("tools");
        body.remove("tool_choice");
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert("model".to_string(), Value::String(model));
        body.insert("stream".to_string(), Value::Bool(true));
        Value::Object(body)
    }
}

/// Opens a streaming completion upstream.
pub trait Upstream: Send + Sync {
    fn open(&self, body: Value) -> BoxFuture<'_, Result<ByteStream, ProxyError>>;
}

#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    client: Client,
    url: Option<String>,
    api_key: Option<String>,
}

impl ReqwestUpstream {
    pub fn new(url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.filter(|url| !url.trim().is_empty()),
            api_key,
        }
    }

    async fn send(&self, body: Value) -> Result<ByteStream, ProxyError> {
        let url = self.url.as_deref().ok_or(ProxyError::UpstreamNotConfigured)?;
        let api_key = self.api_key.as_deref().unwrap_or_default();
        debug!(url = %url, "opening upstream stream");
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "upstream rejected request");
            return Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|err| ProxyError::StreamError {
                    message: err.to_string(),
                })
            })
            .boxed())
    }
}

impl Upstream for ReqwestUpstream {
    fn open(&self, body: Value) -> BoxFuture<'_, Result<ByteStream, ProxyError>> {
        self.send(body).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> ChatRequest {
        ChatRequest::parse(value.to_string().as_bytes()).expect("valid request")
    }

    #[test]
    fn rejects_bodies_without_message_array() {
        for body in [&b"not json"[..], b"[]", b"{}", b"{\"messages\":\"hi\"}"] {
            let err = ChatRequest::parse(body).unwrap_err();
            assert_eq!(err.to_string(), "invalid request: Invalid messages format");
        }
    }

    #[test]
    fn mode_follows_tool_declarations() {
        let messages = json!([{"role": "user", "content": "hi"}]);
        assert_eq!(request(json!({"messages": messages})).mode(), Mode::Local);
        assert_eq!(
            request(json!({"messages": messages, "tools": []})).mode(),
            Mode::Agent
        );
        assert_eq!(
            request(json!({"messages": messages, "tools": null, "tool_choice": null})).mode(),
            Mode::Local
        );
        assert_eq!(
            request(json!({"messages": messages, "tools": [{"type": "function"}]})).mode(),
            Mode::Agent
        );
        assert_eq!(
            request(json!({"messages": messages, "tool_choice": "auto"})).mode(),
            Mode::Agent
        );
    }

    #[test]
    fn local_body_injects_prompt_and_strips_tools() {
        let body = request(json!({
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "list files"}
            ],
            "tool_choice": null,
            "temperature": 0.2,
            "stream": false
        }))
        .into_local_body("llama3.1:8b", "INSTRUCTIONS");
        assert_eq!(
            body,
            json!({
                "messages": [
                    {"role": "system", "content": "INSTRUCTIONS"},
                    {"role": "user", "content": "list files"}
                ],
                "model": "llama3.1:8b",
                "temperature": 0.2,
                "stream": true
            })
        );
    }

    #[test]
    fn agent_body_keeps_tools_and_model() {
        let tools = json!([{"type": "function", "function": {"name": "lookup"}}]);
        let body = request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "model": "gpt-4o",
            "tools": tools
        }))
        .into_agent_body("llama3.1:8b");
        assert_eq!(body["tools"], tools);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn missing_url_is_a_configuration_fault() {
        let upstream = ReqwestUpstream::new(None, None);
        let err = upstream.open(json!({})).await.err().expect("error");
        assert!(matches!(err, ProxyError::UpstreamNotConfigured));
    }
}
