use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tool_proxy::router::{build_router, AppState};
use tool_proxy::sandbox::{
    ExecPolicy, SandboxExecutor, DEFAULT_EXEC_BLOCKLIST, DEFAULT_EXEC_MAX_BUFFER,
};
use tool_proxy::upstream::{ByteStream, Upstream};
use tool_proxy::workspace::Workspace;
use tool_proxy_error::ProxyError;
use tower::util::ServiceExt;

const TEST_MODEL: &str = "test-model";
const TEST_PROMPT: &str = "TEST INSTRUCTIONS";

enum Script {
    Frames(Vec<String>),
    Status(u16, String),
    Unconfigured,
}

/// Upstream double that records outbound bodies and replays canned frames.
struct ScriptedUpstream {
    script: Script,
    requests: Mutex<Vec<Value>>,
}

impl ScriptedUpstream {
    fn new(script: Script) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Upstream for ScriptedUpstream {
    fn open(&self, body: Value) -> BoxFuture<'_, Result<ByteStream, ProxyError>> {
        self.requests.lock().expect("requests lock").push(body);
        let result = match &self.script {
            Script::Frames(frames) => {
                let chunks: Vec<Result<Bytes, ProxyError>> = frames
                    .iter()
                    .map(|frame| Ok(Bytes::from(frame.clone())))
                    .collect();
                Ok(futures::stream::iter(chunks).boxed())
            }
            Script::Status(status, body) => Err(ProxyError::UpstreamStatus {
                status: *status,
                body: body.clone(),
            }),
            Script::Unconfigured => Err(ProxyError::UpstreamNotConfigured),
        };
        async move { result }.boxed()
    }
}

struct TestApp {
    app: Router,
    upstream: Arc<ScriptedUpstream>,
    workspace: TempDir,
}

impl TestApp {
    fn new(script: Script) -> Self {
        let workspace = tempfile::tempdir().expect("create temp workspace");
        let policy = ExecPolicy::new(
            std::time::Duration::from_secs(5),
            DEFAULT_EXEC_MAX_BUFFER,
            DEFAULT_EXEC_BLOCKLIST,
        )
        .expect("exec policy");
        let executor = SandboxExecutor::new(
            Workspace::new(workspace.path()).expect("workspace"),
            policy,
        );
        let upstream = Arc::new(ScriptedUpstream::new(script));
        let state = AppState::new(
            executor,
            upstream.clone(),
            TEST_MODEL.to_string(),
            TEST_PROMPT.to_string(),
        );
        Self {
            app: build_router(state),
            upstream,
            workspace,
        }
    }

    fn with_frames(frames: Vec<String>) -> Self {
        Self::new(Script::Frames(frames))
    }
}

fn content_frame(text: &str) -> String {
    let event = json!({
        "id": "upstream-1",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
    });
    format!("data: {event}\n\n")
}

fn done_frame() -> String {
    "data: [DONE]\n\n".to_string()
}

fn chat_body(extra: Value) -> Value {
    let mut body = json!({
        "messages": [
            {"role": "system", "content": "caller system prompt"},
            {"role": "user", "content": "hello"}
        ]
    });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    body
}

async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, headers, bytes)
}

async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(body) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request");
    let (status, _headers, bytes) = send_request(app, request).await;
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

async fn post_chat(app: &Router, body: Value) -> (StatusCode, HeaderMap, Bytes) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("chat request");
    send_request(app, request).await
}

/// Splits an event-stream body into its `data:` payloads.
fn sse_payloads(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

fn sse_chunks(bytes: &[u8]) -> Vec<Value> {
    sse_payloads(bytes)
        .iter()
        .filter(|payload| payload.as_str() != "[DONE]")
        .map(|payload| serde_json::from_str(payload).expect("chunk json"))
        .collect()
}
