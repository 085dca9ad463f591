use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tool_proxy_error::{ProblemDetails, ProxyError};
use tower_http::trace::TraceLayer;
use tracing::{info, Span};

use crate::chunk::ChunkEncoder;
use crate::relay::RelaySession;
use crate::sandbox::SandboxExecutor;
use crate::upstream::{ChatRequest, Mode, Upstream};

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    executor: Arc<SandboxExecutor>,
    upstream: Arc<dyn Upstream>,
    default_model: String,
    system_prompt: String,
}

impl AppState {
    pub fn new(
        executor: SandboxExecutor,
        upstream: Arc<dyn Upstream>,
        default_model: String,
        system_prompt: String,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            upstream,
            default_model,
            system_prompt,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(shared);

    let http_logging = match std::env::var("TOOL_PROXY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Proxy(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::from(ProxyError::NotFound {
        path: uri.path().to_string(),
    })
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = ChatRequest::parse(&body)?;
    let mode = request.mode();
    let model = request.model(&state.default_model).to_string();

    match mode {
        Mode::Agent => {
            let outbound = request.into_agent_body(&state.default_model);
            let upstream = state.upstream.open(outbound).await?;
            info!(mode = "agent", model = %model, "relaying upstream stream");
            Ok(event_stream(Body::from_stream(upstream)))
        }
        Mode::Local => {
            let outbound = request.into_local_body(&state.default_model, &state.system_prompt);
            let upstream = state.upstream.open(outbound).await?;
            let encoder = ChunkEncoder::new(model.clone());
            info!(mode = "local", model = %model, completion_id = %encoder.id(), "starting relay");
            let frames = RelaySession::new(Arc::clone(&state.executor), encoder).spawn(upstream);
            let body = ReceiverStream::new(frames)
                .map(|frame| Ok::<_, Infallible>(frame.to_sse_bytes()));
            Ok(event_stream(Body::from_stream(body)))
        }
    }
}

fn event_stream(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
