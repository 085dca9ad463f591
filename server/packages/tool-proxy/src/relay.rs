//! Per-request stream relay for Local mode.
//!
//! A [`RelaySession`] reads the upstream SSE byte stream, scans assistant
//! content for fenced tool calls, runs them on the sandbox and splices their
//! results back in. The terminal chunk is only written once upstream is done
//! and every dispatched tool has reported back.

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Bytes;
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tool_proxy_error::ProxyError;
use tracing::{debug, info, warn};

use crate::chunk::{next_tool_call_id, ChatChunk, ChunkEncoder};
use crate::fence::{FenceScanner, Segment};
use crate::sandbox::{SandboxExecutor, ToolResult};
use crate::sse::{parse_event, SseAccumulator, UpstreamEvent};
use crate::tool_call::{classify_block, ToolCall};
use crate::upstream::ByteStream;

pub const DEFAULT_FINISH_REASON: &str = "stop";
const FRAME_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Upstream is still sending.
    Streaming,
    /// Upstream is done; waiting on tool results.
    Draining,
    /// Terminal chunk and `[DONE]` written.
    Closed,
}

/// One outgoing SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Chunk(ChatChunk),
    Done,
}

impl RelayFrame {
    pub fn to_sse_bytes(&self) -> Bytes {
        match self {
            RelayFrame::Chunk(chunk) => match serde_json::to_string(chunk) {
                Ok(json) => Bytes::from(format!("data: {json}\n\n")),
                Err(err) => {
                    warn!(error = %err, "failed to encode chunk");
                    Bytes::new()
                }
            },
            RelayFrame::Done => Bytes::from_static(b"data: [DONE]\n\n"),
        }
    }

    pub fn as_chunk(&self) -> Option<&ChatChunk> {
        match self {
            RelayFrame::Chunk(chunk) => Some(chunk),
            RelayFrame::Done => None,
        }
    }
}

#[derive(Debug)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool: String,
    pub result: ToolResult,
}

pub struct RelaySession {
    encoder: ChunkEncoder,
    executor: Arc<SandboxExecutor>,
    accumulator: SseAccumulator,
    scanner: FenceScanner,
    processed: HashSet<String>,
    tasks: JoinSet<ToolOutcome>,
    phase: Phase,
    finish_reason: Option<String>,
}

impl RelaySession {
    pub fn new(executor: Arc<SandboxExecutor>, encoder: ChunkEncoder) -> Self {
        Self {
            encoder,
            executor,
            accumulator: SseAccumulator::new(),
            scanner: FenceScanner::new(),
            processed: HashSet::new(),
            tasks: JoinSet::new(),
            phase: Phase::Streaming,
            finish_reason: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Tool executions dispatched but not yet reported.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// First frame of every Local-mode response.
    pub fn open(&self) -> RelayFrame {
        RelayFrame::Chunk(self.encoder.opening())
    }

    /// Feeds raw upstream bytes.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Vec<RelayFrame> {
        let mut frames = Vec::new();
        for payload in self.accumulator.push(bytes) {
            self.on_payload(&payload, &mut frames);
        }
        frames
    }

    /// Upstream closed its byte stream, with or without `[DONE]`.
    pub fn on_eof(&mut self) -> Vec<RelayFrame> {
        let mut frames = Vec::new();
        for payload in self.accumulator.finish() {
            self.on_payload(&payload, &mut frames);
        }
        self.finish_upstream(&mut frames);
        frames
    }

    pub fn on_transport_error(&mut self, message: &str) -> Vec<RelayFrame> {
        let mut frames = Vec::new();
        if self.phase != Phase::Streaming {
            return frames;
        }
        warn!(error = %message, pending = self.tasks.len(), "upstream stream failed");
        frames.push(self.content(format!("PROXY_ERROR: upstream stream error: {message}")));
        self.finish_upstream(&mut frames);
        frames
    }

    pub fn on_task_joined(&mut self, joined: Result<ToolOutcome, JoinError>) -> Vec<RelayFrame> {
        let mut frames = Vec::new();
        let text = match joined {
            Ok(outcome) => {
                info!(
                    tool = %outcome.tool,
                    call_id = %outcome.call_id,
                    success = outcome.result.success,
                    pending = self.tasks.len(),
                    "tool call finished"
                );
                outcome.result.render(&outcome.tool)
            }
            Err(err) => {
                warn!(error = %err, "tool task failed");
                format!("TOOL_ERROR: tool task failed: {err}")
            }
        };
        frames.push(self.content(format!("\n\n{text}")));
        self.maybe_close(&mut frames);
        frames
    }

    /// Waits for the next tool execution to finish. Returns `None` when
    /// nothing is pending.
    pub async fn next_outcome(&mut self) -> Option<Vec<RelayFrame>> {
        let joined = self.tasks.join_next().await?;
        Some(self.on_task_joined(joined))
    }

    /// Drives the session to completion, writing frames to `tx`.
    pub async fn run(mut self, mut upstream: ByteStream, tx: mpsc::Sender<RelayFrame>) {
        if tx.send(self.open()).await.is_err() {
            return self.abandon();
        }
        loop {
            let frames = tokio::select! {
                next = upstream.next(), if self.phase == Phase::Streaming => match next {
                    Some(Ok(bytes)) => self.on_bytes(&bytes),
                    Some(Err(err)) => self.on_transport_error(&transport_message(err)),
                    None => self.on_eof(),
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_task_joined(joined)
                }
                else => break,
            };
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    return self.abandon();
                }
            }
            if self.phase == Phase::Closed {
                break;
            }
        }
        debug!(completion_id = %self.encoder.id(), "relay closed");
    }

    /// Spawns the relay and returns the receiving half of its frame channel.
    pub fn spawn(self, upstream: ByteStream) -> mpsc::Receiver<RelayFrame> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        tokio::spawn(self.run(upstream, tx));
        rx
    }

    fn abandon(mut self) {
        let pending = self.tasks.len();
        info!(pending, "client disconnected; detaching tool tasks");
        self.tasks.detach_all();
    }

    fn on_payload(&mut self, payload: &str, frames: &mut Vec<RelayFrame>) {
        if self.phase != Phase::Streaming {
            return;
        }
        match parse_event(payload) {
            Ok(UpstreamEvent::Done) => self.finish_upstream(frames),
            Ok(UpstreamEvent::Data(value)) => self.on_data(&value, frames),
            Err(err) => {
                warn!(error = %err, "failed to parse upstream event");
                frames.push(self.content(format!(
                    "PROXY_ERROR: failed to parse upstream event: {err}"
                )));
            }
        }
    }

    fn on_data(&mut self, value: &Value, frames: &mut Vec<RelayFrame>) {
        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| error.as_str().map(str::to_string))
                .unwrap_or_else(|| error.to_string());
            warn!(error = %message, "upstream reported an error");
            frames.push(self.content(format!("UPSTREAM_ERROR: {message}")));
            return;
        }
        let Some(choice) = value.get("choices").and_then(|choices| choices.get(0)) else {
            return;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta").and_then(Value::as_object) else {
            return;
        };
        // The opening chunk already stands in for `role`.
        let mut content = "";
        let mut passthrough = Map::new();
        for (key, field) in delta {
            match (key.as_str(), field) {
                ("content", field) => content = field.as_str().unwrap_or_default(),
                ("role", _) | (_, Value::Null) => {}
                (_, Value::String(text)) if text.is_empty() => {}
                _ => {
                    passthrough.insert(key.clone(), field.clone());
                }
            }
        }
        if !passthrough.is_empty() {
            frames.push(RelayFrame::Chunk(self.encoder.passthrough(passthrough)));
        }
        if !content.is_empty() {
            self.on_content(content, frames);
        }
    }

    fn on_content(&mut self, content: &str, frames: &mut Vec<RelayFrame>) {
        for segment in self.scanner.push(content) {
            match segment {
                Segment::Text(text) => frames.push(self.content(text)),
                Segment::Block { raw, inner } => match classify_block(&inner).into_dispatch() {
                    None => frames.push(self.content(raw)),
                    Some(_) if self.processed.contains(&inner) => {
                        debug!(block = %inner, "skipping repeated tool call");
                    }
                    Some(call) => {
                        self.processed.insert(inner);
                        self.dispatch(call, frames);
                    }
                },
            }
        }
    }

    fn dispatch(&mut self, call: ToolCall, frames: &mut Vec<RelayFrame>) {
        let call_id = next_tool_call_id();
        frames.push(RelayFrame::Chunk(
            self.encoder.tool_call_with_id(call_id.clone(), &call),
        ));
        let executor = Arc::clone(&self.executor);
        let tool = call.tool.clone();
        let task_call_id = call_id.clone();
        self.tasks.spawn(async move {
            let result = executor.execute(&call).await;
            ToolOutcome {
                call_id: task_call_id,
                tool: call.tool,
                result,
            }
        });
        info!(tool = %tool, call_id = %call_id, pending = self.tasks.len(), "dispatched tool call");
    }

    fn finish_upstream(&mut self, frames: &mut Vec<RelayFrame>) {
        if self.phase != Phase::Streaming {
            return;
        }
        if let Some(rest) = self.scanner.finish() {
            frames.push(self.content(rest));
        }
        self.phase = Phase::Draining;
        debug!(pending = self.tasks.len(), "upstream finished");
        self.maybe_close(frames);
    }

    fn maybe_close(&mut self, frames: &mut Vec<RelayFrame>) {
        if self.phase != Phase::Draining || !self.tasks.is_empty() {
            return;
        }
        let reason = self
            .finish_reason
            .clone()
            .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());
        frames.push(RelayFrame::Chunk(self.encoder.finish(reason)));
        frames.push(RelayFrame::Done);
        self.phase = Phase::Closed;
    }

    fn content(&self, text: impl Into<String>) -> RelayFrame {
        RelayFrame::Chunk(self.encoder.content(text))
    }
}

fn transport_message(err: ProxyError) -> String {
    match err {
        ProxyError::StreamError { message } => message,
        other => other.to_string(),
    }
}
