//! OpenAI-compatible `chat.completion.chunk` frames emitted by the proxy.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::tool_call::ToolCall;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

static COMPLETION_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static TOOL_CALL_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub fn next_completion_id() -> String {
    let sequence = COMPLETION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("chatcmpl-{}-{sequence}", Utc::now().timestamp_millis())
}

pub fn next_tool_call_id() -> String {
    let sequence = TOOL_CALL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("call_{}_{sequence}", Utc::now().timestamp_millis())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallEnvelope>>,
    /// Upstream delta fields relayed as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// Builds the chunks of one completion. All chunks share an id, model and
/// creation time.
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    id: String,
    model: String,
    created: i64,
}

impl ChunkEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_identity(next_completion_id(), model, Utc::now().timestamp())
    }

    pub fn with_identity(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Empty-delta chunk that opens the stream.
    pub fn opening(&self) -> ChatChunk {
        self.chunk(ChunkDelta::default(), None)
    }

    pub fn content(&self, text: impl Into<String>) -> ChatChunk {
        self.chunk(
            ChunkDelta {
                content: Some(text.into()),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    /// Announces a dispatched call. `call_id` comes from [`next_tool_call_id`].
    pub fn tool_call_with_id(&self, call_id: impl Into<String>, call: &ToolCall) -> ChatChunk {
        let envelope = ToolCallEnvelope {
            id: call_id.into(),
            call_type: "function",
            function: FunctionCall {
                name: call.tool.clone(),
                arguments: call.arguments_json(),
            },
        };
        self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![envelope]),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    /// Re-encodes upstream delta fields the proxy does not interpret.
    pub fn passthrough(&self, fields: Map<String, Value>) -> ChatChunk {
        self.chunk(
            ChunkDelta {
                extra: fields,
                ..ChunkDelta::default()
            },
            None,
        )
    }

    pub fn finish(&self, reason: impl Into<String>) -> ChatChunk {
        self.chunk(ChunkDelta::default(), Some(reason.into()))
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatChunk {
        ChatChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoder() -> ChunkEncoder {
        ChunkEncoder::with_identity("chatcmpl-test", "llama3.1:8b", 1_700_000_000)
    }

    #[test]
    fn content_chunk_shape() {
        insta::assert_json_snapshot!(encoder().content("hi"), @r###"
        {
          "id": "chatcmpl-test",
          "object": "chat.completion.chunk",
          "created": 1700000000,
          "model": "llama3.1:8b",
          "choices": [
            {
              "index": 0,
              "delta": {
                "content": "hi"
              },
              "finish_reason": null
            }
          ]
        }
        "###);
    }

    #[test]
    fn tool_call_chunk_carries_json_arguments() {
        let mut args = Map::new();
        args.insert("path".to_string(), json!("src"));
        let call = ToolCall {
            tool: "list_files".to_string(),
            args,
            comment: Some("browse".to_string()),
        };
        let chunk = encoder().tool_call_with_id("call_1_1", &call);
        insta::assert_json_snapshot!(chunk.choices[0].delta, @r###"
        {
          "tool_calls": [
            {
              "id": "call_1_1",
              "type": "function",
              "function": {
                "name": "list_files",
                "arguments": "{\"path\":\"src\"}"
              }
            }
          ]
        }
        "###);
    }

    #[test]
    fn passthrough_chunk_keeps_upstream_fields() {
        let mut fields = Map::new();
        fields.insert(
            "tool_calls".to_string(),
            json!([{"function": {"name": "lookup"}}]),
        );
        let chunk = encoder().passthrough(fields);
        insta::assert_json_snapshot!(chunk, @r###"
        {
          "id": "chatcmpl-test",
          "object": "chat.completion.chunk",
          "created": 1700000000,
          "model": "llama3.1:8b",
          "choices": [
            {
              "index": 0,
              "delta": {
                "tool_calls": [
                  {
                    "function": {
                      "name": "lookup"
                    }
                  }
                ]
              },
              "finish_reason": null
            }
          ]
        }
        "###);
    }

    #[test]
    fn finish_chunk_has_empty_delta() {
        let value = serde_json::to_value(encoder().finish("stop")).expect("encode");
        assert_eq!(value["choices"][0]["delta"], json!({}));
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let first = next_tool_call_id();
        let second = next_tool_call_id();
        assert!(first.starts_with("call_"));
        assert_ne!(first, second);
        let a = ChunkEncoder::new("m");
        let b = ChunkEncoder::new("m");
        assert!(a.id().starts_with("chatcmpl-"));
        assert_ne!(a.id(), b.id());
    }
}
