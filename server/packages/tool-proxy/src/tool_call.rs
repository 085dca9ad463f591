//! Tool-call shape recognized inside fenced JSON blocks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ListFiles,
    ReadFile,
    WriteFile,
    ExecCmd,
    Git,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::ListFiles,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::ExecCmd,
        ToolName::Git,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ListFiles => "list_files",
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::ExecCmd => "exec_cmd",
            ToolName::Git => "git",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|name| name.as_str() == value)
            .ok_or_else(|| value.to_string())
    }
}

/// A parsed `{"tool", "args", "comment"}` payload.
///
/// `tool` stays a string so an unrecognized name can still be dispatched and
/// reported by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ToolCall {
    pub fn kind(&self) -> Option<ToolName> {
        self.tool.parse().ok()
    }

    pub fn arguments_json(&self) -> String {
        Value::Object(self.args.clone()).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Known tool with mapping args.
    Accepted(ToolCall),
    /// Has a string `tool` key naming something outside the fixed set. Still
    /// dispatched so the executor can answer with an "unknown tool" result.
    UnknownTool(ToolCall),
    /// Not a tool call; the block stays ordinary assistant text.
    Rejected,
}

impl Verdict {
    pub fn into_dispatch(self) -> Option<ToolCall> {
        match self {
            Verdict::Accepted(call) | Verdict::UnknownTool(call) => Some(call),
            Verdict::Rejected => None,
        }
    }
}

/// Parses the inner text of a fenced block and classifies it.
pub fn classify_block(inner: &str) -> Verdict {
    match serde_json::from_str::<Value>(inner) {
        Ok(value) => validate(&value),
        Err(_) => Verdict::Rejected,
    }
}

pub fn validate(value: &Value) -> Verdict {
    let Some(object) = value.as_object() else {
        return Verdict::Rejected;
    };
    let Some(tool) = object.get("tool").and_then(Value::as_str) else {
        return Verdict::Rejected;
    };
    let comment = object
        .get("comment")
        .and_then(Value::as_str)
        .map(str::to_string);
    let args = object.get("args").and_then(Value::as_object).cloned();

    if tool.parse::<ToolName>().is_err() {
        return Verdict::UnknownTool(ToolCall {
            tool: tool.to_string(),
            args: args.unwrap_or_default(),
            comment,
        });
    }

    match args {
        Some(args) => Verdict::Accepted(ToolCall {
            tool: tool.to_string(),
            args,
            comment,
        }),
        None => Verdict::Rejected,
    }
}
