//! Tool proxy core: fenced-JSON tool-call emulation over a streaming chat API.

pub mod chunk;
pub mod cli;
pub mod config;
pub mod fence;
pub mod prompts;
pub mod relay;
pub mod router;
pub mod sandbox;
pub mod sse;
pub mod tool_call;
pub mod upstream;
pub mod workspace;
