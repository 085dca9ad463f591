//! Process-wide settings, read once at startup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::prompts::load_system_prompt;
use crate::router::AppState;
use crate::sandbox::{
    ExecPolicy, SandboxExecutor, DEFAULT_EXEC_BLOCKLIST, DEFAULT_EXEC_MAX_BUFFER,
    DEFAULT_EXEC_TIMEOUT_MS,
};
use crate::upstream::ReqwestUpstream;
use crate::workspace::Workspace;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 11434;
pub const DEFAULT_WORKSPACE_ROOT: &str = "/app/workspace";
pub const DEFAULT_MODEL: &str = "llama3.1:8b";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("workspace root {path} is unusable: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid exec blocklist pattern {pattern:?}: {message}")]
    Blocklist { pattern: String, message: String },
    #[error("failed to load system prompt from {path}: {source}")]
    SystemPrompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub workspace_root: PathBuf,
    pub exec_timeout_ms: u64,
    pub exec_max_buffer: usize,
    pub exec_blocklist: String,
    pub upstream_url: Option<String>,
    pub upstream_api_key: Option<String>,
    pub default_model: String,
    pub system_prompt_file: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            exec_timeout_ms: DEFAULT_EXEC_TIMEOUT_MS,
            exec_max_buffer: DEFAULT_EXEC_MAX_BUFFER,
            exec_blocklist: DEFAULT_EXEC_BLOCKLIST.to_string(),
            upstream_url: None,
            upstream_api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
            system_prompt_file: None,
        }
    }
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn exec_policy(&self) -> Result<ExecPolicy, ConfigError> {
        ExecPolicy::new(
            Duration::from_millis(self.exec_timeout_ms),
            self.exec_max_buffer,
            &self.exec_blocklist,
        )
        .map_err(|err| ConfigError::Blocklist {
            pattern: self.exec_blocklist.clone(),
            message: err.to_string(),
        })
    }

    pub fn executor(&self) -> Result<SandboxExecutor, ConfigError> {
        let workspace =
            Workspace::new(&self.workspace_root).map_err(|source| ConfigError::Workspace {
                path: self.workspace_root.clone(),
                source,
            })?;
        Ok(SandboxExecutor::new(workspace, self.exec_policy()?))
    }

    pub fn system_prompt(&self) -> Result<String, ConfigError> {
        load_system_prompt(self.system_prompt_file.as_deref()).map_err(|source| {
            ConfigError::SystemPrompt {
                path: self.system_prompt_file.clone().unwrap_or_default(),
                source,
            }
        })
    }

    /// Builds the shared server state with the reqwest-backed upstream.
    pub fn app_state(&self) -> Result<AppState, ConfigError> {
        let upstream = ReqwestUpstream::new(
            self.upstream_url.clone(),
            self.upstream_api_key.clone(),
        );
        Ok(AppState::new(
            self.executor()?,
            Arc::new(upstream),
            self.default_model.clone(),
            self.system_prompt()?,
        ))
    }
}
