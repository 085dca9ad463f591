use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{
    ConfigError, ProxyConfig, DEFAULT_HOST, DEFAULT_MODEL, DEFAULT_PORT, DEFAULT_WORKSPACE_ROOT,
};
use crate::router::build_router;
use crate::sandbox::{DEFAULT_EXEC_BLOCKLIST, DEFAULT_EXEC_MAX_BUFFER, DEFAULT_EXEC_TIMEOUT_MS};

#[derive(Parser, Debug)]
#[command(name = "tool-proxy")]
#[command(about = "Streaming chat proxy with fenced-JSON tool calls", version)]
pub struct Cli {
    #[arg(long, env = "HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "WORKSPACE_ROOT", default_value = DEFAULT_WORKSPACE_ROOT)]
    workspace_root: PathBuf,

    #[arg(long, env = "EXEC_TIMEOUT_MS", default_value_t = DEFAULT_EXEC_TIMEOUT_MS)]
    exec_timeout_ms: u64,

    #[arg(long, env = "EXEC_MAX_BUFFER", default_value_t = DEFAULT_EXEC_MAX_BUFFER)]
    exec_max_buffer: usize,

    #[arg(long, env = "EXEC_BLOCKLIST", default_value = DEFAULT_EXEC_BLOCKLIST)]
    exec_blocklist: String,

    #[arg(long, env = "UPSTREAM_URL")]
    upstream_url: Option<String>,

    #[arg(long, env = "UPSTREAM_API_KEY", hide_env_values = true)]
    upstream_api_key: Option<String>,

    #[arg(long, env = "DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    default_model: String,

    #[arg(long, env = "SYSTEM_PROMPT_FILE")]
    system_prompt_file: Option<PathBuf>,

    #[arg(long = "cors-allow-origin")]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method")]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header")]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials")]
    cors_allow_credentials: bool,
}

impl Cli {
    pub fn config(&self) -> ProxyConfig {
        ProxyConfig {
            host: self.host.clone(),
            port: self.port,
            workspace_root: self.workspace_root.clone(),
            exec_timeout_ms: self.exec_timeout_ms,
            exec_max_buffer: self.exec_max_buffer,
            exec_blocklist: self.exec_blocklist.clone(),
            upstream_url: self.upstream_url.clone(),
            upstream_api_key: self.upstream_api_key.clone(),
            default_model: self.default_model.clone(),
            system_prompt_file: self.system_prompt_file.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_tool_proxy() -> Result<(), CliError> {
    let env_file = dotenvy::dotenv().ok();
    init_logging();
    if let Some(path) = env_file {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }
    let cli = Cli::parse();
    run_server(&cli)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(cli: &Cli) -> Result<(), CliError> {
    let config = cli.config();
    let state = config.app_state()?;
    let router = build_router(state).layer(build_cors_layer(cli)?);
    let addr = config.bind_addr();

    if config.upstream_url.is_none() {
        tracing::warn!("UPSTREAM_URL is not set; chat completions will fail until it is configured");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            workspace_root = %config.workspace_root.display(),
            default_model = %config.default_model,
            "tool proxy listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

/// Permissive unless any CORS flag is given.
fn build_cors_layer(cli: &Cli) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    if cli.cors_allow_origin.is_empty() {
        cors = cors.allow_origin(Any);
    } else {
        let mut origins = Vec::new();
        for origin in &cli.cors_allow_origin {
            let value = origin
                .parse()
                .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
            origins.push(value);
        }
        cors = cors.allow_origin(origins);
    }

    if cli.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &cli.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if cli.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &cli.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if cli.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}
