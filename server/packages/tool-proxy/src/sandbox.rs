//! Sandbox executor for the five workspace tools.
//!
//! Every operation resolves its paths through [`Workspace`] and reports all
//! failures as a [`ToolResult`] with `success: false`. Nothing here returns an
//! error past [`SandboxExecutor::execute`].
//!
//! The command denylist is a heuristic pre-filter over a shell string. It is
//! not a security boundary: anything the shell can express indirectly
//! (variables, `eval`, scripts written with `write_file`) bypasses it.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::tool_call::{ToolCall, ToolName};
use crate::workspace::Workspace;

/// Largest file `read_file` will return (256 KiB).
pub const MAX_READ_BYTES: u64 = 256 * 1024;
pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_EXEC_MAX_BUFFER: usize = 1024 * 1024;
pub const DEFAULT_EXEC_BLOCKLIST: &str =
    r"rm -rf|shutdown|reboot|mkfs|:\(\)\s*\{\s*:\|:&\s*\};:";

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("path outside WORKSPACE_ROOT: {path}")]
    PathEscape { path: String },
    #[error("path does not exist: {path}")]
    NotFound { path: String },
    #[error("path is not a directory: {path}")]
    NotADirectory { path: String },
    #[error("path is not a file: {path}")]
    NotAFile { path: String },
    #[error("file too large: {size} bytes (max {limit} bytes)")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("blocked command")]
    BlockedCommand,
    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("command was terminated by signal {signal}")]
    Terminated { signal: i32 },
    #[error("{}", describe_exit(.code, .stderr))]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("command output exceeded {limit} bytes")]
    OutputLimit { limit: usize },
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArgs { tool: String, message: String },
    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

fn describe_exit(code: &Option<i32>, stderr: &str) -> String {
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match code {
        Some(code) => format!("command exited with status {code}"),
        None => "command execution failed".to_string(),
    }
}

fn io_error(context: &str, source: io::Error) -> ToolError {
    ToolError::Io {
        context: context.to_string(),
        source,
    }
}

fn map_fs_error(path: &str, context: &str, err: io::Error) -> ToolError {
    if err.kind() == io::ErrorKind::NotFound {
        ToolError::NotFound {
            path: path.to_string(),
        }
    } else {
        io_error(context, err)
    }
}

/// Outcome of one tool execution. `result` is absent on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Human-readable text spliced into the assistant stream.
    pub fn render(&self, tool: &str) -> String {
        if !self.success {
            let error = self.error.as_deref().unwrap_or("unknown error");
            return format!("TOOL_ERROR: {error}");
        }
        let body = match &self.result {
            Some(Value::String(text)) => text.clone(),
            Some(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            None => String::new(),
        };
        format!("[Tool {tool} Result]\n{body}")
    }
}

impl From<Result<Value, ToolError>> for ToolResult {
    fn from(outcome: Result<Value, ToolError>) -> Self {
        match outcome {
            Ok(value) => ToolResult::ok(value),
            Err(err) => ToolResult::failure(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsEntryType {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: FsEntryType,
}

#[derive(Debug, Deserialize)]
struct ListFilesArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ExecCmdArgs {
    cmd: String,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitArgs {
    sub: String,
    #[serde(default)]
    cwd: Option<String>,
}

fn parse_args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(call.args.clone())).map_err(|err| {
        ToolError::InvalidArgs {
            tool: call.tool.clone(),
            message: err.to_string(),
        }
    })
}

/// Limits applied to `exec_cmd` and `git`.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    pub timeout: Duration,
    pub max_buffer: usize,
    denylist: Option<regress::Regex>,
}

impl ExecPolicy {
    /// Compiles `denylist` as a case-insensitive ECMAScript pattern. An empty
    /// pattern disables the denylist.
    pub fn new(
        timeout: Duration,
        max_buffer: usize,
        denylist: &str,
    ) -> Result<Self, regress::Error> {
        let denylist = if denylist.trim().is_empty() {
            None
        } else {
            Some(regress::Regex::with_flags(denylist, "i")?)
        };
        Ok(Self {
            timeout,
            max_buffer,
            denylist,
        })
    }

    pub fn is_blocked(&self, cmd: &str) -> bool {
        self.denylist
            .as_ref()
            .map(|pattern| pattern.find(cmd).is_some())
            .unwrap_or(false)
    }
}

struct CommandOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Executes tool calls inside one confined workspace. Process-wide and
/// read-only after construction.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    workspace: Workspace,
    policy: ExecPolicy,
}

impl SandboxExecutor {
    pub fn new(workspace: Workspace, policy: ExecPolicy) -> Self {
        Self { workspace, policy }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Runs a dispatched tool call. Unknown tool names and malformed args
    /// come back as failed results.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        info!(tool = %call.tool, comment = ?call.comment, "executing tool");
        let outcome = self.dispatch(call).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => debug!(tool = %call.tool, duration_ms, "tool succeeded"),
            Err(err) => warn!(tool = %call.tool, duration_ms, error = %err, "tool failed"),
        }
        ToolResult::from(outcome)
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let Some(kind) = call.kind() else {
            return Err(ToolError::UnknownTool {
                tool: call.tool.clone(),
            });
        };
        match kind {
            ToolName::ListFiles => {
                let args: ListFilesArgs = parse_args(call)?;
                self.try_list_files(args.path.as_deref().unwrap_or(".")).await
            }
            ToolName::ReadFile => {
                let args: ReadFileArgs = parse_args(call)?;
                self.try_read_file(&args.path).await
            }
            ToolName::WriteFile => {
                let args: WriteFileArgs = parse_args(call)?;
                self.try_write_file(&args.path, &args.content).await
            }
            ToolName::ExecCmd => {
                let args: ExecCmdArgs = parse_args(call)?;
                self.try_exec_cmd(&args.cmd, args.cwd.as_deref()).await
            }
            ToolName::Git => {
                let args: GitArgs = parse_args(call)?;
                self.try_exec_cmd(&format!("git {}", args.sub), args.cwd.as_deref())
                    .await
            }
        }
    }

    pub async fn list_files(&self, path: &str) -> ToolResult {
        self.try_list_files(path).await.into()
    }

    pub async fn read_file(&self, path: &str) -> ToolResult {
        self.try_read_file(path).await.into()
    }

    pub async fn write_file(&self, path: &str, content: &str) -> ToolResult {
        self.try_write_file(path, content).await.into()
    }

    pub async fn exec_cmd(&self, cmd: &str, cwd: Option<&str>) -> ToolResult {
        self.try_exec_cmd(cmd, cwd).await.into()
    }

    pub async fn git(&self, sub: &str, cwd: Option<&str>) -> ToolResult {
        self.exec_cmd(&format!("git {sub}"), cwd).await
    }

    async fn try_list_files(&self, raw_path: &str) -> Result<Value, ToolError> {
        let target = self.workspace.resolve(raw_path)?;
        let metadata = fs::metadata(&target)
            .await
            .map_err(|err| map_fs_error(raw_path, "failed to list files", err))?;
        if !metadata.is_dir() {
            return Err(ToolError::NotADirectory {
                path: raw_path.to_string(),
            });
        }
        let mut reader = fs::read_dir(&target)
            .await
            .map_err(|err| io_error("failed to list files", err))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| io_error("failed to list files", err))?
        {
            // Follows symlinks like a plain stat; dangling links count as files.
            let is_dir = match fs::metadata(entry.path()).await {
                Ok(metadata) => metadata.is_dir(),
                Err(_) => false,
            };
            entries.push(FsEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                entry_type: if is_dir {
                    FsEntryType::Dir
                } else {
                    FsEntryType::File
                },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(serde_json::to_value(entries)?)
    }

    async fn try_read_file(&self, raw_path: &str) -> Result<Value, ToolError> {
        let target = self.workspace.resolve(raw_path)?;
        let metadata = fs::metadata(&target)
            .await
            .map_err(|err| map_fs_error(raw_path, "failed to read file", err))?;
        if !metadata.is_file() {
            return Err(ToolError::NotAFile {
                path: raw_path.to_string(),
            });
        }
        if metadata.len() > MAX_READ_BYTES {
            return Err(ToolError::FileTooLarge {
                size: metadata.len(),
                limit: MAX_READ_BYTES,
            });
        }
        let file = fs::File::open(&target)
            .await
            .map_err(|err| map_fs_error(raw_path, "failed to read file", err))?;
        // The file may grow between stat and read; never hand back a prefix.
        let mut bytes = Vec::with_capacity(metadata.len() as usize);
        file.take(MAX_READ_BYTES + 1)
            .read_to_end(&mut bytes)
            .await
            .map_err(|err| io_error("failed to read file", err))?;
        if bytes.len() as u64 > MAX_READ_BYTES {
            return Err(ToolError::FileTooLarge {
                size: bytes.len() as u64,
                limit: MAX_READ_BYTES,
            });
        }
        // Undecodable bytes become U+FFFD rather than failing the read.
        Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn try_write_file(&self, raw_path: &str, content: &str) -> Result<Value, ToolError> {
        let target = self.workspace.resolve(raw_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error("failed to write file", err))?;
        }
        fs::write(&target, content)
            .await
            .map_err(|err| io_error("failed to write file", err))?;
        Ok(Value::String(format!("File written successfully: {raw_path}")))
    }

    async fn try_exec_cmd(&self, cmd: &str, cwd: Option<&str>) -> Result<Value, ToolError> {
        if self.policy.is_blocked(cmd) {
            warn!(cmd = %cmd, "command matched denylist");
            return Err(ToolError::BlockedCommand);
        }
        let cwd = cwd.unwrap_or(".");
        let working_dir = self.workspace.resolve(cwd)?;

        let mut command = shell_command(cmd);
        command
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|err| io_error("command execution failed", err))?;

        let collected = tokio::time::timeout(
            self.policy.timeout,
            collect_output(&mut child, self.policy.max_buffer),
        )
        .await;
        let output = match collected {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                let _ = child.start_kill();
                return Err(err);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(ToolError::Timeout {
                    timeout_ms: self.policy.timeout.as_millis() as u64,
                });
            }
        };

        if output.status.success() {
            return Ok(json!({
                "stdout": output.stdout.trim(),
                "stderr": output.stderr.trim(),
                "cmd": cmd,
                "cwd": cwd,
            }));
        }
        if let Some(signal) = exit_signal(&output.status) {
            return Err(ToolError::Terminated { signal });
        }
        Err(ToolError::NonZeroExit {
            code: output.status.code(),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[cfg(not(windows))]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}

#[cfg(windows)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("powershell.exe");
    command.arg("-NoProfile").arg("-Command").arg(cmd);
    command
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Drains stdout and stderr together, failing once their combined size
/// passes `limit`.
async fn collect_output(child: &mut Child, limit: usize) -> Result<CommandOutput, ToolError> {
    let missing = |name: &str| {
        io_error(
            "command execution failed",
            io::Error::new(io::ErrorKind::Other, format!("{name} not captured")),
        )
    };
    let mut stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let mut stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_chunk = [0u8; READ_CHUNK_SIZE];
    let mut err_chunk = [0u8; READ_CHUNK_SIZE];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_chunk), if out_open => {
                let n = read.map_err(|err| io_error("failed to read command output", err))?;
                if n == 0 {
                    out_open = false;
                } else {
                    out.extend_from_slice(&out_chunk[..n]);
                }
            }
            read = stderr.read(&mut err_chunk), if err_open => {
                let n = read.map_err(|err| io_error("failed to read command output", err))?;
                if n == 0 {
                    err_open = false;
                } else {
                    err.extend_from_slice(&err_chunk[..n]);
                }
            }
        }
        if out.len() + err.len() > limit {
            return Err(ToolError::OutputLimit { limit });
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| io_error("command execution failed", err))?;
    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
    })
}
