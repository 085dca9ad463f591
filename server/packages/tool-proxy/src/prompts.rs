//! Instruction message injected ahead of the conversation in Local mode.

use std::io;
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You can operate on a project workspace through five tools. To call a tool, reply with a fenced code block tagged `json` that holds exactly one call:

```json
{
  "tool": "<tool name>",
  "args": { ... },
  "comment": "<one line on why you are calling it>"
}
```

Rules:
- Emit one fenced block per tool call. Use several blocks to make several calls.
- Never use `json` fences for anything other than tool calls.
- Keep ordinary answers as plain prose.
- Tool results are appended to the conversation as "[Tool <name> Result]" blocks. Failures start with "TOOL_ERROR:".

Tools:
- list_files: list one directory (not recursive).
  args: {"path": "<dir relative to the workspace>"}; path defaults to ".".
- read_file: return a text file's contents, up to 256 KiB.
  args: {"path": "<file>"}
- write_file: create or overwrite a file; missing parent directories are created.
  args: {"path": "<file>", "content": "<full new contents>"}
- exec_cmd: run a shell command with a short timeout and a capped output size.
  args: {"cmd": "<command line>", "cwd": "<dir, optional>"}
- git: run a git subcommand.
  args: {"sub": "<arguments after git, e.g. status or diff --stat>", "cwd": "<dir, optional>"}

Every path is relative to the workspace root and cannot leave it. Destructive commands are refused."#;

/// Reads the instruction text from `path`, or returns the built-in prompt.
pub fn load_system_prompt(path: Option<&Path>) -> io::Result<String> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            if text.trim().is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("system prompt file is empty: {}", path.display()),
                ));
            }
            Ok(text)
        }
        None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
    }
}
