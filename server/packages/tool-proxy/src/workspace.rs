//! Workspace confinement.
//!
//! Every path a tool touches is resolved against the configured root and must
//! stay inside it after `..` folding, absolute overrides and symlink resolution.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::sandbox::ToolError;

/// Canonical workspace root shared by all tool executions.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates the root directory if needed and pins its canonical form.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, raw_path: &str) -> Result<PathBuf, ToolError> {
        confine(&self.root, raw_path)
    }
}

/// Resolves `raw_path` against `root` (which must already be canonical) and
/// returns the canonical target if it is `root` or nested under it.
pub fn confine(root: &Path, raw_path: &str) -> Result<PathBuf, ToolError> {
    let escape = || ToolError::PathEscape {
        path: raw_path.to_string(),
    };
    let joined = root.join(raw_path);
    let normalized = normalize_lexically(&joined);
    let resolved = canonicalize_existing_prefix(&normalized).ok_or_else(escape)?;
    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(escape())
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(value) => normalized.push(value),
        }
    }
    normalized
}

/// Canonicalizes the deepest existing ancestor and re-appends the missing
/// tail. Returns `None` when a dangling symlink sits on the path, since its
/// target cannot be checked.
fn canonicalize_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut tail = Vec::new();
    let mut current = path;
    loop {
        match current.canonicalize() {
            Ok(mut resolved) => {
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Some(resolved);
            }
            Err(_) => {
                let is_symlink = fs::symlink_metadata(current)
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if is_symlink {
                    return None;
                }
                tail.push(current.file_name()?.to_os_string());
                current = current.parent()?;
            }
        }
    }
}
