//! Path sandboxing for file tools.
//!
//! A [`PathGuard`] pins a tool registry to one directory. Every `path`
//! argument is resolved against the root, symlinks included, before the
//! wrapped handler is allowed to run.

use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::ToolError,
    tools::{ToolContext, ToolHandler, ToolOutcome},
};

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// The root is made absolute and resolved through symlinks as far as it
    /// exists on disk.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(root))
                .unwrap_or_else(|_| root.to_path_buf())
        };
        let root = resolve_real(&absolute).unwrap_or_else(|_| normalize(&absolute));
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `raw` (relative to the root, or absolute) and checks that
    /// the real target is the root or nested under it.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let violation = || ToolError::SandboxViolation {
            path: raw.to_string(),
            root: self.root.clone(),
        };

        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        // A dangling symlink cannot be proven to stay inside, so it is a
        // violation as well.
        let resolved = resolve_real(&joined).map_err(|_| violation())?;
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(violation())
        }
    }
}

/// Walks `path` component by component, replacing every existing symlink
/// with its canonical target so a later `..` pops the real parent.
fn resolve_real(path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                if let Ok(meta) = std::fs::symlink_metadata(&resolved) {
                    if meta.file_type().is_symlink() {
                        resolved = std::fs::canonicalize(&resolved)?;
                    }
                }
            }
        }
    }
    Ok(resolved)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Wraps `handler` so calls carrying a `path` argument are checked against
/// `root` first. Calls without `path` are forwarded untouched.
pub fn guard(root: impl AsRef<Path>, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
    Arc::new(Guarded {
        guard: PathGuard::new(root),
        inner: handler,
    })
}

struct Guarded {
    guard: PathGuard,
    inner: Arc<dyn ToolHandler>,
}

#[async_trait]
impl ToolHandler for Guarded {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    async fn call(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutcome, ToolError> {
        match args.get("path") {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => {
                if let Err(error) = self.guard.resolve(raw) {
                    tracing::warn!(
                        target = "burrow::guard",
                        tool = %self.inner.name(),
                        path = %raw,
                        root = %self.guard.root().display(),
                        "blocked file access outside sandbox"
                    );
                    return Ok(ToolOutcome::failure(error.to_string()));
                }
            }
            Some(other) => {
                tracing::warn!(
                    target = "burrow::guard",
                    tool = %self.inner.name(),
                    path = %other,
                    "blocked non-string path argument"
                );
                return Ok(ToolOutcome::failure("path must be a string"));
            }
        }
        self.inner.call(ctx, args).await
    }
}
