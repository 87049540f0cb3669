use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Agent definition files larger than this are skipped.
const MAX_DEFINITION_BYTES: u64 = 512 * 1024;

/// In-memory copy of the agent definition: the top-level markdown files of
/// the workspace, keyed by file name.
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    pub root: PathBuf,
    pub files: BTreeMap<String, String>,
    pub loaded_at: DateTime<Utc>,
}

impl WorkspaceSnapshot {
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: BTreeMap::new(),
            loaded_at: Utc::now(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }
}

pub trait WorkspaceLoader: Send + Sync {
    fn root(&self) -> &Path;

    /// Either a complete snapshot or an error; never a partial one.
    fn load(&self) -> Result<WorkspaceSnapshot>;
}

#[derive(Debug, Clone)]
pub struct DirWorkspaceLoader {
    root: PathBuf,
}

impl DirWorkspaceLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl WorkspaceLoader for DirWorkspaceLoader {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self) -> Result<WorkspaceSnapshot> {
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("failed reading workspace {}", self.root.display()))?;

        let mut files = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_markdown = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
            let meta = entry.metadata()?;
            if !meta.is_file() || !is_markdown {
                continue;
            }
            if meta.len() > MAX_DEFINITION_BYTES {
                tracing::warn!(target = "burrow::workspace", file = %path.display(), bytes = meta.len(), "skipping oversized definition file");
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            files.insert(entry.file_name().to_string_lossy().into_owned(), content);
        }

        Ok(WorkspaceSnapshot {
            root: self.root.clone(),
            files,
            loaded_at: Utc::now(),
        })
    }
}
