use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use parking_lot::Mutex;

/// Append-only audit/memory log.
pub trait LogStore: Send + Sync {
    fn append(&self, kind: &str, text: &str) -> Result<()>;
}

/// One markdown file per hour: `<dir>/<YYYY-MM-DD>/<HH>.md`.
pub struct HourlyLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl HourlyLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The `memory/` directory of a workspace.
    pub fn in_workspace(root: &Path) -> Self {
        Self::new(root.join("memory"))
    }

    pub fn path_for(&self, at: DateTime<Local>) -> PathBuf {
        self.dir
            .join(at.format("%Y-%m-%d").to_string())
            .join(format!("{}.md", at.format("%H")))
    }
}

impl LogStore for HourlyLog {
    fn append(&self, kind: &str, text: &str) -> Result<()> {
        let now = Local::now();
        let path = self.path_for(now);
        let _guard = self.write_lock.lock();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening {}", path.display()))?;
        writeln!(
            file,
            "- {} [{}] {}",
            now.format("%H:%M:%S"),
            kind,
            single_line(text)
        )?;
        file.flush()?;
        Ok(())
    }
}

fn single_line(text: &str) -> String {
    text.trim().replace('\n', " / ")
}
