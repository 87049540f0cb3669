use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

type Fingerprint = BTreeMap<String, (u64, Option<SystemTime>)>;

/// Size and mtime of every top-level file under `root`. An unreadable root
/// fingerprints as empty.
fn fingerprint(root: &Path) -> Fingerprint {
    let mut out = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return out;
    };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_file() {
            out.insert(
                entry.file_name().to_string_lossy().into_owned(),
                (meta.len(), meta.modified().ok()),
            );
        }
    }
    out
}

/// Polls `root` every `interval` and signals `tx` when the set of files or
/// their size/mtime changes. Bursts coalesce: if a signal is already
/// pending the new one is dropped.
pub async fn run_change_watcher(
    root: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<()>,
    token: CancellationToken,
) {
    let scan_root = root.clone();
    let mut last = match tokio::task::spawn_blocking(move || fingerprint(&scan_root)).await {
        Ok(fp) => fp,
        Err(error) => {
            tracing::error!(target = "burrow::watcher", error = %error, "initial workspace scan failed");
            return;
        }
    };
    tracing::debug!(target = "burrow::watcher", root = %root.display(), files = last.len(), "watching workspace");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let scan_root = root.clone();
        let current = match tokio::task::spawn_blocking(move || fingerprint(&scan_root)).await {
            Ok(fp) => fp,
            Err(error) => {
                tracing::warn!(target = "burrow::watcher", error = %error, "workspace scan failed");
                continue;
            }
        };
        if current == last {
            continue;
        }
        last = current;

        match tx.try_send(()) {
            Ok(()) => {
                tracing::debug!(target = "burrow::watcher", "workspace change signalled");
            }
            Err(TrySendError::Full(())) => {
                tracing::trace!(target = "burrow::watcher", "change already pending");
            }
            Err(TrySendError::Closed(())) => break,
        }
    }

    tracing::debug!(target = "burrow::watcher", "change watcher stopped");
}
