//! Secret storage.
//!
//! The vault is unlocked once at startup and copied into an immutable
//! [`SecretSnapshot`]; nothing re-reads it while the runtime is up.

use std::{
    collections::BTreeMap,
    io::{BufRead, IsTerminal, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{config::PASSPHRASE_ENV, error::StartupError};

pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<bool>;
    fn list(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    salt: String,
    verifier: String,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

/// JSON vault gated by a salted SHA-256 passphrase verifier.
///
/// Entries are not encrypted at rest in this build; the passphrase only
/// gates access. Keep the file at `0600`.
pub struct FileVault {
    path: PathBuf,
    state: Mutex<VaultFile>,
}

impl FileVault {
    /// Opens the vault at `path`, creating an empty one bound to
    /// `passphrase` if the file does not exist yet.
    pub fn unlock(path: &Path, passphrase: &str) -> Result<Self, StartupError> {
        let fail = |reason: String| StartupError::VaultUnlock {
            path: path.to_path_buf(),
            reason,
        };

        if !path.exists() {
            let salt = Uuid::new_v4().simple().to_string();
            let state = VaultFile {
                verifier: verifier(&salt, passphrase),
                salt,
                entries: BTreeMap::new(),
            };
            let vault = Self {
                path: path.to_path_buf(),
                state: Mutex::new(state),
            };
            vault
                .persist(&vault.state.lock())
                .map_err(|e| fail(format!("{e:#}")))?;
            tracing::info!(target = "burrow::secrets", path = %path.display(), "created new vault");
            return Ok(vault);
        }

        let raw = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let state: VaultFile =
            serde_json::from_str(&raw).map_err(|e| fail(format!("corrupt vault: {e}")))?;
        if verifier(&state.salt, passphrase) != state.verifier {
            return Err(fail("wrong passphrase".to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &VaultFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)
            .with_context(|| format!("failed writing {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn verifier(salt: &str, passphrase: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(passphrase.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl SecretStore for FileVault {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.insert(key.to_string(), value.to_string());
        self.persist(&state)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = state.entries.remove(key).is_some();
        if removed {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().entries.keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<BTreeMap<String, String>>,
}

impl SecretStore for MemoryVault {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// Read-only copy of every secret, taken once at startup.
#[derive(Debug, Clone, Default)]
pub struct SecretSnapshot {
    entries: Arc<BTreeMap<String, String>>,
}

impl SecretSnapshot {
    pub fn capture(store: &dyn SecretStore) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for key in store.list()? {
            if let Some(value) = store.get(&key)? {
                entries.insert(key, value);
            }
        }
        Ok(Self {
            entries: Arc::new(entries),
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys upper-cased with non-alphanumerics mapped to `_`, for export to
    /// child process environments.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let name: String = key
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                (name, value.clone())
            })
            .collect()
    }
}

/// Passphrase from the environment, else an interactive prompt. Worker
/// mode passes `interactive = false` and relies on the environment.
pub fn resolve_passphrase(interactive: bool) -> Result<String, StartupError> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    let fail = |reason: &str| StartupError::Collaborator {
        name: "vault passphrase",
        reason: reason.to_string(),
    };
    if !interactive || !std::io::stdin().is_terminal() {
        return Err(fail(&format!(
            "{PASSPHRASE_ENV} is not set and no terminal is available for a prompt"
        )));
    }

    eprint!("vault passphrase: ");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| fail(&e.to_string()))?;
    let passphrase = line.trim_end_matches(['\r', '\n']).to_string();
    if passphrase.is_empty() {
        return Err(fail("empty passphrase"));
    }
    Ok(passphrase)
}
