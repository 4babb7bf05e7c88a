//! Persisted runtime state (`state.json`).

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Values the orchestrator remembers across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    /// Backend auth token from the last successful login.
    pub token: Option<String>,
    /// Subscribe URL of the logged-in account.
    pub subscribe_url: Option<String>,
    /// Selector group names in profile declaration order.
    pub group_order: Vec<String>,
    /// Control port chosen when port randomization is on.
    pub controller_port: Option<u16>,
    pub tun: bool,
    /// TUN was requested without administrator rights. The next elevated
    /// start turns it on; any start clears it.
    pub pending_tun: bool,
    /// Manually pinned API endpoint.
    pub endpoint_override: Option<String>,
}

/// File-backed [`RuntimeState`]. Every mutation is written through.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<RuntimeState>,
}

impl StateStore {
    /// Load `path`; a missing or corrupt file yields the default state.
    pub fn open(path: &Path) -> Self {
        let state = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("corrupt state file at {}, starting fresh: {e}", path.display());
                RuntimeState::default()
            }),
            Err(_) => RuntimeState::default(),
        };
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> RuntimeState {
        self.state.lock().clone()
    }

    /// Apply `f` and persist the result.
    pub fn update<F>(&self, f: F) -> std::io::Result<()>
    where
        F: FnOnce(&mut RuntimeState),
    {
        let mut state = self.state.lock();
        f(&mut state);
        let json = serde_json::to_string_pretty(&*state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)
    }
}
