use crate::error::SwitchError;
use crate::paths::SwitchPaths;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Variable name to user-entered value, per server.
pub type SecretMap = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub installed: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub secrets: SecretMap,
}

/// Three independent files; corruption in one never affects the others.
#[derive(Debug, Clone)]
pub struct SwitchStateStore {
    paths: SwitchPaths,
}

impl SwitchStateStore {
    pub fn new(paths: SwitchPaths) -> Self {
        Self { paths }
    }

    pub fn load(&self) -> PersistedState {
        PersistedState {
            installed: load_or_default(&self.paths.installed_path),
            deleted: load_or_default(&self.paths.deleted_path),
            secrets: load_or_default(&self.paths.secrets_path),
        }
    }

    pub fn save_installed(&self, installed: &BTreeSet<String>) -> Result<(), SwitchError> {
        self.save(&self.paths.installed_path, installed)
    }

    pub fn save_deleted(&self, deleted: &BTreeSet<String>) -> Result<(), SwitchError> {
        self.save(&self.paths.deleted_path, deleted)
    }

    pub fn save_secrets(&self, secrets: &SecretMap) -> Result<(), SwitchError> {
        self.save(&self.paths.secrets_path, secrets)
    }

    pub fn paths(&self) -> &SwitchPaths {
        &self.paths
    }

    fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), SwitchError> {
        self.paths
            .ensure_runtime_dir()
            .map_err(|e| SwitchError::io(&self.paths.runtime_directory, e))?;
        let mut payload = serde_json::to_vec_pretty(value)?;
        payload.push(b'\n');
        std::fs::write(path, payload).map_err(|e| SwitchError::io(path, e))
    }
}

fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let Ok(data) = std::fs::read(path) else {
        return T::default();
    };

    serde_json::from_slice(&data).unwrap_or_else(|error| {
        tracing::warn!(path = %path.display(), %error, "discarding corrupt state file");
        T::default()
    })
}
