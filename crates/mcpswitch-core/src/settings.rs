use crate::error::SwitchError;
use crate::models::HostConfig;
use crate::paths::{claude_desktop_dir, SwitchPaths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SERVERS_ROOT_ENV: &str = "MCPSWITCH_SERVERS_ROOT";
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_MANIFEST_FILE: &str = "config.json";
const SETTINGS_VERSION: u32 = 1;

/// What to do when two manifests declare the same server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    FirstWins,
    #[default]
    LastWins,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchSettings {
    pub version: u32,
    #[serde(default, rename = "servers_root")]
    pub servers_root: Option<PathBuf>,
    #[serde(default = "default_exclude_dirs", rename = "exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default = "default_manifest_file", rename = "manifest_file_name")]
    pub manifest_file_name: String,
    #[serde(default = "default_debounce_ms", rename = "debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default, rename = "collision_policy")]
    pub collision_policy: CollisionPolicy,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            servers_root: None,
            exclude_dirs: default_exclude_dirs(),
            manifest_file_name: default_manifest_file(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            collision_policy: CollisionPolicy::default(),
            hosts: Vec::new(),
        }
    }
}

impl SwitchSettings {
    /// Configured hosts, or the three built-in ones when none are configured.
    pub fn effective_hosts(&self, home: &Path) -> Vec<HostConfig> {
        if self.hosts.is_empty() {
            default_hosts(home)
        } else {
            self.hosts.clone()
        }
    }

    pub fn effective_servers_root(&self) -> PathBuf {
        if let Some(root) = &self.servers_root {
            return root.clone();
        }
        if let Ok(root) = std::env::var(SERVERS_ROOT_ENV) {
            if !root.trim().is_empty() {
                return PathBuf::from(root);
            }
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }
}

fn default_exclude_dirs() -> Vec<String> {
    [".git", ".svn", "__pycache__", "MasterServer"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_manifest_file() -> String {
    String::from(DEFAULT_MANIFEST_FILE)
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

pub fn default_hosts(home: &Path) -> Vec<HostConfig> {
    vec![
        HostConfig {
            host_id: String::from("claude"),
            display_name: String::from("Claude"),
            file_path: claude_desktop_dir(home).join("claude_desktop_config.json"),
            config_key: String::from("mcpServers"),
        },
        HostConfig {
            host_id: String::from("cursor"),
            display_name: String::from("Cursor"),
            file_path: home.join(".cursor").join("mcp.json"),
            config_key: String::from("mcpServers"),
        },
        HostConfig {
            host_id: String::from("windsurf"),
            display_name: String::from("Windsurf"),
            file_path: home
                .join(".codeium")
                .join("windsurf")
                .join("mcp_config.json"),
            config_key: String::from("mcpServers"),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct SwitchSettingsStore {
    paths: SwitchPaths,
}

impl SwitchSettingsStore {
    pub fn new(paths: SwitchPaths) -> Self {
        Self { paths }
    }

    pub fn load_settings(&self) -> SwitchSettings {
        let Ok(data) = std::fs::read(&self.paths.settings_path) else {
            return SwitchSettings::default();
        };

        serde_json::from_slice(&data).unwrap_or_else(|error| {
            tracing::warn!(
                path = %self.paths.settings_path.display(),
                %error,
                "ignoring unreadable settings"
            );
            SwitchSettings::default()
        })
    }

    pub fn save_settings(&self, settings: &SwitchSettings) -> Result<(), SwitchError> {
        self.paths
            .ensure_runtime_dir()
            .map_err(|e| SwitchError::io(&self.paths.runtime_directory, e))?;

        let normalized = SwitchSettings {
            version: SETTINGS_VERSION,
            ..settings.clone()
        };

        let mut payload = serde_json::to_vec_pretty(&normalized)?;
        payload.push(b'\n');
        std::fs::write(&self.paths.settings_path, payload)
            .map_err(|e| SwitchError::io(&self.paths.settings_path, e))
    }

    pub fn paths(&self) -> &SwitchPaths {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::{CollisionPolicy, SwitchSettings, SwitchSettingsStore};
    use crate::paths::SwitchPaths;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: SwitchSettings =
            serde_json::from_str(r#"{"version": 1, "debounce_ms": 250}"#).expect("parse");
        assert_eq!(settings.debounce_ms, 250);
        assert_eq!(settings.manifest_file_name, "config.json");
        assert_eq!(settings.collision_policy, CollisionPolicy::LastWins);
        assert!(settings.exclude_dirs.iter().any(|item| item == "MasterServer"));
    }

    #[test]
    fn corrupt_settings_yield_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = SwitchSettingsStore::new(SwitchPaths::from_runtime(dir.path().to_path_buf()));
        std::fs::write(&store.paths().settings_path, "{ nope").expect("write");
        assert_eq!(store.load_settings(), SwitchSettings::default());
    }

    #[test]
    fn save_then_load_keeps_overrides() {
        let dir = tempdir().expect("tempdir");
        let store = SwitchSettingsStore::new(SwitchPaths::from_runtime(dir.path().join("state")));
        let settings = SwitchSettings {
            version: 0,
            collision_policy: CollisionPolicy::Reject,
            ..SwitchSettings::default()
        };
        store.save_settings(&settings).expect("save");

        let loaded = store.load_settings();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.collision_policy, CollisionPolicy::Reject);
    }

    #[test]
    fn built_in_hosts_share_the_mcp_servers_key() {
        let hosts = SwitchSettings::default().effective_hosts(Path::new("/home/u"));
        assert_eq!(hosts.len(), 3);
        assert!(hosts.iter().all(|host| host.config_key == "mcpServers"));
        assert_eq!(
            hosts[1].file_path,
            Path::new("/home/u").join(".cursor").join("mcp.json")
        );
    }
}
