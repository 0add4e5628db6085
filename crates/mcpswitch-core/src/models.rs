use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A tool server declared in a manifest, with relative args already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "source_path")]
    pub source_path: PathBuf,
    /// Declared fields other than `command`/`args`/`env`, passed through untouched.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub extra: JsonMap<String, JsonValue>,
}

impl ServerDefinition {
    pub fn declares_env(&self) -> bool {
        !self.env.is_empty()
    }
}

/// One consuming application and where it keeps its enabled servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "host_id")]
    pub host_id: String,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "file_path")]
    pub file_path: PathBuf,
    #[serde(rename = "config_key")]
    pub config_key: String,
}

/// Typed view of a server entry inside a host file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnabledServerEntry {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub definition: ServerDefinition,
    pub enabled: bool,
    pub installed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableServer {
    pub definition: ServerDefinition,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    /// Display names of hosts that must be restarted to pick up the change.
    #[serde(rename = "restart_hosts")]
    pub restart_hosts: Vec<String>,
}

impl Notification {
    pub fn new(
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            restart_hosts: Vec::new(),
        }
    }

    pub fn with_restart_hosts(mut self, hosts: Vec<String>) -> Self {
        self.restart_hosts = hosts;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostStatus {
    Written,
    Unchanged,
    Conflict,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOutcome {
    #[serde(rename = "host_id")]
    pub host_id: String,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(flatten)]
    pub status: HostStatus,
}

impl HostOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, HostStatus::Conflict | HostStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchAction {
    Enable,
    Disable,
    Install,
    Delete,
    Sync,
    ManifestChange,
}

impl SwitchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Install => "install",
            Self::Delete => "delete",
            Self::Sync => "sync",
            Self::ManifestChange => "manifest_change",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub action: SwitchAction,
    pub server: String,
    pub outcomes: Vec<HostOutcome>,
    /// Failures outside host files, such as state that could not be saved.
    pub notes: Vec<String>,
}

impl OperationReport {
    pub fn new(action: SwitchAction, server: impl Into<String>) -> Self {
        Self {
            action,
            server: server.into(),
            outcomes: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes.iter().filter(|item| item.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn is_total_failure(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(HostOutcome::is_failure)
    }

    pub fn restart_hosts(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|item| item.status == HostStatus::Written)
            .map(|item| item.display_name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncChangeKind {
    Rewritten,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncChange {
    #[serde(rename = "host_id")]
    pub host_id: String,
    pub server: String,
    pub kind: SyncChangeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub changes: Vec<SyncChange>,
    pub failures: Vec<HostOutcome>,
}

impl SyncReport {
    pub fn write_count(&self) -> usize {
        self.changes.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManifestChangeReport {
    /// Server names whose in-memory definition was replaced.
    pub updated: Vec<String>,
    /// Server names a manifest no longer provides.
    pub removed: Vec<String>,
    /// Manifests that failed to parse and were left as they were.
    pub rejected: Vec<PathBuf>,
    pub outcomes: Vec<HostOutcome>,
}

impl ManifestChangeReport {
    pub fn restart_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .outcomes
            .iter()
            .filter(|item| item.status == HostStatus::Written)
            .map(|item| item.display_name.clone())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    #[serde(rename = "occurred_at")]
    pub occurred_at: String,
    pub action: String,
    pub status: AuditEventStatus,
    pub server: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub paths: Vec<String>,
}
