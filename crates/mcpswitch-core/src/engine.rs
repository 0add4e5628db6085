use crate::audit_store::{SwitchAuditStore, DEFAULT_AUDIT_LOG_LIMIT};
use crate::env_prompt::{carry_over_env, EnvPrompt, EnvResolver};
use crate::error::SwitchError;
use crate::hosts::{EnsureOutcome, HostAdapter, WriteStatus};
use crate::manifest::{env_from_json, load_manifest, ManifestScanner, NameCollision};
use crate::models::{
    AuditEventStatus, AvailableServer, CatalogEntry, HostConfig, HostOutcome, HostStatus,
    ManifestChangeReport, Notification, NotificationLevel, OperationReport, ServerDefinition,
    SwitchAction, SyncChange, SyncChangeKind, SyncReport,
};
use crate::notifications::NotificationSink;
use crate::paths::SwitchPaths;
use crate::settings::SwitchSettings;
use crate::state_store::{PersistedState, SwitchStateStore};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reconciles discovered manifests, persisted state and every host's config file.
///
/// Host files are the source of truth for which servers are enabled; the state
/// store only remembers what was installed, deleted and which secrets were
/// entered.
pub struct SwitchEngine {
    scanner: ManifestScanner,
    hosts: Vec<HostAdapter>,
    store: SwitchStateStore,
    audit: SwitchAuditStore,
    sink: Arc<dyn NotificationSink>,
    state: PersistedState,
    scanned: BTreeMap<String, ServerDefinition>,
    manifest_paths: Vec<PathBuf>,
    servers: BTreeMap<String, ServerDefinition>,
    enabled_servers: BTreeSet<String>,
}

impl SwitchEngine {
    pub fn from_settings(
        paths: SwitchPaths,
        settings: &SwitchSettings,
        home: &Path,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::new(
            ManifestScanner::from_settings(settings),
            settings.effective_hosts(home),
            SwitchStateStore::new(paths.clone()),
            SwitchAuditStore::new(paths),
            sink,
        )
    }

    pub fn new(
        scanner: ManifestScanner,
        hosts: Vec<HostConfig>,
        store: SwitchStateStore,
        audit: SwitchAuditStore,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let state = store.load();
        Self {
            scanner,
            hosts: hosts.into_iter().map(HostAdapter::new).collect(),
            store,
            audit,
            sink,
            state,
            scanned: BTreeMap::new(),
            manifest_paths: Vec::new(),
            servers: BTreeMap::new(),
            enabled_servers: BTreeSet::new(),
        }
    }

    /// Startup sequence: make sure every host file exists, then load the
    /// catalog and the enabled set.
    pub fn initialize(&mut self) {
        for host in &mut self.hosts {
            match host.ensure_exists() {
                Ok(EnsureOutcome::Recreated) => self.sink.notify(&Notification::new(
                    NotificationLevel::Warning,
                    format!("{} config was reset", host.display_name()),
                    format!(
                        "{} held invalid JSON and was replaced with an empty configuration.",
                        host.config().file_path.display()
                    ),
                )),
                Ok(_) => {}
                Err(error) => self.sink.notify(&Notification::new(
                    NotificationLevel::Error,
                    format!("Cannot prepare {} config", host.display_name()),
                    error.to_string(),
                )),
            }
        }
        self.load_catalog();
        self.load_enabled();
    }

    /// Rescans manifests and rebuilds the catalog from installed servers plus
    /// anything a host currently enables, minus deleted servers.
    pub fn load_catalog(&mut self) {
        self.state = self.store.load();
        let outcome = self.scanner.scan();
        for collision in &outcome.collisions {
            self.notify_collision(collision);
        }

        let host_names = self.host_entry_names();
        self.servers = outcome
            .servers
            .iter()
            .filter(|(name, _)| {
                (self.state.installed.contains(*name) || host_names.contains(*name))
                    && !self.state.deleted.contains(*name)
            })
            .map(|(name, definition)| (name.clone(), definition.clone()))
            .collect();
        self.scanned = outcome.servers;
        self.manifest_paths = outcome.manifest_paths;
        tracing::info!(
            scanned = self.scanned.len(),
            catalog = self.servers.len(),
            "catalog loaded"
        );
    }

    pub fn load_enabled(&mut self) {
        let host_names = self.host_entry_names();
        self.enabled_servers = host_names
            .into_iter()
            .filter(|name| self.servers.contains_key(name))
            .collect();
    }

    /// Makes every host file agree with the catalog. Scanned servers that a
    /// host or the installed list still reaches join the catalog first.
    /// Entries for managed servers that are neither in the catalog nor
    /// reachable (manifest gone, or deleted) are removed; entries whose
    /// command, args, declared fields or env keys drifted are rewritten keeping
    /// the host's env values. Entries the engine never managed are left alone.
    pub fn sync(&mut self) -> SyncReport {
        self.adopt_reachable();
        let managed = self.managed_names();
        let mut report = SyncReport::default();

        for host in &mut self.hosts {
            let entries = host.read_entries();
            for (name, value) in entries {
                if !managed.contains(&name) {
                    continue;
                }
                let (kind, result) = match self.servers.get(&name) {
                    None => (SyncChangeKind::Removed, host.remove_entry(&name)),
                    Some(definition) if !entry_matches(&value, definition) => {
                        let entry =
                            rewrite_entry(&value, definition, self.state.secrets.get(&name));
                        (SyncChangeKind::Rewritten, host.write_entry(&name, entry))
                    }
                    Some(_) => continue,
                };
                match result {
                    Ok(WriteStatus::Written) => report.changes.push(SyncChange {
                        host_id: host.host_id().to_string(),
                        server: name,
                        kind,
                    }),
                    Ok(WriteStatus::Unchanged) => {}
                    Err(error) => report.failures.push(failed_outcome(host, error)),
                }
            }
        }
        self.load_enabled();

        if report.write_count() > 0 || !report.failures.is_empty() {
            let mut restart: Vec<String> = report
                .changes
                .iter()
                .filter_map(|change| self.display_name_of(&change.host_id))
                .collect();
            restart.sort();
            restart.dedup();
            let level = if report.failures.is_empty() {
                NotificationLevel::Info
            } else {
                NotificationLevel::Warning
            };
            let mut message = format!("Updated {} host entries.", report.write_count());
            append_failures(&mut message, &report.failures);
            self.sink.notify(
                &Notification::new(level, "Host configs reconciled", message.clone())
                    .with_restart_hosts(restart),
            );
            let status = if report.failures.is_empty() {
                AuditEventStatus::Success
            } else {
                AuditEventStatus::Partial
            };
            self.record(SwitchAction::Sync, status, None, message);
        }
        tracing::info!(
            writes = report.write_count(),
            failures = report.failures.len(),
            "sync finished"
        );
        report
    }

    /// Writes the server into every host. Declared env variables are resolved
    /// first; cancelling there leaves everything untouched.
    pub fn enable(
        &mut self,
        name: &str,
        resolver: &mut dyn EnvResolver,
    ) -> Result<OperationReport, SwitchError> {
        let definition = self
            .servers
            .get(name)
            .cloned()
            .ok_or_else(|| SwitchError::UnknownServer(name.to_string()))?;

        let env = if definition.declares_env() {
            let prompt = EnvPrompt::new(&definition, self.state.secrets.get(name));
            let answers = resolver
                .resolve(&prompt)
                .ok_or_else(|| SwitchError::Cancelled(name.to_string()))?;
            prompt.complete(answers)
        } else {
            BTreeMap::new()
        };

        let mut report = OperationReport::new(SwitchAction::Enable, name);
        self.state.secrets.insert(name.to_string(), env.clone());
        if let Err(error) = self.store.save_secrets(&self.state.secrets) {
            tracing::warn!(%error, "failed to persist secrets");
            report.notes.push(format!("Secrets were not saved: {error}"));
        }

        let entry = canonical_entry(&definition, &env);
        for host in &mut self.hosts {
            let result = host.write_entry(name, entry.clone());
            report.outcomes.push(host_outcome(host, result));
        }
        if !report.is_total_failure() {
            self.enabled_servers.insert(name.to_string());
        }

        self.finish(&report);
        Ok(report)
    }

    pub fn disable(&mut self, name: &str) -> OperationReport {
        let mut report = OperationReport::new(SwitchAction::Disable, name);
        for host in &mut self.hosts {
            let result = host.remove_entry(name);
            report.outcomes.push(host_outcome(host, result));
        }
        self.enabled_servers.remove(name);

        self.finish(&report);
        report
    }

    pub fn install(&mut self, name: &str, definition: ServerDefinition) -> OperationReport {
        let mut report = OperationReport::new(SwitchAction::Install, name);
        self.state.deleted.remove(name);
        self.state.installed.insert(name.to_string());
        self.servers.insert(
            name.to_string(),
            ServerDefinition {
                name: name.to_string(),
                ..definition
            },
        );
        self.persist_membership(&mut report);

        self.finish(&report);
        report
    }

    /// Installs a server found by the last scan.
    pub fn install_available(&mut self, name: &str) -> Result<OperationReport, SwitchError> {
        let definition = self
            .scanned
            .get(name)
            .cloned()
            .ok_or_else(|| SwitchError::UnknownServer(name.to_string()))?;
        Ok(self.install(name, definition))
    }

    pub fn delete(&mut self, name: &str) -> OperationReport {
        let mut report = OperationReport::new(SwitchAction::Delete, name);
        self.state.installed.remove(name);
        self.state.deleted.insert(name.to_string());
        self.servers.remove(name);
        self.enabled_servers.remove(name);

        for host in &mut self.hosts {
            let result = host.remove_entry(name);
            report.outcomes.push(host_outcome(host, result));
        }
        self.persist_membership(&mut report);

        self.finish(&report);
        report
    }

    /// Re-reads changed manifests. A manifest that fails to parse is reported
    /// and its previous definitions stay in place. Otherwise the manifest's
    /// definitions replace the ones it declared before, subject to the
    /// scanner's collision policy; names it no longer declares leave the
    /// catalog. For servers enabled on a host, the host entry keeps its
    /// `command` and `env` while args and other declared fields follow the
    /// manifest.
    pub fn apply_manifest_changes(&mut self, paths: &[PathBuf]) -> ManifestChangeReport {
        let mut report = ManifestChangeReport::default();
        let mut fresh = None;

        for path in paths {
            let definitions = match load_manifest(path) {
                Ok(definitions) => definitions,
                Err(error) => {
                    let location = error
                        .line()
                        .map(|line| format!(" at line {line}"))
                        .unwrap_or_default();
                    self.sink.notify(&Notification::new(
                        NotificationLevel::Error,
                        "Invalid manifest",
                        format!("{}{location}: {error}", path.display()),
                    ));
                    report.rejected.push(path.clone());
                    continue;
                }
            };
            let source_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            let outcome = fresh.get_or_insert_with(|| self.scanner.scan());

            for collision in &outcome.collisions {
                if collision.first == source_dir || collision.second == source_dir {
                    self.notify_collision(collision);
                }
            }

            let mut stale: BTreeSet<String> = self
                .scanned
                .iter()
                .filter(|(_, definition)| definition.source_path == source_dir)
                .map(|(name, _)| name.clone())
                .collect();
            let mut winners = Vec::new();
            for definition in definitions {
                let wins = outcome
                    .servers
                    .get(&definition.name)
                    .is_some_and(|winner| winner.source_path == definition.source_path);
                if wins {
                    stale.remove(&definition.name);
                    winners.push(definition);
                } else {
                    stale.insert(definition.name);
                }
            }

            for name in stale {
                match outcome.servers.get(&name) {
                    Some(other) => {
                        self.scanned.insert(name.clone(), other.clone());
                        if let Some(current) = self.servers.get_mut(&name) {
                            *current = other.clone();
                        }
                    }
                    None => {
                        self.servers.remove(&name);
                        self.enabled_servers.remove(&name);
                        if self.scanned.remove(&name).is_some() {
                            tracing::info!(server = %name, "server dropped from manifest");
                            report.removed.push(name);
                        }
                    }
                }
            }

            for definition in winners {
                let name = definition.name.clone();
                if self.state.deleted.contains(&name) {
                    self.scanned.insert(name, definition);
                    continue;
                }
                if self.servers.contains_key(&name) {
                    self.servers.insert(name.clone(), definition.clone());
                }
                self.scanned.insert(name.clone(), definition.clone());
                report.updated.push(name.clone());

                for host in &mut self.hosts {
                    let entries = host.read_entries();
                    let Some(existing) = entries.get(&name) else {
                        continue;
                    };
                    let entry =
                        live_merge_entry(existing, &definition, self.state.secrets.get(&name));
                    let result = host.write_entry(&name, entry);
                    report.outcomes.push(host_outcome(host, result));
                }
            }
        }

        let restart = report.restart_hosts();
        if !report.updated.is_empty() || !report.removed.is_empty() {
            let mut message = String::new();
            if !report.updated.is_empty() {
                message.push_str(&format!("Reloaded {}.", report.updated.join(", ")));
            }
            if !report.removed.is_empty() {
                if !message.is_empty() {
                    message.push(' ');
                }
                message.push_str(&format!(
                    "No longer declared: {}.",
                    report.removed.join(", ")
                ));
            }
            let failures: Vec<HostOutcome> =
                report.outcomes.iter().filter(|o| o.is_failure()).cloned().collect();
            append_failures(&mut message, &failures);
            if !restart.is_empty() {
                message.push_str(&format!(" Restart {} to apply.", restart.join(", ")));
            }
            let level = if failures.is_empty() {
                NotificationLevel::Info
            } else {
                NotificationLevel::Warning
            };
            self.sink.notify(
                &Notification::new(level, "Manifest changed", message.clone())
                    .with_restart_hosts(restart),
            );
            let status = if failures.is_empty() {
                AuditEventStatus::Success
            } else {
                AuditEventStatus::Partial
            };
            let server = report
                .updated
                .iter()
                .chain(report.removed.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join(",");
            self.record(SwitchAction::ManifestChange, status, Some(&server), message);
        }
        report
    }

    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.servers
            .iter()
            .map(|(name, definition)| CatalogEntry {
                name: name.clone(),
                definition: definition.clone(),
                enabled: self.enabled_servers.contains(name),
                installed: self.state.installed.contains(name),
            })
            .collect()
    }

    /// Scanned servers outside the catalog, deleted ones included.
    pub fn available(&self) -> Vec<AvailableServer> {
        self.scanned
            .values()
            .filter(|definition| !self.servers.contains_key(&definition.name))
            .map(|definition| AvailableServer {
                definition: definition.clone(),
                deleted: self.state.deleted.contains(&definition.name),
            })
            .collect()
    }

    pub fn servers(&self) -> &BTreeMap<String, ServerDefinition> {
        &self.servers
    }

    pub fn enabled_servers(&self) -> &BTreeSet<String> {
        &self.enabled_servers
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled_servers.contains(name)
    }

    pub fn installed(&self) -> &BTreeSet<String> {
        &self.state.installed
    }

    pub fn deleted(&self) -> &BTreeSet<String> {
        &self.state.deleted
    }

    pub fn secrets_for(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.state.secrets.get(name)
    }

    pub fn host_configs(&self) -> Vec<&HostConfig> {
        self.hosts.iter().map(HostAdapter::config).collect()
    }

    pub fn scanner(&self) -> &ManifestScanner {
        &self.scanner
    }

    /// Manifest files found by the last scan.
    pub fn watch_paths(&self) -> &[PathBuf] {
        &self.manifest_paths
    }

    pub fn audit(&self) -> &SwitchAuditStore {
        &self.audit
    }

    fn host_entry_names(&mut self) -> BTreeSet<String> {
        self.hosts
            .iter_mut()
            .flat_map(|host| host.read_entries().into_iter().map(|(name, _)| name))
            .collect()
    }

    /// Adds scanned definitions for names that are installed or present on a
    /// host but missing from the catalog, using the same rule as `load_catalog`.
    fn adopt_reachable(&mut self) {
        let host_names = self.host_entry_names();
        for name in host_names.iter().chain(self.state.installed.iter()) {
            if self.servers.contains_key(name) || self.state.deleted.contains(name) {
                continue;
            }
            if let Some(definition) = self.scanned.get(name) {
                tracing::debug!(server = %name, "adopting reachable server into catalog");
                self.servers.insert(name.clone(), definition.clone());
            }
        }
    }

    fn notify_collision(&self, collision: &NameCollision) {
        self.sink.notify(&Notification::new(
            NotificationLevel::Warning,
            format!("Duplicate server name {}", collision.name),
            format!(
                "{} is declared in both {} and {}.",
                collision.name,
                collision.first.display(),
                collision.second.display()
            ),
        ));
    }

    fn managed_names(&self) -> BTreeSet<String> {
        self.scanned
            .keys()
            .chain(self.servers.keys())
            .chain(self.state.installed.iter())
            .chain(self.state.deleted.iter())
            .chain(self.state.secrets.keys())
            .cloned()
            .collect()
    }

    fn display_name_of(&self, host_id: &str) -> Option<String> {
        self.hosts
            .iter()
            .find(|host| host.host_id() == host_id)
            .map(|host| host.display_name().to_string())
    }

    fn persist_membership(&self, report: &mut OperationReport) {
        if let Err(error) = self.store.save_installed(&self.state.installed) {
            tracing::warn!(%error, "failed to persist installed servers");
            report.notes.push(format!("Installed list was not saved: {error}"));
        }
        if let Err(error) = self.store.save_deleted(&self.state.deleted) {
            tracing::warn!(%error, "failed to persist deleted servers");
            report.notes.push(format!("Deleted list was not saved: {error}"));
        }
    }

    fn finish(&self, report: &OperationReport) {
        let notification = summarize(report);
        self.sink.notify(&notification);

        let status = if report.is_total_failure() {
            AuditEventStatus::Failed
        } else if report.is_success() && report.notes.is_empty() {
            AuditEventStatus::Success
        } else {
            AuditEventStatus::Partial
        };
        self.record(
            report.action,
            status,
            Some(&report.server),
            notification.message,
        );
    }

    fn record(
        &self,
        action: SwitchAction,
        status: AuditEventStatus,
        server: Option<&str>,
        summary: String,
    ) {
        let paths = self
            .hosts
            .iter()
            .map(|host| host.config().file_path.display().to_string())
            .collect();
        let event = SwitchAuditStore::new_event(action.as_str(), status, server, summary, paths);
        if let Err(error) = self.audit.append_event(event, DEFAULT_AUDIT_LOG_LIMIT) {
            tracing::warn!(%error, "failed to append audit event");
        }
    }
}

fn host_outcome(host: &HostAdapter, result: Result<WriteStatus, SwitchError>) -> HostOutcome {
    match result {
        Ok(WriteStatus::Written) => HostOutcome {
            host_id: host.host_id().to_string(),
            display_name: host.display_name().to_string(),
            status: HostStatus::Written,
        },
        Ok(WriteStatus::Unchanged) => HostOutcome {
            host_id: host.host_id().to_string(),
            display_name: host.display_name().to_string(),
            status: HostStatus::Unchanged,
        },
        Err(error) => failed_outcome(host, error),
    }
}

fn failed_outcome(host: &HostAdapter, error: SwitchError) -> HostOutcome {
    let status = match error {
        SwitchError::HostConflict { .. } => HostStatus::Conflict,
        other => {
            tracing::warn!(host = %host.host_id(), error = %other, "host write failed");
            HostStatus::Failed {
                message: other.to_string(),
            }
        }
    };
    HostOutcome {
        host_id: host.host_id().to_string(),
        display_name: host.display_name().to_string(),
        status,
    }
}

fn append_failures(message: &mut String, failures: &[HostOutcome]) {
    for failure in failures {
        let reason = match &failure.status {
            HostStatus::Conflict => String::from("file changed on disk, try again"),
            HostStatus::Failed { message: reason } => reason.clone(),
            HostStatus::Written | HostStatus::Unchanged => continue,
        };
        message.push_str(&format!(" {}: {reason}.", failure.display_name));
    }
}

fn summarize(report: &OperationReport) -> Notification {
    let verb = match report.action {
        SwitchAction::Enable => "enabled",
        SwitchAction::Disable => "disabled",
        SwitchAction::Install => "installed",
        SwitchAction::Delete => "deleted",
        SwitchAction::Sync => "reconciled",
        SwitchAction::ManifestChange => "reloaded",
    };
    let restart = report.restart_hosts();
    let failures: Vec<HostOutcome> = report.failures().cloned().collect();

    let (level, title) = if report.is_total_failure() {
        (
            NotificationLevel::Error,
            format!("{} could not be {verb}", report.server),
        )
    } else if failures.is_empty() && report.notes.is_empty() {
        (NotificationLevel::Info, format!("{} {verb}", report.server))
    } else {
        (
            NotificationLevel::Warning,
            format!("{} {verb} with errors", report.server),
        )
    };

    let mut message = format!("{} was {verb}.", report.server);
    append_failures(&mut message, &failures);
    for note in &report.notes {
        message.push_str(&format!(" {note}."));
    }
    if !restart.is_empty() {
        message.push_str(&format!(
            " Restart {} for the change to take effect.",
            restart.join(", ")
        ));
    }
    Notification::new(level, title, message).with_restart_hosts(restart)
}

/// The entry written on enable: declared command, args, resolved env and any
/// other declared fields.
pub fn canonical_entry(
    definition: &ServerDefinition,
    env: &BTreeMap<String, String>,
) -> JsonValue {
    let mut object = JsonMap::new();
    object.insert(
        String::from("command"),
        JsonValue::String(definition.command.clone()),
    );
    object.insert(String::from("args"), args_to_json(&definition.args));
    object.insert(String::from("env"), env_to_json(env));
    for (key, value) in &definition.extra {
        object.insert(key.clone(), value.clone());
    }
    JsonValue::Object(object)
}

/// Compares everything the manifest declares except env values.
fn entry_matches(entry: &JsonValue, definition: &ServerDefinition) -> bool {
    let Some(object) = entry.as_object() else {
        return false;
    };
    if object.get("command").and_then(JsonValue::as_str) != Some(definition.command.as_str()) {
        return false;
    }
    if object.get("args").cloned().unwrap_or(JsonValue::Array(Vec::new()))
        != args_to_json(&definition.args)
    {
        return false;
    }
    if definition
        .extra
        .iter()
        .any(|(key, value)| object.get(key) != Some(value))
    {
        return false;
    }
    host_env(object).keys().eq(definition.env.keys())
}

fn rewrite_entry(
    existing: &JsonValue,
    definition: &ServerDefinition,
    stored: Option<&BTreeMap<String, String>>,
) -> JsonValue {
    let mut object = existing.as_object().cloned().unwrap_or_default();
    let env = carry_over_env(definition, &host_env(&object), stored);
    object.insert(
        String::from("command"),
        JsonValue::String(definition.command.clone()),
    );
    object.insert(String::from("args"), args_to_json(&definition.args));
    for (key, value) in &definition.extra {
        object.insert(key.clone(), value.clone());
    }
    object.insert(String::from("env"), env_to_json(&env));
    JsonValue::Object(object)
}

fn live_merge_entry(
    existing: &JsonValue,
    definition: &ServerDefinition,
    stored: Option<&BTreeMap<String, String>>,
) -> JsonValue {
    let mut object = existing.as_object().cloned().unwrap_or_default();
    if !object.contains_key("command") {
        object.insert(
            String::from("command"),
            JsonValue::String(definition.command.clone()),
        );
    }
    object.insert(String::from("args"), args_to_json(&definition.args));
    for (key, value) in &definition.extra {
        object.insert(key.clone(), value.clone());
    }
    if !object.contains_key("env") {
        let env = carry_over_env(definition, &BTreeMap::new(), stored);
        object.insert(String::from("env"), env_to_json(&env));
    }
    JsonValue::Object(object)
}

fn host_env(object: &JsonMap<String, JsonValue>) -> BTreeMap<String, String> {
    object
        .get("env")
        .and_then(JsonValue::as_object)
        .map(env_from_json)
        .unwrap_or_default()
}

fn args_to_json(args: &[String]) -> JsonValue {
    JsonValue::Array(args.iter().cloned().map(JsonValue::String).collect())
}

fn env_to_json(env: &BTreeMap<String, String>) -> JsonValue {
    JsonValue::Object(
        env.iter()
            .map(|(key, value)| (key.clone(), JsonValue::String(value.clone())))
            .collect(),
    )
}
