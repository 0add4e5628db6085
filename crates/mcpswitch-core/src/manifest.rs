//! Discovery of tool-server manifests.
//!
//! Every immediate subdirectory of the servers root may carry one manifest
//! (`config.json` by default) whose top-level keys are server names:
//!
//! ```json
//! { "Weather": { "command": "python", "args": ["./server.py"], "env": {} } }
//! ```
//!
//! Args beginning with `./` are resolved against the manifest's directory.

use crate::error::SwitchError;
use crate::models::ServerDefinition;
use crate::settings::{CollisionPolicy, SwitchSettings};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const RELATIVE_MARKER: &str = "./";
const HIDDEN_MARKER: char = '.';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCollision {
    pub name: String,
    pub first: PathBuf,
    pub second: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub servers: BTreeMap<String, ServerDefinition>,
    /// Every manifest found, including ones that failed to parse.
    pub manifest_paths: Vec<PathBuf>,
    pub rejected_manifests: Vec<PathBuf>,
    pub collisions: Vec<NameCollision>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ManifestScanner {
    root: PathBuf,
    exclude_dirs: BTreeSet<String>,
    manifest_file_name: String,
    collision_policy: CollisionPolicy,
}

impl ManifestScanner {
    pub fn new(root: impl Into<PathBuf>, exclude_dirs: &[String]) -> Self {
        Self {
            root: root.into(),
            exclude_dirs: exclude_dirs.iter().cloned().collect(),
            manifest_file_name: String::from(crate::settings::DEFAULT_MANIFEST_FILE),
            collision_policy: CollisionPolicy::default(),
        }
    }

    pub fn from_settings(settings: &SwitchSettings) -> Self {
        Self::new(settings.effective_servers_root(), &settings.exclude_dirs)
            .with_manifest_file_name(&settings.manifest_file_name)
            .with_collision_policy(settings.collision_policy)
    }

    pub fn with_manifest_file_name(mut self, name: &str) -> Self {
        self.manifest_file_name = name.to_string();
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_file_name(&self) -> &str {
        &self.manifest_file_name
    }

    /// Scans every candidate subdirectory. A broken manifest is skipped with a
    /// warning; the scan itself never fails.
    pub fn scan(&self) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut rejected: BTreeMap<String, PathBuf> = BTreeMap::new();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::warn!(root = %self.root.display(), %error, "skipping unreadable entry");
                    outcome
                        .warnings
                        .push(format!("Failed to read {}: {error}", self.root.display()));
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy();
            if dir_name.starts_with(HIDDEN_MARKER) || self.exclude_dirs.contains(&*dir_name) {
                continue;
            }

            let manifest_path = entry.path().join(&self.manifest_file_name);
            if !manifest_path.is_file() {
                continue;
            }

            outcome.manifest_paths.push(manifest_path.clone());
            let definitions = match load_manifest(&manifest_path) {
                Ok(definitions) => definitions,
                Err(error) => {
                    tracing::warn!(%error, "skipping manifest");
                    outcome.warnings.push(error.to_string());
                    outcome.rejected_manifests.push(manifest_path);
                    continue;
                }
            };

            for definition in definitions {
                self.insert(&mut outcome, &mut rejected, definition);
            }
        }

        tracing::debug!(
            root = %self.root.display(),
            servers = outcome.servers.len(),
            collisions = outcome.collisions.len(),
            "manifest scan finished"
        );
        outcome
    }

    fn insert(
        &self,
        outcome: &mut ScanOutcome,
        rejected: &mut BTreeMap<String, PathBuf>,
        definition: ServerDefinition,
    ) {
        let first = if let Some(first) = rejected.get(&definition.name) {
            first.clone()
        } else if let Some(existing) = outcome.servers.get(&definition.name) {
            existing.source_path.clone()
        } else {
            outcome
                .servers
                .insert(definition.name.clone(), definition);
            return;
        };

        let collision = NameCollision {
            name: definition.name.clone(),
            first,
            second: definition.source_path.clone(),
        };
        tracing::warn!(
            name = %collision.name,
            first = %collision.first.display(),
            second = %collision.second.display(),
            policy = ?self.collision_policy,
            "duplicate server name across manifests"
        );
        outcome.collisions.push(collision);

        match self.collision_policy {
            CollisionPolicy::FirstWins => {}
            CollisionPolicy::LastWins => {
                outcome
                    .servers
                    .insert(definition.name.clone(), definition);
            }
            CollisionPolicy::Reject => {
                if let Some(existing) = outcome.servers.remove(&definition.name) {
                    rejected.insert(definition.name, existing.source_path);
                }
            }
        }
    }
}

/// Parses a single manifest file; its parent directory is the source path.
pub fn load_manifest(path: &Path) -> Result<Vec<ServerDefinition>, SwitchError> {
    let raw = fs::read_to_string(path).map_err(|error| SwitchError::io(path, error))?;
    let source_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_manifest(&raw, path, source_dir)
}

pub fn parse_manifest(
    raw: &str,
    path: &Path,
    source_dir: &Path,
) -> Result<Vec<ServerDefinition>, SwitchError> {
    let parsed = serde_json::from_str::<JsonValue>(raw)
        .map_err(|error| SwitchError::manifest_parse(path, &error))?;
    let JsonValue::Object(root) = parsed else {
        return Err(SwitchError::NotAnObject(path.display().to_string()));
    };

    let mut definitions = Vec::new();
    for (name, value) in root {
        match definition_from_json(&name, value, source_dir) {
            Some(definition) => definitions.push(definition),
            None => tracing::warn!(
                manifest = %path.display(),
                server = %name,
                "ignoring entry without a command"
            ),
        }
    }
    Ok(definitions)
}

fn definition_from_json(
    name: &str,
    value: JsonValue,
    source_dir: &Path,
) -> Option<ServerDefinition> {
    let JsonValue::Object(mut object) = value else {
        return None;
    };
    let command = match object.remove("command") {
        Some(JsonValue::String(command)) => command,
        _ => return None,
    };
    let args = object
        .remove("args")
        .and_then(|value| match value {
            JsonValue::Array(items) => Some(items),
            _ => None,
        })
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::String(arg) => Some(resolve_arg(&arg, source_dir)),
            _ => None,
        })
        .collect();
    let env = object
        .remove("env")
        .and_then(|value| match value {
            JsonValue::Object(map) => Some(env_from_json(&map)),
            _ => None,
        })
        .unwrap_or_default();

    Some(ServerDefinition {
        name: name.to_string(),
        command,
        args,
        env,
        source_path: source_dir.to_path_buf(),
        extra: object,
    })
}

pub(crate) fn env_from_json(map: &JsonMap<String, JsonValue>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                JsonValue::String(text) => text.clone(),
                JsonValue::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

pub fn resolve_arg(arg: &str, source_dir: &Path) -> String {
    match arg.strip_prefix(RELATIVE_MARKER) {
        Some(relative) => source_dir.join(relative).display().to_string(),
        None => arg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_manifest, resolve_arg, ManifestScanner};
    use crate::error::SwitchError;
    use crate::settings::CollisionPolicy;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_manifest(root: &Path, dir: &str, body: &str) {
        let path = root.join(dir).join("config.json");
        fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        fs::write(path, body).expect("write manifest");
    }

    fn excluded() -> Vec<String> {
        vec![String::from("MasterServer")]
    }

    #[test]
    fn relative_args_resolve_against_manifest_dir() {
        let defs = parse_manifest(
            r#"{"Weather": {"command": "python", "args": ["./server.py", "-v"], "env": {}}}"#,
            Path::new("/srv/Weather/config.json"),
            Path::new("/srv/Weather"),
        )
        .expect("parse");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].args, vec!["/srv/Weather/server.py", "-v"]);
        assert_eq!(defs[0].source_path, Path::new("/srv/Weather"));
        assert!(!defs[0].declares_env());
    }

    #[test]
    fn unknown_fields_are_kept_as_extra() {
        let defs = parse_manifest(
            r#"{"Pizza": {"command": "uv", "cwd": "/tmp", "env": {"API_KEY": "", "PORT": 8080}}}"#,
            Path::new("/srv/Pizza/config.json"),
            Path::new("/srv/Pizza"),
        )
        .expect("parse");
        assert_eq!(defs[0].extra.get("cwd").and_then(|v| v.as_str()), Some("/tmp"));
        assert_eq!(defs[0].env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(defs[0].env.get("API_KEY").map(String::as_str), Some(""));
    }

    #[test]
    fn parse_error_reports_line() {
        let error = parse_manifest(
            "{\n  \"Weather\": {\n    \"command\": \n}\n",
            Path::new("/srv/Weather/config.json"),
            Path::new("/srv/Weather"),
        )
        .expect_err("must fail");
        assert!(matches!(error, SwitchError::ManifestParse { .. }));
        assert_eq!(error.line(), Some(4));
    }

    #[test]
    fn plain_args_are_untouched() {
        assert_eq!(resolve_arg("-y", Path::new("/srv")), "-y");
        assert_eq!(resolve_arg("../x", Path::new("/srv")), "../x");
    }

    #[test]
    fn scan_skips_malformed_hidden_and_excluded_dirs() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_manifest(root, "Broken", "{ not json");
        write_manifest(root, "Weather", r#"{"Weather": {"command": "python"}}"#);
        write_manifest(root, ".hidden", r#"{"Hidden": {"command": "python"}}"#);
        write_manifest(root, "MasterServer", r#"{"Master": {"command": "python"}}"#);
        fs::create_dir_all(root.join("Empty")).expect("empty dir");

        let outcome = ManifestScanner::new(root, &excluded()).scan();
        assert_eq!(outcome.servers.keys().collect::<Vec<_>>(), vec!["Weather"]);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.manifest_paths.len(), 2);
        assert_eq!(
            outcome.rejected_manifests,
            vec![root.join("Broken").join("config.json")]
        );
    }

    #[test]
    fn collisions_are_reported_and_policy_applied() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_manifest(root, "a", r#"{"Dup": {"command": "first"}}"#);
        write_manifest(root, "b", r#"{"Dup": {"command": "second"}}"#);
        write_manifest(root, "c", r#"{"Dup": {"command": "third"}}"#);

        let last = ManifestScanner::new(root, &[]).scan();
        assert_eq!(last.collisions.len(), 2);
        assert_eq!(last.servers["Dup"].command, "third");

        let first = ManifestScanner::new(root, &[])
            .with_collision_policy(CollisionPolicy::FirstWins)
            .scan();
        assert_eq!(first.servers["Dup"].command, "first");

        let rejected = ManifestScanner::new(root, &[])
            .with_collision_policy(CollisionPolicy::Reject)
            .scan();
        assert!(!rejected.servers.contains_key("Dup"));
        assert_eq!(rejected.collisions.len(), 2);
        assert_eq!(rejected.collisions[1].first, root.join("a"));
        assert_eq!(rejected.collisions[1].second, root.join("c"));
    }

    #[test]
    fn scan_of_missing_root_is_empty() {
        let temp = tempdir().expect("tempdir");
        let outcome = ManifestScanner::new(temp.path().join("missing"), &[]).scan();
        assert!(outcome.servers.is_empty());
    }
}
