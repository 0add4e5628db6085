//! Read/modify/write access to one host application's config file.
//!
//! The whole document is kept as an ordered JSON object so keys the host owns
//! round-trip untouched; only the map under `config_key` is interpreted.
//! Each adapter remembers a digest of the content it last observed and
//! refuses to write over a file that changed since then.

use crate::error::SwitchError;
use crate::models::{EnabledServerEntry, HostConfig};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Existing,
    Created,
    KeyAdded,
    /// The file held invalid JSON and was replaced with an empty document.
    Recreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct HostAdapter {
    config: HostConfig,
    snapshot: Option<String>,
}

impl HostAdapter {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            snapshot: None,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn host_id(&self) -> &str {
        &self.config.host_id
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    pub fn ensure_exists(&mut self) -> Result<EnsureOutcome, SwitchError> {
        let path = &self.config.file_path;
        let raw = match fs::read_to_string(path) {
            Ok(raw) => Some(raw),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(error) => return Err(SwitchError::io(path, error)),
        };

        let (mut root, outcome) = match raw.as_deref() {
            None => (JsonMap::new(), EnsureOutcome::Created),
            Some(text) if text.trim().is_empty() => (JsonMap::new(), EnsureOutcome::Created),
            Some(text) => match serde_json::from_str::<JsonValue>(text) {
                Ok(JsonValue::Object(root)) => (root, EnsureOutcome::Existing),
                Ok(_) | Err(_) => {
                    tracing::warn!(
                        host = %self.config.host_id,
                        path = %path.display(),
                        "replacing corrupt host config"
                    );
                    (JsonMap::new(), EnsureOutcome::Recreated)
                }
            },
        };

        let outcome = match root.get(&self.config.config_key) {
            Some(JsonValue::Object(_)) => outcome,
            _ => {
                root.insert(
                    self.config.config_key.clone(),
                    JsonValue::Object(JsonMap::new()),
                );
                if outcome == EnsureOutcome::Existing {
                    EnsureOutcome::KeyAdded
                } else {
                    outcome
                }
            }
        };

        if outcome == EnsureOutcome::Existing {
            self.snapshot = raw.as_deref().map(|text| digest(text.as_bytes()));
            return Ok(outcome);
        }

        let rendered = render(&root)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| SwitchError::io(parent, error))?;
        }
        fs::write(path, &rendered).map_err(|error| SwitchError::io(path, error))?;
        self.snapshot = Some(digest(&rendered));
        tracing::debug!(host = %self.config.host_id, ?outcome, "host config ensured");
        Ok(outcome)
    }

    /// Raw server entries under `config_key`; empty on any read or parse failure.
    pub fn read_entries(&mut self) -> JsonMap<String, JsonValue> {
        let Ok(raw) = fs::read_to_string(&self.config.file_path) else {
            return JsonMap::new();
        };
        self.snapshot = Some(digest(raw.as_bytes()));

        match serde_json::from_str::<JsonValue>(&raw) {
            Ok(JsonValue::Object(mut root)) => match root.remove(&self.config.config_key) {
                Some(JsonValue::Object(entries)) => entries,
                _ => JsonMap::new(),
            },
            _ => JsonMap::new(),
        }
    }

    pub fn read_enabled(&mut self) -> BTreeMap<String, EnabledServerEntry> {
        self.read_entries()
            .into_iter()
            .map(|(name, value)| {
                let entry = serde_json::from_value(value).unwrap_or_default();
                (name, entry)
            })
            .collect()
    }

    pub fn write_entry(
        &mut self,
        name: &str,
        entry: JsonValue,
    ) -> Result<WriteStatus, SwitchError> {
        self.modify(|entries| {
            if entries.get(name) == Some(&entry) {
                return false;
            }
            entries.insert(name.to_string(), entry);
            true
        })
    }

    /// Removing a missing entry is a no-op.
    pub fn remove_entry(&mut self, name: &str) -> Result<WriteStatus, SwitchError> {
        self.modify(|entries| entries.remove(name).is_some())
    }

    fn modify(
        &mut self,
        apply: impl FnOnce(&mut JsonMap<String, JsonValue>) -> bool,
    ) -> Result<WriteStatus, SwitchError> {
        let path = self.config.file_path.clone();
        let existing = fs::read_to_string(&path).unwrap_or_default();
        let existing_digest = digest(existing.as_bytes());
        if let Some(snapshot) = &self.snapshot {
            if *snapshot != existing_digest {
                self.snapshot = Some(existing_digest);
                return Err(self.conflict());
            }
        }

        let mut root = match serde_json::from_str::<JsonValue>(&existing) {
            Ok(JsonValue::Object(root)) => root,
            _ => JsonMap::new(),
        };
        let entries_value = root
            .entry(self.config.config_key.clone())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
        if !entries_value.is_object() {
            *entries_value = JsonValue::Object(JsonMap::new());
        }
        let changed = match entries_value.as_object_mut() {
            Some(entries) => apply(entries),
            None => false,
        };

        let rendered = render(&root)?;
        if !changed || rendered == existing.as_bytes() {
            self.snapshot = Some(existing_digest);
            return Ok(WriteStatus::Unchanged);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| SwitchError::io(parent, error))?;
        }
        let current = fs::read_to_string(&path).unwrap_or_default();
        let current_digest = digest(current.as_bytes());
        if current_digest != existing_digest {
            self.snapshot = Some(current_digest);
            return Err(self.conflict());
        }

        fs::write(&path, &rendered).map_err(|error| SwitchError::io(&path, error))?;
        self.snapshot = Some(digest(&rendered));
        Ok(WriteStatus::Written)
    }

    fn conflict(&self) -> SwitchError {
        tracing::warn!(
            host = %self.config.host_id,
            path = %self.config.file_path.display(),
            "host config changed externally; write skipped"
        );
        SwitchError::HostConflict {
            host: self.config.display_name.clone(),
            path: self.config.file_path.clone(),
        }
    }
}

fn render(root: &JsonMap<String, JsonValue>) -> Result<Vec<u8>, SwitchError> {
    let mut rendered = serde_json::to_vec_pretty(root)?;
    rendered.push(b'\n');
    Ok(rendered)
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{EnsureOutcome, HostAdapter, WriteStatus};
    use crate::error::SwitchError;
    use crate::models::HostConfig;
    use serde_json::{json, Value as JsonValue};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn adapter(path: &Path) -> HostAdapter {
        HostAdapter::new(HostConfig {
            host_id: String::from("cursor"),
            display_name: String::from("Cursor"),
            file_path: path.to_path_buf(),
            config_key: String::from("mcpServers"),
        })
    }

    fn read_json(path: &Path) -> JsonValue {
        serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
    }

    #[test]
    fn ensure_exists_creates_parent_dirs_and_empty_map() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("mcp.json");
        let mut host = adapter(&path);
        assert_eq!(host.ensure_exists().expect("ensure"), EnsureOutcome::Created);
        assert_eq!(read_json(&path), json!({"mcpServers": {}}));
        assert_eq!(host.ensure_exists().expect("ensure"), EnsureOutcome::Existing);
    }

    #[test]
    fn ensure_exists_adds_key_and_keeps_other_keys() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        fs::write(&path, r#"{"theme": "dark", "zoom": 2}"#).expect("write");
        let mut host = adapter(&path);
        assert_eq!(host.ensure_exists().expect("ensure"), EnsureOutcome::KeyAdded);

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.starts_with("{\n  \"theme\": \"dark\",\n  \"zoom\": 2,\n  \"mcpServers\": {}"));
    }

    #[test]
    fn ensure_exists_replaces_invalid_json() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        fs::write(&path, "{ broken").expect("write");
        let mut host = adapter(&path);
        assert_eq!(host.ensure_exists().expect("ensure"), EnsureOutcome::Recreated);
        assert_eq!(read_json(&path), json!({"mcpServers": {}}));
    }

    #[test]
    fn read_enabled_fails_soft() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        let mut host = adapter(&path);
        assert!(host.read_enabled().is_empty());
        fs::write(&path, "[1, 2").expect("write");
        assert!(host.read_enabled().is_empty());
    }

    #[test]
    fn write_and_remove_preserve_unrelated_keys() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        fs::write(
            &path,
            r#"{"mcpServers": {"github": {"command": "gh"}}, "other": true}"#,
        )
        .expect("write");
        let mut host = adapter(&path);

        let entry = json!({"command": "python", "args": ["/srv/W/server.py"], "env": {}});
        assert_eq!(
            host.write_entry("Weather", entry.clone()).expect("write"),
            WriteStatus::Written
        );
        assert_eq!(
            host.write_entry("Weather", entry).expect("rewrite"),
            WriteStatus::Unchanged
        );
        let enabled = host.read_enabled();
        assert_eq!(enabled["Weather"].command, "python");
        assert!(enabled.contains_key("github"));

        assert_eq!(host.remove_entry("Weather").expect("remove"), WriteStatus::Written);
        assert_eq!(host.remove_entry("Weather").expect("remove"), WriteStatus::Unchanged);
        assert_eq!(
            read_json(&path),
            json!({"mcpServers": {"github": {"command": "gh"}}, "other": true})
        );
        assert!(fs::read_to_string(&path).expect("read").ends_with("}\n"));
    }

    #[test]
    fn write_over_unreadable_document_starts_empty() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        fs::write(&path, "garbage").expect("write");
        let mut host = adapter(&path);
        host.write_entry("Weather", json!({"command": "python"}))
            .expect("write");
        assert_eq!(
            read_json(&path),
            json!({"mcpServers": {"Weather": {"command": "python"}}})
        );
    }

    #[test]
    fn external_edit_since_last_read_is_a_conflict() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        let mut host = adapter(&path);
        host.ensure_exists().expect("ensure");
        fs::write(&path, r#"{"mcpServers": {}, "edited": 1}"#).expect("external edit");

        let error = host
            .write_entry("Weather", json!({"command": "python"}))
            .expect_err("conflict");
        assert!(matches!(error, SwitchError::HostConflict { .. }));
        assert_eq!(read_json(&path), json!({"mcpServers": {}, "edited": 1}));

        host.write_entry("Weather", json!({"command": "python"}))
            .expect("retry proceeds on fresh content");
        assert_eq!(read_json(&path)["edited"], json!(1));
    }
}
