use crate::error::SwitchError;
use crate::models::{AuditEvent, AuditEventStatus};
use crate::paths::SwitchPaths;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_AUDIT_LOG_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct SwitchAuditStore {
    paths: SwitchPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditLogPayload {
    version: u32,
    #[serde(default)]
    events: Vec<AuditEvent>,
}

impl SwitchAuditStore {
    pub fn new(paths: SwitchPaths) -> Self {
        Self { paths }
    }

    pub fn new_event(
        action: &str,
        status: AuditEventStatus,
        server: Option<&str>,
        summary: impl Into<String>,
        paths: Vec<String>,
    ) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            action: action.to_string(),
            status,
            server: server.map(ToString::to_string),
            summary: summary.into(),
            paths,
        }
    }

    pub fn load_events(&self) -> Vec<AuditEvent> {
        let Ok(data) = std::fs::read(&self.paths.audit_log_path) else {
            return Vec::new();
        };

        serde_json::from_slice::<AuditLogPayload>(&data)
            .map(|payload| payload.events)
            .unwrap_or_default()
    }

    pub fn append_event(&self, event: AuditEvent, max_events: usize) -> Result<(), SwitchError> {
        let mut events = self.load_events();
        events.push(event);

        if max_events > 0 && events.len() > max_events {
            let drop_count = events.len() - max_events;
            events.drain(0..drop_count);
        }

        self.save_events(&events)
    }

    /// Newest first.
    pub fn list_events(&self, limit: Option<usize>, server: Option<&str>) -> Vec<AuditEvent> {
        let max = limit.unwrap_or(50).max(1);

        self.load_events()
            .into_iter()
            .rev()
            .filter(|event| {
                server
                    .map(|name| event.server.as_deref() == Some(name))
                    .unwrap_or(true)
            })
            .take(max)
            .collect()
    }

    fn save_events(&self, events: &[AuditEvent]) -> Result<(), SwitchError> {
        self.paths
            .ensure_runtime_dir()
            .map_err(|error| SwitchError::io(&self.paths.runtime_directory, error))?;
        let payload = AuditLogPayload {
            version: 1,
            events: events.to_vec(),
        };
        let mut data = serde_json::to_vec_pretty(&payload)?;
        data.push(b'\n');
        std::fs::write(&self.paths.audit_log_path, data)
            .map_err(|error| SwitchError::io(&self.paths.audit_log_path, error))
    }
}

#[cfg(test)]
mod tests {
    use super::SwitchAuditStore;
    use crate::models::AuditEventStatus;
    use crate::paths::SwitchPaths;
    use tempfile::tempdir;

    #[test]
    fn append_event_keeps_ring_limit() {
        let dir = tempdir().expect("tempdir");
        let store = SwitchAuditStore::new(SwitchPaths::from_runtime(dir.path().to_path_buf()));
        let limit = 5usize;

        for id in 0..(limit + 3) {
            let event = SwitchAuditStore::new_event(
                "enable",
                AuditEventStatus::Success,
                Some("Weather"),
                format!("summary-{id}"),
                Vec::new(),
            );
            store.append_event(event, limit).expect("append");
        }

        let events = store.load_events();
        assert_eq!(events.len(), limit);
        assert_eq!(
            events.first().map(|item| item.summary.as_str()),
            Some("summary-3")
        );
    }

    #[test]
    fn list_events_is_newest_first_and_filters_by_server() {
        let dir = tempdir().expect("tempdir");
        let store = SwitchAuditStore::new(SwitchPaths::from_runtime(dir.path().to_path_buf()));
        for (server, summary) in [("Weather", "a"), ("Pizza", "b"), ("Weather", "c")] {
            let event = SwitchAuditStore::new_event(
                "disable",
                AuditEventStatus::Partial,
                Some(server),
                summary,
                Vec::new(),
            );
            store.append_event(event, 100).expect("append");
        }

        let weather = store.list_events(Some(10), Some("Weather"));
        assert_eq!(
            weather
                .iter()
                .map(|item| item.summary.as_str())
                .collect::<Vec<_>>(),
            vec!["c", "a"]
        );
        assert_eq!(store.list_events(Some(1), None).len(), 1);
    }
}
