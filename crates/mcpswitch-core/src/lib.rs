pub mod audit_store;
pub mod engine;
pub mod env_prompt;
pub mod error;
pub mod hosts;
pub mod manifest;
pub mod models;
pub mod notifications;
pub mod paths;
pub mod settings;
pub mod state_store;
pub mod watch;

pub use audit_store::{SwitchAuditStore, DEFAULT_AUDIT_LOG_LIMIT};
pub use engine::SwitchEngine;
pub use env_prompt::{DefaultsResolver, EnvPrompt, EnvResolver, EnvVariable};
pub use error::SwitchError;
pub use hosts::{EnsureOutcome, HostAdapter, WriteStatus};
pub use manifest::{ManifestScanner, NameCollision, ScanOutcome};
pub use models::{
    AuditEvent, AuditEventStatus, AvailableServer, CatalogEntry, EnabledServerEntry, HostConfig,
    HostOutcome, HostStatus, ManifestChangeReport, Notification, NotificationLevel,
    OperationReport, ServerDefinition, SwitchAction, SyncChange, SyncChangeKind, SyncReport,
};
pub use notifications::{NotificationSink, RecordingSink, TracingSink};
pub use paths::SwitchPaths;
pub use settings::{CollisionPolicy, SwitchSettings, SwitchSettingsStore};
pub use state_store::{PersistedState, SwitchStateStore};
pub use watch::{Debouncer, ManifestWatcher};
