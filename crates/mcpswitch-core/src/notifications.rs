use crate::models::{Notification, NotificationLevel};
use std::sync::Mutex;

/// Receives user-facing notifications from the engine and watcher.
///
/// The sink is owned by the composition root and handed to the engine, so
/// completion and failure events reach a single coordinator.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Forwards notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        let restart = notification.restart_hosts.join(", ");
        match notification.level {
            NotificationLevel::Info => tracing::info!(
                title = %notification.title,
                restart = %restart,
                "{}",
                notification.message
            ),
            NotificationLevel::Warning => tracing::warn!(
                title = %notification.title,
                restart = %restart,
                "{}",
                notification.message
            ),
            NotificationLevel::Error => tracing::error!(
                title = %notification.title,
                restart = %restart,
                "{}",
                notification.message
            ),
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Notification> {
        match self.notifications.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        match self.notifications.lock() {
            Ok(mut guard) => guard.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
    }
}
