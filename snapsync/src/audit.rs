//! Snapshot notifications and audit logging
//!
//! Lifecycle operations report their outcome through a [`Notifier`].
//! Delivery is fire-and-forget: a notifier never fails the operation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    SnapshotCreate,
    SnapshotDelete,
    /// A refresh campaign observed a final status.
    SnapshotConverged,
    /// A refresh campaign ran out of attempts before a final status.
    SnapshotPollExhausted,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::SnapshotCreate => "cloud_volume_snapshot_create",
            NotificationEvent::SnapshotDelete => "cloud_volume_snapshot_delete",
            NotificationEvent::SnapshotConverged => "snapshot_converged",
            NotificationEvent::SnapshotPollExhausted => "snapshot_poll_exhausted",
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: NotificationEvent,
    /// Local snapshot id, once one exists
    pub subject: Option<String>,
    pub snapshot_name: String,
    pub volume_name: Option<String>,
    pub outcome: Outcome,
}

impl Notification {
    pub fn new(event: NotificationEvent, snapshot_name: impl Into<String>) -> Self {
        Self {
            event,
            subject: None,
            snapshot_name: snapshot_name.into(),
            volume_name: None,
            outcome: Outcome::Success,
        }
    }

    pub fn subject(mut self, snapshot_id: impl Into<String>) -> Self {
        self.subject = Some(snapshot_id.into());
        self
    }

    pub fn volume(mut self, volume_name: Option<String>) -> Self {
        self.volume_name = volume_name;
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    fn message(&self) -> String {
        let volume = self.volume_name.as_deref().unwrap_or("-");
        match (&self.event, &self.outcome) {
            (NotificationEvent::SnapshotCreate, Outcome::Success) => {
                format!("Snapshot '{}' of volume '{}' created", self.snapshot_name, volume)
            }
            (NotificationEvent::SnapshotDelete, Outcome::Success) => {
                format!("Snapshot '{}' of volume '{}' deleted", self.snapshot_name, volume)
            }
            (NotificationEvent::SnapshotConverged, _) => {
                format!("Snapshot '{}' reached a final status", self.snapshot_name)
            }
            (NotificationEvent::SnapshotPollExhausted, _) => format!(
                "Snapshot '{}' did not reach a final status before polling stopped",
                self.snapshot_name
            ),
            (event, Outcome::Failure(error)) => {
                format!("{} failed for '{}': {}", event, self.snapshot_name, error)
            }
        }
    }
}

/// Receiver of lifecycle notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the `audit` tracing target.
pub struct AuditLogger {
    component: String,
}

impl AuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new("snapshot")
    }
}

#[async_trait]
impl Notifier for AuditLogger {
    async fn notify(&self, notification: Notification) {
        let component = self.component.clone();
        tokio::spawn(async move {
            let message = notification.message();
            let subject = notification.subject.as_deref().unwrap_or("-");
            let event = notification.event.as_str();
            match (&notification.event, &notification.outcome) {
                (_, Outcome::Failure(_)) => {
                    tracing::error!(target: "audit", component = %component, event, subject, "{}", message)
                }
                (NotificationEvent::SnapshotPollExhausted, _) => {
                    tracing::warn!(target: "audit", component = %component, event, subject, "{}", message)
                }
                _ => {
                    tracing::info!(target: "audit", component = %component, event, subject, "{}", message)
                }
            }
        });
    }
}

/// Create a shared audit logger
pub fn create_audit_logger() -> Arc<dyn Notifier> {
    Arc::new(AuditLogger::default())
}
