//! Snapshot lifecycle operations.
//!
//! Each operation performs the provider call, mirrors the result into the
//! local record and hands off to the poll scheduler where needed. Failures
//! surface as typed [`SnapshotError`]s carrying the provider's message;
//! nothing here retries on its own.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::audit::{Notification, NotificationEvent, Notifier, Outcome};
use crate::error::{GatewayError, SnapshotError};
use crate::gateway::{
    CreateSnapshotRequest, DeleteOutcome, ProviderConnector, ProviderContext, SnapshotChanges,
};
use crate::queue::{NewTask, TaskQueue};
use crate::reconcile::Reconciler;
use crate::scheduler::PollScheduler;
use crate::store::{SnapshotEntry, Store, gib_to_bytes};

pub const CREATE_SNAPSHOT_METHOD: &str = "create_snapshot";
pub const UPDATE_SNAPSHOT_METHOD: &str = "update_snapshot";
pub const DELETE_SNAPSHOT_METHOD: &str = "delete_snapshot";

const NO_CONNECTION: &str = "No provider connection available";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotOptions {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

pub struct SnapshotService {
    store: Arc<Store>,
    connector: Arc<dyn ProviderConnector>,
    scheduler: Arc<PollScheduler>,
    reconciler: Arc<Reconciler>,
    queue: Arc<dyn TaskQueue>,
    notifier: Arc<dyn Notifier>,
}

impl SnapshotService {
    pub fn new(
        store: Arc<Store>,
        connector: Arc<dyn ProviderConnector>,
        scheduler: Arc<PollScheduler>,
        reconciler: Arc<Reconciler>,
        queue: Arc<dyn TaskQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            connector,
            scheduler,
            reconciler,
            queue,
            notifier,
        }
    }

    async fn load(&self, snapshot_id: &str) -> Result<SnapshotEntry, SnapshotError> {
        self.store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(snapshot_id.to_string()))
    }

    async fn context_for(
        &self,
        record: &SnapshotEntry,
    ) -> Result<Option<ProviderContext>, SnapshotError> {
        Ok(ProviderContext::resolve(&self.store, &record.manager_id, record.tenant_id.as_deref()).await?)
    }

    async fn volume_name(&self, volume_id: &str) -> Option<String> {
        match self.store.get_volume(volume_id).await {
            Ok(volume) => volume.map(|v| v.name),
            Err(e) => {
                warn!(volume_id = %volume_id, error = %e, "Failed to load volume");
                None
            }
        }
    }

    /// Create a snapshot of a volume and start its refresh campaign.
    ///
    /// Nothing is persisted if the provider call fails.
    pub async fn create_snapshot(
        &self,
        volume_id: &str,
        options: &CreateSnapshotOptions,
    ) -> Result<SnapshotEntry, SnapshotError> {
        let volume = self
            .store
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| SnapshotError::InvalidArgument("cloud volume cannot be nil".to_string()))?;

        let context =
            ProviderContext::resolve(&self.store, &volume.manager_id, volume.tenant_id.as_deref())
                .await?
                .ok_or_else(|| SnapshotError::InvalidArgument("manager cannot be nil".to_string()))?;

        let request = CreateSnapshotRequest {
            volume_ref: volume.remote_ref.clone(),
            name: options.name.clone(),
            description: options.description.clone(),
            force: true,
        };
        let result = async {
            let gateway = context.connect(self.connector.as_ref()).await?;
            gateway.create_snapshot(&request).await
        }
        .await;

        let notification = Notification::new(NotificationEvent::SnapshotCreate, options.name.clone())
            .volume(Some(volume.name.clone()));
        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                let message = e.message();
                let err = SnapshotError::create(e);
                error!(snapshot = %options.name, error = %err, "Snapshot create failed");
                self.notifier
                    .notify(notification.outcome(Outcome::Failure(message)))
                    .await;
                return Err(err);
            }
        };

        let mut entry = SnapshotEntry::new(
            remote.id.clone(),
            remote.name.clone().unwrap_or_else(|| options.name.clone()),
            remote.status,
            &volume,
        );
        entry.description = remote.description.clone();
        entry.size_bytes = remote.size_gb.map(gib_to_bytes);
        entry.creation_time = remote.created_at;
        if let Err(e) = self.store.create_snapshot(&entry).await {
            // The provider keeps a snapshot nothing here points at
            error!(
                snapshot = %entry.name,
                remote_ref = %entry.remote_ref,
                error = %e,
                "Failed to persist created snapshot"
            );
            self.notifier
                .notify(notification.outcome(Outcome::Failure(format!(
                    "snapshot {} was created but could not be recorded: {}",
                    entry.remote_ref, e
                ))))
                .await;
            return Err(SnapshotError::Store(
                e.context("failed to persist snapshot record"),
            ));
        }

        info!(
            snapshot_id = %entry.id,
            remote_ref = %entry.remote_ref,
            status = %entry.status,
            "Snapshot created"
        );
        self.notifier
            .notify(notification.subject(entry.id.clone()))
            .await;

        if let Err(e) = self.scheduler.schedule(&entry.id).await {
            // The record stands; a manual refresh can still converge it.
            error!(snapshot_id = %entry.id, error = %e, "Failed to schedule status refresh");
        }

        Ok(entry)
    }

    /// Push name/description changes to the provider and mirror them locally.
    pub async fn update_snapshot(
        &self,
        snapshot_id: &str,
        changes: &SnapshotChanges,
    ) -> Result<SnapshotEntry, SnapshotError> {
        let record = self.load(snapshot_id).await?;
        let Some(context) = self.context_for(&record).await? else {
            return Err(SnapshotError::update(GatewayError::Unavailable(
                NO_CONNECTION.to_string(),
            )));
        };

        let result = async {
            let gateway = context.connect(self.connector.as_ref()).await?;
            match gateway.get_snapshot(&record.remote_ref).await? {
                Some(_) => gateway.update_snapshot(&record.remote_ref, changes).await,
                None => Err(GatewayError::NotFound(
                    "snapshot does not exist".to_string(),
                )),
            }
        }
        .await;

        if let Err(e) = result {
            let err = SnapshotError::update(e);
            error!(snapshot = %record.name, error = %err, "Snapshot update failed");
            return Err(err);
        }

        if !changes.is_empty() {
            self.store.update_snapshot_details(&record.id, changes).await?;
        }
        self.load(snapshot_id).await
    }

    /// Delete a snapshot on the provider and mark the record deleted.
    ///
    /// A snapshot the provider no longer knows counts as deleted.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), SnapshotError> {
        let record = self.load(snapshot_id).await?;
        if record.is_deleted() {
            self.scheduler.cancel(&record.id).await?;
            return Ok(());
        }

        let Some(context) = self.context_for(&record).await? else {
            return Err(SnapshotError::delete(GatewayError::Unavailable(
                NO_CONNECTION.to_string(),
            )));
        };

        let result = async {
            let gateway = context.connect(self.connector.as_ref()).await?;
            let outcome = match gateway.get_snapshot(&record.remote_ref).await? {
                Some(_) => gateway.delete_snapshot(&record.remote_ref).await?,
                None => DeleteOutcome::AlreadyGone,
            };
            Ok::<_, GatewayError>(outcome)
        }
        .await;

        let notification = Notification::new(NotificationEvent::SnapshotDelete, record.name.clone())
            .subject(record.id.clone())
            .volume(self.volume_name(&record.volume_id).await);
        match result {
            Ok(DeleteOutcome::AlreadyGone) => {
                warn!("snapshot=[{}] already deleted", record.name);
            }
            Ok(DeleteOutcome::Deleted) => {}
            Err(e) => {
                let message = e.message();
                let err = SnapshotError::delete(e);
                error!(snapshot = %record.name, error = %err, "Snapshot delete failed");
                self.notifier
                    .notify(notification.outcome(Outcome::Failure(message)))
                    .await;
                return Err(err);
            }
        }

        let cancelled = self.scheduler.cancel(&record.id).await?;
        self.store.mark_snapshot_deleted(&record.id).await?;
        info!(snapshot_id = %record.id, cancelled, "Snapshot deleted");
        self.notifier.notify(notification).await;

        Ok(())
    }

    /// Reconcile one snapshot immediately, outside any campaign.
    ///
    /// A snapshot the provider no longer knows is marked deleted.
    pub async fn refresh_snapshot(&self, snapshot_id: &str) -> Result<SnapshotEntry, SnapshotError> {
        let record = self.load(snapshot_id).await?;
        if record.is_deleted() {
            return Ok(record);
        }
        let Some(context) = self.context_for(&record).await? else {
            return Err(SnapshotError::update(GatewayError::Unavailable(
                NO_CONNECTION.to_string(),
            )));
        };

        let observed = async {
            let gateway = context.connect(self.connector.as_ref()).await?;
            gateway.get_snapshot(&record.remote_ref).await
        }
        .await
        .map_err(SnapshotError::update)?;

        match observed {
            Some(remote) => {
                self.reconciler.apply(&record, &remote).await?;
            }
            None => {
                warn!(snapshot_id = %record.id, "Snapshot no longer exists on provider");
                self.scheduler.cancel(&record.id).await?;
                self.store.mark_snapshot_deleted(&record.id).await?;
            }
        }

        self.load(snapshot_id).await
    }

    // === Queued variants ===

    /// Queue a create for the worker. Returns the task id.
    pub async fn create_snapshot_queue(
        &self,
        volume_id: &str,
        options: &CreateSnapshotOptions,
    ) -> Result<String, SnapshotError> {
        self.enqueue(volume_id, CREATE_SNAPSHOT_METHOD, serde_json::to_string(options))
            .await
    }

    pub async fn update_snapshot_queue(
        &self,
        snapshot_id: &str,
        changes: &SnapshotChanges,
    ) -> Result<String, SnapshotError> {
        self.enqueue(snapshot_id, UPDATE_SNAPSHOT_METHOD, serde_json::to_string(changes))
            .await
    }

    pub async fn delete_snapshot_queue(&self, snapshot_id: &str) -> Result<String, SnapshotError> {
        self.enqueue(snapshot_id, DELETE_SNAPSHOT_METHOD, Ok("{}".to_string()))
            .await
    }

    async fn enqueue(
        &self,
        resource_id: &str,
        method_name: &str,
        payload: serde_json::Result<String>,
    ) -> Result<String, SnapshotError> {
        let payload = payload.context("failed to encode task payload")?;
        let task = NewTask::new(resource_id, method_name, payload, Utc::now());
        let id = self.queue.enqueue(task).await?;
        info!(resource_id = %resource_id, method = %method_name, task_id = %id, "Queued snapshot operation");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::Operation;
    use crate::queue::TaskState;
    use crate::scheduler::REFRESH_STATUS_METHOD;
    use crate::status::SnapshotStatus;
    use crate::store::{ManagerEntry, TenantEntry, VolumeEntry};
    use crate::test_util::Harness;

    fn options(name: &str) -> CreateSnapshotOptions {
        CreateSnapshotOptions {
            name: name.to_string(),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_create_persists_and_schedules() {
        let h = Harness::new().await;

        let snap = h
            .service
            .create_snapshot(&h.volume.id, &options("snap1"))
            .await
            .unwrap();

        assert_eq!(snap.status, SnapshotStatus::Creating);
        assert_eq!(snap.size_bytes, Some(gib_to_bytes(10)));
        assert_eq!(snap.volume_id, h.volume.id);
        assert_eq!(snap.manager_id, h.manager.id);

        let pending = h
            .queue
            .pending(&snap.id, REFRESH_STATUS_METHOD)
            .await
            .unwrap();
        assert_eq!(pending.len(), 24);
    }

    #[tokio::test]
    async fn test_create_requires_volume_and_manager() {
        let h = Harness::new().await;

        let err = h
            .service
            .create_snapshot("no-such-volume", &options("snap1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidArgument(_)));

        let orphan = VolumeEntry::new(
            "orphan".to_string(),
            "vol-orphan".to_string(),
            "missing-manager".to_string(),
            None,
        );
        h.store.create_volume(&orphan).await.unwrap();
        let err = h
            .service
            .create_snapshot(&orphan.id, &options("snap1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidArgument(_)));
        assert_eq!(h.provider.calls(Operation::Create).await, 0);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_record() {
        let h = Harness::new().await;
        h.provider
            .fail_next(
                Operation::Create,
                GatewayError::Api {
                    status: 413,
                    message: "SnapshotLimitExceeded: Maximum number of snapshots allowed (10) exceeded"
                        .to_string(),
                },
            )
            .await;

        let err = h
            .service
            .create_snapshot(&h.volume.id, &options("snap1"))
            .await
            .unwrap_err();
        match err {
            SnapshotError::Create { message, .. } => {
                assert!(message.starts_with("SnapshotLimitExceeded"))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(h.store.list_snapshots(None).await.unwrap().is_empty());
        let events = h.notifier.notifications().await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].outcome,
            Outcome::Failure(
                "SnapshotLimitExceeded: Maximum number of snapshots allowed (10) exceeded"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_create_reports_snapshot_it_could_not_record() {
        let h = Harness::new().await;
        sqlx::query("DROP TABLE snapshots")
            .execute(&h.store.pool())
            .await
            .unwrap();

        let err = h
            .service
            .create_snapshot(&h.volume.id, &options("snap1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Store(_)));

        // Created remotely, never scheduled
        assert_eq!(h.provider.calls(Operation::Create).await, 1);
        let events = h.notifier.notifications().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, NotificationEvent::SnapshotCreate);
        match &events[0].outcome {
            Outcome::Failure(message) => {
                let remote_ref = message
                    .split_whitespace()
                    .nth(1)
                    .unwrap()
                    .to_string();
                assert!(h.provider.snapshot(&remote_ref).await.is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let ticks = sqlx::query("SELECT id FROM queue_tasks")
            .fetch_all(&h.store.pool())
            .await
            .unwrap();
        assert!(ticks.is_empty());
    }

    #[tokio::test]
    async fn test_create_scopes_connection_to_tenant() {
        let h = Harness::new().await;
        let tenant = TenantEntry::new("project-a".to_string(), None, h.manager.id.clone());
        h.store.create_tenant(&tenant).await.unwrap();
        let volume = VolumeEntry::new(
            "scoped".to_string(),
            "vol-scoped".to_string(),
            h.manager.id.clone(),
            Some(tenant.id.clone()),
        );
        h.store.create_volume(&volume).await.unwrap();
        h.provider.add_volume("vol-scoped", 1).await;

        let snap = h
            .service
            .create_snapshot(&volume.id, &options("snap1"))
            .await
            .unwrap();
        assert_eq!(snap.tenant_id.as_deref(), Some(tenant.id.as_str()));

        let connections = h.provider.connections().await;
        assert_eq!(
            connections.last().and_then(|c| c.tenant_name.as_deref()),
            Some("project-a")
        );
    }

    #[tokio::test]
    async fn test_update_missing_remote_fails() {
        let h = Harness::new().await;
        let snap = h.create_snapshot("snap1").await;
        h.provider.remove(&snap.remote_ref).await;

        let changes = SnapshotChanges {
            name: Some("renamed".to_string()),
            description: None,
        };
        let err = h
            .service
            .update_snapshot(&snap.id, &changes)
            .await
            .unwrap_err();
        match err {
            SnapshotError::Update { message, .. } => assert_eq!(message, "snapshot does not exist"),
            other => panic!("unexpected error: {other:?}"),
        }

        let stored = h.store.get_snapshot(&snap.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "snap1");
    }

    #[tokio::test]
    async fn test_update_applies_remotely_and_locally() {
        let h = Harness::new().await;
        let snap = h.create_snapshot("snap1").await;

        let changes = SnapshotChanges {
            name: None,
            description: Some("before upgrade".to_string()),
        };
        let updated = h.service.update_snapshot(&snap.id, &changes).await.unwrap();
        assert_eq!(updated.description.as_deref(), Some("before upgrade"));

        let remote = h.provider.snapshot(&snap.remote_ref).await.unwrap();
        assert_eq!(remote.description.as_deref(), Some("before upgrade"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let h = Harness::new().await;
        let snap = h.create_snapshot("snap1").await;
        h.provider.remove(&snap.remote_ref).await;

        h.service.delete_snapshot(&snap.id).await.unwrap();
        h.service.delete_snapshot(&snap.id).await.unwrap();

        let stored = h.store.get_snapshot(&snap.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SnapshotStatus::Deleted);
        assert_eq!(h.provider.calls(Operation::Delete).await, 0);
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_record() {
        let h = Harness::new().await;
        let snap = h.create_snapshot("snap1").await;
        h.provider
            .fail_next(
                Operation::Delete,
                GatewayError::Api {
                    status: 400,
                    message: "Invalid snapshot: Snapshot status must be available or error"
                        .to_string(),
                },
            )
            .await;

        let err = h.service.delete_snapshot(&snap.id).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Delete { .. }));
        let events = h.notifier.notifications().await;
        assert_eq!(
            events.last().unwrap().outcome,
            Outcome::Failure(
                "Invalid snapshot: Snapshot status must be available or error".to_string()
            )
        );

        let stored = h.store.get_snapshot(&snap.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SnapshotStatus::Creating);
        assert_eq!(
            h.queue
                .pending(&snap.id, REFRESH_STATUS_METHOD)
                .await
                .unwrap()
                .len(),
            24
        );
    }

    #[tokio::test]
    async fn test_refresh_marks_vanished_snapshot_deleted() {
        let h = Harness::new().await;
        let snap = h.create_snapshot("snap1").await;
        h.provider.remove(&snap.remote_ref).await;

        let refreshed = h.service.refresh_snapshot(&snap.id).await.unwrap();
        assert_eq!(refreshed.status, SnapshotStatus::Deleted);
        assert!(
            h.queue
                .pending(&snap.id, REFRESH_STATUS_METHOD)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_refresh_without_manager_fails() {
        let h = Harness::new().await;
        let other = ManagerEntry::new("gone".to_string(), None);
        let volume = VolumeEntry::new(
            "v".to_string(),
            "vol-1".to_string(),
            other.id.clone(),
            None,
        );
        h.store.create_volume(&volume).await.unwrap();
        let entry = SnapshotEntry::new(
            "remote".to_string(),
            "snap".to_string(),
            SnapshotStatus::Creating,
            &volume,
        );
        h.store.create_snapshot(&entry).await.unwrap();

        let err = h.service.refresh_snapshot(&entry.id).await.unwrap_err();
        match err {
            SnapshotError::Update { message, .. } => assert_eq!(message, NO_CONNECTION),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queued_operations() {
        let h = Harness::new().await;
        let task_id = h
            .service
            .create_snapshot_queue(&h.volume.id, &options("queued"))
            .await
            .unwrap();

        let claimed = h.queue.claim_ready(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, task_id);
        assert_eq!(claimed[0].method_name, CREATE_SNAPSHOT_METHOD);
        let decoded: CreateSnapshotOptions = serde_json::from_str(&claimed[0].payload).unwrap();
        assert_eq!(decoded, options("queued"));
        h.queue.finish(&task_id, TaskState::Ok).await.unwrap();
    }
}
