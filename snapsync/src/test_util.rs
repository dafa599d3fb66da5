//! Test utilities: a fully wired service over a temporary database and the
//! in-memory provider.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::audit::{Notification, NotificationEvent, Notifier};
use crate::gateway::{MemoryProvider, ProviderConnector};
use crate::lifecycle::{CreateSnapshotOptions, SnapshotService};
use crate::queue::{SqliteTaskQueue, TaskQueue};
use crate::reconcile::Reconciler;
use crate::scheduler::{PollScheduler, PollSettings};
use crate::store::{ManagerEntry, SnapshotEntry, Store, VolumeEntry};
use crate::worker::{Worker, WorkerSettings};

/// Provider-side id of the volume every harness starts with.
pub const VOLUME_REF: &str = "vol-remote-1";
/// Its size in GiB.
pub const VOLUME_SIZE_GB: u64 = 10;

/// Notifier that keeps every notification for inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.seen.lock().await.iter().map(|n| n.event).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.seen.lock().await.push(notification);
    }
}

pub struct Harness {
    pub store: Arc<Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub scheduler: Arc<PollScheduler>,
    pub provider: MemoryProvider,
    pub notifier: Arc<RecordingNotifier>,
    pub reconciler: Arc<Reconciler>,
    pub service: Arc<SnapshotService>,
    pub worker: Worker,
    pub manager: ManagerEntry,
    pub volume: VolumeEntry,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(PollSettings::default()).await
    }

    pub async fn with_settings(settings: PollSettings) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let store = Arc::new(
            Store::new(dir.path().to_str().expect("utf-8 temp path"))
                .await
                .expect("open store"),
        );
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(store.pool()));
        let scheduler = Arc::new(PollScheduler::new(Arc::clone(&queue), settings));
        let provider = MemoryProvider::new();
        let connector: Arc<dyn ProviderConnector> = Arc::new(provider.clone());
        let notifier = Arc::new(RecordingNotifier::default());

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&connector),
            Arc::clone(&scheduler),
            notifier.clone(),
        ));
        let service = Arc::new(SnapshotService::new(
            Arc::clone(&store),
            connector,
            Arc::clone(&scheduler),
            Arc::clone(&reconciler),
            Arc::clone(&queue),
            notifier.clone(),
        ));
        let worker = Worker::new(
            Arc::clone(&queue),
            Arc::clone(&reconciler),
            Arc::clone(&service),
            WorkerSettings::default(),
        );

        let manager = ManagerEntry::new("cinder".to_string(), None);
        store.create_manager(&manager).await.expect("create manager");
        let volume = VolumeEntry::new(
            "data".to_string(),
            VOLUME_REF.to_string(),
            manager.id.clone(),
            None,
        );
        store.create_volume(&volume).await.expect("create volume");
        provider.add_volume(VOLUME_REF, VOLUME_SIZE_GB).await;

        Self {
            store,
            queue,
            scheduler,
            provider,
            notifier,
            reconciler,
            service,
            worker,
            manager,
            volume,
            _dir: dir,
        }
    }

    /// Create a snapshot of the harness volume through the service.
    pub async fn create_snapshot(&self, name: &str) -> SnapshotEntry {
        let options = CreateSnapshotOptions {
            name: name.to_string(),
            description: None,
        };
        self.service
            .create_snapshot(&self.volume.id, &options)
            .await
            .expect("create snapshot")
    }
}
