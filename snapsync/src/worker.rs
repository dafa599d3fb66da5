//! Queue worker - claims due tasks and dispatches them.
//!
//! Tasks for different resources run concurrently. Tasks for the same
//! resource run one after another in delivery order: the queue does not hand
//! out a resource's tasks while one of them is still claimed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::gateway::SnapshotChanges;
use crate::lifecycle::{
    CREATE_SNAPSHOT_METHOD, CreateSnapshotOptions, DELETE_SNAPSHOT_METHOD, SnapshotService,
    UPDATE_SNAPSHOT_METHOD,
};
use crate::queue::{QueuedTask, TaskQueue, TaskState};
use crate::reconcile::Reconciler;
use crate::scheduler::{REFRESH_STATUS_METHOD, TickPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// How often the queue is checked for due tasks
    pub poll_interval: Duration,
    /// Maximum tasks claimed per check
    pub batch_size: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 32,
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    reconciler: Arc<Reconciler>,
    service: Arc<SnapshotService>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        reconciler: Arc<Reconciler>,
        service: Arc<SnapshotService>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            reconciler,
            service,
            settings,
        }
    }

    /// Process due tasks until `shutdown` flips to `true`.
    ///
    /// Claimed work runs in the background while the queue keeps being
    /// polled, so a slow provider call only holds up its own resource.
    /// Work still running at shutdown is aborted; the claim lease hands it
    /// out again later.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "Worker started"
        );
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.claim_groups().await {
                        Ok(groups) => {
                            for group in groups {
                                self.spawn_group(&mut running, group);
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to process queue"),
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    log_join(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if !running.is_empty() {
                            info!(in_flight = running.len(), "Aborting running tasks");
                        }
                        running.shutdown().await;
                        info!("Worker shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Claim one batch of due tasks and wait until all of them finished.
    ///
    /// Returns the number of tasks processed.
    pub async fn drain_once(&self) -> Result<usize> {
        let groups = self.claim_groups().await?;
        let count = groups.iter().map(Vec::len).sum();

        let mut running = JoinSet::new();
        for group in groups {
            self.spawn_group(&mut running, group);
        }
        while let Some(joined) = running.join_next().await {
            log_join(joined);
        }

        Ok(count)
    }

    /// Claim due tasks, grouped by resource and sorted by delivery time.
    async fn claim_groups(&self) -> Result<Vec<Vec<QueuedTask>>> {
        let tasks = self
            .queue
            .claim_ready(Utc::now(), self.settings.batch_size)
            .await?;

        let mut by_resource: BTreeMap<String, Vec<QueuedTask>> = BTreeMap::new();
        for task in tasks {
            by_resource
                .entry(task.resource_id.clone())
                .or_default()
                .push(task);
        }

        Ok(by_resource
            .into_values()
            .map(|mut group| {
                group.sort_by_key(|t| t.deliver_on);
                group
            })
            .collect())
    }

    fn spawn_group(&self, running: &mut JoinSet<()>, group: Vec<QueuedTask>) {
        let worker = self.clone();
        running.spawn(async move {
            for task in group {
                worker.run_task(task).await;
            }
        });
    }

    async fn run_task(&self, task: QueuedTask) {
        debug!(
            task_id = %task.id,
            resource_id = %task.resource_id,
            method = %task.method_name,
            "Dispatching task"
        );

        let state = match self.dispatch(&task).await {
            Ok(()) => TaskState::Ok,
            Err(e) => {
                error!(
                    task_id = %task.id,
                    resource_id = %task.resource_id,
                    method = %task.method_name,
                    error = %e,
                    "Task failed"
                );
                TaskState::Error
            }
        };

        if let Err(e) = self.queue.finish(&task.id, state).await {
            warn!(task_id = %task.id, error = %e, "Failed to record task result");
        }
    }

    async fn dispatch(&self, task: &QueuedTask) -> Result<()> {
        match task.method_name.as_str() {
            REFRESH_STATUS_METHOD => {
                let tick: TickPayload =
                    serde_json::from_str(&task.payload).context("invalid tick payload")?;
                self.reconciler.refresh_status(&task.resource_id, tick).await;
            }
            CREATE_SNAPSHOT_METHOD => {
                let options: CreateSnapshotOptions =
                    serde_json::from_str(&task.payload).context("invalid create payload")?;
                self.service
                    .create_snapshot(&task.resource_id, &options)
                    .await?;
            }
            UPDATE_SNAPSHOT_METHOD => {
                let changes: SnapshotChanges =
                    serde_json::from_str(&task.payload).context("invalid update payload")?;
                self.service
                    .update_snapshot(&task.resource_id, &changes)
                    .await?;
            }
            DELETE_SNAPSHOT_METHOD => {
                self.service.delete_snapshot(&task.resource_id).await?;
            }
            other => bail!("unknown task method '{}'", other),
        }
        Ok(())
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        error!(error = %e, "Worker task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NotificationEvent;
    use crate::queue::NewTask;
    use crate::scheduler::PollSettings;
    use crate::status::SnapshotStatus;
    use crate::test_util::Harness;

    #[tokio::test]
    async fn test_drain_runs_due_tick() {
        let h = Harness::new().await;
        let snap = h.create_snapshot("snap1").await;
        h.provider
            .set_status(&snap.remote_ref, SnapshotStatus::Available)
            .await;

        // Only the first tick is due
        assert_eq!(h.worker.drain_once().await.unwrap(), 1);

        let stored = h.store.get_snapshot(&snap.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SnapshotStatus::Available);
        assert!(
            h.queue
                .pending(&snap.id, REFRESH_STATUS_METHOD)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(h.worker.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_runs_queued_delete() {
        let h = Harness::new().await;
        let snap = h.create_snapshot("snap1").await;
        h.scheduler.cancel(&snap.id).await.unwrap();

        h.service.delete_snapshot_queue(&snap.id).await.unwrap();
        assert_eq!(h.worker.drain_once().await.unwrap(), 1);

        let stored = h.store.get_snapshot(&snap.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SnapshotStatus::Deleted);
    }

    #[tokio::test]
    async fn test_unknown_method_marks_task_failed() {
        let h = Harness::new().await;
        h.queue
            .enqueue(NewTask::new("r", "defragment", "{}".to_string(), Utc::now()))
            .await
            .unwrap();

        assert_eq!(h.worker.drain_once().await.unwrap(), 1);
        let rows = sqlx::query("SELECT state FROM queue_tasks WHERE method_name = 'defragment'")
            .fetch_all(&h.store.pool())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(sqlx::Row::get::<String, _>(&rows[0], "state"), "error");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new().await;
        let (tx, rx) = watch::channel(false);
        let worker = h.worker.clone();
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stops")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_hung_fetch_does_not_hold_up_other_snapshots() {
        let h = Harness::with_settings(PollSettings {
            interval: Duration::from_millis(100),
            max_attempts: 5,
        })
        .await;
        let stuck = h.create_snapshot("stuck").await;
        let healthy = h.create_snapshot("healthy").await;
        h.provider.stall(&stuck.remote_ref).await;

        let worker = Worker::new(
            h.queue.clone(),
            h.reconciler.clone(),
            h.service.clone(),
            WorkerSettings {
                poll_interval: Duration::from_millis(20),
                batch_size: 32,
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stops")
            .unwrap()
            .unwrap();

        // The healthy campaign ran to the end
        assert!(
            h.queue
                .pending(&healthy.id, REFRESH_STATUS_METHOD)
                .await
                .unwrap()
                .is_empty()
        );
        let exhausted: Vec<_> = h
            .notifier
            .notifications()
            .await
            .into_iter()
            .filter(|n| n.event == NotificationEvent::SnapshotPollExhausted)
            .filter_map(|n| n.subject)
            .collect();
        assert_eq!(exhausted, vec![healthy.id.clone()]);

        // The stuck one stays behind its first tick
        assert_eq!(
            h.queue
                .pending(&stuck.id, REFRESH_STATUS_METHOD)
                .await
                .unwrap()
                .len(),
            4
        );
    }
}
