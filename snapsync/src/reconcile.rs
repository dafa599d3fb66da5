//! Reconciliation engine - merges provider observations into snapshot records.
//!
//! Ticks never fail: any error is logged and the tick counts as a missed
//! observation. The next scheduled tick retries on its own.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

use crate::audit::{Notification, NotificationEvent, Notifier};
use crate::gateway::{ProviderConnector, ProviderContext, RemoteSnapshot};
use crate::scheduler::{PollScheduler, TickPayload};
use crate::status::SnapshotStatus;
use crate::store::{SnapshotEntry, SnapshotUpdate, Store, bytes_to_gib, gib_to_bytes};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No local record (or it is deleted); pending ticks were dropped.
    Missing,
    /// The record already had a final status; nothing was written.
    AlreadyFinal(SnapshotStatus),
    /// The provider does not know the snapshot.
    RemoteAbsent,
    Applied {
        previous: SnapshotStatus,
        current: SnapshotStatus,
        converged: bool,
    },
    /// The tick hit an error; the record is unchanged.
    Failed(String),
}

impl TickOutcome {
    /// Whether the campaign still expects later ticks to make progress.
    fn awaits_convergence(&self) -> bool {
        match self {
            TickOutcome::RemoteAbsent | TickOutcome::Failed(_) => true,
            TickOutcome::Applied { converged, .. } => !converged,
            TickOutcome::Missing | TickOutcome::AlreadyFinal(_) => false,
        }
    }
}

/// Compute the field changes one observation implies for a record.
///
/// - status: always written, unless the observed status is not a legal
///   transition, in which case the current status is kept;
/// - size: only when reported;
/// - creation time: only when reported and not yet set;
/// - description: only when reported and different.
pub fn merge(record: &SnapshotEntry, remote: &RemoteSnapshot) -> SnapshotUpdate {
    let status = if record.status.can_transition_to(remote.status) {
        remote.status
    } else {
        record.status
    };

    SnapshotUpdate {
        status,
        size_bytes: remote.size_gb.map(gib_to_bytes),
        creation_time: match record.creation_time {
            Some(_) => None,
            None => remote.created_at,
        },
        description: remote
            .description
            .clone()
            .filter(|d| record.description.as_deref() != Some(d.as_str())),
    }
}

pub struct Reconciler {
    store: Arc<Store>,
    connector: Arc<dyn ProviderConnector>,
    scheduler: Arc<PollScheduler>,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        connector: Arc<dyn ProviderConnector>,
        scheduler: Arc<PollScheduler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            connector,
            scheduler,
            notifier,
        }
    }

    /// Run one scheduled tick for a snapshot.
    pub async fn refresh_status(&self, snapshot_id: &str, tick: TickPayload) -> TickOutcome {
        let outcome = match self.try_refresh(snapshot_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(snapshot_id = %snapshot_id, error = %e, "Failed to refresh snapshot status");
                TickOutcome::Failed(e.to_string())
            }
        };

        if tick.is_last() && outcome.awaits_convergence() {
            self.campaign_exhausted(snapshot_id, tick).await;
        }

        outcome
    }

    async fn try_refresh(&self, snapshot_id: &str) -> Result<TickOutcome> {
        let record = match self.store.get_snapshot(snapshot_id).await? {
            Some(record) if !record.is_deleted() => record,
            _ => {
                self.scheduler.cancel(snapshot_id).await?;
                debug!(snapshot_id = %snapshot_id, "Snapshot record gone, dropping refresh");
                return Ok(TickOutcome::Missing);
            }
        };

        if record.status.is_final() {
            // A duplicate or late tick after convergence.
            self.scheduler.cancel(&record.id).await?;
            return Ok(TickOutcome::AlreadyFinal(record.status));
        }

        let context = ProviderContext::resolve(
            &self.store,
            &record.manager_id,
            record.tenant_id.as_deref(),
        )
        .await?
        .ok_or_else(|| anyhow!("No provider connection available"))?;
        let gateway = context.connect(self.connector.as_ref()).await?;

        match gateway.get_snapshot(&record.remote_ref).await? {
            Some(remote) => self.apply(&record, &remote).await,
            None => {
                debug!(
                    snapshot_id = %record.id,
                    remote_ref = %record.remote_ref,
                    "Snapshot not found on provider during refresh"
                );
                Ok(TickOutcome::RemoteAbsent)
            }
        }
    }

    /// Merge an observation into the record and stop the campaign on a final status.
    pub async fn apply(
        &self,
        record: &SnapshotEntry,
        remote: &RemoteSnapshot,
    ) -> Result<TickOutcome> {
        let update = merge(record, remote);
        if update.status != remote.status {
            warn!(
                snapshot_id = %record.id,
                current = %record.status,
                observed = %remote.status,
                "Ignoring illegal status transition"
            );
        }

        if !self.store.apply_snapshot_update(&record.id, &update).await? {
            // Deleted while the observation was in flight.
            return Ok(TickOutcome::Missing);
        }

        let converged = update.status.is_final();
        if converged {
            let size = update
                .size_bytes
                .or(record.size_bytes)
                .map(|b| bytes_to_gib(b).to_string())
                .unwrap_or_else(|| "N/A".to_string());
            info!(
                "Snapshot {} reached final status: {}, size: {} GB",
                record.name, update.status, size
            );

            let cancelled = self.scheduler.cancel(&record.id).await?;
            debug!(snapshot_id = %record.id, cancelled, "Cancelled remaining refresh ticks");

            self.notifier
                .notify(
                    Notification::new(NotificationEvent::SnapshotConverged, record.name.clone())
                        .subject(record.id.clone()),
                )
                .await;
        }

        if record.status != update.status {
            info!(
                "Snapshot {} status: {} -> {}",
                record.name, record.status, update.status
            );
        }

        Ok(TickOutcome::Applied {
            previous: record.status,
            current: update.status,
            converged,
        })
    }

    async fn campaign_exhausted(&self, snapshot_id: &str, tick: TickPayload) {
        let record = match self.store.get_snapshot(snapshot_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(snapshot_id = %snapshot_id, error = %e, "Failed to load snapshot after last refresh");
                return;
            }
        };
        if record.is_deleted() || record.status.is_final() {
            return;
        }

        warn!(
            snapshot_id = %record.id,
            status = %record.status,
            attempts = tick.max_attempts,
            "Snapshot did not reach a final status before polling stopped"
        );
        self.notifier
            .notify(
                Notification::new(NotificationEvent::SnapshotPollExhausted, record.name.clone())
                    .subject(record.id.clone()),
            )
            .await;
    }
}
