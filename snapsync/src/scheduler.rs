//! Poll scheduler - queues bounded campaigns of status refresh ticks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::queue::{HIGH_PRIORITY, NewTask, TaskQueue};

/// Queue method name of a reconciliation tick.
pub const REFRESH_STATUS_METHOD: &str = "refresh_status_from_provider";

/// Campaign shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    /// 24 ticks, 5 seconds apart.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 24,
        }
    }
}

/// Arguments carried by each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPayload {
    /// Zero-based position in the campaign
    pub attempt: u32,
    pub max_attempts: u32,
}

impl TickPayload {
    pub fn is_last(&self) -> bool {
        self.attempt.saturating_add(1) >= self.max_attempts
    }
}

pub struct PollScheduler {
    queue: Arc<dyn TaskQueue>,
    settings: PollSettings,
}

impl PollScheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, settings: PollSettings) -> Self {
        Self { queue, settings }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Start a campaign with the configured interval and attempt count.
    pub async fn schedule(&self, resource_id: &str) -> Result<Vec<String>> {
        self.schedule_with(resource_id, self.settings.interval, self.settings.max_attempts)
            .await
    }

    /// Queue `max_attempts` ticks, the k-th due at `now + interval * k`.
    ///
    /// Pending ticks of an earlier campaign for the same resource are removed
    /// first. A campaign without attempts, or one reaching past the
    /// representable time range, is rejected before anything changes.
    /// Returns the ids of the queued ticks.
    pub async fn schedule_with(
        &self,
        resource_id: &str,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<Vec<String>> {
        if max_attempts == 0 {
            bail!("a refresh campaign needs at least one attempt");
        }
        let step = TimeDelta::from_std(interval).context("poll interval out of range")?;
        let now = Utc::now();
        let due = (0..max_attempts)
            .map(|attempt| deliver_on(now, step, attempt))
            .collect::<Result<Vec<_>>>()?;

        let superseded = self.cancel(resource_id).await?;
        if superseded > 0 {
            debug!(resource_id = %resource_id, superseded, "Replacing pending refresh campaign");
        }

        let mut ids = Vec::with_capacity(due.len());
        for (attempt, deliver_on) in (0..max_attempts).zip(due) {
            let payload = TickPayload {
                attempt,
                max_attempts,
            };
            let task = NewTask::new(
                resource_id,
                REFRESH_STATUS_METHOD,
                serde_json::to_string(&payload)?,
                deliver_on,
            )
            .with_priority(HIGH_PRIORITY);
            ids.push(self.queue.enqueue(task).await?);
        }

        debug!(
            resource_id = %resource_id,
            attempts = max_attempts,
            interval_secs = interval.as_secs_f64(),
            "Scheduled status refresh campaign"
        );
        Ok(ids)
    }

    /// Drop every not-yet-started tick for the resource. Returns how many were removed.
    pub async fn cancel(&self, resource_id: &str) -> Result<u64> {
        self.queue
            .remove_pending(resource_id, REFRESH_STATUS_METHOD)
            .await
    }
}

fn deliver_on(now: DateTime<Utc>, step: TimeDelta, attempt: u32) -> Result<DateTime<Utc>> {
    i32::try_from(attempt)
        .ok()
        .and_then(|k| step.checked_mul(k))
        .and_then(|offset| now.checked_add_signed(offset))
        .with_context(|| format!("tick {} of the refresh campaign is out of range", attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SqliteTaskQueue;
    use crate::store::Store;
    use tempfile::TempDir;

    async fn setup() -> (PollScheduler, Arc<dyn TaskQueue>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().to_str().unwrap()).await.unwrap();
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(store.pool()));
        let scheduler = PollScheduler::new(Arc::clone(&queue), PollSettings::default());
        (scheduler, queue, dir)
    }

    #[tokio::test]
    async fn test_schedule_bounded_campaign() {
        let (scheduler, queue, _dir) = setup().await;

        let ids = scheduler.schedule("snap-1").await.unwrap();
        assert_eq!(ids.len(), 24);

        let pending = queue
            .pending("snap-1", REFRESH_STATUS_METHOD)
            .await
            .unwrap();
        assert_eq!(pending.len(), 24);

        for (k, pair) in pending.windows(2).enumerate() {
            assert_eq!(pair[1].deliver_on - pair[0].deliver_on, TimeDelta::seconds(5));
            let payload: TickPayload = serde_json::from_str(&pair[0].payload).unwrap();
            assert_eq!(payload.attempt, k as u32);
            assert_eq!(payload.max_attempts, 24);
        }
        assert!(pending.iter().all(|t| t.priority == HIGH_PRIORITY));
    }

    #[tokio::test]
    async fn test_new_campaign_replaces_pending_one() {
        let (scheduler, queue, _dir) = setup().await;

        scheduler.schedule("snap-1").await.unwrap();
        scheduler
            .schedule_with("snap-1", Duration::from_secs(1), 3)
            .await
            .unwrap();

        let pending = queue
            .pending("snap-1", REFRESH_STATUS_METHOD)
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_out_of_range_campaign_keeps_current_one() {
        let (scheduler, queue, _dir) = setup().await;
        scheduler.schedule("snap-1").await.unwrap();

        let far = Duration::from_secs(1_000_000_000_000_000);
        assert!(scheduler.schedule_with("snap-1", far, 3).await.is_err());
        assert!(scheduler.schedule_with("snap-1", far * 1000, 3).await.is_err());
        assert!(
            scheduler
                .schedule_with("snap-1", Duration::from_secs(5), 0)
                .await
                .is_err()
        );

        let pending = queue
            .pending("snap-1", REFRESH_STATUS_METHOD)
            .await
            .unwrap();
        assert_eq!(pending.len(), 24);
    }

    #[test]
    fn test_deliver_on_checks_range() {
        let now = Utc::now();
        let step = TimeDelta::seconds(5);
        assert_eq!(deliver_on(now, step, 3).unwrap(), now + TimeDelta::seconds(15));
        assert!(deliver_on(now, step, u32::MAX).is_err());
        assert!(deliver_on(now, TimeDelta::days(365 * 200_000), 2).is_err());
    }

    #[tokio::test]
    async fn test_cancel_empty_campaign_is_noop() {
        let (scheduler, _queue, _dir) = setup().await;
        assert_eq!(scheduler.cancel("nothing-here").await.unwrap(), 0);
    }

    #[test]
    fn test_last_tick() {
        let tick = TickPayload {
            attempt: 23,
            max_attempts: 24,
        };
        assert!(tick.is_last());
        let tick = TickPayload {
            attempt: 0,
            max_attempts: 24,
        };
        assert!(!tick.is_last());
        let tick = TickPayload {
            attempt: u32::MAX,
            max_attempts: u32::MAX,
        };
        assert!(tick.is_last());
    }
}
