//! Deferred task queue.
//!
//! Tasks are addressed by `(resource_id, method_name)` so every pending task
//! for one operation on one resource can be removed in a single call.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

use crate::store::{parse_timestamp, timestamp};

pub const HIGH_PRIORITY: i64 = 20;
pub const NORMAL_PRIORITY: i64 = 100;

/// Worker role that executes provider operations.
pub const EMS_OPERATIONS_ROLE: &str = "ems_operations";

/// How long a claim holds before the task is handed out again.
pub const DEFAULT_CLAIM_LEASE: TimeDelta = TimeDelta::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for its delivery time.
    Ready,
    /// Claimed by a worker.
    Dequeue,
    Ok,
    Error,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::Dequeue => "dequeue",
            TaskState::Ok => "ok",
            TaskState::Error => "error",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(TaskState::Ready),
            "dequeue" => Ok(TaskState::Dequeue),
            "ok" => Ok(TaskState::Ok),
            "error" => Ok(TaskState::Error),
            other => Err(anyhow!("unknown task state: {}", other)),
        }
    }
}

/// Enqueue request.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub resource_id: String,
    pub method_name: String,
    /// JSON-encoded arguments for the method
    pub payload: String,
    pub priority: i64,
    pub role: String,
    pub deliver_on: DateTime<Utc>,
}

impl NewTask {
    pub fn new(
        resource_id: impl Into<String>,
        method_name: impl Into<String>,
        payload: String,
        deliver_on: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            method_name: method_name.into(),
            payload,
            priority: NORMAL_PRIORITY,
            role: EMS_OPERATIONS_ROLE.to_string(),
            deliver_on,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: String,
    pub resource_id: String,
    pub method_name: String,
    pub payload: String,
    pub priority: i64,
    pub role: String,
    pub state: TaskState,
    pub deliver_on: DateTime<Utc>,
    pub created_at: String,
}

/// Queue of deferred work, shared by independent workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a task; returns its id.
    async fn enqueue(&self, task: NewTask) -> Result<String>;

    /// Remove every task for the key that no worker is running.
    ///
    /// Tasks under a live claim are left alone. Returns the number removed.
    async fn remove_pending(&self, resource_id: &str, method_name: &str) -> Result<u64>;

    /// Claim up to `limit` tasks due at `now`, ordered by priority then delivery time.
    ///
    /// Claims whose lease ran out are handed out again. Resources with a task
    /// under a live claim are skipped, so one resource's tasks never overlap.
    async fn claim_ready(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueuedTask>>;

    /// Record the outcome of a claimed task.
    async fn finish(&self, task_id: &str, state: TaskState) -> Result<()>;

    /// Tasks for the key that no worker is running, in delivery order.
    async fn pending(&self, resource_id: &str, method_name: &str) -> Result<Vec<QueuedTask>>;
}

/// SQLite-backed task queue sharing the store's database
pub struct SqliteTaskQueue {
    pool: SqlitePool,
    lease: TimeDelta,
}

impl SqliteTaskQueue {
    /// The `queue_tasks` table is created by `Store::new`.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Set how long a claim holds. A claim older than this is treated as
    /// abandoned by a worker that died before finishing the task.
    pub fn with_lease(mut self, lease: TimeDelta) -> Self {
        self.lease = lease;
        self
    }

    /// Claims made at or before this instant have expired.
    fn lease_cutoff(&self, now: DateTime<Utc>) -> String {
        timestamp(now.checked_sub_signed(self.lease).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO queue_tasks (id, resource_id, method_name, payload, priority, role, state, deliver_on, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&task.resource_id)
        .bind(&task.method_name)
        .bind(&task.payload)
        .bind(task.priority)
        .bind(&task.role)
        .bind(TaskState::Ready.as_str())
        .bind(timestamp(task.deliver_on))
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn remove_pending(&self, resource_id: &str, method_name: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_tasks
            WHERE resource_id = ? AND method_name = ?
              AND (state = ? OR (state = ? AND claimed_at <= ?))
            "#,
        )
        .bind(resource_id)
        .bind(method_name)
        .bind(TaskState::Ready.as_str())
        .bind(TaskState::Dequeue.as_str())
        .bind(self.lease_cutoff(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_ready(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueuedTask>> {
        let claimed_at = timestamp(now);
        let cutoff = self.lease_cutoff(now);

        // Single statement: a task is claimed by exactly one caller.
        let rows = sqlx::query(
            r#"
            UPDATE queue_tasks SET state = ?, claimed_at = ?
            WHERE id IN (
                SELECT id FROM queue_tasks
                WHERE deliver_on <= ?
                  AND (state = ? OR (state = ? AND claimed_at <= ?))
                  AND resource_id NOT IN (
                      SELECT resource_id FROM queue_tasks
                      WHERE state = ? AND claimed_at > ?
                  )
                ORDER BY priority, deliver_on
                LIMIT ?
            )
            RETURNING id, resource_id, method_name, payload, priority, role, state, deliver_on, created_at
            "#,
        )
        .bind(TaskState::Dequeue.as_str())
        .bind(&claimed_at)
        .bind(&claimed_at)
        .bind(TaskState::Ready.as_str())
        .bind(TaskState::Dequeue.as_str())
        .bind(&cutoff)
        .bind(TaskState::Dequeue.as_str())
        .bind(&cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>>>()?;
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.deliver_on.cmp(&b.deliver_on))
        });
        Ok(tasks)
    }

    async fn finish(&self, task_id: &str, state: TaskState) -> Result<()> {
        if state == TaskState::Ok {
            sqlx::query("DELETE FROM queue_tasks WHERE id = ?")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query("UPDATE queue_tasks SET state = ?, finished_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(timestamp(Utc::now()))
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn pending(&self, resource_id: &str, method_name: &str) -> Result<Vec<QueuedTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_id, method_name, payload, priority, role, state, deliver_on, created_at
            FROM queue_tasks
            WHERE resource_id = ? AND method_name = ?
              AND (state = ? OR (state = ? AND claimed_at <= ?))
            ORDER BY deliver_on
            "#,
        )
        .bind(resource_id)
        .bind(method_name)
        .bind(TaskState::Ready.as_str())
        .bind(TaskState::Dequeue.as_str())
        .bind(self.lease_cutoff(Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }
}

fn task_from_row(r: &SqliteRow) -> Result<QueuedTask> {
    let state: String = r.get("state");
    let deliver_on: String = r.get("deliver_on");

    Ok(QueuedTask {
        id: r.get("id"),
        resource_id: r.get("resource_id"),
        method_name: r.get("method_name"),
        payload: r.get("payload"),
        priority: r.get("priority"),
        role: r.get("role"),
        state: state.parse()?,
        deliver_on: parse_timestamp(&deliver_on)?,
        created_at: r.get("created_at"),
    })
}
