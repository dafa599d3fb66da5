use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::gateway::SnapshotChanges;
use crate::status::SnapshotStatus;

const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Convert a provider-reported size in GiB to bytes.
pub fn gib_to_bytes(size_gb: u64) -> u64 {
    size_gb.saturating_mul(BYTES_PER_GIB)
}

/// Convert bytes to whole GiB (rounded down).
pub fn bytes_to_gib(size_bytes: u64) -> u64 {
    size_bytes / BYTES_PER_GIB
}

/// Format a timestamp for storage.
///
/// Fixed width and UTC, so the text form sorts chronologically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

/// SQLite-backed store for snapshot records and their parent context
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(metadata_dir: &str) -> Result<Self> {
        let db_path = format!("{}/metadata.db", metadata_dir);
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Shared connection pool, used by the task queue living in the same database.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS managers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                endpoint TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                remote_ref TEXT,
                manager_id TEXT NOT NULL REFERENCES managers(id),
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS volumes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                remote_ref TEXT NOT NULL,
                manager_id TEXT NOT NULL,
                tenant_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                remote_ref TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                size_bytes INTEGER,
                creation_time TEXT,
                volume_id TEXT NOT NULL REFERENCES volumes(id),
                tenant_id TEXT,
                manager_id TEXT NOT NULL,
                deleted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_volume ON snapshots(volume_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_tasks (
                id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                method_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                role TEXT NOT NULL,
                state TEXT NOT NULL,
                deliver_on TEXT NOT NULL,
                created_at TEXT NOT NULL,
                claimed_at TEXT,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_tasks_key ON queue_tasks(resource_id, method_name, state)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_tasks_ready ON queue_tasks(state, deliver_on)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // === Manager operations ===

    pub async fn create_manager(&self, entry: &ManagerEntry) -> Result<()> {
        sqlx::query("INSERT INTO managers (id, name, endpoint, created_at) VALUES (?, ?, ?, ?)")
            .bind(&entry.id)
            .bind(&entry.name)
            .bind(&entry.endpoint)
            .bind(&entry.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_manager(&self, id: &str) -> Result<Option<ManagerEntry>> {
        let row = sqlx::query("SELECT id, name, endpoint, created_at FROM managers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| ManagerEntry {
            id: r.get("id"),
            name: r.get("name"),
            endpoint: r.get("endpoint"),
            created_at: r.get("created_at"),
        }))
    }

    // === Tenant operations ===

    pub async fn create_tenant(&self, entry: &TenantEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenants (id, name, remote_ref, manager_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.name)
        .bind(&entry.remote_ref)
        .bind(&entry.manager_id)
        .bind(&entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_tenant(&self, id: &str) -> Result<Option<TenantEntry>> {
        let row = sqlx::query(
            "SELECT id, name, remote_ref, manager_id, created_at FROM tenants WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TenantEntry {
            id: r.get("id"),
            name: r.get("name"),
            remote_ref: r.get("remote_ref"),
            manager_id: r.get("manager_id"),
            created_at: r.get("created_at"),
        }))
    }

    // === Volume operations ===

    pub async fn create_volume(&self, entry: &VolumeEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO volumes (id, name, remote_ref, manager_id, tenant_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.name)
        .bind(&entry.remote_ref)
        .bind(&entry.manager_id)
        .bind(&entry.tenant_id)
        .bind(&entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_volume(&self, id: &str) -> Result<Option<VolumeEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, remote_ref, manager_id, tenant_id, created_at
            FROM volumes WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| VolumeEntry {
            id: r.get("id"),
            name: r.get("name"),
            remote_ref: r.get("remote_ref"),
            manager_id: r.get("manager_id"),
            tenant_id: r.get("tenant_id"),
            created_at: r.get("created_at"),
        }))
    }

    // === Snapshot operations ===

    pub async fn create_snapshot(&self, entry: &SnapshotEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (id, remote_ref, name, description, status, size_bytes, creation_time,
                                   volume_id, tenant_id, manager_id, deleted_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.remote_ref)
        .bind(&entry.name)
        .bind(&entry.description)
        .bind(entry.status.as_str())
        .bind(entry.size_bytes.map(|v| v as i64))
        .bind(entry.creation_time.map(timestamp))
        .bind(&entry.volume_id)
        .bind(&entry.tenant_id)
        .bind(&entry.manager_id)
        .bind(&entry.deleted_at)
        .bind(&entry.created_at)
        .bind(&entry.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, remote_ref, name, description, status, size_bytes, creation_time,
                   volume_id, tenant_id, manager_id, deleted_at, created_at, updated_at
            FROM snapshots WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    /// List snapshots, newest first, optionally restricted to one volume.
    pub async fn list_snapshots(&self, volume_id: Option<&str>) -> Result<Vec<SnapshotEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, remote_ref, name, description, status, size_bytes, creation_time,
                   volume_id, tenant_id, manager_id, deleted_at, created_at, updated_at
            FROM snapshots WHERE (? IS NULL OR volume_id = ?) ORDER BY created_at DESC
            "#,
        )
        .bind(volume_id)
        .bind(volume_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    /// Apply a reconciliation update in a single statement.
    ///
    /// `creation_time` is only filled while still unset. Returns `false` if the
    /// record is gone or already marked deleted.
    pub async fn apply_snapshot_update(&self, id: &str, update: &SnapshotUpdate) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE snapshots SET
                status = ?,
                size_bytes = COALESCE(?, size_bytes),
                creation_time = COALESCE(creation_time, ?),
                description = COALESCE(?, description),
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.size_bytes.map(|v| v as i64))
        .bind(update.creation_time.map(timestamp))
        .bind(&update.description)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mirror user-requested name/description changes.
    pub async fn update_snapshot_details(&self, id: &str, changes: &SnapshotChanges) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE snapshots SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&changes.name)
        .bind(&changes.description)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a snapshot deleted. Returns `false` if it already was.
    pub async fn mark_snapshot_deleted(&self, id: &str) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE snapshots SET status = ?, deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(SnapshotStatus::Deleted.as_str())
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn snapshot_from_row(r: &SqliteRow) -> Result<SnapshotEntry> {
    let status: String = r.get("status");
    let creation_time: Option<String> = r.get("creation_time");

    Ok(SnapshotEntry {
        id: r.get("id"),
        remote_ref: r.get("remote_ref"),
        name: r.get("name"),
        description: r.get("description"),
        status: status.parse()?,
        size_bytes: r.get::<Option<i64>, _>("size_bytes").map(|v| v as u64),
        creation_time: creation_time.as_deref().map(parse_timestamp).transpose()?,
        volume_id: r.get("volume_id"),
        tenant_id: r.get("tenant_id"),
        manager_id: r.get("manager_id"),
        deleted_at: r.get("deleted_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

// === Entry types ===

/// Storage manager owning volumes and the provider connection.
#[derive(Debug, Clone)]
pub struct ManagerEntry {
    pub id: String,
    pub name: String,
    /// Block-storage API base URL, overriding the process default
    pub endpoint: Option<String>,
    pub created_at: String,
}

impl ManagerEntry {
    pub fn new(name: String, endpoint: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            endpoint,
            created_at: timestamp(Utc::now()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantEntry {
    pub id: String,
    pub name: String,
    pub remote_ref: Option<String>,
    pub manager_id: String,
    pub created_at: String,
}

impl TenantEntry {
    pub fn new(name: String, remote_ref: Option<String>, manager_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            remote_ref,
            manager_id,
            created_at: timestamp(Utc::now()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolumeEntry {
    pub id: String,
    pub name: String,
    /// Provider-side volume id
    pub remote_ref: String,
    pub manager_id: String,
    pub tenant_id: Option<String>,
    pub created_at: String,
}

impl VolumeEntry {
    pub fn new(
        name: String,
        remote_ref: String,
        manager_id: String,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            remote_ref,
            manager_id,
            tenant_id,
            created_at: timestamp(Utc::now()),
        }
    }
}

/// Local record mirroring a provider snapshot
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub id: String,
    /// Provider-side snapshot id, fixed at creation
    pub remote_ref: String,
    pub name: String,
    pub description: Option<String>,
    pub status: SnapshotStatus,
    pub size_bytes: Option<u64>,
    /// Provider-reported creation time, written at most once
    pub creation_time: Option<DateTime<Utc>>,
    pub volume_id: String,
    pub tenant_id: Option<String>,
    pub manager_id: String,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SnapshotEntry {
    pub fn new(remote_ref: String, name: String, status: SnapshotStatus, volume: &VolumeEntry) -> Self {
        let now = timestamp(Utc::now());
        Self {
            id: Uuid::new_v4().to_string(),
            remote_ref,
            name,
            description: None,
            status,
            size_bytes: None,
            creation_time: None,
            volume_id: volume.id.clone(),
            tenant_id: volume.tenant_id.clone(),
            manager_id: volume.manager_id.clone(),
            deleted_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Field changes merged from one provider observation.
///
/// `status` is always written; the optional fields only when present.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotUpdate {
    pub status: SnapshotStatus,
    pub size_bytes: Option<u64>,
    pub creation_time: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn setup_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    async fn seed_volume(store: &Store) -> VolumeEntry {
        let manager = ManagerEntry::new("cinder".to_string(), None);
        store.create_manager(&manager).await.unwrap();
        let volume = VolumeEntry::new(
            "data".to_string(),
            "vol-remote-1".to_string(),
            manager.id.clone(),
            None,
        );
        store.create_volume(&volume).await.unwrap();
        volume
    }

    #[tokio::test]
    async fn test_snapshot_crud() {
        let (store, _dir) = setup_store().await;
        let volume = seed_volume(&store).await;

        let mut entry = SnapshotEntry::new(
            "snap-remote-1".to_string(),
            "snap1".to_string(),
            SnapshotStatus::Creating,
            &volume,
        );
        entry.size_bytes = Some(gib_to_bytes(10));
        store.create_snapshot(&entry).await.unwrap();

        let fetched = store.get_snapshot(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "snap1");
        assert_eq!(fetched.status, SnapshotStatus::Creating);
        assert_eq!(fetched.size_bytes, Some(10 * 1024 * 1024 * 1024));
        assert_eq!(fetched.manager_id, volume.manager_id);
        assert!(fetched.creation_time.is_none());

        let listed = store.list_snapshots(Some(&volume.id)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_snapshots(Some("other")).await.unwrap().is_empty());
        assert_eq!(store.list_snapshots(None).await.unwrap().len(), 1);

        assert!(store.mark_snapshot_deleted(&entry.id).await.unwrap());
        assert!(!store.mark_snapshot_deleted(&entry.id).await.unwrap());
        let deleted = store.get_snapshot(&entry.id).await.unwrap().unwrap();
        assert_eq!(deleted.status, SnapshotStatus::Deleted);
        assert!(deleted.is_deleted());
    }

    #[tokio::test]
    async fn test_creation_time_written_once() {
        let (store, _dir) = setup_store().await;
        let volume = seed_volume(&store).await;
        let entry = SnapshotEntry::new(
            "snap-remote-2".to_string(),
            "snap2".to_string(),
            SnapshotStatus::Creating,
            &volume,
        );
        store.create_snapshot(&entry).await.unwrap();

        let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let update = SnapshotUpdate {
            status: SnapshotStatus::Creating,
            size_bytes: None,
            creation_time: Some(first),
            description: None,
        };
        assert!(store.apply_snapshot_update(&entry.id, &update).await.unwrap());

        let update = SnapshotUpdate {
            status: SnapshotStatus::Available,
            size_bytes: Some(gib_to_bytes(1)),
            creation_time: Some(later),
            description: Some("nightly".to_string()),
        };
        assert!(store.apply_snapshot_update(&entry.id, &update).await.unwrap());

        let fetched = store.get_snapshot(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.creation_time, Some(first));
        assert_eq!(fetched.status, SnapshotStatus::Available);
        assert_eq!(fetched.description.as_deref(), Some("nightly"));
    }

    #[tokio::test]
    async fn test_update_skips_deleted_record() {
        let (store, _dir) = setup_store().await;
        let volume = seed_volume(&store).await;
        let entry = SnapshotEntry::new(
            "snap-remote-3".to_string(),
            "snap3".to_string(),
            SnapshotStatus::Creating,
            &volume,
        );
        store.create_snapshot(&entry).await.unwrap();
        store.mark_snapshot_deleted(&entry.id).await.unwrap();

        let update = SnapshotUpdate {
            status: SnapshotStatus::Available,
            size_bytes: None,
            creation_time: None,
            description: None,
        };
        assert!(!store.apply_snapshot_update(&entry.id, &update).await.unwrap());
        let fetched = store.get_snapshot(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SnapshotStatus::Deleted);
    }

    #[tokio::test]
    async fn test_details_update() {
        let (store, _dir) = setup_store().await;
        let volume = seed_volume(&store).await;
        let entry = SnapshotEntry::new(
            "snap-remote-4".to_string(),
            "before".to_string(),
            SnapshotStatus::Available,
            &volume,
        );
        store.create_snapshot(&entry).await.unwrap();

        let changes = SnapshotChanges {
            name: Some("after".to_string()),
            description: None,
        };
        assert!(store.update_snapshot_details(&entry.id, &changes).await.unwrap());
        let fetched = store.get_snapshot(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "after");
        assert!(fetched.description.is_none());
    }

    #[test]
    fn test_size_conversion() {
        assert_eq!(gib_to_bytes(2), 2 * 1024 * 1024 * 1024);
        assert_eq!(bytes_to_gib(gib_to_bytes(7) + 12), 7);
    }
}
