//! Block-storage provider boundary.
//!
//! A [`ProviderConnector`] hands out tenant-scoped [`SnapshotGateway`]
//! handles. Gateways report partial snapshot data; every descriptor field
//! except id and status is optional.

pub mod cinder;
pub mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::status::SnapshotStatus;
use crate::store::{ManagerEntry, Store, TenantEntry};

pub use cinder::CinderConnector;
pub use memory::MemoryProvider;

/// Snapshot as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: SnapshotStatus,
    pub size_gb: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    /// Provider-side id of the source volume
    pub volume_ref: String,
    pub name: String,
    pub description: Option<String>,
    /// Snapshot even if the volume is attached
    pub force: bool,
}

/// User-editable snapshot attributes. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SnapshotChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The provider no longer knew the snapshot.
    AlreadyGone,
}

/// Options used to scope a provider connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub service: String,
    pub tenant_name: Option<String>,
}

impl ConnectionOptions {
    pub const VOLUME_SERVICE: &'static str = "Volume";

    pub fn for_tenant(tenant: Option<&TenantEntry>) -> Self {
        Self {
            service: Self::VOLUME_SERVICE.to_string(),
            tenant_name: tenant.map(|t| t.name.clone()),
        }
    }
}

/// Snapshot operations against one provider connection.
#[async_trait]
pub trait SnapshotGateway: Send + Sync {
    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
    ) -> Result<RemoteSnapshot, GatewayError>;

    /// Fetch the live snapshot; `Ok(None)` if the provider does not know it.
    async fn get_snapshot(&self, remote_ref: &str) -> Result<Option<RemoteSnapshot>, GatewayError>;

    async fn update_snapshot(
        &self,
        remote_ref: &str,
        changes: &SnapshotChanges,
    ) -> Result<(), GatewayError>;

    async fn delete_snapshot(&self, remote_ref: &str) -> Result<DeleteOutcome, GatewayError>;
}

/// Source of scoped provider connections; owns endpoints and credentials.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(
        &self,
        manager: &ManagerEntry,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn SnapshotGateway>, GatewayError>;
}

/// Manager and scoping resolved for one record.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub manager: ManagerEntry,
    pub options: ConnectionOptions,
}

impl ProviderContext {
    /// Look up the manager and tenant. `Ok(None)` if the manager is missing.
    pub async fn resolve(
        store: &Store,
        manager_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<Self>> {
        let Some(manager) = store.get_manager(manager_id).await? else {
            return Ok(None);
        };
        let tenant = match tenant_id {
            Some(id) => store.get_tenant(id).await?,
            None => None,
        };

        Ok(Some(Self {
            manager,
            options: ConnectionOptions::for_tenant(tenant.as_ref()),
        }))
    }

    pub async fn connect(
        &self,
        connector: &dyn ProviderConnector,
    ) -> Result<Arc<dyn SnapshotGateway>, GatewayError> {
        connector.connect(&self.manager, &self.options).await
    }
}

/// Extract a human-readable message from a provider error response.
///
/// Handles `{"<fault>": {"message": ..}}`, `{"error": {"message": ..}}` and
/// `{"message": ..}` bodies, falling back to the raw text and then the
/// status reason.
pub fn normalize_error_body(status: StatusCode, body: &str) -> String {
    let body = body.trim();

    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = json_error_message(&value)
    {
        return message;
    }

    if !body.is_empty() {
        return body.to_string();
    }

    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

fn json_error_message(value: &Value) -> Option<String> {
    let object = value.as_object()?;

    if let Some(message) = object.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }

    object
        .values()
        .filter_map(Value::as_object)
        .find_map(|fault| fault.get("message").and_then(Value::as_str))
        .map(str::to_string)
}

/// Parse a provider timestamp. Zone-less values are taken as UTC.
pub fn parse_provider_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
