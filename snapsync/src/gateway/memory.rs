//! In-memory provider.
//!
//! Behaves like a block-storage API whose snapshot state is driven by the
//! caller: statuses, sizes and descriptions are set explicitly, snapshots can
//! vanish, and the next call of an operation can be made to fail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ConnectionOptions, CreateSnapshotRequest, DeleteOutcome, ProviderConnector, RemoteSnapshot,
    SnapshotChanges, SnapshotGateway,
};
use crate::error::GatewayError;
use crate::status::SnapshotStatus;
use crate::store::ManagerEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Get,
    Update,
    Delete,
}

#[derive(Default)]
struct State {
    /// Volume ref -> size in GiB
    volumes: HashMap<String, u64>,
    snapshots: HashMap<String, RemoteSnapshot>,
    initial_status: Option<SnapshotStatus>,
    failures: HashMap<Operation, GatewayError>,
    calls: HashMap<Operation, usize>,
    connections: Vec<ConnectionOptions>,
    /// Snapshots whose fetch never returns
    stalled: HashSet<String>,
}

/// Scriptable provider, usable as connector and gateway.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<State>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a provider-side volume available for snapshots.
    pub async fn add_volume(&self, volume_ref: &str, size_gb: u64) {
        let mut state = self.state.lock().await;
        state.volumes.insert(volume_ref.to_string(), size_gb);
    }

    /// Status reported by newly created snapshots (default `creating`).
    pub async fn set_initial_status(&self, status: SnapshotStatus) {
        self.state.lock().await.initial_status = Some(status);
    }

    pub async fn set_status(&self, remote_ref: &str, status: SnapshotStatus) {
        self.modify(remote_ref, |s| s.status = status).await;
    }

    pub async fn set_size(&self, remote_ref: &str, size_gb: Option<u64>) {
        self.modify(remote_ref, |s| s.size_gb = size_gb).await;
    }

    pub async fn set_description(&self, remote_ref: &str, description: Option<&str>) {
        let description = description.map(str::to_string);
        self.modify(remote_ref, move |s| s.description = description)
            .await;
    }

    pub async fn set_created_at(&self, remote_ref: &str, created_at: Option<DateTime<Utc>>) {
        self.modify(remote_ref, |s| s.created_at = created_at).await;
    }

    /// Drop a snapshot on the provider side.
    pub async fn remove(&self, remote_ref: &str) {
        self.state.lock().await.snapshots.remove(remote_ref);
    }

    /// Fail the next call of `op` with `error`.
    pub async fn fail_next(&self, op: Operation, error: GatewayError) {
        self.state.lock().await.failures.insert(op, error);
    }

    /// Make every later fetch of `remote_ref` hang.
    pub async fn stall(&self, remote_ref: &str) {
        self.state.lock().await.stalled.insert(remote_ref.to_string());
    }

    pub async fn snapshot(&self, remote_ref: &str) -> Option<RemoteSnapshot> {
        self.state.lock().await.snapshots.get(remote_ref).cloned()
    }

    pub async fn calls(&self, op: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Options of every connection handed out so far.
    pub async fn connections(&self) -> Vec<ConnectionOptions> {
        self.state.lock().await.connections.clone()
    }

    async fn modify(&self, remote_ref: &str, f: impl FnOnce(&mut RemoteSnapshot)) {
        if let Some(snapshot) = self.state.lock().await.snapshots.get_mut(remote_ref) {
            f(snapshot);
        }
    }
}

impl State {
    /// Count the call and consume an injected failure, if any.
    fn enter(&mut self, op: Operation) -> Result<(), GatewayError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderConnector for MemoryProvider {
    async fn connect(
        &self,
        _manager: &ManagerEntry,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn SnapshotGateway>, GatewayError> {
        self.state.lock().await.connections.push(options.clone());
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl SnapshotGateway for MemoryProvider {
    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
    ) -> Result<RemoteSnapshot, GatewayError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::Create)?;

        let size_gb = *state.volumes.get(&request.volume_ref).ok_or_else(|| {
            GatewayError::NotFound(format!(
                "Volume {} could not be found.",
                request.volume_ref
            ))
        })?;

        let snapshot = RemoteSnapshot {
            id: Uuid::new_v4().to_string(),
            name: Some(request.name.clone()),
            description: request.description.clone(),
            status: state.initial_status.unwrap_or(SnapshotStatus::Creating),
            size_gb: Some(size_gb),
            created_at: None,
        };
        state
            .snapshots
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn get_snapshot(&self, remote_ref: &str) -> Result<Option<RemoteSnapshot>, GatewayError> {
        {
            let mut state = self.state.lock().await;
            state.enter(Operation::Get)?;
            if !state.stalled.contains(remote_ref) {
                return Ok(state.snapshots.get(remote_ref).cloned());
            }
        }
        // Lock released, other callers keep going
        std::future::pending().await
    }

    async fn update_snapshot(
        &self,
        remote_ref: &str,
        changes: &SnapshotChanges,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::Update)?;

        let snapshot = state.snapshots.get_mut(remote_ref).ok_or_else(|| {
            GatewayError::NotFound(format!("Snapshot {} could not be found.", remote_ref))
        })?;
        if let Some(name) = &changes.name {
            snapshot.name = Some(name.clone());
        }
        if let Some(description) = &changes.description {
            snapshot.description = Some(description.clone());
        }
        Ok(())
    }

    async fn delete_snapshot(&self, remote_ref: &str) -> Result<DeleteOutcome, GatewayError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::Delete)?;

        match state.snapshots.remove(remote_ref) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::AlreadyGone),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(volume_ref: &str) -> CreateSnapshotRequest {
        CreateSnapshotRequest {
            volume_ref: volume_ref.to_string(),
            name: "snap".to_string(),
            description: None,
            force: true,
        }
    }

    #[tokio::test]
    async fn test_create_requires_known_volume() {
        let provider = MemoryProvider::new();
        let err = provider.create_snapshot(&request("vol-x")).await.unwrap_err();
        assert!(err.is_not_found());

        provider.add_volume("vol-x", 10).await;
        let snap = provider.create_snapshot(&request("vol-x")).await.unwrap();
        assert_eq!(snap.status, SnapshotStatus::Creating);
        assert_eq!(snap.size_gb, Some(10));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let provider = MemoryProvider::new();
        provider
            .fail_next(Operation::Get, GatewayError::Unavailable("timeout".to_string()))
            .await;

        assert!(provider.get_snapshot("missing").await.is_err());
        assert_eq!(provider.get_snapshot("missing").await.unwrap(), None);
        assert_eq!(provider.calls(Operation::Get).await, 2);
    }

    #[tokio::test]
    async fn test_delete_absent_snapshot() {
        let provider = MemoryProvider::new();
        assert_eq!(
            provider.delete_snapshot("gone").await.unwrap(),
            DeleteOutcome::AlreadyGone
        );
    }
}
