//! Cinder (OpenStack block storage, API v3) snapshot gateway over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ConnectionOptions, CreateSnapshotRequest, DeleteOutcome, ProviderConnector, RemoteSnapshot,
    SnapshotChanges, SnapshotGateway, normalize_error_body, parse_provider_time,
};
use crate::error::GatewayError;
use crate::status::SnapshotStatus;
use crate::store::ManagerEntry;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const PROJECT_NAME_HEADER: &str = "X-Project-Name";

/// Builds Cinder gateways for managers, sharing one HTTP client.
pub struct CinderConnector {
    client: Client,
    default_endpoint: String,
    auth_token: Option<String>,
}

impl CinderConnector {
    /// `request_timeout` bounds every provider call, connect to last byte.
    pub fn new(
        default_endpoint: String,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            default_endpoint,
            auth_token,
        })
    }
}

#[async_trait]
impl ProviderConnector for CinderConnector {
    async fn connect(
        &self,
        manager: &ManagerEntry,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn SnapshotGateway>, GatewayError> {
        if options.service != ConnectionOptions::VOLUME_SERVICE {
            return Err(GatewayError::Unavailable(format!(
                "unsupported service '{}'",
                options.service
            )));
        }

        let endpoint = manager
            .endpoint
            .clone()
            .unwrap_or_else(|| self.default_endpoint.clone());

        Ok(Arc::new(CinderGateway {
            client: self.client.clone(),
            base_url: endpoint.trim_end_matches('/').to_string(),
            auth_token: self.auth_token.clone(),
            project: options.tenant_name.clone(),
        }))
    }
}

/// One tenant-scoped connection to a Cinder endpoint.
pub struct CinderGateway {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    project: Option<String>,
}

impl CinderGateway {
    fn snapshots_url(&self) -> String {
        format!("{}/snapshots", self.base_url)
    }

    fn snapshot_url(&self, remote_ref: &str) -> String {
        format!("{}/snapshots/{}", self.base_url, remote_ref)
    }

    fn scoped(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        if let Some(token) = &self.auth_token {
            request = request.header(AUTH_TOKEN_HEADER, token);
        }
        if let Some(project) = &self.project {
            request = request.header(PROJECT_NAME_HEADER, project);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self.scoped(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = normalize_error_body(status, &body);
        if status == StatusCode::NOT_FOUND {
            Err(GatewayError::NotFound(message))
        } else {
            Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn read_snapshot(response: Response) -> Result<RemoteSnapshot, GatewayError> {
        let envelope: SnapshotEnvelope<WireSnapshot> = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        envelope.snapshot.try_into()
    }
}

#[async_trait]
impl SnapshotGateway for CinderGateway {
    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
    ) -> Result<RemoteSnapshot, GatewayError> {
        debug!(volume = %request.volume_ref, name = %request.name, "POST snapshot");
        let body = SnapshotEnvelope {
            snapshot: WireCreate {
                volume_id: &request.volume_ref,
                name: &request.name,
                description: request.description.as_deref(),
                force: request.force,
            },
        };
        let response = self
            .send(self.client.post(self.snapshots_url()).json(&body))
            .await?;
        Self::read_snapshot(response).await
    }

    async fn get_snapshot(&self, remote_ref: &str) -> Result<Option<RemoteSnapshot>, GatewayError> {
        match self.send(self.client.get(self.snapshot_url(remote_ref))).await {
            Ok(response) => Self::read_snapshot(response).await.map(Some),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_snapshot(
        &self,
        remote_ref: &str,
        changes: &SnapshotChanges,
    ) -> Result<(), GatewayError> {
        let body = SnapshotEnvelope { snapshot: changes };
        self.send(self.client.put(self.snapshot_url(remote_ref)).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_snapshot(&self, remote_ref: &str) -> Result<DeleteOutcome, GatewayError> {
        match self
            .send(self.client.delete(self.snapshot_url(remote_ref)))
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(GatewayError::NotFound(_)) => Ok(DeleteOutcome::AlreadyGone),
            Err(e) => Err(e),
        }
    }
}

// === Wire format ===

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope<T> {
    snapshot: T,
}

#[derive(Serialize)]
struct WireCreate<'a> {
    volume_id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    force: bool,
}

#[derive(Deserialize)]
struct WireSnapshot {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    status: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    created_at: Option<String>,
}

impl TryFrom<WireSnapshot> for RemoteSnapshot {
    type Error = GatewayError;

    fn try_from(wire: WireSnapshot) -> Result<Self, Self::Error> {
        let status = SnapshotStatus::from_provider(&wire.status).ok_or_else(|| {
            GatewayError::Decode(format!(
                "snapshot {} has unrecognized status '{}'",
                wire.id, wire.status
            ))
        })?;

        Ok(RemoteSnapshot {
            status,
            name: wire.name,
            description: wire.description,
            size_gb: wire.size,
            created_at: wire.created_at.as_deref().and_then(parse_provider_time),
            id: wire.id,
        })
    }
}
