//! Error types.

use thiserror::Error;

/// Errors reported by a block-storage provider connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The remote object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider rejected the request.
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response could not be understood.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// No connection could be established for the request.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// The human-readable message extracted from the provider error.
    pub fn message(&self) -> String {
        match self {
            GatewayError::NotFound(msg)
            | GatewayError::Decode(msg)
            | GatewayError::Unavailable(msg) => msg.clone(),
            GatewayError::Api { message, .. } => message.clone(),
            GatewayError::Transport(e) => e.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

/// Errors surfaced by snapshot lifecycle operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A required parent reference is missing.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("snapshot create failed: {message}")]
    Create {
        message: String,
        #[source]
        source: GatewayError,
    },

    #[error("snapshot update failed: {message}")]
    Update {
        message: String,
        #[source]
        source: GatewayError,
    },

    #[error("snapshot delete failed: {message}")]
    Delete {
        message: String,
        #[source]
        source: GatewayError,
    },

    /// The local snapshot record does not exist.
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SnapshotError {
    pub fn create(source: GatewayError) -> Self {
        SnapshotError::Create {
            message: source.message(),
            source,
        }
    }

    pub fn update(source: GatewayError) -> Self {
        SnapshotError::Update {
            message: source.message(),
            source,
        }
    }

    pub fn delete(source: GatewayError) -> Self {
        SnapshotError::Delete {
            message: source.message(),
            source,
        }
    }
}
