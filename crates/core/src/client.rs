//! Cluster seams consumed by the apply pipeline.
//!
//! `wl-kubehub` and `wl-ops` implement these against a live API server; tests
//! use in-memory fakes.

use std::path::Path;
use std::time::Duration;

use futures::stream::BoxStream;

use crate::{Identity, Workload};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("workload {0} not found")]
    NotFound(Identity),
    /// Optimistic-concurrency rejection (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// Absent for `EventKind::Error`.
    pub object: Option<Workload>,
    pub message: Option<String>,
}

impl WatchEvent {
    pub fn modified(object: Workload) -> Self {
        Self { kind: EventKind::Modified, object: Some(object), message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { kind: EventKind::Error, object: None, message: Some(message.into()) }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

#[async_trait::async_trait]
pub trait WorkloadClient: Send + Sync {
    async fn get(&self, id: &Identity) -> Result<Workload, ClientError>;
    /// Server may default unset fields; the returned object is authoritative.
    async fn create(&self, workload: &Workload) -> Result<Workload, ClientError>;
    /// Keyed by `metadata.resourceVersion`; stale versions yield `ClientError::Conflict`.
    async fn update(&self, workload: &Workload) -> Result<Workload, ClientError>;
    /// Change events for a single workload, in server order.
    async fn watch(&self, id: &Identity) -> Result<WatchStream, ClientError>;

    async fn get_opt(&self, id: &Identity) -> Result<Option<Workload>, ClientError> {
        match self.get(id).await {
            Ok(w) => Ok(Some(w)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailRequest {
    pub namespace: String,
    pub selector: String,
    pub since: Duration,
    pub timestamps: bool,
}

/// Streams logs for pods matching a selector until cancelled (dropped).
#[async_trait::async_trait]
pub trait LogTailer: Send + Sync {
    async fn tail(&self, req: TailRequest) -> anyhow::Result<()>;
}

/// Uploads a local source directory as an image.
#[async_trait::async_trait]
pub trait SourcePublisher: Send + Sync {
    /// Returns the pushed reference pinned by digest, `image@sha256:...`.
    async fn publish(&self, dir: &Path, image: &str) -> anyhow::Result<String>;
}
