use std::time::Duration;

use wl_core::{ClientError, Identity};

/// Every way an apply run can end unsuccessfully. The binary maps all of
/// these to a failing exit status; nothing here retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Bad merge input; raised before any cluster call.
    #[error("{0}")]
    Validation(String),
    #[error("apply of workload {0} aborted: confirmation declined")]
    AbortedByUser(Identity),
    #[error("conflict updating workload, the object was modified by another user; please run the update command again")]
    Conflict(Identity),
    #[error("{0}")]
    Failed(String),
    #[error("Failed to become ready: {message}")]
    NotReady { id: Identity, reason: String, message: String },
    #[error(
        "timeout after {timeout:?} waiting for \"{}\" to become ready\nTo view status run: wlctl workload get {} --namespace {}",
        .id.name,
        .id.name,
        .id.namespace
    )]
    TimedOut { id: Identity, timeout: Duration },
    #[error("publishing source to {image}: {cause:#}")]
    Publish { image: String, cause: anyhow::Error },
    #[error("watch for workload {id} failed: {cause}")]
    Watch { id: Identity, cause: String },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("writing output: {0}")]
    Output(#[from] std::io::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApplyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
