//! Create / update / no-op decision and the single cluster write.

use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{info, warn};
use wl_core::{ClientError, Workload, WorkloadClient};

use crate::diff::DiffRecord;
use crate::error::ApplyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Create,
    Update,
}

impl Intent {
    pub fn verb(self) -> &'static str {
        match self {
            Intent::Create => "create",
            Intent::Update => "update",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Intent::Create => "Create",
            Intent::Update => "Update",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Server copy, including defaulted fields.
    Created(Workload),
    Updated(Workload),
    NoOp,
    /// Dry run: what would have been submitted.
    DryRun { intent: Intent, target: Workload },
    Conflict(String),
    Failed(String),
}

impl ApplyOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, ApplyOutcome::Created(_) | ApplyOutcome::Updated(_))
    }

    pub fn workload(&self) -> Option<&Workload> {
        match self {
            ApplyOutcome::Created(w) | ApplyOutcome::Updated(w) => Some(w),
            ApplyOutcome::DryRun { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Terminal status line for successful outcomes.
    pub fn status_line(&self) -> Option<String> {
        match self {
            ApplyOutcome::Created(w) => Some(format!("Created workload {:?}", w.name())),
            ApplyOutcome::Updated(w) => Some(format!("Updated workload {:?}", w.name())),
            ApplyOutcome::NoOp => Some("Workload is unchanged, skipping update".to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub dry_run: bool,
    /// False when an interactive confirmation was required and declined.
    pub confirmed: bool,
}

/// The intent `apply` would act on, or `None` for a no-op.
pub fn intent(existing: Option<&Workload>, diff: &DiffRecord) -> Option<Intent> {
    match existing {
        None => Some(Intent::Create),
        Some(_) if diff.is_empty() => None,
        Some(_) => Some(Intent::Update),
    }
}

/// At most one `create` or `update` call; none for no-op, dry run or abort.
pub async fn apply<C>(
    client: &C,
    existing: Option<&Workload>,
    target: &Workload,
    diff: &DiffRecord,
    opts: ApplyOptions,
) -> Result<ApplyOutcome, ApplyError>
where
    C: WorkloadClient + ?Sized,
{
    let id = target
        .identity()
        .ok_or_else(|| ApplyError::validation("target workload has no name or namespace"))?;
    let Some(intent) = intent(existing, diff) else {
        info!(workload = %id, "workload unchanged");
        return Ok(ApplyOutcome::NoOp);
    };
    if opts.dry_run {
        info!(workload = %id, intent = intent.verb(), "dry run, nothing submitted");
        return Ok(ApplyOutcome::DryRun { intent, target: target.clone() });
    }
    if !opts.confirmed {
        return Err(ApplyError::AbortedByUser(id));
    }

    let t0 = Instant::now();
    counter!("apply_attempts", 1u64);
    let res = match intent {
        Intent::Create => client.create(target).await,
        Intent::Update => client.update(target).await,
    };
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);

    let outcome = match (intent, res) {
        (Intent::Create, Ok(w)) => ApplyOutcome::Created(w),
        (Intent::Update, Ok(w)) => ApplyOutcome::Updated(w),
        (Intent::Update, Err(ClientError::Conflict(msg))) => {
            counter!("apply_conflict", 1u64);
            warn!(workload = %id, %msg, "update rejected: stale resourceVersion");
            return Ok(ApplyOutcome::Conflict(msg));
        }
        (_, Err(e)) => {
            counter!("apply_err", 1u64);
            warn!(workload = %id, intent = intent.verb(), error = %e, "submission failed");
            return Ok(ApplyOutcome::Failed(e.to_string()));
        }
    };
    counter!("apply_ok", 1u64);
    info!(workload = %id, intent = intent.verb(), "submitted");
    Ok(outcome)
}
