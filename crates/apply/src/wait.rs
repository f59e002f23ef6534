//! Readiness watcher: block until the `Ready` condition resolves or the
//! deadline passes, optionally tailing logs alongside.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wl_core::{EventKind, Identity, LogTailer, TailRequest, WatchEvent, WorkloadClient, READY_CONDITION};

use crate::error::ApplyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    NotReady { reason: String, message: String },
    /// Carries the configured timeout.
    TimedOut(Duration),
    WatchError(String),
}

impl WaitOutcome {
    fn label(&self) -> &'static str {
        match self {
            WaitOutcome::Ready => "ready",
            WaitOutcome::NotReady { .. } => "not_ready",
            WaitOutcome::TimedOut(_) => "timed_out",
            WaitOutcome::WatchError(_) => "watch_error",
        }
    }

    pub fn into_result(self, id: &Identity) -> Result<(), ApplyError> {
        match self {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::NotReady { reason, message } => Err(ApplyError::NotReady { id: id.clone(), reason, message }),
            WaitOutcome::TimedOut(timeout) => Err(ApplyError::TimedOut { id: id.clone(), timeout }),
            WaitOutcome::WatchError(cause) => Err(ApplyError::Watch { id: id.clone(), cause }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    pub since: Duration,
    pub timestamps: bool,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self { since: Duration::from_secs(1), timestamps: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub tail: Option<TailOptions>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(600), tail: None }
    }
}

/// Aborts the tail task when the wait ends, however it ends.
struct TailGuard(JoinHandle<()>);

impl Drop for TailGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_tail(tailer: Arc<dyn LogTailer>, id: &Identity, opts: TailOptions) -> TailGuard {
    let req = TailRequest {
        namespace: id.namespace.clone(),
        selector: id.selector(),
        since: opts.since,
        timestamps: opts.timestamps,
    };
    TailGuard(tokio::spawn(async move {
        if let Err(e) = tailer.tail(req).await {
            warn!(error = %e, "log tail ended with error");
        }
    }))
}

/// Waits on the workload's watch stream. A tail failure never changes the
/// outcome.
pub async fn wait_ready<C>(
    client: &C,
    tailer: Option<Arc<dyn LogTailer>>,
    id: &Identity,
    opts: &WaitOptions,
) -> WaitOutcome
where
    C: WorkloadClient + ?Sized,
{
    let deadline = Instant::now() + opts.timeout;
    let _tail = match (tailer, opts.tail) {
        (Some(t), Some(o)) => Some(spawn_tail(t, id, o)),
        _ => None,
    };
    let outcome = watch_until(client, id, deadline, opts.timeout).await;
    counter!("wait_outcome_total", 1u64, "outcome" => outcome.label());
    info!(workload = %id, outcome = outcome.label(), "wait finished");
    outcome
}

async fn watch_until<C>(client: &C, id: &Identity, deadline: Instant, timeout: Duration) -> WaitOutcome
where
    C: WorkloadClient + ?Sized,
{
    let mut stream = match tokio::time::timeout_at(deadline, client.watch(id)).await {
        Err(_) => return WaitOutcome::TimedOut(timeout),
        Ok(Err(e)) => return WaitOutcome::WatchError(e.to_string()),
        Ok(Ok(s)) => s,
    };
    loop {
        let next = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => return WaitOutcome::TimedOut(timeout),
            next = stream.next() => next,
        };
        // the timer may not have fired yet even though the deadline passed
        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut(timeout);
        }
        match next {
            None => return WaitOutcome::WatchError("watch closed before the workload became ready".into()),
            Some(Err(e)) => return WaitOutcome::WatchError(e.to_string()),
            Some(Ok(ev)) => {
                if let Some(outcome) = evaluate(id, &ev) {
                    return outcome;
                }
            }
        }
    }
}

/// Terminal outcome for one event, if any.
pub fn evaluate(id: &Identity, ev: &WatchEvent) -> Option<WaitOutcome> {
    let ours = ev.object.as_ref().map(|o| o.identity().as_ref() == Some(id)).unwrap_or(true);
    match ev.kind {
        EventKind::Error => Some(WaitOutcome::WatchError(
            ev.message.clone().unwrap_or_else(|| "watch reported an error".into()),
        )),
        EventKind::Deleted if ours => Some(WaitOutcome::WatchError(format!("workload {} was deleted while waiting", id))),
        EventKind::Deleted => None,
        EventKind::Added | EventKind::Modified => {
            let obj = ev.object.as_ref().filter(|_| ours)?;
            if !obj.status_is_current() {
                debug!(workload = %id, "status not yet observed for latest generation");
                return None;
            }
            let cond = obj.condition(READY_CONDITION)?;
            debug!(workload = %id, status = %cond.status, reason = ?cond.reason, "ready condition");
            if cond.is_true() {
                Some(WaitOutcome::Ready)
            } else if cond.is_false() {
                Some(WaitOutcome::NotReady {
                    reason: cond.reason.clone().unwrap_or_default(),
                    message: cond.message.clone().unwrap_or_default(),
                })
            } else {
                None
            }
        }
    }
}
