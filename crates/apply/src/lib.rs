//! wlctl apply pipeline: layered merge, line diff, create/update, readiness wait.

#![forbid(unsafe_code)]

pub mod advisory;
pub mod diff;
pub mod error;
pub mod executor;
pub mod flags;
pub mod layer;
pub mod manifest;
pub mod merge;
pub mod wait;

use std::borrow::Cow;
use std::io::Write;
use std::sync::Arc;

use tracing::{debug, info};
use wl_core::{Identity, LogTailer, SourcePublisher, Workload, WorkloadClient};

pub use advisory::{default_advisories, Advisory, CrossNamespaceClaims};
pub use diff::{diff, diff_text, DiffLine, DiffRecord, DiffSummary, LineOp};
pub use error::ApplyError;
pub use executor::{apply, ApplyOptions, ApplyOutcome, Intent};
pub use flags::{FlagInputs, LocalSource};
pub use layer::{ListPatch, MapPatch, Patch, PartialWorkload, SourceLayer};
pub use manifest::{load_manifest, parse_manifest, ManifestSource};
pub use merge::{merge, LayerStack};
pub use wait::{wait_ready, TailOptions, WaitOptions, WaitOutcome};

/// One `workload apply` invocation.
#[derive(Debug, Clone, Default)]
pub struct ApplyRequest {
    pub file: Option<PartialWorkload>,
    pub flags: PartialWorkload,
    /// Used when neither layer names a namespace.
    pub default_namespace: String,
    pub dry_run: bool,
    /// Skip the confirmation prompt.
    pub assume_yes: bool,
    pub wait: Option<WaitOptions>,
    /// Published before merging; the pushed digest becomes the source image.
    pub local_source: Option<LocalSource>,
}

/// Everything computed before the first cluster write.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Identity,
    pub existing: Option<Workload>,
    pub target: Workload,
    pub diff: DiffRecord,
    pub advisories: Vec<String>,
}

impl Prepared {
    pub fn intent(&self) -> Option<Intent> {
        executor::intent(self.existing.as_ref(), &self.diff)
    }
}

/// Interactive yes/no gate in front of the cluster write.
pub trait Confirm: Send {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Fixed answer; used for `--yes` and in tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub id: Identity,
    pub outcome: ApplyOutcome,
    /// Present only when a wait was requested and something was submitted.
    pub wait: Option<WaitOutcome>,
}

impl PipelineReport {
    /// Collapse into success/failure for the exit status.
    pub fn into_result(self) -> Result<(), ApplyError> {
        match self.outcome {
            ApplyOutcome::Conflict(_) => return Err(ApplyError::Conflict(self.id)),
            ApplyOutcome::Failed(cause) => return Err(ApplyError::Failed(cause)),
            _ => {}
        }
        match self.wait {
            Some(w) => w.into_result(&self.id),
            None => Ok(()),
        }
    }
}

pub struct Pipeline<C: ?Sized> {
    client: Arc<C>,
    tailer: Option<Arc<dyn LogTailer>>,
    publisher: Option<Arc<dyn SourcePublisher>>,
    advisories: Vec<Box<dyn Advisory>>,
}

impl<C> Pipeline<C>
where
    C: WorkloadClient + ?Sized,
{
    pub fn new(client: Arc<C>) -> Self {
        Self { client, tailer: None, publisher: None, advisories: default_advisories() }
    }

    pub fn with_tailer(mut self, tailer: Arc<dyn LogTailer>) -> Self {
        self.tailer = Some(tailer);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn SourcePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_advisories(mut self, advisories: Vec<Box<dyn Advisory>>) -> Self {
        self.advisories = advisories;
        self
    }

    /// Merge and diff. Reads the live object; never writes.
    pub async fn prepare(&self, req: &ApplyRequest) -> Result<Prepared, ApplyError> {
        let mut stack = LayerStack::new();
        if let Some(file) = &req.file {
            stack.push(SourceLayer::File, file.clone());
        }
        stack.push(SourceLayer::Flags, req.flags.clone());

        let id = stack.resolve_identity(&req.default_namespace)?;
        let existing = self.client.get_opt(&id).await?;
        let target = stack.merge_onto(existing.as_ref(), &req.default_namespace)?;
        let diff = diff::diff(existing.as_ref(), &target)?;
        let advisories = self.advisories.iter().filter_map(|a| a.check(existing.as_ref(), &target)).collect();

        let summary = diff.summary();
        debug!(workload = %id, exists = existing.is_some(), adds = summary.adds, removes = summary.removes, "diff computed");
        Ok(Prepared { id, existing, target, diff, advisories })
    }

    /// Pushes `req.local_source` and pins the flag layer's source image to
    /// the pushed digest. Dry runs keep the unpinned image and push nothing.
    pub async fn publish_local_source<'r>(
        &self,
        req: &'r ApplyRequest,
        out: &mut (dyn Write + Send),
    ) -> Result<Cow<'r, ApplyRequest>, ApplyError> {
        let Some(src) = req.local_source.as_ref().filter(|_| !req.dry_run) else {
            return Ok(Cow::Borrowed(req));
        };
        let publisher = self
            .publisher
            .as_ref()
            .ok_or_else(|| ApplyError::validation("--local-path is not supported: no source publisher configured"))?;
        writeln!(out, "Publishing source in {:?} to {:?}...", src.dir.display().to_string(), src.image)?;
        out.flush()?;
        let pushed = publisher
            .publish(&src.dir, &src.image)
            .await
            .map_err(|cause| ApplyError::Publish { image: src.image.clone(), cause })?;
        writeln!(out, "Published source")?;
        info!(dir = %src.dir.display(), image = %pushed, "local source published");

        let mut req = req.clone();
        req.flags.source_image = Patch::Set(pushed);
        Ok(Cow::Owned(req))
    }

    /// Full run, writing the user transcript to `out`. Conflict and failure
    /// come back inside the report; see `PipelineReport::into_result`.
    pub async fn run(
        &self,
        req: &ApplyRequest,
        confirm: &mut dyn Confirm,
        out: &mut (dyn Write + Send),
    ) -> Result<PipelineReport, ApplyError> {
        let req = self.publish_local_source(req, out).await?;
        let req: &ApplyRequest = &req;
        let prepared = self.prepare(req).await?;
        let Prepared { id, existing, target, diff, advisories } = &prepared;

        for warning in advisories {
            writeln!(out, "WARNING: {}", warning)?;
        }
        let intent = prepared.intent();
        if let Some(intent) = intent {
            if req.dry_run {
                write!(out, "{}", target.manifest_yaml()?)?;
            } else {
                writeln!(out, "{} workload:", intent.title())?;
                write!(out, "{}", diff.render())?;
                writeln!(out)?;
            }
        }

        let confirmed = match intent {
            Some(intent) if !req.dry_run && !req.assume_yes => {
                out.flush()?;
                confirm.confirm(&format!("Really {} the workload {:?}?", intent.verb(), id.name))
            }
            _ => true,
        };
        let opts = ApplyOptions { dry_run: req.dry_run, confirmed };
        let outcome = executor::apply(&*self.client, existing.as_ref(), target, diff, opts).await?;
        if let Some(line) = outcome.status_line() {
            writeln!(out, "{}", line)?;
        }

        let wait = match &req.wait {
            Some(wait_opts) if outcome.is_submitted() => {
                writeln!(out, "Waiting for workload {:?} to become ready...", id.name)?;
                out.flush()?;
                let res = wait::wait_ready(&*self.client, self.tailer.clone(), id, wait_opts).await;
                if res == WaitOutcome::Ready {
                    writeln!(out, "Workload {:?} is ready", id.name)?;
                }
                Some(res)
            }
            _ => None,
        };
        info!(workload = %id, submitted = outcome.is_submitted(), wait = ?wait, "apply finished");
        Ok(PipelineReport { id: id.clone(), outcome, wait })
    }
}
