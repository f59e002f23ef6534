#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use wl_core::{
    ClientError, Condition, Identity, LogTailer, SourcePublisher, TailRequest, WatchEvent, WatchStream, Workload, WorkloadClient,
    WorkloadStatus, READY_CONDITION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Get,
    Create,
    Update,
    Watch,
}

#[derive(Debug, Clone)]
pub enum Failure {
    Conflict,
    Other(String),
}

impl Failure {
    fn into_error(self) -> ClientError {
        match self {
            Failure::Conflict => ClientError::Conflict("induced conflict".into()),
            Failure::Other(msg) => ClientError::Other(anyhow::anyhow!(msg)),
        }
    }
}

/// In-memory cluster: records every call, can induce write failures and
/// replays a scripted watch.
#[derive(Default)]
pub struct FakeClient {
    objects: Mutex<BTreeMap<Identity, Workload>>,
    calls: Mutex<Vec<Call>>,
    fail_create: Mutex<Option<Failure>>,
    fail_update: Mutex<Option<Failure>>,
    events: Mutex<Vec<Result<WatchEvent, String>>>,
    /// Keep the watch open after the scripted events.
    hold_open: Mutex<bool>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, w: Workload) -> Self {
        let id = w.identity().expect("fixture has identity");
        self.objects.lock().unwrap().insert(id, w);
        self
    }

    pub fn fail_create(self, f: Failure) -> Self {
        *self.fail_create.lock().unwrap() = Some(f);
        self
    }

    pub fn fail_update(self, f: Failure) -> Self {
        *self.fail_update.lock().unwrap() = Some(f);
        self
    }

    pub fn with_events(self, events: Vec<Result<WatchEvent, String>>, hold_open: bool) -> Self {
        *self.events.lock().unwrap() = events;
        *self.hold_open.lock().unwrap() = hold_open;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Create | Call::Update)).count()
    }

    pub fn stored(&self, id: &Identity) -> Option<Workload> {
        self.objects.lock().unwrap().get(id).cloned()
    }

    fn record(&self, c: Call) {
        self.calls.lock().unwrap().push(c);
    }
}

#[async_trait::async_trait]
impl WorkloadClient for FakeClient {
    async fn get(&self, id: &Identity) -> Result<Workload, ClientError> {
        self.record(Call::Get);
        self.stored(id).ok_or_else(|| ClientError::NotFound(id.clone()))
    }

    async fn create(&self, workload: &Workload) -> Result<Workload, ClientError> {
        self.record(Call::Create);
        if let Some(f) = self.fail_create.lock().unwrap().take() {
            return Err(f.into_error());
        }
        let mut created = workload.clone();
        created.metadata.resource_version = Some("1".into());
        let id = created.identity().expect("identity");
        self.objects.lock().unwrap().insert(id, created.clone());
        Ok(created)
    }

    async fn update(&self, workload: &Workload) -> Result<Workload, ClientError> {
        self.record(Call::Update);
        if let Some(f) = self.fail_update.lock().unwrap().take() {
            return Err(f.into_error());
        }
        let mut updated = workload.clone();
        let next = updated.metadata.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0) + 1;
        updated.metadata.resource_version = Some(next.to_string());
        let id = updated.identity().expect("identity");
        self.objects.lock().unwrap().insert(id, updated.clone());
        Ok(updated)
    }

    async fn watch(&self, _id: &Identity) -> Result<WatchStream, ClientError> {
        self.record(Call::Watch);
        let events: Vec<_> = self.events.lock().unwrap().drain(..).collect();
        let hold_open = *self.hold_open.lock().unwrap();
        let s = async_stream::stream! {
            for ev in events {
                yield ev.map_err(|msg| ClientError::Other(anyhow::anyhow!(msg)));
            }
            if hold_open {
                futures::future::pending::<()>().await;
            }
        };
        Ok(s.boxed())
    }
}

/// Records requests; optionally fails right away, otherwise tails forever.
#[derive(Default)]
pub struct FakeTailer {
    pub requests: Mutex<Vec<TailRequest>>,
    pub fail: bool,
}

#[async_trait::async_trait]
impl LogTailer for FakeTailer {
    async fn tail(&self, req: TailRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(req);
        if self.fail {
            anyhow::bail!("no pods to tail");
        }
        futures::future::pending::<()>().await;
        Ok(())
    }
}

pub const SOURCE_DIGEST: &str = "sha256:978be33a7f0cbe89bf48fbb438846047a28e1298d6d10d0de2d64bdab6a34aa1";

/// Records pushes and answers with `image@SOURCE_DIGEST`.
#[derive(Default)]
pub struct FakePublisher {
    pub pushed: Mutex<Vec<(PathBuf, String)>>,
    pub fail: bool,
}

#[async_trait::async_trait]
impl SourcePublisher for FakePublisher {
    async fn publish(&self, dir: &Path, image: &str) -> anyhow::Result<String> {
        self.pushed.lock().unwrap().push((dir.to_path_buf(), image.to_string()));
        if self.fail {
            anyhow::bail!("UNAUTHORIZED: authentication required");
        }
        Ok(format!("{}@{}", image, SOURCE_DIGEST))
    }
}

pub fn id() -> Identity {
    Identity::new("default", "my-workload")
}

pub fn existing_image() -> Workload {
    let mut w = Workload::new(&id());
    w.metadata.resource_version = Some("999".into());
    w.spec.image = Some("ubuntu:bionic".into());
    w
}

pub fn with_ready(mut w: Workload, status: &str) -> Workload {
    w.status = Some(WorkloadStatus {
        conditions: vec![Condition {
            condition_type: READY_CONDITION.into(),
            status: status.into(),
            reason: Some("OopsieDoodle".into()),
            message: Some("a hopefully informative message about what went wrong".into()),
            ..Default::default()
        }],
        ..Default::default()
    });
    w
}

pub fn ready_event(status: &str) -> Result<WatchEvent, String> {
    Ok(WatchEvent::modified(with_ready(existing_image(), status)))
}

pub const SHORT: Duration = Duration::from_millis(50);
