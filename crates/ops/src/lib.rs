//! wl ops: log tailing for the pods a workload's supply chain runs, and
//! publishing local source directories.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, LogParams},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::process::Command;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use wl_core::{LogTailer, SourcePublisher, TailRequest};

/// A single line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    /// `pod[container]`
    pub source: String,
    pub line: String,
}

impl LogChunk {
    pub fn render(&self) -> String {
        format!("{} {}", self.source, self.line)
    }
}

fn queue_cap() -> usize {
    std::env::var("WLCTL_TAIL_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024)
}

/// Follows every container of every pod matching the selector, printing
/// lines to stdout until dropped.
pub struct KubeLogTailer {
    client: Client,
}

impl KubeLogTailer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Containers whose logs can be read right now (running or finished).
pub fn loggable_containers(pod: &Pod) -> Vec<String> {
    let Some(status) = pod.status.as_ref() else { return Vec::new() };
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .filter(|cs| {
            cs.state
                .as_ref()
                .map(|s| s.running.is_some() || s.terminated.is_some())
                .unwrap_or(false)
        })
        .map(|cs| cs.name.clone())
        .collect()
}

fn log_params(req: &TailRequest, container: &str) -> LogParams {
    LogParams {
        container: Some(container.to_string()),
        follow: true,
        since_seconds: Some(req.since.as_secs().max(1) as i64),
        timestamps: req.timestamps,
        ..LogParams::default()
    }
}

async fn follow(api: Api<Pod>, pod: String, lp: LogParams, tx: mpsc::Sender<LogChunk>) {
    use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
    let source = format!("{}[{}]", pod, lp.container.as_deref().unwrap_or_default());
    let reader = match api.log_stream(&pod, &lp).await {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %source, error = %e, "log_stream failed to open");
            return;
        }
    };
    // futures AsyncRead -> tokio AsyncRead -> bytes stream
    let stream = ReaderStream::new(reader.compat());
    pump_bytes_to_lines(stream, tx, &source).await;
}

#[async_trait::async_trait]
impl LogTailer for KubeLogTailer {
    async fn tail(&self, req: TailRequest) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &req.namespace);
        let (tx, mut rx) = mpsc::channel::<LogChunk>(queue_cap());
        let mut followers = JoinSet::new();
        followers.spawn(async move {
            while let Some(chunk) = rx.recv().await {
                println!("{}", chunk.render());
            }
        });

        let mut followed: HashSet<(String, String)> = HashSet::new();
        let stream = watcher::watcher(pods.clone(), watcher::Config::default().labels(&req.selector));
        futures::pin_mut!(stream);
        info!(ns = %req.namespace, selector = %req.selector, "log tail started");
        while let Some(ev) = stream.try_next().await.context("watching pods for log tail")? {
            let seen = match ev {
                Event::Applied(p) => vec![p],
                Event::Restarted(list) => list,
                Event::Deleted(_) => continue,
            };
            for pod in seen {
                let Some(name) = pod.metadata.name.clone() else { continue };
                for container in loggable_containers(&pod) {
                    if followed.insert((name.clone(), container.clone())) {
                        debug!(pod = %name, container = %container, "following container logs");
                        followers.spawn(follow(pods.clone(), name.clone(), log_params(&req, &container), tx.clone()));
                    }
                }
            }
        }
        warn!("pod watch for log tail ended");
        Ok(())
    }
}

fn publish_timeout() -> Duration {
    let secs = std::env::var("WLCTL_PUBLISH_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(300);
    Duration::from_secs(secs)
}

/// Pushes a directory as a plain image with the `imgpkg` CLI.
pub struct ImgpkgPublisher {
    program: String,
    timeout: Duration,
}

impl Default for ImgpkgPublisher {
    fn default() -> Self {
        let program = std::env::var("WLCTL_IMGPKG").unwrap_or_else(|_| "imgpkg".to_string());
        Self { program, timeout: publish_timeout() }
    }
}

impl ImgpkgPublisher {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Self::default() }
    }
}

/// `repo@sha256:...` from imgpkg's `Pushed '...'` line.
pub fn parse_pushed_ref(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("Pushed '")?.strip_suffix('\''))
        .filter(|r| r.contains("@sha256:"))
        .map(str::to_string)
}

#[async_trait::async_trait]
impl SourcePublisher for ImgpkgPublisher {
    async fn publish(&self, dir: &Path, image: &str) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("push")
            .arg("-i")
            .arg(image)
            .arg("-f")
            .arg(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // registry creds come from the docker config unless IaaS auth is asked for
        if std::env::var_os("IMGPKG_ENABLE_IAAS_AUTH").is_none() {
            cmd.env("IMGPKG_ENABLE_IAAS_AUTH", "false");
        }
        info!(dir = %dir.display(), image = %image, "publishing local source");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("{} push timed out after {:?}", self.program, self.timeout))?
            .with_context(|| format!("running {} push", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().chain(stdout.lines()).find(|l| !l.trim().is_empty()).unwrap_or_default();
            bail!("{} push failed ({}): {}", self.program, output.status, detail.trim());
        }
        parse_pushed_ref(&stdout).ok_or_else(|| anyhow!("{} push did not report a digest", self.program))
    }
}

/// Consume a stream of bytes, split into lines, send via bounded channel.
/// Drops lines when the channel is full, stops once the receiver is gone,
/// flushes the last partial line on end.
async fn pump_bytes_to_lines<S, E>(stream: S, tx: mpsc::Sender<LogChunk>, source: &str)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let send = |line: &[u8]| -> bool {
        match std::str::from_utf8(line) {
            Ok(s) => !matches!(
                tx.try_send(LogChunk { source: source.to_string(), line: s.to_string() }),
                Err(TrySendError::Closed(_))
            ),
            Err(_) => true,
        }
    };
    'outer: while let Some(next) = stream.next().await {
        match next {
            Ok(chunk) => {
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line = buf.split_to(pos);
                    let _ = buf.split_to(1); // drop '\n'
                    if !send(&line) {
                        debug!(source = %source, "log receiver gone");
                        break 'outer;
                    }
                }
            }
            Err(e) => {
                warn!(source = %source, error = %e, "log stream error");
                break;
            }
        }
    }
    if !buf.is_empty() {
        send(&buf);
    }
    info!(source = %source, "log pump ended");
}
