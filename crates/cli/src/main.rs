use std::io::{BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use wl_apply::{
    manifest::check_stdin_confirmation, load_manifest, ApplyRequest, Confirm, FlagInputs, ManifestSource, Pipeline,
    TailOptions, WaitOptions,
};
use wl_core::{Identity, Workload, WorkloadClient, READY_CONDITION};
use wl_kubehub::KubeWorkloadClient;
use wl_ops::{ImgpkgPublisher, KubeLogTailer};

#[derive(Parser, Debug)]
#[command(name = "wlctl", version, about = "Apply and inspect supply chain workloads")]
struct Cli {
    /// Kubernetes namespace (default: current context)
    #[arg(short = 'n', long = "namespace", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Workload lifecycle
    Workload {
        #[command(subcommand)]
        command: WorkloadCommands,
    },
}

#[derive(Subcommand, Debug)]
enum WorkloadCommands {
    /// Create or update a workload from flags and/or a manifest
    Apply(Box<ApplyArgs>),
    /// Show a workload and its readiness
    Get {
        name: String,
    },
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// Workload name (defaults to metadata.name from --file)
    name: Option<String>,
    /// Manifest path, or "-" for stdin
    #[arg(short = 'f', long = "file")]
    file: Option<String>,
    /// Application the workload is part of
    #[arg(long = "app")]
    app: Option<String>,
    /// Workload type, e.g. web
    #[arg(short = 't', long = "type")]
    workload_type: Option<String>,
    /// Label "key=value", "key-" to delete
    #[arg(short = 'l', long = "label")]
    labels: Vec<String>,
    /// Annotation "key=value", "key-" to delete
    #[arg(long = "annotation")]
    annotations: Vec<String>,
    /// Runtime env var "NAME=value", "NAME-" to delete
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,
    /// Build env var "NAME=value", "NAME-" to delete
    #[arg(long = "build-env")]
    build_env: Vec<String>,
    /// Param "name=value", "name-" to delete
    #[arg(short = 'p', long = "param")]
    params: Vec<String>,
    /// Param with a YAML/JSON value "name=<yaml>"
    #[arg(long = "param-yaml")]
    param_yaml: Vec<String>,
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,
    #[arg(long = "live-update", action = ArgAction::SetTrue)]
    live_update: bool,
    /// Pre-built runnable image (exclusive with source flags)
    #[arg(long = "image")]
    image: Option<String>,
    #[arg(long = "git-repo")]
    git_repo: Option<String>,
    #[arg(long = "git-branch")]
    git_branch: Option<String>,
    #[arg(long = "git-tag")]
    git_tag: Option<String>,
    #[arg(long = "git-commit")]
    git_commit: Option<String>,
    /// Source bundle image
    #[arg(long = "source-image")]
    source_image: Option<String>,
    /// Local directory to publish to --source-image and use as the source
    #[arg(long = "local-path")]
    local_path: Option<String>,
    /// Path inside the source to build from
    #[arg(long = "sub-path")]
    sub_path: Option<String>,
    /// Service claim "name=apiVersion:kind[:namespace]:refName", "name-" to delete
    #[arg(long = "service-ref")]
    service_refs: Vec<String>,
    /// Service account; "" clears it
    #[arg(long = "service-account")]
    service_account: Option<String>,
    #[arg(long = "limit-cpu")]
    limit_cpu: Option<String>,
    #[arg(long = "limit-memory")]
    limit_memory: Option<String>,
    #[arg(long = "request-cpu")]
    request_cpu: Option<String>,
    #[arg(long = "request-memory")]
    request_memory: Option<String>,
    /// Print the resulting workload instead of submitting it
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Accept all prompts
    #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
    yes: bool,
    /// Wait for the workload to become ready
    #[arg(long = "wait", action = ArgAction::SetTrue)]
    wait: bool,
    #[arg(long = "wait-timeout", env = "WLCTL_WAIT_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    wait_timeout: Duration,
    /// Tail build and runtime logs while waiting (implies --wait)
    #[arg(long = "tail", action = ArgAction::SetTrue)]
    tail: bool,
    /// Like --tail, with timestamps
    #[arg(long = "tail-timestamp", action = ArgAction::SetTrue)]
    tail_timestamp: bool,
}

impl ApplyArgs {
    fn flag_inputs(&self, namespace: Option<String>) -> FlagInputs {
        FlagInputs {
            name: self.name.clone(),
            namespace,
            app: self.app.clone(),
            workload_type: self.workload_type.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            env: self.env.clone(),
            build_env: self.build_env.clone(),
            params: self.params.clone(),
            param_yaml: self.param_yaml.clone(),
            debug: self.debug,
            live_update: self.live_update,
            image: self.image.clone(),
            git_repo: self.git_repo.clone(),
            git_branch: self.git_branch.clone(),
            git_tag: self.git_tag.clone(),
            git_commit: self.git_commit.clone(),
            source_image: self.source_image.clone(),
            local_path: self.local_path.clone(),
            sub_path: self.sub_path.clone(),
            service_refs: self.service_refs.clone(),
            service_account: self.service_account.clone(),
            limit_cpu: self.limit_cpu.clone(),
            limit_memory: self.limit_memory.clone(),
            request_cpu: self.request_cpu.clone(),
            request_memory: self.request_memory.clone(),
        }
    }

    fn wait_options(&self) -> Option<WaitOptions> {
        let tail = (self.tail || self.tail_timestamp)
            .then(|| TailOptions { since: Duration::from_secs(1), timestamps: self.tail_timestamp });
        (self.wait || tail.is_some()).then(|| WaitOptions { timeout: self.wait_timeout, tail })
    }
}

fn init_tracing() {
    let env = std::env::var("WLCTL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the user transcript
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("WLCTL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid WLCTL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prompts on stdout, answers from stdin.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, prompt: &str) -> bool {
        print!("{} [yN]: ", prompt);
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

async fn run_apply(args: &ApplyArgs, namespace: Option<String>) -> Result<()> {
    let kube = wl_kubehub::kube_client().await?;
    let client = KubeWorkloadClient::new(kube.clone());
    let default_namespace = client.default_namespace().to_string();

    let file = match args.file.as_deref() {
        Some(arg) => {
            let src = ManifestSource::from_arg(arg);
            check_stdin_confirmation(&src, args.yes, args.dry_run)?;
            Some(load_manifest(&src)?)
        }
        None => None,
    };
    let flags = args.flag_inputs(namespace);
    let local_source = flags.local_source()?;
    let req = ApplyRequest {
        file,
        flags: flags.into_layer()?,
        local_source,
        default_namespace,
        dry_run: args.dry_run,
        assume_yes: args.yes,
        wait: args.wait_options(),
    };
    info!(dry_run = req.dry_run, wait = req.wait.is_some(), "workload apply invoked");

    let mut pipeline = Pipeline::new(Arc::new(client));
    if req.wait.and_then(|w| w.tail).is_some() {
        pipeline = pipeline.with_tailer(Arc::new(KubeLogTailer::new(kube)));
    }
    if req.local_source.is_some() {
        pipeline = pipeline.with_publisher(Arc::new(ImgpkgPublisher::default()));
    }
    let mut out = std::io::stdout();
    let report = pipeline.run(&req, &mut StdinConfirm, &mut out).await?;
    report.into_result()?;
    Ok(())
}

/// One-line readiness summary for `workload get`.
fn describe_ready(w: &Workload, now: DateTime<Utc>) -> String {
    let Some(c) = w.condition(READY_CONDITION) else {
        return "Ready: <unknown>".to_string();
    };
    let mut line = format!("Ready: {}", c.status);
    if let Some(reason) = c.reason.as_deref().filter(|r| !r.is_empty()) {
        line.push_str(&format!(" ({})", reason));
    }
    let since = c
        .last_transition_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .and_then(|t| (now - t.with_timezone(&Utc)).to_std().ok());
    if let Some(age) = since {
        let rounded = Duration::from_secs(age.as_secs());
        line.push_str(&format!(" for {}", humantime::format_duration(rounded)));
    }
    if let Some(msg) = c.message.as_deref().filter(|m| !m.is_empty()) {
        line.push_str(&format!("\n  {}", msg));
    }
    line
}

async fn run_get(name: &str, namespace: Option<String>) -> Result<()> {
    let client = KubeWorkloadClient::try_default().await?;
    let ns = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let id = Identity::new(ns, name);
    let w = client.get(&id).await.with_context(|| format!("getting workload {}", id))?;
    print!("{}", w.manifest_yaml()?);
    println!("{}", describe_ready(&w, Utc::now()));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let work = async {
        match cli.command {
            Commands::Workload { command: WorkloadCommands::Apply(args) } => run_apply(&args, cli.namespace).await,
            Commands::Workload { command: WorkloadCommands::Get { name } } => run_get(&name, cli.namespace).await,
        }
    };
    tokio::select! {
        res = work => res,
        _ = signal::ctrl_c() => {
            warn!("interrupted");
            Err(anyhow!("interrupted"))
        }
    }
}
