//! Manifest loading: file or stdin -> `Workload` -> file layer.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value as Json;
use wl_core::{Workload, API_VERSION, KIND};

use crate::error::ApplyError;
use crate::layer::{GitPatch, Patch, PartialWorkload};

fn max_yaml_bytes() -> usize {
    std::env::var("WLCTL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("WLCTL_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // running counter, bail once the budget is spent
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Path(PathBuf),
    Stdin,
}

impl ManifestSource {
    /// `-` selects stdin.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" { ManifestSource::Stdin } else { ManifestSource::Path(PathBuf::from(arg)) }
    }

    pub fn is_stdin(&self) -> bool {
        matches!(self, ManifestSource::Stdin)
    }

    pub fn read(&self) -> Result<String> {
        let max = max_yaml_bytes();
        let mut buf = String::new();
        match self {
            ManifestSource::Stdin => {
                std::io::stdin().take(max as u64 + 1).read_to_string(&mut buf).context("reading manifest from stdin")?;
            }
            ManifestSource::Path(p) => {
                let f = std::fs::File::open(p).with_context(|| format!("opening manifest {}", p.display()))?;
                f.take(max as u64 + 1).read_to_string(&mut buf).with_context(|| format!("reading manifest {}", p.display()))?;
            }
        }
        if buf.len() > max {
            bail!("YAML payload too large (>{} bytes)", max);
        }
        Ok(buf)
    }
}

/// Decode a single workload document with friendly errors for the common mistakes.
pub fn parse_manifest(yaml: &str) -> Result<Workload> {
    if yaml.len() > max_yaml_bytes() {
        bail!("YAML payload too large (>{} bytes)", max_yaml_bytes());
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        bail!("YAML document too complex (>{} nodes)", max_yaml_nodes());
    }
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?;
    if api_version != API_VERSION || kind != KIND {
        bail!("expected {} {}, found {} {}", API_VERSION, KIND, api_version, kind);
    }
    serde_json::from_value(json).context("decoding workload")
}

/// Stdin is the manifest, so it cannot also answer the confirmation prompt.
pub fn check_stdin_confirmation(src: &ManifestSource, assume_yes: bool, dry_run: bool) -> Result<(), ApplyError> {
    if src.is_stdin() && !assume_yes && !dry_run {
        return Err(ApplyError::validation("--yes is required when the manifest is read from stdin"));
    }
    Ok(())
}

pub fn load_manifest(src: &ManifestSource) -> Result<PartialWorkload, ApplyError> {
    let text = src.read().map_err(|e| ApplyError::validation(format!("{:#}", e)))?;
    let workload = parse_manifest(&text).map_err(|e| ApplyError::validation(format!("{:#}", e)))?;
    Ok(PartialWorkload::from_manifest(&workload))
}

impl PartialWorkload {
    /// A manifest states its source and service account completely, so those
    /// fields are `Set` or `Clear`; everything else merges sparsely.
    pub fn from_manifest(w: &Workload) -> Self {
        let mut layer = PartialWorkload {
            name: w.metadata.name.clone(),
            namespace: w.metadata.namespace.clone(),
            service_account_name: Patch::from_option(w.spec.service_account_name.clone()),
            ..Default::default()
        };
        for (k, v) in &w.metadata.labels {
            layer.labels.set(k, v);
        }
        for (k, v) in &w.metadata.annotations {
            layer.annotations.set(k, v);
        }

        let spec = &w.spec;
        if let Some(image) = &spec.image {
            layer.image = Patch::Set(image.clone());
        }
        if let Some(source) = spec.source.as_ref().filter(|s| s.has_origin()) {
            if let Some(git) = &source.git {
                layer.git = Some(GitPatch {
                    url: Patch::Set(git.url.clone()),
                    branch: Patch::from_option(git.git_ref.branch.clone()),
                    tag: Patch::from_option(git.git_ref.tag.clone()),
                    commit: Patch::from_option(git.git_ref.commit.clone()),
                });
                layer.source_image = Patch::Clear;
            } else {
                layer.source_image = Patch::from_option(source.image.clone());
            }
            layer.sub_path = Patch::from_option(source.sub_path.clone());
        } else if let Some(sub_path) = spec.source.as_ref().and_then(|s| s.sub_path.clone()) {
            layer.sub_path = Patch::Set(sub_path);
        }

        for e in &spec.env {
            layer.env.upsert(e.clone());
        }
        for e in spec.build.iter().flat_map(|b| b.env.iter()) {
            layer.build_env.upsert(e.clone());
        }
        for p in &spec.params {
            layer.params.upsert(p.clone());
        }
        for c in &spec.service_claims {
            layer.service_claims.upsert(c.clone());
        }
        if let Some(res) = &spec.resources {
            for (k, v) in &res.limits {
                layer.limits.set(k, v);
            }
            for (k, v) in &res.requests {
                layer.requests.set(k, v);
            }
        }
        layer
    }
}
