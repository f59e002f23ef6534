//! Command-line intent as a flag layer.

use std::path::PathBuf;

use serde_json::Value as Json;
use wl_core::{EnvVar, Param, ServiceClaim, ServiceClaimRef, APP_PART_OF_LABEL, WORKLOAD_TYPE_LABEL};

use crate::error::ApplyError;
use crate::layer::{GitPatch, MapPatch, Patch, PartialWorkload};

/// Raw flag values, already split into repeated occurrences.
#[derive(Debug, Clone, Default)]
pub struct FlagInputs {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub app: Option<String>,
    pub workload_type: Option<String>,
    /// `key=value`, `key-` or `key=` (delete).
    pub labels: Vec<String>,
    pub annotations: Vec<String>,
    /// `NAME=value` or `NAME-`.
    pub env: Vec<String>,
    pub build_env: Vec<String>,
    pub params: Vec<String>,
    /// `name=<yaml or json>`.
    pub param_yaml: Vec<String>,
    pub debug: bool,
    pub live_update: bool,
    pub image: Option<String>,
    pub git_repo: Option<String>,
    pub git_branch: Option<String>,
    pub git_tag: Option<String>,
    pub git_commit: Option<String>,
    pub source_image: Option<String>,
    /// Directory published to `source_image` before merging.
    pub local_path: Option<String>,
    pub sub_path: Option<String>,
    /// `name=apiVersion:kind[:namespace]:refName` or `name-`.
    pub service_refs: Vec<String>,
    pub service_account: Option<String>,
    pub limit_cpu: Option<String>,
    pub limit_memory: Option<String>,
    pub request_cpu: Option<String>,
    pub request_memory: Option<String>,
}

/// Local directory to publish as the workload's source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    pub dir: PathBuf,
    pub image: String,
}

enum Entry<'a> {
    Set(&'a str, &'a str),
    Remove(&'a str),
}

fn parse_entry<'a>(what: &str, raw: &'a str) -> Result<Entry<'a>, ApplyError> {
    if let Some((k, v)) = raw.split_once('=') {
        if !k.is_empty() {
            return Ok(Entry::Set(k, v));
        }
    } else if let Some(k) = raw.strip_suffix('-').filter(|k| !k.is_empty()) {
        return Ok(Entry::Remove(k));
    }
    Err(ApplyError::validation(format!("invalid {} {:?}: expected KEY=VALUE or KEY-", what, raw)))
}

fn parse_map(what: &str, raw: &[String], into: &mut MapPatch) -> Result<(), ApplyError> {
    for r in raw {
        match parse_entry(what, r)? {
            Entry::Set(k, "") | Entry::Remove(k) => into.delete(k),
            Entry::Set(k, v) => into.set(k, v),
        };
    }
    Ok(())
}

fn set_or_delete(into: &mut MapPatch, key: &str, v: &Option<String>) {
    match v.as_deref() {
        None => {}
        Some("") => {
            into.delete(key);
        }
        Some(q) => {
            into.set(key, q);
        }
    }
}

fn parse_service_ref(raw: &str, layer: &mut PartialWorkload) -> Result<(), ApplyError> {
    let invalid = || {
        ApplyError::validation(format!(
            "invalid service ref {:?}: expected NAME=apiVersion:kind[:namespace]:name or NAME-",
            raw
        ))
    };
    match parse_entry("service ref", raw).map_err(|_| invalid())? {
        Entry::Remove(name) => {
            layer.service_claims.remove(name);
            layer.claim_namespaces.delete(name);
        }
        Entry::Set(name, target) => {
            let parts: Vec<&str> = target.split(':').collect();
            let (api_version, kind, namespace, ref_name) = match parts.as_slice() {
                [a, k, n] => (*a, *k, None, *n),
                [a, k, ns, n] => (*a, *k, Some(*ns), *n),
                _ => return Err(invalid()),
            };
            if [api_version, kind, ref_name].iter().any(|s| s.is_empty()) {
                return Err(invalid());
            }
            layer.service_claims.upsert(ServiceClaim {
                name: name.to_string(),
                reference: Some(ServiceClaimRef {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    name: ref_name.to_string(),
                }),
            });
            match namespace.filter(|ns| !ns.is_empty()) {
                Some(ns) => layer.claim_namespaces.set(name, ns),
                None => layer.claim_namespaces.delete(name),
            };
        }
    }
    Ok(())
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

impl FlagInputs {
    fn sets_git_ref(&self) -> bool {
        [&self.git_branch, &self.git_tag, &self.git_commit].iter().any(|f| f.is_some())
    }

    /// `--local-path` with the `--source-image` it publishes to.
    pub fn local_source(&self) -> Result<Option<LocalSource>, ApplyError> {
        let Some(dir) = non_empty(&self.local_path) else { return Ok(None) };
        if self.git_repo.is_some() || self.sets_git_ref() {
            return Err(ApplyError::validation("--local-path cannot be combined with git flags"));
        }
        if self.image.is_some() {
            return Err(ApplyError::validation("--local-path and --image are mutually exclusive"));
        }
        let Some(image) = non_empty(&self.source_image) else {
            return Err(ApplyError::validation("--local-path requires --source-image"));
        };
        Ok(Some(LocalSource { dir: PathBuf::from(dir), image: image.to_string() }))
    }

    pub fn into_layer(self) -> Result<PartialWorkload, ApplyError> {
        self.local_source()?;
        if self.git_repo.as_deref() == Some("") && self.sets_git_ref() {
            return Err(ApplyError::validation(
                "--git-repo \"\" removes the git source and cannot be combined with --git-branch, --git-tag or --git-commit",
            ));
        }
        let mut layer = PartialWorkload {
            name: self.name.filter(|n| !n.is_empty()),
            namespace: self.namespace.filter(|n| !n.is_empty()),
            image: Patch::from_flag(self.image),
            source_image: Patch::from_flag(self.source_image),
            sub_path: Patch::from_flag(self.sub_path),
            service_account_name: Patch::from_flag(self.service_account),
            ..Default::default()
        };

        set_or_delete(&mut layer.labels, APP_PART_OF_LABEL, &self.app);
        set_or_delete(&mut layer.labels, WORKLOAD_TYPE_LABEL, &self.workload_type);
        parse_map("label", &self.labels, &mut layer.labels)?;
        parse_map("annotation", &self.annotations, &mut layer.annotations)?;

        for (raw, target) in self.env.iter().map(|e| (e, false)).chain(self.build_env.iter().map(|e| (e, true))) {
            let list = if target { &mut layer.build_env } else { &mut layer.env };
            match parse_entry("env", raw)? {
                Entry::Set(k, v) => list.upsert(EnvVar::new(k, v)),
                Entry::Remove(k) => list.remove(k),
            };
        }

        for raw in &self.params {
            match parse_entry("param", raw)? {
                Entry::Set(k, v) => layer.params.upsert(Param { name: k.to_string(), value: Json::String(v.to_string()) }),
                Entry::Remove(k) => layer.params.remove(k),
            };
        }
        for raw in &self.param_yaml {
            match parse_entry("param-yaml", raw)? {
                Entry::Set(k, v) => {
                    let value: serde_yaml::Value = serde_yaml::from_str(v).map_err(|e| {
                        ApplyError::validation(format!("invalid param-yaml {:?}: {}", k, e))
                    })?;
                    let value = serde_json::to_value(value).map_err(|e| {
                        ApplyError::validation(format!("invalid param-yaml {:?}: {}", k, e))
                    })?;
                    layer.params.upsert(Param { name: k.to_string(), value })
                }
                Entry::Remove(k) => layer.params.remove(k),
            };
        }
        if self.debug {
            layer.params.upsert(Param { name: "debug".into(), value: Json::String("true".into()) });
        }
        if self.live_update {
            layer.params.upsert(Param { name: "live-update".into(), value: Json::String("true".into()) });
        }

        let git = GitPatch {
            url: Patch::from_flag(self.git_repo),
            branch: Patch::from_flag(self.git_branch),
            tag: Patch::from_flag(self.git_tag),
            commit: Patch::from_flag(self.git_commit),
        };
        if !git.is_empty() {
            layer.git = Some(git);
        }

        for raw in &self.service_refs {
            parse_service_ref(raw, &mut layer)?;
        }

        set_or_delete(&mut layer.limits, "cpu", &self.limit_cpu);
        set_or_delete(&mut layer.limits, "memory", &self.limit_memory);
        set_or_delete(&mut layer.requests, "cpu", &self.request_cpu);
        set_or_delete(&mut layer.requests, "memory", &self.request_memory);
        Ok(layer)
    }
}
