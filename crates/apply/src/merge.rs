//! Resource merger: existing object, manifest layer and flag layer in, one
//! target workload out.
//!
//! Layers are applied in precedence order (existing < file < flags) no matter
//! the order they were pushed, so a flag-sourced deletion always lands after
//! the file's values. Pure: no cluster or disk access.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wl_core::{GitSource, Identity, Source, Workload, WorkloadSpec, DEFAULT_NAMESPACE, SERVICE_CLAIMS_ANNOTATION};

use crate::error::ApplyError;
use crate::layer::{MapPatch, Patch, PartialWorkload, SourceLayer};

static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// Merge the three sources into a target workload.
pub fn merge(
    existing: Option<&Workload>,
    file: Option<&PartialWorkload>,
    flags: &PartialWorkload,
) -> Result<Workload, ApplyError> {
    let mut stack = LayerStack::new();
    if let Some(file) = file {
        stack.push(SourceLayer::File, file.clone());
    }
    stack.push(SourceLayer::Flags, flags.clone());
    stack.merge_onto(existing, DEFAULT_NAMESPACE)
}

/// Precedence-ordered collection of layers.
#[derive(Debug, Clone, Default)]
pub struct LayerStack {
    layers: Vec<(SourceLayer, PartialWorkload)>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: SourceLayer, patch: PartialWorkload) -> &mut Self {
        self.layers.push((layer, patch));
        self
    }

    fn ordered(&self) -> Vec<&(SourceLayer, PartialWorkload)> {
        let mut ordered: Vec<_> = self.layers.iter().collect();
        // stable: equal layers keep push order
        ordered.sort_by_key(|(layer, _)| *layer);
        ordered
    }

    fn top_name(&self) -> Option<&str> {
        self.ordered().into_iter().rev().find_map(|(_, p)| p.name.as_deref())
    }

    fn top_namespace(&self) -> Option<&str> {
        self.ordered().into_iter().rev().find_map(|(_, p)| p.namespace.as_deref())
    }

    /// Identity a create would use: highest-precedence name and namespace.
    pub fn resolve_identity(&self, default_namespace: &str) -> Result<Identity, ApplyError> {
        let name = self.top_name().filter(|n| !n.is_empty()).ok_or_else(|| {
            ApplyError::validation("workload name is required: pass a name or a manifest with metadata.name")
        })?;
        let namespace = self.top_namespace().filter(|n| !n.is_empty()).unwrap_or(default_namespace);
        Ok(Identity::new(namespace, name))
    }

    pub fn merge_onto(&self, existing: Option<&Workload>, default_namespace: &str) -> Result<Workload, ApplyError> {
        let mut target = match existing {
            Some(e) => {
                let id = e.identity().ok_or_else(|| ApplyError::validation("existing workload has no name or namespace"))?;
                self.check_identity(&id)?;
                let mut seeded = e.clone();
                seeded.status = None;
                seeded
            }
            None => Workload::new(&self.resolve_identity(default_namespace)?),
        };
        for (layer, patch) in self.ordered() {
            apply_layer(&mut target, *layer, patch)?;
        }
        finalize(&mut target)?;
        Ok(target)
    }

    // Identity is fixed by the existing object; layers may only restate it.
    fn check_identity(&self, id: &Identity) -> Result<(), ApplyError> {
        if let Some(name) = self.top_name() {
            if name != id.name {
                return Err(ApplyError::validation(format!(
                    "workload name {:?} does not match existing workload {}",
                    name, id
                )));
            }
        }
        if let Some(ns) = self.top_namespace() {
            if ns != id.namespace {
                return Err(ApplyError::validation(format!(
                    "workload namespace {:?} does not match existing workload {}",
                    ns, id
                )));
            }
        }
        Ok(())
    }
}

fn apply_layer(target: &mut Workload, layer: SourceLayer, p: &PartialWorkload) -> Result<(), ApplyError> {
    check_exclusive(layer, p)?;

    p.labels.apply_to(&mut target.metadata.labels);
    p.annotations.apply_to(&mut target.metadata.annotations);
    if !p.claim_namespaces.is_empty() {
        merge_claim_namespaces(&mut target.metadata.annotations, &p.claim_namespaces)?;
    }

    let spec = &mut target.spec;
    merge_source(spec, p);
    p.env.apply_to(&mut spec.env);
    if !p.build_env.is_empty() {
        let build = spec.build.get_or_insert_with(Default::default);
        p.build_env.apply_to(&mut build.env);
    }
    p.params.apply_to(&mut spec.params);
    p.service_claims.apply_to(&mut spec.service_claims);
    if !p.limits.is_empty() || !p.requests.is_empty() {
        let res = spec.resources.get_or_insert_with(Default::default);
        p.limits.apply_to(&mut res.limits);
        p.requests.apply_to(&mut res.requests);
    }
    p.service_account_name.apply_to(&mut spec.service_account_name);

    debug!(?layer, labels = p.labels.0.len(), env = p.env.upserts.len(), "layer merged");
    Ok(())
}

fn check_exclusive(layer: SourceLayer, p: &PartialWorkload) -> Result<(), ApplyError> {
    let sets_git = p.git.as_ref().map(|g| !g.is_empty() && !g.removes_git()).unwrap_or(false);
    let sets_source_image = p.source_image.is_set();
    if p.image.is_set() && (sets_git || sets_source_image) {
        return Err(ApplyError::validation(format!(
            "{:?} layer sets both image and source; they are mutually exclusive",
            layer
        )));
    }
    if sets_git && sets_source_image {
        return Err(ApplyError::validation(format!(
            "{:?} layer sets both a git source and a source image; they are mutually exclusive",
            layer
        )));
    }
    Ok(())
}

// image, git and source image replace each other; subPath rides on whichever source wins.
fn merge_source(spec: &mut WorkloadSpec, p: &PartialWorkload) {
    match &p.image {
        Patch::Set(image) => {
            spec.image = Some(image.clone());
            spec.source = None;
        }
        Patch::Clear => spec.image = None,
        Patch::Unset => {}
    }

    if p.git.as_ref().map(|g| g.removes_git()).unwrap_or(false) {
        if let Some(source) = spec.source.as_mut() {
            source.git = None;
        }
    } else if let Some(git) = p.git.as_ref().filter(|g| !g.is_empty()) {
        spec.image = None;
        let source = spec.source.get_or_insert_with(Source::default);
        source.image = None;
        let current = source.git.get_or_insert_with(GitSource::default);
        match &git.url {
            Patch::Set(url) => current.url = url.clone(),
            Patch::Clear | Patch::Unset => {}
        }
        git.branch.apply_to(&mut current.git_ref.branch);
        git.tag.apply_to(&mut current.git_ref.tag);
        git.commit.apply_to(&mut current.git_ref.commit);
    }

    match &p.source_image {
        Patch::Set(image) => {
            spec.image = None;
            let source = spec.source.get_or_insert_with(Source::default);
            source.git = None;
            source.image = Some(image.clone());
        }
        Patch::Clear => {
            if let Some(source) = spec.source.as_mut() {
                source.image = None;
            }
        }
        Patch::Unset => {}
    }

    match &p.sub_path {
        Patch::Set(path) => spec.source.get_or_insert_with(Source::default).sub_path = Some(path.clone()),
        Patch::Clear => {
            if let Some(source) = spec.source.as_mut() {
                source.sub_path = None;
            }
        }
        Patch::Unset => {}
    }
}

/// Payload of the service-claims annotation: which namespace each claim's
/// referenced service lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClaimsExtension {
    pub kind: String,
    pub api_version: String,
    pub spec: ClaimsExtensionSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimsExtensionSpec {
    #[serde(default)]
    pub service_claims: BTreeMap<String, ClaimTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTarget {
    pub namespace: String,
}

impl Default for ServiceClaimsExtension {
    fn default() -> Self {
        Self {
            kind: "ServiceClaimsExtension".to_string(),
            api_version: "supplychain.apps.x-tanzu.vmware.com/v1alpha1".to_string(),
            spec: ClaimsExtensionSpec::default(),
        }
    }
}

impl ServiceClaimsExtension {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Option<Self>, ApplyError> {
        match annotations.get(SERVICE_CLAIMS_ANNOTATION) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
                ApplyError::validation(format!("invalid {} annotation: {}", SERVICE_CLAIMS_ANNOTATION, e))
            }),
        }
    }
}

fn merge_claim_namespaces(annotations: &mut BTreeMap<String, String>, patch: &MapPatch) -> Result<(), ApplyError> {
    let mut ext = ServiceClaimsExtension::from_annotations(annotations)?.unwrap_or_default();
    for (claim, ns) in &patch.0 {
        match ns {
            Some(ns) => {
                ext.spec.service_claims.insert(claim.clone(), ClaimTarget { namespace: ns.clone() });
            }
            None => {
                ext.spec.service_claims.remove(claim);
            }
        }
    }
    if ext.spec.service_claims.is_empty() {
        annotations.remove(SERVICE_CLAIMS_ANNOTATION);
    } else {
        let raw = serde_json::to_string(&ext).map_err(|e| ApplyError::Internal(e.into()))?;
        annotations.insert(SERVICE_CLAIMS_ANNOTATION.to_string(), raw);
    }
    Ok(())
}

fn finalize(target: &mut Workload) -> Result<(), ApplyError> {
    let spec = &mut target.spec;
    if spec.build.as_ref().map(|b| b.env.is_empty()).unwrap_or(false) {
        spec.build = None;
    }
    if spec.resources.as_ref().map(|r| r.is_empty()).unwrap_or(false) {
        spec.resources = None;
    }
    if let Some(source) = &spec.source {
        if !source.has_origin() {
            if source.sub_path.is_some() {
                return Err(ApplyError::validation(
                    "subPath requires a source: set a git repository or a source image",
                ));
            }
            spec.source = None;
        }
    }
    validate(target)
}

/// Checks the merged object is submittable.
pub fn validate(w: &Workload) -> Result<(), ApplyError> {
    let name = w.metadata.name.as_deref().unwrap_or("");
    if name.is_empty() {
        return Err(ApplyError::validation("workload name is required"));
    }
    check_dns_label("name", name)?;
    check_dns_label("namespace", w.metadata.namespace.as_deref().unwrap_or(""))?;

    let spec = &w.spec;
    match (&spec.image, &spec.source) {
        (None, None) => {
            return Err(ApplyError::validation(
                "workload needs a source: one of image, git repository or source image",
            ))
        }
        (Some(_), Some(_)) => {
            return Err(ApplyError::validation("image and source are mutually exclusive"));
        }
        _ => {}
    }
    if let Some(git) = spec.source.as_ref().and_then(|s| s.git.as_ref()) {
        if git.url.is_empty() {
            return Err(ApplyError::validation("git source requires a repository url"));
        }
        if git.git_ref.is_empty() {
            return Err(ApplyError::validation("git source requires one of branch, tag or commit"));
        }
    }
    let build_env = spec.build.iter().flat_map(|b| b.env.iter());
    if spec.env.iter().chain(build_env).any(|e| e.name.is_empty()) {
        return Err(ApplyError::validation("environment variables need a name"));
    }
    if spec.params.iter().any(|p| p.name.is_empty()) {
        return Err(ApplyError::validation("params need a name"));
    }
    if spec.service_claims.iter().any(|c| c.name.is_empty()) {
        return Err(ApplyError::validation("service claims need a name"));
    }
    Ok(())
}

fn check_dns_label(what: &str, value: &str) -> Result<(), ApplyError> {
    if value.len() > 63 || !DNS1123_LABEL.is_match(value) {
        return Err(ApplyError::validation(format!(
            "invalid workload {} {:?}: must be a lowercase RFC 1123 label (a-z, 0-9, '-', at most 63 characters)",
            what, value
        )));
    }
    Ok(())
}
