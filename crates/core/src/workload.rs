//! Workload resource model (`carto.run/v1alpha1`, kind `Workload`).
//!
//! Only the fields the apply pipeline merges are typed. Everything else the
//! server returns rides along in the flattened `extra` maps so an update never
//! drops fields this client does not know about.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;

use crate::{API_VERSION, KIND, WORKLOAD_NAME_LABEL};

/// Namespace + name. Assigned once per pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Label selector matching the pods the supply chain runs for this workload.
    pub fn selector(&self) -> String {
        format!("{}={}", WORKLOAD_NAME_LABEL, self.name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn default_api_version() -> String { API_VERSION.to_string() }
fn default_kind() -> String { KIND.to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkloadSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkloadStatus>,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::default(),
            spec: WorkloadSpec::default(),
            status: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Optimistic-concurrency token; updates are rejected when it is stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<WorkloadBuild>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_claims: Vec<ServiceClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    /// Pre-built source bundle image (as opposed to `spec.image`, a runnable image).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

impl Source {
    pub fn has_origin(&self) -> bool {
        self.git.is_some() || self.image.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    #[serde(default)]
    pub url: String,
    #[serde(rename = "ref", default)]
    pub git_ref: GitRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl GitRef {
    pub fn is_empty(&self) -> bool {
        self.branch.is_none() && self.tag.is_none() && self.commit.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub value: Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<Json>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: Some(value.into()), value_from: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadBuild {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, deserialize_with = "quantity_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "quantity_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.requests.is_empty()
    }
}

// Quantities show up as `cpu: 1` as often as `cpu: 500m`.
fn quantity_map<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<BTreeMap<String, String>, D::Error> {
    let raw = Option::<BTreeMap<String, Json>>::deserialize(d)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                Json::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaim {
    pub name: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ServiceClaimRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClaimRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True", "False" or "Unknown".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn is_true(&self) -> bool { self.status.eq_ignore_ascii_case("true") }
    pub fn is_false(&self) -> bool { self.status.eq_ignore_ascii_case("false") }
}

impl Workload {
    /// Blank workload carrying only an identity.
    pub fn new(id: &Identity) -> Self {
        let mut w = Self::default();
        w.metadata.name = Some(id.name.clone());
        w.metadata.namespace = Some(id.namespace.clone());
        w
    }

    pub fn identity(&self) -> Option<Identity> {
        match (&self.metadata.namespace, &self.metadata.name) {
            (Some(ns), Some(name)) => Some(Identity::new(ns.clone(), name.clone())),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status.as_ref()?.conditions.iter().find(|c| c.condition_type == condition_type)
    }

    /// False while `status.observedGeneration` lags `metadata.generation`,
    /// i.e. the conditions describe an older spec.
    pub fn status_is_current(&self) -> bool {
        let generation = self.metadata.extra.get("generation").and_then(Json::as_i64);
        let observed = self.status.as_ref().and_then(|s| s.extra.get("observedGeneration")).and_then(Json::as_i64);
        match (generation, observed) {
            (Some(g), Some(o)) => o >= g,
            _ => true,
        }
    }

    /// Stable text form used for diffing: sorted keys, server-populated fields removed.
    pub fn canonical_yaml(&self) -> Result<String> {
        let mut v = serde_json::to_value(self).context("serializing workload")?;
        strip_noisy(&mut v);
        render_yaml(sort_keys(v))
    }

    /// Full YAML of the object as it would be submitted (dry-run output).
    pub fn manifest_yaml(&self) -> Result<String> {
        let mut v = serde_json::to_value(self).context("serializing workload")?;
        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
        render_yaml(sort_keys(v))
    }
}

fn strip_noisy(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
        meta.remove("selfLink");
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
}

// serde_json may be built with `preserve_order`; rebuild maps in key order either way.
fn sort_keys(v: Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut entries: Vec<(String, Json)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Json::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Json::Array(items) => Json::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

fn render_yaml(v: Json) -> Result<String> {
    let body = serde_yaml::to_string(&v).context("rendering workload yaml")?;
    Ok(format!("---\n{}", body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_yaml_prunes_server_fields() {
        let w: Workload = serde_json::from_value(serde_json::json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "1d6c6b3a-0000-0000-0000-000000000000",
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "spec": { "image": "ubuntu:bionic" },
            "status": { "conditions": [ {"type": "Ready", "status": "True"} ] }
        }))
        .unwrap();
        let yaml = w.canonical_yaml().unwrap();
        assert_eq!(
            yaml,
            "---\napiVersion: carto.run/v1alpha1\nkind: Workload\nmetadata:\n  name: x\n  namespace: ns\nspec:\n  image: ubuntu:bionic\n"
        );
    }

    #[test]
    fn canonical_yaml_sorts_keys_and_keeps_unknown_fields() {
        let mut w = Workload::new(&Identity::new("default", "app"));
        w.metadata.labels.insert("zeta".into(), "1".into());
        w.metadata.labels.insert("alpha".into(), "2".into());
        w.spec.extra.insert("customField".into(), Json::Bool(true));
        w.spec.env.push(EnvVar::new("A", "1"));
        let yaml = w.canonical_yaml().unwrap();
        let alpha = yaml.find("alpha").unwrap();
        let zeta = yaml.find("zeta").unwrap();
        assert!(alpha < zeta, "labels not sorted:\n{}", yaml);
        assert!(yaml.contains("  customField: true\n"), "{}", yaml);
        assert!(yaml.contains("  env:\n  - name: A\n    value: '1'\n"), "{}", yaml);
    }

    #[test]
    fn manifest_yaml_keeps_resource_version() {
        let mut w = Workload::new(&Identity::new("default", "app"));
        w.metadata.resource_version = Some("999".into());
        let yaml = w.manifest_yaml().unwrap();
        assert!(yaml.contains("resourceVersion: '999'"), "{}", yaml);
    }

    #[test]
    fn numeric_quantities_deserialize_as_strings() {
        let w: Workload = serde_yaml::from_str(
            "apiVersion: carto.run/v1alpha1\nkind: Workload\nmetadata:\n  name: a\nspec:\n  resources:\n    limits:\n      cpu: 1\n      memory: 1Gi\n",
        )
        .unwrap();
        let res = w.spec.resources.unwrap();
        assert_eq!(res.limits.get("cpu").map(String::as_str), Some("1"));
        assert_eq!(res.limits.get("memory").map(String::as_str), Some("1Gi"));
    }

    #[test]
    fn ready_condition_lookup() {
        let mut w = Workload::default();
        assert!(w.condition(crate::READY_CONDITION).is_none());
        w.status = Some(WorkloadStatus {
            conditions: vec![Condition { condition_type: "Ready".into(), status: "False".into(), ..Default::default() }],
            ..Default::default()
        });
        let c = w.condition(crate::READY_CONDITION).unwrap();
        assert!(c.is_false());
        assert!(!c.is_true());
    }

    #[test]
    fn identity_requires_name_and_namespace() {
        let mut w = Workload::default();
        w.metadata.name = Some("a".into());
        assert!(w.identity().is_none());
        w.metadata.namespace = Some("ns".into());
        assert_eq!(w.identity().unwrap().to_string(), "ns/a");
        assert_eq!(w.identity().unwrap().selector(), "carto.run/workload-name=a");
    }
}
