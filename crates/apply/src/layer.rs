//! Sparse patches ("layers") that feed the merger.
//!
//! A layer only carries the fields its producer explicitly set; everything
//! else stays `Unset` and does not participate in the merge.

use std::collections::BTreeMap;

use wl_core::{EnvVar, Param, ServiceClaim};

/// Where a layer came from. Ordering is precedence: later variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceLayer {
    Existing,
    File,
    Flags,
}

/// Tri-state scalar patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Unset,
    Set(T),
    /// Explicitly remove the field.
    Clear,
}

impl<T: Clone> Patch<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Patch::Unset)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Patch::Set(_))
    }

    pub fn apply_to(&self, field: &mut Option<T>) {
        match self {
            Patch::Unset => {}
            Patch::Set(v) => *field = Some(v.clone()),
            Patch::Clear => *field = None,
        }
    }

    /// `Set` when present, `Clear` when absent. Used for layers that describe
    /// a field completely (a manifest) rather than sparsely (flags).
    pub fn from_option(v: Option<T>) -> Self {
        match v {
            Some(v) => Patch::Set(v),
            None => Patch::Clear,
        }
    }
}

impl Patch<String> {
    /// Flag convention: an empty value means "remove".
    pub fn from_flag(v: Option<String>) -> Self {
        match v {
            None => Patch::Unset,
            Some(s) if s.is_empty() => Patch::Clear,
            Some(s) => Patch::Set(s),
        }
    }
}

/// Key-wise map patch; `None` marks the key for deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapPatch(pub BTreeMap<String, Option<String>>);

impl MapPatch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), Some(value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), None);
        self
    }

    pub fn apply_to(&self, target: &mut BTreeMap<String, String>) {
        for (k, v) in &self.0 {
            match v {
                Some(v) => {
                    target.insert(k.clone(), v.clone());
                }
                None => {
                    target.remove(k);
                }
            }
        }
    }
}

/// Sequence entries identified by name.
pub trait Named {
    fn entry_name(&self) -> &str;
}

impl Named for EnvVar {
    fn entry_name(&self) -> &str { &self.name }
}

impl Named for Param {
    fn entry_name(&self) -> &str { &self.name }
}

impl Named for ServiceClaim {
    fn entry_name(&self) -> &str { &self.name }
}

/// Named-list patch: upserts override in place or append, removals drop by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPatch<T> {
    pub upserts: Vec<T>,
    pub removals: Vec<String>,
}

impl<T> Default for ListPatch<T> {
    fn default() -> Self {
        Self { upserts: Vec::new(), removals: Vec::new() }
    }
}

impl<T: Named + Clone> ListPatch<T> {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn upsert(&mut self, entry: T) -> &mut Self {
        self.upserts.push(entry);
        self
    }

    pub fn remove(&mut self, name: impl Into<String>) -> &mut Self {
        self.removals.push(name.into());
        self
    }

    pub fn apply_to(&self, target: &mut Vec<T>) {
        for entry in &self.upserts {
            match target.iter_mut().find(|e| e.entry_name() == entry.entry_name()) {
                Some(slot) => *slot = entry.clone(),
                None => target.push(entry.clone()),
            }
        }
        if !self.removals.is_empty() {
            target.retain(|e| !self.removals.iter().any(|r| r == e.entry_name()));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitPatch {
    pub url: Patch<String>,
    pub branch: Patch<String>,
    pub tag: Patch<String>,
    pub commit: Patch<String>,
}

impl GitPatch {
    pub fn is_empty(&self) -> bool {
        self.url.is_unset() && self.branch.is_unset() && self.tag.is_unset() && self.commit.is_unset()
    }

    /// A cleared url drops the git source altogether.
    pub fn removes_git(&self) -> bool {
        matches!(self.url, Patch::Clear)
    }
}

/// One layer's worth of workload fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialWorkload {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub labels: MapPatch,
    pub annotations: MapPatch,
    pub image: Patch<String>,
    pub git: Option<GitPatch>,
    pub source_image: Patch<String>,
    pub sub_path: Patch<String>,
    pub env: ListPatch<EnvVar>,
    pub build_env: ListPatch<EnvVar>,
    pub params: ListPatch<Param>,
    pub service_claims: ListPatch<ServiceClaim>,
    /// Claim name -> namespace of the referenced service (cross-namespace refs).
    pub claim_namespaces: MapPatch,
    pub limits: MapPatch,
    pub requests: MapPatch,
    pub service_account_name: Patch<String>,
}
