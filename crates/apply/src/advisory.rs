//! Advisory checks: warnings printed before the diff. They never block an apply.

use wl_core::Workload;

use crate::merge::ServiceClaimsExtension;

pub trait Advisory: Send + Sync {
    fn check(&self, existing: Option<&Workload>, target: &Workload) -> Option<String>;
}

/// Warns when the target introduces or changes cross-namespace service claims.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossNamespaceClaims;

impl Advisory for CrossNamespaceClaims {
    fn check(&self, existing: Option<&Workload>, target: &Workload) -> Option<String> {
        let after = ServiceClaimsExtension::from_annotations(&target.metadata.annotations).ok().flatten()?;
        if after.spec.service_claims.is_empty() {
            return None;
        }
        let before = existing.and_then(|e| ServiceClaimsExtension::from_annotations(&e.metadata.annotations).ok().flatten());
        if before.as_ref() == Some(&after) {
            return None;
        }
        Some("Cross namespace service claims are deprecated. Please use `tanzu service claim create` instead.".to_string())
    }
}

pub fn default_advisories() -> Vec<Box<dyn Advisory>> {
    vec![Box::new(CrossNamespaceClaims)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use wl_core::{Identity, SERVICE_CLAIMS_ANNOTATION};

    const CLAIMS: &str = r#"{"kind":"ServiceClaimsExtension","apiVersion":"supplychain.apps.x-tanzu.vmware.com/v1alpha1","spec":{"serviceClaims":{"database":{"namespace":"my-prod-ns"}}}}"#;

    fn with_claims(raw: Option<&str>) -> Workload {
        let mut w = Workload::new(&Identity::new("default", "my-workload"));
        if let Some(raw) = raw {
            w.metadata.annotations.insert(SERVICE_CLAIMS_ANNOTATION.into(), raw.into());
        }
        w
    }

    #[test]
    fn warns_on_new_cross_namespace_claim() {
        let msg = CrossNamespaceClaims.check(None, &with_claims(Some(CLAIMS))).unwrap();
        assert!(msg.starts_with("Cross namespace service claims are deprecated"));
        assert!(CrossNamespaceClaims.check(Some(&with_claims(None)), &with_claims(Some(CLAIMS))).is_some());
    }

    #[test]
    fn silent_when_unchanged_or_absent() {
        assert!(CrossNamespaceClaims.check(Some(&with_claims(Some(CLAIMS))), &with_claims(Some(CLAIMS))).is_none());
        assert!(CrossNamespaceClaims.check(None, &with_claims(None)).is_none());
    }
}
