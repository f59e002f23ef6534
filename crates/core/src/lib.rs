//! wl core types: the Workload model, its identity, and the traits the
//! apply pipeline uses to talk to a cluster.

#![forbid(unsafe_code)]

pub mod client;
pub mod workload;

pub use client::{ClientError, EventKind, LogTailer, SourcePublisher, TailRequest, WatchEvent, WatchStream, WorkloadClient};
pub use workload::{
    Condition, EnvVar, GitRef, GitSource, Identity, ObjectMeta, Param, ResourceRequirements, ServiceClaim,
    ServiceClaimRef, Source, Workload, WorkloadBuild, WorkloadSpec, WorkloadStatus,
};

pub const API_VERSION: &str = "carto.run/v1alpha1";
pub const KIND: &str = "Workload";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Condition type the control plane uses to report workload health.
pub const READY_CONDITION: &str = "Ready";

/// Label stamped on everything the supply chain creates for a workload.
pub const WORKLOAD_NAME_LABEL: &str = "carto.run/workload-name";
pub const WORKLOAD_TYPE_LABEL: &str = "apps.tanzu.vmware.com/workload-type";
pub const APP_PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const SERVICE_CLAIMS_ANNOTATION: &str = "serviceclaims.supplychain.apps.x-tanzu.vmware.com/extensions";

pub mod prelude {
    pub use super::{ClientError, Identity, Workload, WorkloadClient, READY_CONDITION};
}
