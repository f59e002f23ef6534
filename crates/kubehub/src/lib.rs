//! wl kubehub: `WorkloadClient` over kube-rs.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use tracing::{debug, info};
use wl_core::{ClientError, EventKind, Identity, WatchEvent, WatchStream, Workload, WorkloadClient};

pub const GROUP: &str = "carto.run";
pub const VERSION: &str = "v1alpha1";
pub const PLURAL: &str = "workloads";

/// Client from the ambient kubeconfig or in-cluster environment.
pub async fn kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig")
}

/// Static resource description; avoids a discovery round-trip.
pub fn workload_resource() -> ApiResource {
    let gvk = GroupVersionKind { group: GROUP.into(), version: VERSION.into(), kind: wl_core::KIND.into() };
    ApiResource::from_gvk_with_plural(&gvk, PLURAL)
}

#[derive(Clone)]
pub struct KubeWorkloadClient {
    client: Client,
    ar: ApiResource,
}

impl KubeWorkloadClient {
    pub fn new(client: Client) -> Self {
        Self { client, ar: workload_resource() }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(kube_client().await?))
    }

    /// Namespace of the current kubeconfig context.
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.ar)
    }
}

fn identity_of(w: &Workload) -> Result<Identity, ClientError> {
    w.identity()
        .ok_or_else(|| ClientError::Other(anyhow::anyhow!("workload is missing metadata.name or metadata.namespace")))
}

pub fn to_dynamic(w: &Workload) -> Result<DynamicObject> {
    let v = serde_json::to_value(w).context("serializing workload")?;
    serde_json::from_value(v).context("converting workload to DynamicObject")
}

pub fn from_dynamic(obj: &DynamicObject) -> Result<Workload> {
    let v = serde_json::to_value(obj).context("serializing DynamicObject")?;
    serde_json::from_value(v).context("decoding workload")
}

/// 404 and 409 get their own variants; the rest pass through with context.
pub fn map_kube_err(e: kube::Error, id: &Identity, op: &str) -> ClientError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(id.clone()),
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(ae.message),
        other => ClientError::Other(anyhow::Error::new(other).context(format!("{} workload {}", op, id))),
    }
}

fn convert_event(ev: Result<Event<DynamicObject>, watcher::Error>, id: &Identity) -> Vec<Result<WatchEvent, ClientError>> {
    let one = |kind: EventKind, o: &DynamicObject| -> Result<WatchEvent, ClientError> {
        let object = from_dynamic(o).map_err(ClientError::Other)?;
        Ok(WatchEvent { kind, object: Some(object), message: None })
    };
    match ev {
        Ok(Event::Applied(o)) => vec![one(EventKind::Modified, &o)],
        Ok(Event::Deleted(o)) => vec![one(EventKind::Deleted, &o)],
        Ok(Event::Restarted(list)) => {
            debug!(workload = %id, count = list.len(), "watch restarted");
            list.iter().map(|o| one(EventKind::Added, o)).collect()
        }
        Err(e) => vec![Ok(WatchEvent::error(e.to_string()))],
    }
}

#[async_trait::async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get(&self, id: &Identity) -> Result<Workload, ClientError> {
        let obj = self.api(&id.namespace).get(&id.name).await.map_err(|e| map_kube_err(e, id, "getting"))?;
        from_dynamic(&obj).map_err(ClientError::Other)
    }

    async fn create(&self, workload: &Workload) -> Result<Workload, ClientError> {
        let id = identity_of(workload)?;
        let obj = to_dynamic(workload)?;
        let created = self
            .api(&id.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, &id, "creating"))?;
        info!(workload = %id, rv = ?created.metadata.resource_version, "workload created");
        from_dynamic(&created).map_err(ClientError::Other)
    }

    async fn update(&self, workload: &Workload) -> Result<Workload, ClientError> {
        let id = identity_of(workload)?;
        let obj = to_dynamic(workload)?;
        let updated = self
            .api(&id.namespace)
            .replace(&id.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, &id, "updating"))?;
        info!(workload = %id, rv = ?updated.metadata.resource_version, "workload updated");
        from_dynamic(&updated).map_err(ClientError::Other)
    }

    async fn watch(&self, id: &Identity) -> Result<WatchStream, ClientError> {
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", id.name));
        let owned = id.clone();
        let events = watcher::watcher(self.api(&id.namespace), cfg)
            .flat_map(move |ev| stream::iter(convert_event(ev, &owned)));
        info!(workload = %id, "watch started");
        Ok(events.boxed())
    }
}
