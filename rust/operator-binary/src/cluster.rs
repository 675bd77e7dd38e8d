//! Access to cluster state: the locally cached view maintained by reflectors, and the live API
//! used for workload reads, scale writes and Kubernetes events.
use crate::{
    claim::ClaimKey,
    workload::{ScalableKind, WorkloadRef},
};
use serde_json::json;
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, ReplicaSet, StatefulSet},
            core::v1::{PersistentVolumeClaim, Pod},
            storage::v1::StorageClass,
        },
        NamespaceResourceScope,
    },
    kube::{
        self,
        api::{Patch, PatchParams},
        runtime::{
            events::{Event, EventType, Recorder, Reporter},
            reflector::{ObjectRef, Store},
        },
        Api, Client, Resource, ResourceExt,
    },
};
use std::{fmt::Debug, future::Future, sync::Arc};

/// Read-only, eventually consistent view of the objects the controller inspects
pub trait ClusterCache: Send + Sync {
    fn claim(&self, key: &ClaimKey) -> Option<Arc<PersistentVolumeClaim>>;

    /// All Pods in `namespace`
    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>>;

    fn replica_set(&self, namespace: &str, name: &str) -> Option<Arc<ReplicaSet>>;

    fn storage_class(&self, name: &str) -> Option<Arc<StorageClass>>;
}

/// Calls against the API server
///
/// Reads return `Ok(None)` when the object does not exist.
pub trait ClusterApi: Send + Sync {
    fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Deployment>, kube::Error>> + Send;

    fn stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<StatefulSet>, kube::Error>> + Send;

    /// Sets the replica count through the scale subresource, leaving the rest of the spec alone
    fn update_scale(
        &self,
        kind: ScalableKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Publishes a Kubernetes event on the claim, failures are only logged
    fn publish_event(
        &self,
        claim: &PersistentVolumeClaim,
        event: &ReattachEvent,
    ) -> impl Future<Output = ()> + Send;
}

/// Progress of a reattach cycle, reported as Kubernetes events on the claim
#[derive(Clone, Debug, PartialEq)]
pub enum ReattachEvent {
    ScaledDown { workload: WorkloadRef },
    ResizeAwaitTimedOut { attempts: u32 },
    ScaledUp { workload: WorkloadRef, replicas: i32 },
}

impl ReattachEvent {
    fn to_event(&self) -> Event {
        let (type_, reason, note) = match self {
            ReattachEvent::ScaledDown { workload } => (
                EventType::Normal,
                "ScaledDown",
                format!("scaled {workload} to 0 replicas to detach the expanded volume"),
            ),
            ReattachEvent::ResizeAwaitTimedOut { attempts } => (
                EventType::Warning,
                "ResizeAwaitTimedOut",
                format!(
                    "filesystem resize was not pending after {attempts} checks, \
                     restoring the workload anyway"
                ),
            ),
            ReattachEvent::ScaledUp { workload, replicas } => (
                EventType::Normal,
                "ScaledUp",
                format!("scaled {workload} back to {replicas} replicas"),
            ),
        };
        Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reattach".to_string(),
            secondary: None,
        }
    }
}

/// [`ClusterCache`] backed by reflector stores
#[derive(Clone)]
pub struct StoreCache {
    pub claims: Store<PersistentVolumeClaim>,
    pub pods: Store<Pod>,
    pub replica_sets: Store<ReplicaSet>,
    pub storage_classes: Store<StorageClass>,
}

impl ClusterCache for StoreCache {
    fn claim(&self, key: &ClaimKey) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .collect()
    }

    fn replica_set(&self, namespace: &str, name: &str) -> Option<Arc<ReplicaSet>> {
        self.replica_sets
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn storage_class(&self, name: &str) -> Option<Arc<StorageClass>> {
        self.storage_classes.get(&ObjectRef::new(name))
    }
}

/// [`ClusterApi`] talking to the API server
pub struct KubeApi {
    client: Client,
    field_manager: String,
    recorder: Recorder,
}

impl KubeApi {
    pub fn new(client: Client, field_manager: &str, controller_name: &str) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: controller_name.to_string(),
                instance: None,
            },
        );
        Self {
            client,
            field_manager: field_manager.to_string(),
            recorder,
        }
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + serde::de::DeserializeOwned,
    {
        Api::<K>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn patch_scale<K>(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + serde::de::DeserializeOwned,
    {
        let patch = json!({ "spec": { "replicas": replicas } });
        Api::<K>::namespaced(self.client.clone(), namespace)
            .patch_scale(
                name,
                &PatchParams {
                    field_manager: Some(self.field_manager.clone()),
                    ..PatchParams::default()
                },
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

impl ClusterApi for KubeApi {
    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error> {
        self.get_opt(namespace, name).await
    }

    async fn stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, kube::Error> {
        self.get_opt(namespace, name).await
    }

    async fn update_scale(
        &self,
        kind: ScalableKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), kube::Error> {
        match kind {
            ScalableKind::Deployment => {
                self.patch_scale::<Deployment>(namespace, name, replicas)
                    .await
            }
            ScalableKind::StatefulSet => {
                self.patch_scale::<StatefulSet>(namespace, name, replicas)
                    .await
            }
        }
    }

    async fn publish_event(&self, claim: &PersistentVolumeClaim, event: &ReattachEvent) {
        let reference = claim.object_ref(&());
        if let Err(error) = self.recorder.publish(&event.to_event(), &reference).await {
            tracing::warn!(
                claim = %claim.name_any(),
                error = &error as &dyn std::error::Error,
                "failed to publish event"
            );
        }
    }
}
