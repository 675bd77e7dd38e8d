//! In-memory stand-ins for the cluster cache and API
use crate::{
    claim::ClaimKey,
    cluster::{ClusterApi, ClusterCache, ReattachEvent},
    workload::{ScalableKind, WorkloadKind, WorkloadRef},
};
use stackable_operator::{
    k8s_openapi::api::{
        apps::v1::{Deployment, ReplicaSet, StatefulSet},
        core::v1::{PersistentVolumeClaim, Pod},
        storage::v1::StorageClass,
    },
    kube::{self, core::ErrorResponse, ResourceExt},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

#[derive(Default)]
pub struct FakeCache {
    claims: Mutex<Vec<Arc<PersistentVolumeClaim>>>,
    pods: Vec<Arc<Pod>>,
    replica_sets: Vec<Arc<ReplicaSet>>,
    storage_classes: Vec<Arc<StorageClass>>,
}

impl FakeCache {
    pub fn with_claim(self, claim: PersistentVolumeClaim) -> Self {
        self.set_claim(claim);
        self
    }

    pub fn with_pod(mut self, pod: Pod) -> Self {
        self.pods.push(Arc::new(pod));
        self
    }

    pub fn with_replica_set(mut self, replica_set: ReplicaSet) -> Self {
        self.replica_sets.push(Arc::new(replica_set));
        self
    }

    pub fn with_storage_class(
        mut self,
        name: &str,
        provisioner: &str,
        allow_volume_expansion: Option<bool>,
    ) -> Self {
        let mut storage_class: StorageClass = serde_yaml::from_str(&format!(
            r#"
            apiVersion: storage.k8s.io/v1
            kind: StorageClass
            metadata:
              name: {name}
            provisioner: {provisioner}
            "#
        ))
        .expect("illegal test input");
        storage_class.allow_volume_expansion = allow_volume_expansion;
        self.storage_classes.push(Arc::new(storage_class));
        self
    }

    /// Replaces the cached revision of a claim, as the reflector would on a watch event
    pub fn set_claim(&self, claim: PersistentVolumeClaim) {
        let mut claims = self.claims.lock().unwrap();
        claims.retain(|cached| {
            cached.name_any() != claim.name_any() || cached.namespace() != claim.namespace()
        });
        claims.push(Arc::new(claim));
    }
}

impl ClusterCache for FakeCache {
    fn claim(&self, key: &ClaimKey) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims
            .lock()
            .unwrap()
            .iter()
            .find(|claim| {
                claim.name_any() == key.name
                    && claim.namespace().as_deref() == Some(key.namespace.as_str())
            })
            .cloned()
    }

    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>> {
        self.pods
            .iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect()
    }

    fn replica_set(&self, namespace: &str, name: &str) -> Option<Arc<ReplicaSet>> {
        self.replica_sets
            .iter()
            .find(|rs| rs.name_any() == name && rs.namespace().as_deref() == Some(namespace))
            .cloned()
    }

    fn storage_class(&self, name: &str) -> Option<Arc<StorageClass>> {
        self.storage_classes
            .iter()
            .find(|sc| sc.name_any() == name)
            .cloned()
    }
}

/// Records scale calls and events, and fails scale calls on demand
#[derive(Default)]
pub struct FakeApi {
    deployments: Vec<Deployment>,
    stateful_sets: Vec<StatefulSet>,
    scale_failures: Mutex<VecDeque<kube::Error>>,
    pub scale_calls: Mutex<Vec<(WorkloadRef, i32)>>,
    pub events: Mutex<Vec<ReattachEvent>>,
}

impl FakeApi {
    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployments.push(deployment);
        self
    }

    pub fn with_stateful_set(mut self, stateful_set: StatefulSet) -> Self {
        self.stateful_sets.push(stateful_set);
        self
    }

    /// Makes the next scale call fail with `error`
    pub fn fail_next_scale(&self, error: kube::Error) {
        self.scale_failures.lock().unwrap().push_back(error);
    }

    pub fn scale_calls(&self) -> Vec<(WorkloadRef, i32)> {
        self.scale_calls.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<ReattachEvent> {
        self.events.lock().unwrap().clone()
    }
}

fn find_named<K: ResourceExt + Clone>(objects: &[K], namespace: &str, name: &str) -> Option<K> {
    objects
        .iter()
        .find(|object| {
            object.name_any() == name && object.namespace().as_deref() == Some(namespace)
        })
        .cloned()
}

impl ClusterApi for FakeApi {
    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error> {
        Ok(find_named(&self.deployments, namespace, name))
    }

    async fn stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, kube::Error> {
        Ok(find_named(&self.stateful_sets, namespace, name))
    }

    async fn update_scale(
        &self,
        kind: ScalableKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), kube::Error> {
        if let Some(error) = self.scale_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.scale_calls.lock().unwrap().push((
            WorkloadRef::new(WorkloadKind::from(kind), namespace, name),
            replicas,
        ));
        Ok(())
    }

    async fn publish_event(&self, _claim: &PersistentVolumeClaim, event: &ReattachEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn conflict() -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified; please apply your changes to the latest version"
            .to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    })
}

pub fn not_found() -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "deployments.apps \"web\" not found".to_string(),
        reason: "NotFound".to_string(),
        code: 404,
    })
}

/// A controller owner reference, indented to follow `metadata.namespace`
fn owner_references_yaml(owner: Option<(&str, &str)>) -> String {
    owner
        .map(|(kind, owner_name)| {
            format!(
                r#"
              ownerReferences:
                - apiVersion: apps/v1
                  kind: {kind}
                  name: {owner_name}
                  uid: 00000000-0000-0000-0000-000000000000
                  controller: true"#
            )
        })
        .unwrap_or_default()
}

pub fn pod(name: &str, claim_name: &str, owner: Option<(&str, &str)>) -> Pod {
    let owner_references = owner_references_yaml(owner);
    serde_yaml::from_str(&format!(
        r#"
            apiVersion: v1
            kind: Pod
            metadata:
              name: {name}
              namespace: default{owner_references}
            spec:
              containers:
                - name: main
                  image: nginx
              volumes:
                - name: data
                  persistentVolumeClaim:
                    claimName: {claim_name}
            "#
    ))
    .expect("illegal test input")
}

pub fn replica_set(name: &str, owner: Option<(&str, &str)>) -> ReplicaSet {
    let owner_references = owner_references_yaml(owner);
    serde_yaml::from_str(&format!(
        r#"
            apiVersion: apps/v1
            kind: ReplicaSet
            metadata:
              name: {name}
              namespace: default{owner_references}
            spec:
              selector:
                matchLabels:
                  app: {name}
            "#
    ))
    .expect("illegal test input")
}
