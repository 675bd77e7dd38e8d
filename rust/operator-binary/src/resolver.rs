//! Finds the workload owning the single Pod that mounts a claim
use crate::{
    cluster::{ClusterApi, ClusterCache},
    workload::{Workload, WorkloadKind, WorkloadRef},
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::OwnerReference,
    },
    kube::{self, Resource, ResourceExt},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("ReplicaSet {namespace}/{name} owning the mounting Pod is not cached yet"))]
    ReplicaSetNotCached { namespace: String, name: String },
    #[snafu(display("failed to fetch Deployment {namespace}/{name}"))]
    FetchDeployment {
        source: kube::Error,
        namespace: String,
        name: String,
    },
    #[snafu(display("failed to fetch StatefulSet {namespace}/{name}"))]
    FetchStatefulSet {
        source: kube::Error,
        namespace: String,
        name: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Resolves the workload of the claim `claim_name` in `namespace`.
///
/// Returns `Ok(None)` whenever there is nothing safe to act on: the claim is mounted by no Pod
/// or by several, the owner kind is unknown, or the workload disappeared.
pub async fn resolve(
    cache: &impl ClusterCache,
    api: &impl ClusterApi,
    claim_name: &str,
    namespace: &str,
) -> Result<Option<Workload>> {
    let mounting_pods = cache
        .pods(namespace)
        .into_iter()
        .filter(|pod| mounts_claim(pod, claim_name))
        .collect::<Vec<_>>();
    let [pod] = mounting_pods.as_slice() else {
        tracing::debug!(
            claim = claim_name,
            namespace,
            mounting_pods = mounting_pods.len(),
            "claim is not mounted by exactly one Pod, skipping"
        );
        return Ok(None);
    };

    let Some(owner) = resolve_owner(cache, pod, namespace)? else {
        return Ok(None);
    };
    tracing::debug!(
        claim = claim_name,
        %owner,
        pod = %pod.name_any(),
        "resolved owner of mounting Pod"
    );

    match owner.kind {
        WorkloadKind::Deployment => Ok(api
            .deployment(namespace, &owner.name)
            .await
            .with_context(|_| FetchDeploymentSnafu {
                namespace,
                name: owner.name.clone(),
            })?
            .map(Workload::Deployment)),
        WorkloadKind::StatefulSet => Ok(api
            .stateful_set(namespace, &owner.name)
            .await
            .with_context(|_| FetchStatefulSetSnafu {
                namespace,
                name: owner.name.clone(),
            })?
            .map(Workload::StatefulSet)),
        WorkloadKind::ReplicaSet | WorkloadKind::Pod => Ok(Some(Workload::Unmanaged(owner))),
    }
}

fn mounts_claim(pod: &Pod, claim_name: &str) -> bool {
    pod.spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .any(|source| source.claim_name == claim_name)
}

fn controller_of<K: Resource>(object: &K) -> Option<&OwnerReference> {
    object
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
}

/// Walks the controller owner references of the Pod up to the workload
fn resolve_owner(
    cache: &impl ClusterCache,
    pod: &Pod,
    namespace: &str,
) -> Result<Option<WorkloadRef>> {
    let Some(owner) = controller_of(pod) else {
        return Ok(Some(WorkloadRef::new(
            WorkloadKind::Pod,
            namespace,
            pod.name_any(),
        )));
    };

    match owner.kind.parse::<WorkloadKind>() {
        Ok(WorkloadKind::StatefulSet) => Ok(Some(WorkloadRef::new(
            WorkloadKind::StatefulSet,
            namespace,
            &owner.name,
        ))),
        Ok(WorkloadKind::ReplicaSet) => {
            let replica_set = cache
                .replica_set(namespace, &owner.name)
                .with_context(|| ReplicaSetNotCachedSnafu {
                    namespace,
                    name: owner.name.clone(),
                })?;
            match controller_of(replica_set.as_ref()) {
                None => Ok(Some(WorkloadRef::new(
                    WorkloadKind::ReplicaSet,
                    namespace,
                    replica_set.name_any(),
                ))),
                Some(rs_owner) if rs_owner.kind == WorkloadKind::Deployment.to_string() => {
                    Ok(Some(WorkloadRef::new(
                        WorkloadKind::Deployment,
                        namespace,
                        &rs_owner.name,
                    )))
                }
                Some(rs_owner) => {
                    tracing::debug!(
                        replica_set = %replica_set.name_any(),
                        owner_kind = %rs_owner.kind,
                        "ReplicaSet is controlled by an unsupported kind"
                    );
                    Ok(None)
                }
            }
        }
        _ => {
            tracing::debug!(
                pod = %pod.name_any(),
                owner_kind = %owner.kind,
                "Pod is controlled by an unsupported kind"
            );
            Ok(None)
        }
    }
}
