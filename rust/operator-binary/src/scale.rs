//! Scales the resolved workload through its scale subresource
use crate::{
    cluster::ClusterApi,
    workload::{Scalable, ScalableKind, Workload, WorkloadRef},
};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::apps::v1::{Deployment, StatefulSet},
    kube,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("{workload} has no scale subresource"))]
    UnsupportedWorkloadKind { workload: WorkloadRef },
    #[snafu(display("failed to scale {workload} to {replicas} replicas"))]
    UpdateScale {
        source: kube::Error,
        workload: WorkloadRef,
        replicas: i32,
    },
}

/// What a scale call found on the cluster
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scaled {
    Applied,
    /// The workload was deleted in the meantime
    WorkloadGone,
}

/// Sets the replica count of `workload` to `replicas`.
///
/// Only the replica count is written, concurrent edits to the rest of the workload spec are kept.
pub async fn scale_to(
    api: &impl ClusterApi,
    workload: &Workload,
    replicas: i32,
) -> Result<Scaled, Error> {
    match workload {
        Workload::Deployment(deployment) => scale::<Deployment>(api, deployment, replicas).await,
        Workload::StatefulSet(stateful_set) => {
            scale::<StatefulSet>(api, stateful_set, replicas).await
        }
        Workload::Unmanaged(workload) => UnsupportedWorkloadKindSnafu {
            workload: workload.clone(),
        }
        .fail(),
    }
}

async fn scale<K: Scalable>(
    api: &impl ClusterApi,
    object: &K,
    replicas: i32,
) -> Result<Scaled, Error> {
    let workload = object.identity();
    scale_ref(api, K::KIND, &workload, replicas).await
}

/// Like [`scale_to`], for a workload that is only known by reference
pub async fn scale_ref(
    api: &impl ClusterApi,
    kind: ScalableKind,
    workload: &WorkloadRef,
    replicas: i32,
) -> Result<Scaled, Error> {
    tracing::info!(%workload, replicas, "scaling workload");
    match api
        .update_scale(kind, &workload.namespace, &workload.name, replicas)
        .await
    {
        Ok(()) => Ok(Scaled::Applied),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            tracing::info!(%workload, "workload no longer exists, nothing to scale");
            Ok(Scaled::WorkloadGone)
        }
        Err(source) => Err(source).with_context(|_| UpdateScaleSnafu {
            workload: workload.clone(),
            replicas,
        }),
    }
}
