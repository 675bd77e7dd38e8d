//! The workloads that may own the Pod mounting a claim
use stackable_operator::{
    k8s_openapi::api::apps::v1::{Deployment, StatefulSet},
    kube::ResourceExt,
};
use std::fmt;
use strum::{Display, EnumString};

/// Replica count Kubernetes assumes when `spec.replicas` is unset
const DEFAULT_REPLICAS: i32 = 1;

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    Pod,
}

/// The workload kinds with a scale subresource
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum ScalableKind {
    Deployment,
    StatefulSet,
}

impl From<ScalableKind> for WorkloadKind {
    fn from(kind: ScalableKind) -> Self {
        match kind {
            ScalableKind::Deployment => WorkloadKind::Deployment,
            ScalableKind::StatefulSet => WorkloadKind::StatefulSet,
        }
    }
}

impl TryFrom<WorkloadKind> for ScalableKind {
    type Error = WorkloadKind;

    fn try_from(kind: WorkloadKind) -> Result<Self, Self::Error> {
        match kind {
            WorkloadKind::Deployment => Ok(ScalableKind::Deployment),
            WorkloadKind::StatefulSet => Ok(ScalableKind::StatefulSet),
            other @ (WorkloadKind::ReplicaSet | WorkloadKind::Pod) => Err(other),
        }
    }
}

/// Identifies a workload by kind, namespace and name
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Capabilities shared by the workload kinds that can be scaled through the scale subresource
pub trait Scalable {
    const KIND: ScalableKind;

    /// The replica count requested in the workload spec
    fn desired_replicas(&self) -> i32;

    fn identity(&self) -> WorkloadRef;
}

fn identity_of<K: ResourceExt>(kind: ScalableKind, object: &K) -> WorkloadRef {
    WorkloadRef::new(
        kind.into(),
        object.namespace().unwrap_or_default(),
        object.name_any(),
    )
}

impl Scalable for Deployment {
    const KIND: ScalableKind = ScalableKind::Deployment;

    fn desired_replicas(&self) -> i32 {
        self.spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(DEFAULT_REPLICAS)
    }

    fn identity(&self) -> WorkloadRef {
        identity_of(Self::KIND, self)
    }
}

impl Scalable for StatefulSet {
    const KIND: ScalableKind = ScalableKind::StatefulSet;

    fn desired_replicas(&self) -> i32 {
        self.spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(DEFAULT_REPLICAS)
    }

    fn identity(&self) -> WorkloadRef {
        identity_of(Self::KIND, self)
    }
}

/// The owner resolved for a claim's mounting Pod
#[derive(Clone, Debug)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    /// A bare Pod or a ReplicaSet without a controlling Deployment, neither of which can be
    /// scaled by this operator
    Unmanaged(WorkloadRef),
}

impl Workload {
    pub fn identity(&self) -> WorkloadRef {
        match self {
            Workload::Deployment(deployment) => deployment.identity(),
            Workload::StatefulSet(stateful_set) => stateful_set.identity(),
            Workload::Unmanaged(workload) => workload.clone(),
        }
    }

    /// The replica count to restore after the workload was scaled down, if it can be scaled at all
    pub fn desired_replicas(&self) -> Option<i32> {
        match self {
            Workload::Deployment(deployment) => Some(deployment.desired_replicas()),
            Workload::StatefulSet(stateful_set) => Some(stateful_set.desired_replicas()),
            Workload::Unmanaged(_) => None,
        }
    }
}
