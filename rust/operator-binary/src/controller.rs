//! Scales the workload of an expanded [`PersistentVolumeClaim`] down and back up, so the volume is
//! reattached and the grown filesystem becomes visible to the Pod
use crate::{
    claim::{self, ClaimKey},
    cluster::{ClusterApi, ClusterCache, KubeApi, ReattachEvent, StoreCache},
    config::ReattachConfig,
    eligibility::{check_candidacy, should_enqueue, Candidacy, ClaimChange, ClaimChangeTracker},
    resolver,
    retry::{self, RequeueBackoff},
    scale::{self, Scaled},
    workload::{ScalableKind, WorkloadRef},
    OPERATOR_NAME,
};
use futures::{channel::mpsc, future, Stream, StreamExt};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::ReplicaSet,
            core::v1::{PersistentVolumeClaim, Pod},
            storage::v1::StorageClass,
        },
        NamespaceResourceScope,
    },
    kube::{
        self,
        runtime::{
            controller::{self, Action},
            reflector,
            reflector::{store::WriterDropped, ObjectRef},
            watcher, WatchStreamExt,
        },
        Api, Resource, ResourceExt,
    },
    logging::controller::ReconcilerError,
    namespace::WatchNamespace,
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use strum::EnumDiscriminants;

pub const CONTROLLER_NAME: &str = "volumereattach";

/// Replica count to restore once an interrupted cycle is retried
#[derive(Clone, Debug, PartialEq)]
struct PendingRestore {
    /// Only the claim revision that started the cycle may finish it
    claim_uid: Option<String>,
    kind: ScalableKind,
    workload: WorkloadRef,
    replicas: i32,
}

pub struct Ctx<C, A> {
    pub cache: C,
    pub api: A,
    pub config: ReattachConfig,
    requeue_backoff: RequeueBackoff<ClaimKey>,
    pending_restores: Mutex<HashMap<ClaimKey, PendingRestore>>,
}

impl<C, A> Ctx<C, A> {
    pub fn new(cache: C, api: A, config: ReattachConfig) -> Self {
        let requeue_backoff =
            RequeueBackoff::new(config.requeue_base_delay, config.requeue_max_delay);
        Self {
            cache,
            api,
            config,
            requeue_backoff,
            pending_restores: Mutex::new(HashMap::new()),
        }
    }

    fn pending_restore(&self, key: &ClaimKey) -> Option<PendingRestore> {
        self.pending_restores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember_restore(&self, key: &ClaimKey, restore: PendingRestore) {
        self.pending_restores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), restore);
    }

    fn forget_restore(&self, key: &ClaimKey) {
        self.pending_restores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drops all state kept for a deleted claim
    fn forget_claim(&self, key: &ClaimKey) {
        self.forget_restore(key);
        self.requeue_backoff.forget(key);
    }
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(strum::IntoStaticStr))]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace { source: claim::NoNamespaceError },
    #[snafu(display("failed to resolve the workload mounting {claim}"))]
    ResolveWorkload {
        source: resolver::Error,
        claim: ClaimKey,
    },
    #[snafu(display("failed to scale down the workload mounting {claim}"))]
    ScaleDown { source: scale::Error, claim: ClaimKey },
    #[snafu(display("failed to scale up the workload mounting {claim}"))]
    ScaleUp { source: scale::Error, claim: ClaimKey },
    #[snafu(display("failed to restore the replicas of {workload} after an interrupted reattach"))]
    RestoreReplicas {
        source: scale::Error,
        workload: WorkloadRef,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_claim<C, A>(
    claim: Arc<PersistentVolumeClaim>,
    ctx: Arc<Ctx<C, A>>,
) -> Result<Action>
where
    C: ClusterCache,
    A: ClusterApi,
{
    let key = ClaimKey::from_claim(&claim).context(ObjectHasNoNamespaceSnafu)?;
    tracing::info!(claim = %key, "Starting reconcile");

    reconcile_key(&key, &ctx).await?;
    ctx.requeue_backoff.forget(&key);

    // Status updates of the claim are not triggers, only a fresh size increase is
    Ok(Action::await_change())
}

async fn reconcile_key<C, A>(key: &ClaimKey, ctx: &Ctx<C, A>) -> Result<()>
where
    C: ClusterCache,
    A: ClusterApi,
{
    let Some(claim) = ctx.cache.claim(key) else {
        tracing::debug!(claim = %key, "claim no longer exists");
        return Ok(());
    };

    match ctx.pending_restore(key) {
        Some(restore) if restore.claim_uid.as_deref() == claim.uid().as_deref() => {
            tracing::info!(
                claim = %key,
                workload = %restore.workload,
                replicas = restore.replicas,
                "restoring workload left scaled down by an earlier attempt"
            );
            let scaled =
                scale::scale_ref(&ctx.api, restore.kind, &restore.workload, restore.replicas)
                    .await
                    .with_context(|_| RestoreReplicasSnafu {
                        workload: restore.workload.clone(),
                    })?;
            ctx.forget_restore(key);
            if scaled == Scaled::Applied {
                ctx.api
                    .publish_event(
                        &claim,
                        &ReattachEvent::ScaledUp {
                            workload: restore.workload,
                            replicas: restore.replicas,
                        },
                    )
                    .await;
            }
            return Ok(());
        }
        Some(restore) => {
            tracing::debug!(
                claim = %key,
                workload = %restore.workload,
                "discarding restore recorded for an earlier claim of the same name"
            );
            ctx.forget_restore(key);
        }
        None => {}
    }

    let candidacy = check_candidacy(&claim, &ctx.cache, &ctx.config.supported_provisioners);
    if candidacy != Candidacy::Candidate {
        tracing::debug!(claim = %key, %candidacy, "claim is not reattached");
        return Ok(());
    }
    if let (Some(requested), Some(capacity)) = (
        claim::requested_size(&claim),
        claim::reported_capacity(&claim),
    ) {
        tracing::info!(claim = %key, %requested, %capacity, "claim is being expanded");
    }

    let Some(workload) = resolver::resolve(&ctx.cache, &ctx.api, &key.name, &key.namespace)
        .await
        .with_context(|_| ResolveWorkloadSnafu { claim: key.clone() })?
    else {
        return Ok(());
    };
    let identity = workload.identity();
    let (Ok(kind), Some(replicas)) = (
        ScalableKind::try_from(identity.kind),
        workload.desired_replicas(),
    ) else {
        tracing::info!(
            claim = %key,
            workload = %identity,
            "workload cannot be scaled, the Pod has to be recreated manually"
        );
        return Ok(());
    };

    let scaled = scale::scale_to(&ctx.api, &workload, 0)
        .await
        .with_context(|_| ScaleDownSnafu { claim: key.clone() })?;
    if scaled == Scaled::WorkloadGone {
        return Ok(());
    }
    ctx.remember_restore(
        key,
        PendingRestore {
            claim_uid: claim.uid(),
            kind,
            workload: identity.clone(),
            replicas,
        },
    );
    ctx.api
        .publish_event(
            &claim,
            &ReattachEvent::ScaledDown {
                workload: identity.clone(),
            },
        )
        .await;

    let resize_pending = retry::poll_until(&ctx.config.resize_poll, || {
        ctx.cache
            .claim(key)
            .is_some_and(|current| claim::is_resize_pending(&current))
    })
    .await;
    match resize_pending {
        Ok(attempts) => {
            tracing::debug!(claim = %key, attempts, "filesystem resize is pending");
        }
        Err(timeout) => {
            tracing::warn!(
                claim = %key,
                attempts = timeout.attempts,
                "filesystem resize did not become pending, scaling up anyway"
            );
            ctx.api
                .publish_event(
                    &claim,
                    &ReattachEvent::ResizeAwaitTimedOut {
                        attempts: timeout.attempts,
                    },
                )
                .await;
        }
    }

    let scaled = scale::scale_ref(&ctx.api, kind, &identity, replicas)
        .await
        .with_context(|_| ScaleUpSnafu { claim: key.clone() })?;
    ctx.forget_restore(key);
    if scaled == Scaled::WorkloadGone {
        return Ok(());
    }
    ctx.api
        .publish_event(
            &claim,
            &ReattachEvent::ScaledUp {
                workload: identity,
                replicas,
            },
        )
        .await;
    Ok(())
}

/// Feeds a claim watch event through `tracker` and returns the claims to queue.
///
/// Deleted claims also drop the restore and backoff state kept for them, the queue never hands a
/// claim that is gone to the reconciler.
fn triggers_for<C, A>(
    tracker: &mut ClaimChangeTracker,
    event: watcher::Event<PersistentVolumeClaim>,
    ctx: &Ctx<C, A>,
) -> Vec<ObjectRef<PersistentVolumeClaim>> {
    let mut triggers = Vec::new();
    for change in tracker.observe(event) {
        if let ClaimChange::Deleted(claim) = &change {
            if let Ok(key) = ClaimKey::from_claim(claim) {
                ctx.forget_claim(&key);
            }
        }
        if should_enqueue(&change) {
            triggers.push(ObjectRef::from_obj(change.latest()));
        }
    }
    triggers
}

pub fn error_policy<C, A>(
    claim: Arc<PersistentVolumeClaim>,
    _error: &Error,
    ctx: Arc<Ctx<C, A>>,
) -> Action {
    match ClaimKey::from_claim(&claim) {
        Ok(key) => {
            let delay = ctx.requeue_backoff.next_delay(&key);
            tracing::debug!(
                claim = %key,
                failures = ctx.requeue_backoff.failures(&key),
                ?delay,
                "requeueing claim"
            );
            Action::requeue(delay)
        }
        Err(_) => Action::await_change(),
    }
}

#[derive(Snafu, Debug)]
pub enum RunError {
    #[snafu(display("the {cache} cache stopped before its initial sync"))]
    CacheSync {
        source: WriterDropped,
        cache: &'static str,
    },
}

/// Owns the caches and the claim queue, and runs the reconcile workers
pub struct ResizeController {
    client: kube::Client,
    config: ReattachConfig,
    namespace: WatchNamespace,
}

impl ResizeController {
    pub fn new(client: kube::Client, config: ReattachConfig, namespace: WatchNamespace) -> Self {
        Self {
            client,
            config,
            namespace,
        }
    }

    /// Runs with the configured number of workers until `shutdown` resolves
    pub async fn start(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), RunError> {
        let workers = self.config.workers;
        self.run(workers, shutdown).await
    }

    /// Runs `workers` concurrent reconciles until `shutdown` resolves.
    ///
    /// Once it does no further claims are taken off the queue and in-flight reconciles finish.
    pub async fn run(
        self,
        workers: u16,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), RunError> {
        let (claims, claim_writer) = reflector::store();
        let (pods, pod_writer) = reflector::store();
        let (replica_sets, replica_set_writer) = reflector::store();
        let (storage_classes, storage_class_writer) = reflector::store();

        let claim_api = self.namespaced_api::<PersistentVolumeClaim>();
        let pod_api = self.namespaced_api::<Pod>();
        let replica_set_api = self.namespaced_api::<ReplicaSet>();
        let storage_class_api = Api::<StorageClass>::all(self.client.clone());

        let cache = StoreCache {
            claims: claims.clone(),
            pods,
            replica_sets,
            storage_classes,
        };
        let api = KubeApi::new(self.client, OPERATOR_NAME, CONTROLLER_NAME);
        let ctx = Arc::new(Ctx::new(cache, api, self.config));

        // The claim reflector outlives the queue, reconciles still running after shutdown keep
        // observing the claim while they wait for the resize
        let (trigger_tx, trigger_rx) = mpsc::unbounded();
        let claim_watch = {
            let ctx = ctx.clone();
            let mut tracker = ClaimChangeTracker::default();
            reflector(
                claim_writer,
                watcher(claim_api, watcher::Config::default()).default_backoff(),
            )
            .for_each(move |event| {
                match event {
                    Ok(event) => {
                        for claim in triggers_for(&mut tracker, event, &*ctx) {
                            if trigger_tx.unbounded_send(claim).is_err() {
                                tracing::debug!("claim queue is closed, dropping trigger");
                            }
                        }
                    }
                    Err(error) => tracing::warn!(
                        kind = "PersistentVolumeClaim",
                        error = &error as &dyn std::error::Error,
                        "watch failed, retrying"
                    ),
                }
                future::ready(())
            })
        };

        let caches = future::join4(
            claim_watch,
            drain(
                "Pod",
                reflector(
                    pod_writer,
                    watcher(pod_api, watcher::Config::default()).default_backoff(),
                ),
            ),
            drain(
                "ReplicaSet",
                reflector(
                    replica_set_writer,
                    watcher(replica_set_api, watcher::Config::default()).default_backoff(),
                ),
            ),
            drain(
                "StorageClass",
                reflector(
                    storage_class_writer,
                    watcher(storage_class_api, watcher::Config::default()).default_backoff(),
                ),
            ),
        );

        let workers_done = async {
            for (cache, ready) in [
                ("PersistentVolumeClaim", ctx.cache.claims.wait_until_ready().await),
                ("Pod", ctx.cache.pods.wait_until_ready().await),
                ("ReplicaSet", ctx.cache.replica_sets.wait_until_ready().await),
                (
                    "StorageClass",
                    ctx.cache.storage_classes.wait_until_ready().await,
                ),
            ] {
                ready.context(CacheSyncSnafu { cache })?;
            }
            tracing::info!(workers, "caches synced, starting workers");

            controller::applier(
                |claim, ctx| Box::pin(reconcile_claim(claim, ctx)),
                error_policy,
                ctx.clone(),
                claims,
                trigger_rx
                    .map(Ok::<_, watcher::Error>)
                    .take_until(shutdown),
                controller::Config::default().concurrency(workers),
            )
            .for_each(|result| {
                report_reconciled(result);
                future::ready(())
            })
            .await;
            Ok::<(), RunError>(())
        };

        tokio::select! {
            result = workers_done => result,
            _ = caches => Ok(()),
        }
    }

    fn namespaced_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            WatchNamespace::All => Api::all(self.client.clone()),
            WatchNamespace::One(namespace) => Api::namespaced(self.client.clone(), namespace),
        }
    }
}

/// Keeps a reflector running, watch errors are retried by its backoff
async fn drain<K>(kind: &'static str, events: impl Stream<Item = Result<K, watcher::Error>>) {
    events
        .for_each(|event| {
            if let Err(error) = event {
                tracing::warn!(
                    kind,
                    error = &error as &dyn std::error::Error,
                    "watch failed, retrying"
                );
            }
            future::ready(())
        })
        .await
}

fn report_reconciled(
    result: Result<
        (ObjectRef<PersistentVolumeClaim>, Action),
        controller::Error<Error, watcher::Error>,
    >,
) {
    match result {
        Ok((claim, _)) => tracing::debug!(%claim, "reconciled claim"),
        // The claim was deleted after it was queued
        Err(controller::Error::ObjectNotFound(claim)) => {
            tracing::debug!(%claim, "claim is gone");
        }
        Err(controller::Error::ReconcilerFailed(error, claim)) => tracing::error!(
            %claim,
            category = error.category(),
            error = &error as &dyn std::error::Error,
            "failed to reconcile claim"
        ),
        Err(error) => tracing::error!(
            error = &error as &dyn std::error::Error,
            "claim queue failed"
        ),
    }
}
