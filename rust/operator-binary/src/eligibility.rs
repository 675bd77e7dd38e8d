//! Decides which claims are worth reconciling.
//!
//! [`should_enqueue`] runs on every claim notification and only looks at sizes. The remaining
//! conditions need other objects and are checked by [`check_candidacy`] once the claim is
//! processed.
use crate::{
    claim::{self, ClaimKey},
    cluster::ClusterCache,
};
use stackable_operator::{
    k8s_openapi::api::core::v1::PersistentVolumeClaim, kube::runtime::watcher,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use strum::Display;

/// A change notification for a single claim
#[derive(Clone, Debug)]
pub enum ClaimChange {
    Added(PersistentVolumeClaim),
    Updated {
        old: PersistentVolumeClaim,
        new: PersistentVolumeClaim,
    },
    Deleted(PersistentVolumeClaim),
}

impl ClaimChange {
    /// The most recent revision carried by the notification
    pub fn latest(&self) -> &PersistentVolumeClaim {
        match self {
            ClaimChange::Added(claim) | ClaimChange::Deleted(claim) => claim,
            ClaimChange::Updated { new, .. } => new,
        }
    }
}

/// Whether a notification should put the claim's key onto the queue
pub fn should_enqueue(change: &ClaimChange) -> bool {
    match change {
        ClaimChange::Added(_) | ClaimChange::Deleted(_) => claim::is_expanding(change.latest()),
        // Only a fresh size increase counts, an update that merely reports the grown capacity
        // must not start another cycle
        ClaimChange::Updated { old, new } => {
            claim::requested_size(new) > claim::requested_size(old) && claim::is_expanding(new)
        }
    }
}

/// Turns the watch stream of claims into add, update and delete notifications by remembering
/// the last revision seen for every claim
#[derive(Debug, Default)]
pub struct ClaimChangeTracker {
    known: HashMap<ClaimKey, PersistentVolumeClaim>,
    relisted: Option<HashSet<ClaimKey>>,
}

impl ClaimChangeTracker {
    pub fn observe(&mut self, event: watcher::Event<PersistentVolumeClaim>) -> Vec<ClaimChange> {
        match event {
            watcher::Event::Apply(claim) => self.apply(claim).into_iter().collect(),
            watcher::Event::InitApply(claim) => {
                if let Ok(key) = ClaimKey::from_claim(&claim) {
                    self.relisted.get_or_insert_with(HashSet::new).insert(key);
                }
                self.apply(claim).into_iter().collect()
            }
            watcher::Event::Delete(claim) => {
                let Ok(key) = ClaimKey::from_claim(&claim) else {
                    return Vec::new();
                };
                self.known.remove(&key);
                vec![ClaimChange::Deleted(claim)]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let vanished = self
                    .known
                    .keys()
                    .filter(|key| !relisted.contains(key))
                    .cloned()
                    .collect::<Vec<_>>();
                vanished
                    .into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(ClaimChange::Deleted)
                    .collect()
            }
        }
    }

    fn apply(&mut self, claim: PersistentVolumeClaim) -> Option<ClaimChange> {
        let Ok(key) = ClaimKey::from_claim(&claim) else {
            tracing::debug!("ignoring claim without namespace");
            return None;
        };
        Some(match self.known.insert(key, claim.clone()) {
            Some(old) => ClaimChange::Updated { old, new: claim },
            None => ClaimChange::Added(claim),
        })
    }
}

/// Why a claim is or is not reattached when it is processed
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum Candidacy {
    Candidate,
    NotExpanding,
    NotBound,
    NoStorageClass,
    StorageClassNotFound { name: String },
    ExpansionNotAllowed { storage_class: String },
    UnsupportedProvisioner { provisioner: String },
}

/// Checks the claim itself and its storage class.
///
/// None of the negative outcomes is an error, they simply take the claim out of consideration.
pub fn check_candidacy(
    claim: &PersistentVolumeClaim,
    cache: &impl ClusterCache,
    supported_provisioners: &BTreeSet<String>,
) -> Candidacy {
    if !claim::is_expanding(claim) {
        return Candidacy::NotExpanding;
    }
    if !claim::is_bound(claim) {
        return Candidacy::NotBound;
    }
    let Some(class_name) = claim::storage_class_name(claim) else {
        return Candidacy::NoStorageClass;
    };
    let Some(storage_class) = cache.storage_class(class_name) else {
        return Candidacy::StorageClassNotFound {
            name: class_name.to_string(),
        };
    };
    if storage_class.allow_volume_expansion != Some(true) {
        return Candidacy::ExpansionNotAllowed {
            storage_class: class_name.to_string(),
        };
    }
    if !supported_provisioners.contains(&storage_class.provisioner) {
        return Candidacy::UnsupportedProvisioner {
            provisioner: storage_class.provisioner.clone(),
        };
    }
    Candidacy::Candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        claim::fixtures::{claim, claim_with_class},
        testing::FakeCache,
    };
    use rstest::rstest;

    fn supported() -> BTreeSet<String> {
        BTreeSet::from(["ebs.csi.aws.com".to_string()])
    }

    #[rstest]
    #[case::expanding(claim("data", "20Gi", "10Gi"), true)]
    #[case::satisfied(claim("data", "20Gi", "20Gi"), false)]
    fn added_and_deleted_claims_enqueue_while_expanding(
        #[case] pvc: PersistentVolumeClaim,
        #[case] expected: bool,
    ) {
        assert_eq!(should_enqueue(&ClaimChange::Added(pvc.clone())), expected);
        assert_eq!(should_enqueue(&ClaimChange::Deleted(pvc)), expected);
    }

    #[rstest]
    #[case::size_increased(("10Gi", "10Gi"), ("20Gi", "10Gi"), true)]
    #[case::size_unchanged(("20Gi", "10Gi"), ("20Gi", "10Gi"), false)]
    #[case::capacity_caught_up(("20Gi", "10Gi"), ("20Gi", "20Gi"), false)]
    #[case::increase_already_satisfied(("10Gi", "10Gi"), ("20Gi", "20Gi"), false)]
    #[case::size_decreased(("20Gi", "10Gi"), ("15Gi", "10Gi"), false)]
    fn updates_enqueue_only_on_fresh_increase(
        #[case] old: (&str, &str),
        #[case] new: (&str, &str),
        #[case] expected: bool,
    ) {
        let change = ClaimChange::Updated {
            old: claim("data", old.0, old.1),
            new: claim("data", new.0, new.1),
        };
        assert_eq!(should_enqueue(&change), expected);
    }

    #[test]
    fn tracker_turns_watch_events_into_changes() {
        let mut tracker = ClaimChangeTracker::default();

        let added = tracker.observe(watcher::Event::Apply(claim("data", "10Gi", "10Gi")));
        assert!(matches!(added.as_slice(), [ClaimChange::Added(_)]));

        let updated = tracker.observe(watcher::Event::Apply(claim("data", "20Gi", "10Gi")));
        let [ClaimChange::Updated { old, new }] = updated.as_slice() else {
            panic!("expected a single update, got {updated:?}");
        };
        assert_eq!(claim::requested_size(old), "10Gi".parse().ok());
        assert_eq!(claim::requested_size(new), "20Gi".parse().ok());
        assert!(should_enqueue(&updated[0]));

        let deleted = tracker.observe(watcher::Event::Delete(claim("data", "20Gi", "10Gi")));
        assert!(matches!(deleted.as_slice(), [ClaimChange::Deleted(_)]));
    }

    #[test]
    fn relist_reports_vanished_claims_as_deleted() {
        let mut tracker = ClaimChangeTracker::default();
        tracker.observe(watcher::Event::Apply(claim("kept", "10Gi", "10Gi")));
        tracker.observe(watcher::Event::Apply(claim("gone", "20Gi", "10Gi")));

        assert!(tracker.observe(watcher::Event::Init).is_empty());
        let relisted = tracker.observe(watcher::Event::InitApply(claim("kept", "10Gi", "10Gi")));
        assert!(matches!(relisted.as_slice(), [ClaimChange::Updated { .. }]));

        let done = tracker.observe(watcher::Event::InitDone);
        let names = done
            .iter()
            .map(|change| change.latest().metadata.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec![Some("gone".to_string())]);
        assert!(matches!(done[0], ClaimChange::Deleted(_)));
    }

    #[rstest]
    #[case::candidate(claim_with_class("data", "20Gi", "10Gi", "fast"), Candidacy::Candidate)]
    #[case::not_expanding(
        claim_with_class("data", "10Gi", "10Gi", "fast"),
        Candidacy::NotExpanding
    )]
    #[case::unknown_class(
        claim_with_class("data", "20Gi", "10Gi", "missing"),
        Candidacy::StorageClassNotFound { name: "missing".to_string() }
    )]
    #[case::fixed_size_class(
        claim_with_class("data", "20Gi", "10Gi", "fixed"),
        Candidacy::ExpansionNotAllowed { storage_class: "fixed".to_string() }
    )]
    #[case::unsupported_provisioner(
        claim_with_class("data", "20Gi", "10Gi", "nfs"),
        Candidacy::UnsupportedProvisioner { provisioner: "nfs.csi.k8s.io".to_string() }
    )]
    fn candidacy(#[case] pvc: PersistentVolumeClaim, #[case] expected: Candidacy) {
        let cache = FakeCache::default()
            .with_storage_class("fast", "ebs.csi.aws.com", Some(true))
            .with_storage_class("fixed", "ebs.csi.aws.com", None)
            .with_storage_class("nfs", "nfs.csi.k8s.io", Some(true));
        assert_eq!(check_candidacy(&pvc, &cache, &supported()), expected);
    }

    #[test]
    fn unbound_claims_are_not_candidates() {
        let mut pvc = claim("data", "20Gi", "10Gi");
        if let Some(status) = pvc.status.as_mut() {
            status.phase = Some("Pending".to_string());
        }
        let cache = FakeCache::default().with_storage_class("fast", "ebs.csi.aws.com", Some(true));
        assert_eq!(
            check_candidacy(&pvc, &cache, &supported()),
            Candidacy::NotBound
        );
    }
}
