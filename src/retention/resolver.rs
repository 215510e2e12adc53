//! Orphan computation for subscription removal.

use crate::query::Fingerprint;
use crate::subscriptions::Registry;
use crate::types::{ObjectId, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use super::graph::GraphSnapshot;

/// Objects retained only by a subscription that is being removed.
///
/// Consumed once by the removal hand-off to the transport; never persisted on
/// its own.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionMarker {
    pub subscription: Option<SubscriptionId>,
    pub orphaned: BTreeSet<ObjectId>,
}

impl RetentionMarker {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.orphaned.is_empty()
    }

    pub fn len(&self) -> usize {
        self.orphaned.len()
    }
}

/// Direct matches of `fingerprint` plus everything link-reachable from them.
pub fn retained_by(snapshot: &dyn GraphSnapshot, fingerprint: &Fingerprint) -> BTreeSet<ObjectId> {
    let direct = snapshot.evaluate(fingerprint);
    let linked = snapshot.reachable_from(&direct);
    let mut retained = direct;
    retained.extend(linked);
    retained
}

/// Objects retained by `target` and by none of `others`, all evaluated
/// against the same snapshot.
pub fn orphaned_objects<'a>(
    snapshot: &dyn GraphSnapshot,
    target: &Fingerprint,
    others: impl IntoIterator<Item = &'a Fingerprint>,
) -> BTreeSet<ObjectId> {
    let mut orphaned = retained_by(snapshot, target);
    if orphaned.is_empty() {
        return orphaned;
    }

    // Named subscriptions can share a fingerprint; evaluate each query once.
    let mut evaluated: HashSet<&Fingerprint> = HashSet::new();
    for other in others {
        if !evaluated.insert(other) {
            continue;
        }
        if other == target {
            // Same query retains exactly the same objects.
            orphaned.clear();
            break;
        }
        for id in retained_by(snapshot, other) {
            orphaned.remove(&id);
        }
        if orphaned.is_empty() {
            break;
        }
    }
    orphaned
}

/// Plan the removal of subscription `id`.
///
/// Returns an empty marker when `id` is no longer in the registry.
pub fn plan_removal(
    registry: &Registry,
    id: SubscriptionId,
    snapshot: &dyn GraphSnapshot,
) -> RetentionMarker {
    let Some(record) = registry.get(id) else {
        return RetentionMarker::empty();
    };

    let others = registry.others(id).map(|r| r.fingerprint());
    let orphaned = orphaned_objects(snapshot, record.fingerprint(), others);
    debug!(
        subscription = %id,
        orphaned = orphaned.len(),
        "planned subscription removal"
    );

    RetentionMarker {
        subscription: Some(id),
        orphaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QuerySpec;
    use crate::retention::{MemoryGraph, ObjectGraph};
    use crate::types::Timestamp;

    fn ids(raw: &[u64]) -> BTreeSet<ObjectId> {
        raw.iter().map(|i| ObjectId(*i)).collect()
    }

    fn graph_with(queries: Vec<(&str, Vec<u64>)>) -> MemoryGraph {
        let graph = MemoryGraph::new();
        for (predicate, matches) in queries {
            graph
                .define_results("Item", predicate, matches.into_iter().map(ObjectId))
                .unwrap();
        }
        graph
    }

    fn fp(predicate: &str) -> Fingerprint {
        QuerySpec::new("Item").filter(predicate).fingerprint().unwrap()
    }

    #[test]
    fn test_overlapping_subscriptions() {
        let graph = graph_with(vec![("a", vec![1, 2, 3]), ("b", vec![2, 3, 4])]);
        let mut registry = Registry::new();
        let a = registry.insert(None, fp("a"), Timestamp::now());
        registry.insert(None, fp("b"), Timestamp::now());

        let marker = plan_removal(&registry, a, graph.snapshot().as_ref());
        assert_eq!(marker.subscription, Some(a));
        assert_eq!(marker.orphaned, ids(&[1]));
    }

    #[test]
    fn test_third_subscription_keeps_objects() {
        let graph = graph_with(vec![("a", vec![1, 2, 3]), ("b", vec![2, 3, 4]), ("c", vec![3])]);
        let snap = graph.snapshot();

        // Removing both A and B while C remains.
        let orphaned_ab: BTreeSet<_> = orphaned_objects(snap.as_ref(), &fp("a"), [&fp("c")])
            .union(&orphaned_objects(snap.as_ref(), &fp("b"), [&fp("c")]))
            .copied()
            .collect();
        assert_eq!(orphaned_ab, ids(&[1, 2, 4]));
    }

    #[test]
    fn test_link_reachable_objects_are_retained() {
        let graph = graph_with(vec![("a", vec![1]), ("b", vec![2])]);
        // 1 -> 10 -> 11, 2 -> 11
        graph.link(ObjectId(1), ObjectId(10));
        graph.link(ObjectId(10), ObjectId(11));
        graph.link(ObjectId(2), ObjectId(11));

        let snap = graph.snapshot();
        assert_eq!(retained_by(snap.as_ref(), &fp("a")), ids(&[1, 10, 11]));
        assert_eq!(
            orphaned_objects(snap.as_ref(), &fp("a"), [&fp("b")]),
            ids(&[1, 10])
        );
    }

    #[test]
    fn test_limit_does_not_apply_to_links() {
        let graph = graph_with(vec![("a", vec![1, 2, 3])]);
        graph.link(ObjectId(1), ObjectId(20));
        graph.link(ObjectId(3), ObjectId(30));
        let snap = graph.snapshot();

        let limited = QuerySpec::new("Item").filter("a").limit(1).fingerprint().unwrap();
        assert_eq!(retained_by(snap.as_ref(), &limited), ids(&[1, 20]));

        let zero = QuerySpec::new("Item").filter("a").limit(0).fingerprint().unwrap();
        assert!(retained_by(snap.as_ref(), &zero).is_empty());
    }

    #[test]
    fn test_same_query_under_two_names() {
        let graph = graph_with(vec![("a", vec![1, 2])]);
        let mut registry = Registry::new();
        let first = registry.insert(Some("one".into()), fp("a"), Timestamp::now());
        registry.insert(Some("two".into()), fp("a"), Timestamp::now());

        let marker = plan_removal(&registry, first, graph.snapshot().as_ref());
        assert!(marker.is_empty());
    }

    #[test]
    fn test_unknown_subscription_yields_empty_marker() {
        let graph = graph_with(vec![("a", vec![1])]);
        let registry = Registry::new();
        let marker = plan_removal(&registry, SubscriptionId(42), graph.snapshot().as_ref());
        assert_eq!(marker, RetentionMarker::empty());
    }
}
