//! Object graph interfaces and an in-memory implementation.

use crate::query::{Fingerprint, TRUE_PREDICATE};
use crate::types::ObjectId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// A consistent, read-only view of the local object graph.
pub trait GraphSnapshot: Send + Sync {
    /// Objects directly matched by the query, honoring its limit.
    fn evaluate(&self, fingerprint: &Fingerprint) -> BTreeSet<ObjectId>;

    /// Link-transitive closure from `roots`. Roots are included only when
    /// reachable from another root.
    fn reachable_from(&self, roots: &BTreeSet<ObjectId>) -> BTreeSet<ObjectId>;
}

/// Source of graph snapshots. Local writes may continue while a snapshot is
/// in use; the snapshot does not observe them.
pub trait ObjectGraph: Send + Sync {
    fn snapshot(&self) -> Arc<dyn GraphSnapshot>;
}

#[derive(Clone, Debug, Default)]
struct GraphData {
    /// Object type per object.
    objects: BTreeMap<ObjectId, String>,
    /// Outgoing links.
    links: BTreeMap<ObjectId, BTreeSet<ObjectId>>,
    /// Ordered results per (object type, canonical predicate).
    results: HashMap<(String, String), Vec<ObjectId>>,
}

/// In-memory object graph.
///
/// There is no predicate engine here: results for a predicate are defined
/// with [`define_results`](Self::define_results) in the order the query
/// engine would return them (sort and distinct already applied). The
/// `TRUEPREDICATE` query matches every object of its type in id order. A
/// query's limit keeps the first `limit` results.
///
/// Writes are copy-on-write, so snapshots taken earlier stay unchanged.
#[derive(Default)]
pub struct MemoryGraph {
    data: RwLock<Arc<GraphData>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, id: ObjectId, object_type: impl Into<String>) {
        let mut guard = self.data.write();
        Arc::make_mut(&mut *guard).objects.insert(id, object_type.into());
    }

    /// Remove an object with its links and any query results naming it.
    pub fn remove_object(&self, id: ObjectId) {
        let mut guard = self.data.write();
        let data = Arc::make_mut(&mut *guard);
        data.objects.remove(&id);
        data.links.remove(&id);
        for targets in data.links.values_mut() {
            targets.remove(&id);
        }
        for ids in data.results.values_mut() {
            ids.retain(|o| *o != id);
        }
    }

    pub fn link(&self, from: ObjectId, to: ObjectId) {
        let mut guard = self.data.write();
        Arc::make_mut(&mut *guard)
            .links
            .entry(from)
            .or_default()
            .insert(to);
    }

    /// Define the ordered result list for a query. The predicate is
    /// canonicalized the same way fingerprints are.
    pub fn define_results(
        &self,
        object_type: &str,
        predicate: &str,
        ids: impl IntoIterator<Item = ObjectId>,
    ) -> crate::error::Result<()> {
        let fingerprint = crate::query::QuerySpec::new(object_type)
            .filter(predicate)
            .fingerprint()?;
        let key = (
            fingerprint.object_type().to_string(),
            fingerprint.predicate().to_string(),
        );
        let mut guard = self.data.write();
        Arc::make_mut(&mut *guard)
            .results
            .insert(key, ids.into_iter().collect());
        Ok(())
    }

    pub fn object_count(&self) -> usize {
        self.data.read().objects.len()
    }
}

impl ObjectGraph for MemoryGraph {
    fn snapshot(&self) -> Arc<dyn GraphSnapshot> {
        Arc::new(MemorySnapshot {
            data: Arc::clone(&*self.data.read()),
        })
    }
}

/// Frozen view of a [`MemoryGraph`].
pub struct MemorySnapshot {
    data: Arc<GraphData>,
}

impl MemorySnapshot {
    fn ordered_matches(&self, fingerprint: &Fingerprint) -> Vec<ObjectId> {
        let key = (
            fingerprint.object_type().to_string(),
            fingerprint.predicate().to_string(),
        );
        if let Some(ids) = self.data.results.get(&key) {
            return ids.clone();
        }
        if fingerprint.predicate() == TRUE_PREDICATE {
            return self
                .data
                .objects
                .iter()
                .filter(|(_, ty)| ty.as_str() == fingerprint.object_type())
                .map(|(id, _)| *id)
                .collect();
        }
        Vec::new()
    }
}

impl GraphSnapshot for MemorySnapshot {
    fn evaluate(&self, fingerprint: &Fingerprint) -> BTreeSet<ObjectId> {
        let matches = self.ordered_matches(fingerprint);
        let take = match fingerprint.limit() {
            Some(limit) => usize::try_from(limit).unwrap_or(usize::MAX),
            None => usize::MAX,
        };
        matches.into_iter().take(take).collect()
    }

    fn reachable_from(&self, roots: &BTreeSet<ObjectId>) -> BTreeSet<ObjectId> {
        let mut reached = BTreeSet::new();
        let mut frontier: VecDeque<ObjectId> = roots.iter().copied().collect();
        while let Some(id) = frontier.pop_front() {
            if let Some(targets) = self.data.links.get(&id) {
                for target in targets {
                    if reached.insert(*target) {
                        frontier.push_back(*target);
                    }
                }
            }
        }
        reached
    }
}
