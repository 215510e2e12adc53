//! Index of live subscription records with dedup by identity.

use crate::query::Fingerprint;
use crate::types::{SubscriptionId, Timestamp};
use std::collections::HashMap;

use super::record::SubscriptionRecord;

/// Owns every live [`SubscriptionRecord`].
///
/// Named records are indexed by name; unnamed records by fingerprint. A name
/// and a fingerprint never collide: a named and an unnamed subscription to
/// the same query are distinct records.
#[derive(Debug)]
pub struct Registry {
    records: HashMap<SubscriptionId, SubscriptionRecord>,
    by_name: HashMap<String, SubscriptionId>,
    by_fingerprint: HashMap<Fingerprint, SubscriptionId>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            by_name: HashMap::new(),
            by_fingerprint: HashMap::new(),
            next_id: 1,
        }
    }

    /// Find the live record a subscribe request would dedup to.
    ///
    /// A name is the primary key when present, regardless of fingerprint.
    pub fn find_equivalent(
        &self,
        name: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> Option<&SubscriptionRecord> {
        let id = match name {
            Some(name) => self.by_name.get(name),
            None => self.by_fingerprint.get(fingerprint),
        }?;
        self.records.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&SubscriptionRecord> {
        self.by_name.get(name).and_then(|id| self.records.get(id))
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&SubscriptionRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.records.contains_key(&id)
    }

    /// Insert a new record under a fresh id.
    ///
    /// Callers must have checked [`find_equivalent`](Self::find_equivalent)
    /// first; an existing entry for the same identity is replaced in the
    /// index.
    pub fn insert(
        &mut self,
        name: Option<String>,
        fingerprint: Fingerprint,
        created: Timestamp,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.insert_record(SubscriptionRecord::new(id, name, fingerprint, created));
        id
    }

    /// Re-insert a record under a known id (used when restoring queued
    /// subscriptions after a restart).
    pub(crate) fn restore(
        &mut self,
        id: SubscriptionId,
        name: Option<String>,
        fingerprint: Fingerprint,
        created: Timestamp,
    ) {
        self.reserve_through(id);
        self.insert_record(SubscriptionRecord::new(id, name, fingerprint, created));
    }

    /// Ensure future ids are allocated above `id`.
    pub(crate) fn reserve_through(&mut self, id: SubscriptionId) {
        self.next_id = self.next_id.max(id.0 + 1);
    }

    fn insert_record(&mut self, record: SubscriptionRecord) {
        let id = record.id();
        match record.name() {
            Some(name) => {
                self.by_name.insert(name.to_string(), id);
            }
            None => {
                self.by_fingerprint.insert(record.fingerprint().clone(), id);
            }
        }
        self.records.insert(id, record);
    }

    /// Stop tracking a record. Returns it so the caller can invalidate it.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<SubscriptionRecord> {
        let record = self.records.remove(&id)?;
        match record.name() {
            Some(name) => {
                if self.by_name.get(name) == Some(&id) {
                    self.by_name.remove(name);
                }
            }
            None => {
                if self.by_fingerprint.get(record.fingerprint()) == Some(&id) {
                    self.by_fingerprint.remove(record.fingerprint());
                }
            }
        }
        Some(record)
    }

    /// Remove and return every record.
    pub(crate) fn drain(&mut self) -> Vec<SubscriptionRecord> {
        self.by_name.clear();
        self.by_fingerprint.clear();
        self.records.drain().map(|(_, record)| record).collect()
    }

    /// Every live record except `id`.
    pub fn others(&self, id: SubscriptionId) -> impl Iterator<Item = &SubscriptionRecord> {
        self.records.values().filter(move |r| r.id() != id)
    }

    /// Live records ordered by creation time, ties broken by id.
    pub fn ordered(&self) -> Vec<&SubscriptionRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|r| (r.created(), r.id()));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
