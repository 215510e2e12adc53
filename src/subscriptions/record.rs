//! Subscription records and their lifecycle.

use crate::error::SubscriptionError;
use crate::query::Fingerprint;
use crate::transport::SubscriptionIntent;
use crate::types::{SubscriptionId, SubscriptionState, Timestamp};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Observable `{state, error}` pair.
///
/// `error` is `Some` exactly when `state` is [`SubscriptionState::Error`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    pub error: Option<SubscriptionError>,
}

impl SubscriptionStatus {
    fn creating() -> Self {
        Self {
            state: SubscriptionState::Creating,
            error: None,
        }
    }
}

/// One observed transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: SubscriptionId,
    pub from: SubscriptionState,
    pub to: SubscriptionState,
    pub error: Option<SubscriptionError>,
}

/// How a subscription is identified for dedup and removal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKey {
    Named(String),
    Query(Fingerprint),
}

impl SubscriptionKey {
    pub fn for_subscription(name: Option<&str>, fingerprint: &Fingerprint) -> Self {
        match name {
            Some(name) => SubscriptionKey::Named(name.to_string()),
            None => SubscriptionKey::Query(fingerprint.clone()),
        }
    }
}

/// Whether `from -> to` is a legal lifecycle step.
pub fn is_legal_transition(from: SubscriptionState, to: SubscriptionState) -> bool {
    use SubscriptionState::*;
    match (from, to) {
        (Invalidated, _) => false,
        (_, Invalidated) => true,
        (Creating, Pending) | (Pending, Complete) => true,
        (Creating, Error) | (Pending, Error) => true,
        _ => false,
    }
}

/// Status plus the observers that want to hear about changes to it. Kept
/// behind one lock so registration and notification never interleave.
pub(crate) struct StatusCell {
    inner: Mutex<CellInner>,
}

struct CellInner {
    status: SubscriptionStatus,
    observers: Vec<Observer>,
}

/// A registered observer. `alive` dies with the caller's token, so
/// abandoned observers are pruned without waiting for a failed send.
struct Observer {
    sender: Sender<StatusChange>,
    alive: Weak<()>,
}

impl Observer {
    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

/// Receiving end of an observer registration. Dropping it unregisters the
/// observer.
pub(crate) struct Observation {
    pub(crate) status: SubscriptionStatus,
    pub(crate) receiver: Receiver<StatusChange>,
    pub(crate) token: Arc<()>,
}

impl StatusCell {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CellInner {
                status: SubscriptionStatus::creating(),
                observers: Vec::new(),
            }),
        }
    }

    pub(crate) fn status(&self) -> SubscriptionStatus {
        self.inner.lock().status.clone()
    }

    /// Register an observer; the observation carries the status it starts
    /// from.
    pub(crate) fn observe(&self) -> Observation {
        let (sender, receiver) = unbounded();
        let token = Arc::new(());
        let mut inner = self.inner.lock();
        inner.observers.retain(Observer::is_alive);
        let status = inner.status.clone();
        if !status.state.is_terminal() {
            inner.observers.push(Observer {
                sender,
                alive: Arc::downgrade(&token),
            });
        }
        Observation {
            status,
            receiver,
            token,
        }
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Drop every observer so their receivers disconnect.
    pub(crate) fn close(&self) {
        self.inner.lock().observers.clear();
    }

    fn apply(&self, id: SubscriptionId, to: SubscriptionState, error: Option<SubscriptionError>) -> bool {
        let mut inner = self.inner.lock();
        let from = inner.status.state;
        if !is_legal_transition(from, to) {
            return false;
        }
        inner.status = SubscriptionStatus {
            state: to,
            error: error.clone(),
        };
        let change = StatusChange { id, from, to, error };
        inner
            .observers
            .retain(|observer| {
                observer.is_alive() && observer.sender.send(change.clone()).is_ok()
            });
        if to.is_terminal() {
            inner.observers.clear();
        }
        true
    }
}

/// A single subscription owned by the [`Registry`](super::Registry).
///
/// State changes go through [`SubscriptionRecord::transition`], which only
/// performs legal lifecycle steps.
pub struct SubscriptionRecord {
    id: SubscriptionId,
    name: Option<String>,
    fingerprint: Fingerprint,
    created: Timestamp,
    cell: Arc<StatusCell>,
}

impl SubscriptionRecord {
    pub(crate) fn new(
        id: SubscriptionId,
        name: Option<String>,
        fingerprint: Fingerprint,
        created: Timestamp,
    ) -> Self {
        Self {
            id,
            name,
            fingerprint,
            created,
            cell: Arc::new(StatusCell::new()),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::for_subscription(self.name(), &self.fingerprint)
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.cell.status()
    }

    pub fn state(&self) -> SubscriptionState {
        self.cell.status().state
    }

    pub(crate) fn cell(&self) -> &Arc<StatusCell> {
        &self.cell
    }

    pub(crate) fn intent(&self) -> SubscriptionIntent {
        SubscriptionIntent {
            id: self.id,
            name: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
            created: self.created,
        }
    }

    /// Attempt a lifecycle step. Illegal steps are ignored and return false.
    pub(crate) fn transition(&self, to: SubscriptionState) -> bool {
        debug_assert!(to != SubscriptionState::Error, "use fail() for errors");
        self.step(to, None)
    }

    /// Move to `Error` with the given detail.
    pub(crate) fn fail(&self, error: SubscriptionError) -> bool {
        self.step(SubscriptionState::Error, Some(error))
    }

    /// Move to `Invalidated`. Returns false if already invalidated.
    pub(crate) fn invalidate(&self) -> bool {
        self.step(SubscriptionState::Invalidated, None)
    }

    fn step(&self, to: SubscriptionState, error: Option<SubscriptionError>) -> bool {
        let from = self.state();
        let applied = self.cell.apply(self.id, to, error);
        if applied {
            debug!(subscription = %self.id, %from, %to, "subscription transition");
        } else {
            debug!(subscription = %self.id, %from, %to, "ignoring illegal transition");
        }
        applied
    }
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("state", &self.state())
            .finish()
    }
}
