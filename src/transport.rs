//! Boundary with the sync protocol layer.
//!
//! The session submits intents through [`Transport`] and receives
//! acknowledgements back as [`TransportEvent`]s on the channel returned by
//! `Session::event_sender`. Submission must not block on the network: a
//! transport accepts the intent (or fails with
//! [`SyncError::TransportFailure`] when no connection is available) and the
//! server's answer arrives later as an event.

use crate::error::{Result, SubscriptionError, SyncError};
use crate::query::Fingerprint;
use crate::subscriptions::SubscriptionKey;
use crate::types::{ObjectId, SubscriptionId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Request to register a subscription with the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIntent {
    pub id: SubscriptionId,
    pub name: Option<String>,
    pub fingerprint: Fingerprint,
    pub created: Timestamp,
}

/// Request to remove a subscription and delete the objects it alone retained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalIntent {
    pub id: SubscriptionId,
    pub key: SubscriptionKey,
    pub orphaned: BTreeSet<ObjectId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Asynchronous notifications from the protocol layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// The server received the subscription and is evaluating it.
    Acknowledged { id: SubscriptionId },
    /// The query is evaluated and matching objects are synced.
    Completed { id: SubscriptionId },
    /// The server refused the subscription.
    Rejected {
        id: SubscriptionId,
        error: SubscriptionError,
    },
    /// The server applied a removal.
    RemovalConfirmed { id: SubscriptionId },
    ConnectivityChanged { state: Connectivity },
}

/// Outbound side of the sync protocol.
pub trait Transport: Send + Sync {
    /// Hand a subscription to the protocol layer.
    fn submit(&self, intent: &SubscriptionIntent) -> Result<()>;

    /// Hand a removal to the protocol layer.
    fn submit_removal(&self, intent: &RemovalIntent) -> Result<()>;
}

/// Something handed to a [`RecordingTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Subscribe(SubscriptionIntent),
    Remove(RemovalIntent),
}

/// Transport that records submissions in memory.
///
/// Useful when embedding the session in tests: toggle reachability to
/// simulate connection loss, and feed server answers back through the
/// session's event sender.
pub struct RecordingTransport {
    submissions: Mutex<Vec<Submission>>,
    reachable: AtomicBool,
    reject_next: Mutex<Option<SyncError>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            reject_next: Mutex::new(None),
        }
    }

    /// While unreachable, every submission fails with `TransportFailure`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next subscription submission with `error`.
    pub fn reject_next(&self, error: SyncError) {
        *self.reject_next.lock() = Some(error);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    /// Number of times subscription `id` was submitted.
    pub fn subscribe_count(&self, id: SubscriptionId) -> usize {
        self.submissions
            .lock()
            .iter()
            .filter(|s| matches!(s, Submission::Subscribe(i) if i.id == id))
            .count()
    }

    /// Number of removals submitted for `id`.
    pub fn removal_count(&self, id: SubscriptionId) -> usize {
        self.submissions
            .lock()
            .iter()
            .filter(|s| matches!(s, Submission::Remove(i) if i.id == id))
            .count()
    }

    /// The most recent removal submitted for `id`.
    pub fn last_removal(&self, id: SubscriptionId) -> Option<RemovalIntent> {
        self.submissions.lock().iter().rev().find_map(|s| match s {
            Submission::Remove(i) if i.id == id => Some(i.clone()),
            _ => None,
        })
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::TransportFailure("not connected".into()))
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn submit(&self, intent: &SubscriptionIntent) -> Result<()> {
        self.check_reachable()?;
        if let Some(err) = self.reject_next.lock().take() {
            return Err(err);
        }
        self.submissions
            .lock()
            .push(Submission::Subscribe(intent.clone()));
        Ok(())
    }

    fn submit_removal(&self, intent: &RemovalIntent) -> Result<()> {
        self.check_reachable()?;
        self.submissions.lock().push(Submission::Remove(intent.clone()));
        Ok(())
    }
}
