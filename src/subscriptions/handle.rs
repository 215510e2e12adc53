//! Caller-facing handles onto subscription records.

use crate::error::{Result, SubscriptionError};
use crate::query::Fingerprint;
use crate::session::SessionInner;
use crate::types::{SubscriptionId, SubscriptionState, Timestamp};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::record::{Observation, StatusCell, StatusChange, SubscriptionRecord, SubscriptionStatus};

/// Observation handle for a subscription.
///
/// Handles never own the record; the session's registry does. Two handles
/// returned for equivalent subscribe calls compare equal.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    name: Option<String>,
    fingerprint: Fingerprint,
    created: Timestamp,
    cell: Arc<StatusCell>,
    session: Weak<SessionInner>,
}

impl SubscriptionHandle {
    pub(crate) fn new(record: &SubscriptionRecord, session: Weak<SessionInner>) -> Self {
        Self {
            id: record.id(),
            name: record.name().map(str::to_string),
            fingerprint: record.fingerprint().clone(),
            created: record.created(),
            cell: Arc::clone(record.cell()),
            session,
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

    pub fn status(&self) -> SubscriptionStatus {
        self.cell.status()
    }

    pub fn state(&self) -> SubscriptionState {
        self.status().state
    }

    pub fn error(&self) -> Option<SubscriptionError> {
        self.status().error
    }

    /// Start observing transitions. The observer sees every transition that
    /// happens after this call, in order.
    pub fn observe(&self) -> StatusObserver {
        let observation = self.cell.observe();
        StatusObserver {
            receiver: observation.receiver,
            _token: observation.token,
        }
    }

    /// Remove this subscription. Idempotent.
    ///
    /// Objects retained only by this subscription are deleted by the server
    /// later; the local store is not changed by this call.
    pub fn unsubscribe(&self) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => session.unsubscribe(self.id),
            None => Ok(()),
        }
    }

    /// Block until `predicate` holds for the current status, or until the
    /// timeout elapses. Returns the matching status, or `None` on timeout or
    /// when the subscription can no longer change.
    pub fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<SubscriptionStatus>
    where
        F: Fn(&SubscriptionStatus) -> bool,
    {
        // No observer needed when the predicate already holds.
        let status = self.cell.status();
        if predicate(&status) {
            return Some(status);
        }
        let Observation {
            status,
            receiver,
            token: _token,
        } = self.cell.observe();
        if predicate(&status) {
            return Some(status);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining) {
                Ok(change) => {
                    let status = SubscriptionStatus {
                        state: change.to,
                        error: change.error,
                    };
                    if predicate(&status) {
                        return Some(status);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    /// Wait until the server has settled this subscription (`Complete`,
    /// `Error` or `Invalidated`).
    pub fn wait_until_settled(&self, timeout: Duration) -> Option<SubscriptionStatus> {
        self.wait_for(|s| !s.state.is_outstanding(), timeout)
    }
}

impl PartialEq for SubscriptionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for SubscriptionHandle {}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Receives [`StatusChange`]s for one subscription.
pub struct StatusObserver {
    receiver: Receiver<StatusChange>,
    _token: Arc<()>,
}

impl StatusObserver {
    /// Receive the next change (blocking).
    pub fn recv(&self) -> std::result::Result<StatusChange, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a change (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<StatusChange, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<StatusChange, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received so far, without blocking.
    pub fn drain(&self) -> Vec<StatusChange> {
        self.receiver.try_iter().collect()
    }
}
