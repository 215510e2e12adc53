//! Core identifiers and the subscription state enum.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a locally-synced object in the object graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-local identifier for a subscription record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Lifecycle state of a subscription.
///
/// The numeric codes are stable and match what sync servers report on the
/// wire: `Error = -1`, `Pending = 0`, `Complete = 1`, `Creating = 2`,
/// `Invalidated = 3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Created locally but not yet sent to the server.
    Creating,
    /// Accepted for submission; the server is computing the result set.
    Pending,
    /// The server has evaluated the query and matching objects are synced.
    Complete,
    /// Rejected locally or by the server. The record carries error detail.
    Error,
    /// Explicitly removed. Terminal.
    Invalidated,
}

impl SubscriptionState {
    pub fn code(self) -> i8 {
        match self {
            SubscriptionState::Error => -1,
            SubscriptionState::Pending => 0,
            SubscriptionState::Complete => 1,
            SubscriptionState::Creating => 2,
            SubscriptionState::Invalidated => 3,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -1 => Some(SubscriptionState::Error),
            0 => Some(SubscriptionState::Pending),
            1 => Some(SubscriptionState::Complete),
            2 => Some(SubscriptionState::Creating),
            3 => Some(SubscriptionState::Invalidated),
            _ => None,
        }
    }

    /// Position along the `Creating -> Pending -> Complete` progression.
    /// `Error` and `Invalidated` sit outside it.
    pub(crate) fn progress(self) -> Option<u8> {
        match self {
            SubscriptionState::Creating => Some(0),
            SubscriptionState::Pending => Some(1),
            SubscriptionState::Complete => Some(2),
            SubscriptionState::Error | SubscriptionState::Invalidated => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SubscriptionState::Invalidated
    }

    /// Whether the server has yet to settle this subscription.
    pub fn is_outstanding(self) -> bool {
        matches!(self, SubscriptionState::Creating | SubscriptionState::Pending)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Creating => "creating",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Complete => "complete",
            SubscriptionState::Error => "error",
            SubscriptionState::Invalidated => "invalidated",
        };
        f.write_str(s)
    }
}
