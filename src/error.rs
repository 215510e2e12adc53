//! Error types for the subscription manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors returned synchronously by session operations.
///
/// Server-side failures never show up here; they are reported through a
/// subscription moving to the `Error` state with a [`SubscriptionError`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Rejected by server: {0}")]
    ServerRejected(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid queue format: {0}")]
    InvalidFormat(String),

    #[error("Offline queue is locked by another session")]
    Locked,

    #[error("Session is closed")]
    SessionClosed,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Category of a subscription failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed predicate, sort or distinct clause.
    InvalidQuery,
    /// The server does not support a requested feature (e.g. `limit`).
    UnsupportedFeature,
    /// Generic server rejection.
    ServerRejected,
    /// Transport retries were exhausted.
    TransportFailure,
}

/// Error detail attached to a subscription in the `Error` state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SubscriptionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidQuery, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFeature, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerRejected, message)
    }

    /// Classify a synchronous submission error. Returns `None` for errors
    /// that are recovered by queueing rather than surfaced on the record.
    pub(crate) fn from_submit_error(err: &SyncError) -> Option<Self> {
        match err {
            SyncError::TransportFailure(_) => None,
            SyncError::InvalidQuery(msg) => Some(Self::invalid_query(msg.clone())),
            SyncError::UnsupportedFeature(msg) => Some(Self::unsupported(msg.clone())),
            other => Some(Self::rejected(other.to_string())),
        }
    }
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SubscriptionError {}
