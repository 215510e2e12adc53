//! # Partial Sync
//!
//! Client-side subscription manager for partially synchronized stores.
//!
//! A client declares interest in a subset of server-held data by
//! subscribing to a query. The server decides asynchronously what that
//! means, so every subscription carries an observable lifecycle state.
//!
//! ## Core Concepts
//!
//! - **Fingerprints**: Canonical query identity used to dedup subscriptions
//! - **Subscriptions**: Named or anonymous records moving through
//!   `Creating -> Pending -> Complete`, with `Error` and `Invalidated` exits
//! - **Retention**: Removal only deletes objects no other subscription keeps,
//!   including objects pulled in through links
//! - **Offline queue**: Intents issued without a connection are replayed once,
//!   in order, on reconnect
//!
//! ## Example
//!
//! ```ignore
//! use partial_sync::{MemoryGraph, QuerySpec, RecordingTransport, Session, SessionConfig};
//!
//! let transport = Arc::new(RecordingTransport::new());
//! let session = Session::new(SessionConfig::default(), transport, Arc::new(MemoryGraph::new()))?;
//! session.spawn_event_loop()?;
//!
//! let dogs = session.subscribe(&QuerySpec::new("Dog").filter("age > 3").limit(10), Some("old-dogs"))?;
//! dogs.wait_until_settled(Duration::from_secs(30));
//!
//! // Objects only this subscription retained are deleted by the server.
//! dogs.unsubscribe()?;
//! ```

pub mod error;
pub mod query;
pub mod queue;
pub mod retention;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{ErrorKind, Result, SubscriptionError, SyncError};
pub use query::{canonicalize, Fingerprint, QuerySpec, SortKey};
pub use queue::{Intent, OfflineQueue, QueuedIntent};
pub use retention::{
    orphaned_objects, plan_removal, retained_by, GraphSnapshot, MemoryGraph, ObjectGraph,
    RetentionMarker,
};
pub use session::{NameConflictPolicy, Session, SessionConfig, SubscriptionInfo};
pub use subscriptions::{
    Registry, StatusChange, StatusObserver, SubscriptionHandle, SubscriptionKey,
    SubscriptionRecord, SubscriptionStatus,
};
pub use transport::{
    Connectivity, RecordingTransport, RemovalIntent, Submission, SubscriptionIntent, Transport,
    TransportEvent,
};
pub use types::*;
