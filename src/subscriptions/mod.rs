//! Query subscriptions and their lifecycle.
//!
//! A subscription declares interest in the server-held objects matching a
//! query. It is created in `Creating`, moves to `Pending` once submitted,
//! and to `Complete` when the server reports the matching objects are
//! synced. Rejections move it to `Error`; removal moves any state to the
//! terminal `Invalidated`.
//!
//! # Example
//!
//! ```ignore
//! let handle = session.subscribe(&QuerySpec::new("Dog").filter("age > 3"), Some("old-dogs"))?;
//!
//! let observer = handle.observe();
//! while let Ok(change) = observer.recv() {
//!     println!("{} -> {}", change.from, change.to);
//!     if !change.to.is_outstanding() {
//!         break;
//!     }
//! }
//!
//! handle.unsubscribe()?;
//! ```

mod handle;
mod record;
mod registry;

pub use handle::{StatusObserver, SubscriptionHandle};
pub use record::{
    is_legal_transition, StatusChange, SubscriptionKey, SubscriptionRecord, SubscriptionStatus,
};
pub use registry::Registry;
