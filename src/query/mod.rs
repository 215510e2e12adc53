//! Query specifications and their canonical fingerprints.
//!
//! A subscription is identified (when unnamed) by the canonical form of the
//! query it was created from. Two specs that differ only in whitespace,
//! repeated sort keys or the order of distinct fields produce the same
//! [`Fingerprint`], so subscribing to either one dedups to the same record.

mod fingerprint;

pub use fingerprint::{canonicalize, Fingerprint, QuerySpec, SortKey, TRUE_PREDICATE};
