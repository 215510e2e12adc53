//! Canonicalization of query specifications.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Predicate used when a query has no filter.
pub const TRUE_PREDICATE: &str = "TRUEPREDICATE";

/// One sort clause.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// A query as expressed by a caller, before canonicalization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuerySpec {
    /// Object type (class/table) the query runs against.
    pub object_type: String,
    /// Predicate text. Empty means "match everything".
    pub predicate: String,
    pub sort: Vec<SortKey>,
    pub distinct: Vec<String>,
    /// Maximum number of top-level matches (None = unlimited).
    pub limit: Option<u64>,
}

impl QuerySpec {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = predicate.into();
        self
    }

    pub fn sorted_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn distinct_on(mut self, field: impl Into<String>) -> Self {
        self.distinct.push(field.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonicalize this spec. See [`canonicalize`].
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        canonicalize(self)
    }
}

/// Canonical, comparable identity of a query.
///
/// Equality covers every component including the limit; `None` (no limit)
/// never equals any finite limit.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    object_type: String,
    predicate: String,
    sort: Vec<SortKey>,
    distinct: Vec<String>,
    limit: Option<u64>,
}

impl Fingerprint {
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    pub fn sort(&self) -> &[SortKey] {
        &self.sort
    }

    pub fn distinct(&self) -> &[String] {
        &self.distinct
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// SHA-256 of the canonical JSON encoding, hex encoded.
    pub fn digest(&self) -> String {
        // Field order is fixed by the struct, so the encoding is stable.
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }

    /// First 12 hex characters of the digest, for logs.
    pub fn short_digest(&self) -> String {
        let mut digest = self.digest();
        digest.truncate(12);
        digest
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", self.short_digest())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} WHERE {}", self.object_type, self.predicate)?;
        if !self.sort.is_empty() {
            let keys: Vec<String> = self
                .sort
                .iter()
                .map(|k| format!("{} {}", k.field, if k.ascending { "ASC" } else { "DESC" }))
                .collect();
            write!(f, " SORT({})", keys.join(", "))?;
        }
        if !self.distinct.is_empty() {
            write!(f, " DISTINCT({})", self.distinct.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT({})", limit)?;
        }
        Ok(())
    }
}

/// Canonicalize a query spec into a [`Fingerprint`].
///
/// Pure and deterministic. Fails with [`SyncError::InvalidQuery`] for an
/// empty object type, an unbalanced predicate, or empty field names.
pub fn canonicalize(spec: &QuerySpec) -> Result<Fingerprint> {
    let object_type = spec.object_type.trim();
    if object_type.is_empty() {
        return Err(SyncError::InvalidQuery("object type is empty".into()));
    }

    let predicate = normalize_predicate(&spec.predicate)?;

    // A repeated sort key can never change the ordering established by its
    // first occurrence.
    let mut seen = BTreeSet::new();
    let mut sort = Vec::with_capacity(spec.sort.len());
    for key in &spec.sort {
        let field = key.field.trim();
        if field.is_empty() {
            return Err(SyncError::InvalidQuery("sort field name is empty".into()));
        }
        if seen.insert(field.to_string()) {
            sort.push(SortKey {
                field: field.to_string(),
                ascending: key.ascending,
            });
        }
    }

    let mut distinct = BTreeSet::new();
    for field in &spec.distinct {
        let field = field.trim();
        if field.is_empty() {
            return Err(SyncError::InvalidQuery("distinct field name is empty".into()));
        }
        distinct.insert(field.to_string());
    }

    Ok(Fingerprint {
        object_type: object_type.to_string(),
        predicate,
        sort,
        distinct: distinct.into_iter().collect(),
        limit: spec.limit,
    })
}

/// Collapse whitespace outside string literals and check that quotes and
/// parentheses balance.
fn normalize_predicate(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth: i64 = 0;
    let mut pending_space = false;

    for c in raw.trim().chars() {
        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SyncError::InvalidQuery(format!(
                        "unbalanced ')' in predicate: {}",
                        raw
                    )));
                }
            }
            _ => {}
        }
        out.push(c);
    }

    if quote.is_some() {
        return Err(SyncError::InvalidQuery(format!(
            "unterminated string literal in predicate: {}",
            raw
        )));
    }
    if depth != 0 {
        return Err(SyncError::InvalidQuery(format!(
            "unbalanced '(' in predicate: {}",
            raw
        )));
    }

    if out.is_empty() {
        Ok(TRUE_PREDICATE.to_string())
    } else {
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_whitespace_is_normalized() {
        let a = QuerySpec::new("Person").filter("age  >   3 AND name == 'Al  Bo'");
        let b = QuerySpec::new(" Person ").filter("\tage > 3\nAND name == 'Al  Bo' ");
        let fa = canonicalize(&a).unwrap();
        let fb = canonicalize(&b).unwrap();
        assert_eq!(fa, fb);
        // Whitespace inside literals is significant.
        assert_eq!(fa.predicate(), "age > 3 AND name == 'Al  Bo'");
    }

    #[test]
    fn test_empty_predicate_matches_all() {
        let fp = canonicalize(&QuerySpec::new("Dog")).unwrap();
        assert_eq!(fp.predicate(), TRUE_PREDICATE);
        assert_eq!(
            fp,
            canonicalize(&QuerySpec::new("Dog").filter(TRUE_PREDICATE)).unwrap()
        );
    }

    #[test]
    fn test_limit_is_part_of_identity() {
        let base = QuerySpec::new("Dog").filter("age > 1");
        let unlimited = canonicalize(&base).unwrap();
        let ten = canonicalize(&base.clone().limit(10)).unwrap();
        let ten_again = canonicalize(&base.clone().limit(10)).unwrap();
        let eleven = canonicalize(&base.clone().limit(11)).unwrap();
        let zero = canonicalize(&base.limit(0)).unwrap();

        assert_eq!(ten, ten_again);
        assert_ne!(ten, eleven);
        assert_ne!(unlimited, ten);
        assert_ne!(unlimited, zero);
        assert_ne!(ten.digest(), eleven.digest());
    }

    #[test]
    fn test_distinct_order_is_irrelevant() {
        let a = QuerySpec::new("Dog").distinct_on("name").distinct_on("age");
        let b = QuerySpec::new("Dog")
            .distinct_on("age")
            .distinct_on("name")
            .distinct_on("age");
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn test_sort_order_is_significant() {
        let a = QuerySpec::new("Dog")
            .sorted_by(SortKey::asc("name"))
            .sorted_by(SortKey::desc("age"));
        let b = QuerySpec::new("Dog")
            .sorted_by(SortKey::desc("age"))
            .sorted_by(SortKey::asc("name"));
        assert_ne!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());

        // A repeated key is dropped.
        let c = a.clone().sorted_by(SortKey::asc("age"));
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&c).unwrap());
    }

    #[test]
    fn test_invalid_queries_rejected() {
        let cases = vec![
            QuerySpec::new(""),
            QuerySpec::new("Dog").filter("(age > 1"),
            QuerySpec::new("Dog").filter("age > 1)"),
            QuerySpec::new("Dog").filter("name == 'unterminated"),
            QuerySpec::new("Dog").sorted_by(SortKey::asc(" ")),
            QuerySpec::new("Dog").distinct_on(""),
        ];
        for spec in cases {
            let result = canonicalize(&spec);
            assert!(
                matches!(result, Err(SyncError::InvalidQuery(_))),
                "expected InvalidQuery for {:?}",
                spec
            );
        }
    }

    #[test]
    fn test_parens_inside_literal_ignored() {
        let fp = canonicalize(&QuerySpec::new("Dog").filter("name == ')('")).unwrap();
        assert_eq!(fp.predicate(), "name == ')('");
    }

    #[test]
    fn test_display() {
        let fp = canonicalize(
            &QuerySpec::new("Dog")
                .filter("age > 1")
                .sorted_by(SortKey::desc("age"))
                .limit(5),
        )
        .unwrap();
        assert_eq!(fp.to_string(), "Dog WHERE age > 1 SORT(age DESC) LIMIT(5)");
    }

    proptest! {
        #[test]
        fn prop_canonicalize_is_idempotent(
            words in proptest::collection::vec("[a-z]{1,6}", 0..6),
            pad in "[ \t\n]{0,3}",
            limit in proptest::option::of(0u64..100),
        ) {
            let predicate = format!("{}{}{}", pad, words.join(&format!(" {} ", pad)), pad);
            let mut spec = QuerySpec::new("Obj").filter(predicate);
            spec.limit = limit;
            let first = canonicalize(&spec).unwrap();

            let mut again = QuerySpec::new(first.object_type()).filter(first.predicate());
            again.limit = first.limit();
            let second = canonicalize(&again).unwrap();
            prop_assert_eq!(first.digest(), second.digest());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_distinct_permutation_invariant(mut fields in proptest::collection::vec("[a-z]{1,4}", 1..6)) {
            let forward = fields.iter().fold(QuerySpec::new("Obj"), |s, f| s.distinct_on(f.clone()));
            fields.reverse();
            let backward = fields.iter().fold(QuerySpec::new("Obj"), |s, f| s.distinct_on(f.clone()));
            prop_assert_eq!(canonicalize(&forward).unwrap(), canonicalize(&backward).unwrap());
        }
    }
}
