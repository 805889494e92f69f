// pipelite-core/src/collation.rs
// Pluggable string comparison strategies

use crate::error::{PipeLiteError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;

/// String-comparison strategy affecting equality and ordering of string
/// values throughout the engine.
///
/// A collator is carried by the `ExpressionContext` and propagated to
/// match expressions, group keys and lookup-cache keys. Two values that
/// compare equal under a collator must also hash equal under it, which
/// is why every strategy exposes a [`Collator::collation_key`] usable
/// as a hashing proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collator {
    kind: CollatorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CollatorKind {
    /// Raw byte comparison (the default when no collation is given)
    Binary,
    /// ASCII case-insensitive comparison
    CaseInsensitive,
    /// Embedded digit runs compare by numeric value ("doc2" < "doc10")
    NumericOrdering,
}

impl Collator {
    pub fn binary() -> Self {
        Collator {
            kind: CollatorKind::Binary,
        }
    }

    pub fn case_insensitive() -> Self {
        Collator {
            kind: CollatorKind::CaseInsensitive,
        }
    }

    pub fn numeric_ordering() -> Self {
        Collator {
            kind: CollatorKind::NumericOrdering,
        }
    }

    /// Parse a collation document, e.g. `{"locale": "simple", "strength": 2}`.
    ///
    /// Supported fields: `locale` (only "simple"), `strength` (1 or 2
    /// selects case-insensitive, 3 binary), `numericOrdering` (bool).
    pub fn from_spec(spec: &serde_json::Value) -> Result<Self> {
        let obj = spec.as_object().ok_or_else(|| {
            PipeLiteError::InvalidPipeline("collation must be an object".to_string())
        })?;

        if let Some(locale) = obj.get("locale") {
            if locale.as_str() != Some("simple") {
                return Err(PipeLiteError::InvalidPipeline(format!(
                    "unsupported collation locale: {}",
                    locale
                )));
            }
        }

        if obj.get("numericOrdering").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(Collator::numeric_ordering());
        }

        match obj.get("strength").and_then(|v| v.as_i64()) {
            Some(1) | Some(2) => Ok(Collator::case_insensitive()),
            Some(3) | None => Ok(Collator::binary()),
            Some(other) => Err(PipeLiteError::InvalidPipeline(format!(
                "unsupported collation strength: {}",
                other
            ))),
        }
    }

    /// Serialize back to the collation-document form.
    pub fn to_spec(&self) -> serde_json::Value {
        match self.kind {
            CollatorKind::Binary => serde_json::json!({"locale": "simple"}),
            CollatorKind::CaseInsensitive => {
                serde_json::json!({"locale": "simple", "strength": 2})
            }
            CollatorKind::NumericOrdering => {
                serde_json::json!({"locale": "simple", "numericOrdering": true})
            }
        }
    }

    /// Compare two strings under this collation.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self.kind {
            CollatorKind::Binary => a.cmp(b),
            CollatorKind::CaseInsensitive => {
                let la = a.to_lowercase();
                let lb = b.to_lowercase();
                la.cmp(&lb)
            }
            CollatorKind::NumericOrdering => numeric_compare(a, b),
        }
    }

    pub fn eq(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// A canonical key such that `compare(a, b) == Equal` implies
    /// `collation_key(a) == collation_key(b)`. Used for hashing and for
    /// canonicalized map keys.
    pub fn collation_key<'a>(&self, s: &'a str) -> Cow<'a, str> {
        match self.kind {
            CollatorKind::Binary => Cow::Borrowed(s),
            CollatorKind::CaseInsensitive => Cow::Owned(s.to_lowercase()),
            CollatorKind::NumericOrdering => Cow::Owned(numeric_key(s)),
        }
    }
}

impl Default for Collator {
    fn default() -> Self {
        Collator::binary()
    }
}

/// Compare strings segment-by-segment, digit runs by numeric value.
fn numeric_compare(a: &str, b: &str) -> Ordering {
    let mut ia = a.chars().peekable();
    let mut ib = b.chars().peekable();

    loop {
        match (ia.peek().copied(), ib.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let da = take_digits(&mut ia);
                    let db = take_digits(&mut ib);
                    let cmp = compare_digit_runs(&da, &db);
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                } else {
                    let cmp = ca.cmp(&cb);
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                    ia.next();
                    ib.next();
                }
            }
        }
    }
}

fn take_digits(it: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut run = String::new();
    while let Some(c) = it.peek() {
        if c.is_ascii_digit() {
            run.push(*c);
            it.next();
        } else {
            break;
        }
    }
    run
}

/// Compare digit runs numerically without overflow: strip leading
/// zeros, longer run wins, lexicographic otherwise.
fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Canonical form for hashing under numeric ordering: digit runs lose
/// their leading zeros (an all-zero run keeps a single zero).
fn numeric_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut it = s.chars().peekable();
    while let Some(c) = it.peek().copied() {
        if c.is_ascii_digit() {
            let run = take_digits(&mut it);
            let trimmed = run.trim_start_matches('0');
            if trimmed.is_empty() {
                out.push('0');
            } else {
                out.push_str(trimmed);
            }
        } else {
            out.push(c);
            it.next();
        }
    }
    out
}
