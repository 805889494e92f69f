// pipelite-core/src/document.rs
// Ordered-field document with out-of-band metadata

use crate::collation::Collator;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// An immutable, ordered mapping from field name to [`Value`].
///
/// Field insertion order is preserved and significant for comparison
/// and serialization. Documents are built through [`DocumentBuilder`]
/// and frozen; once inside a pipeline they are shared by `Arc` and
/// never mutated in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
    // No skip_serializing_if here: spill runs go through bincode,
    // which requires a symmetric field layout
    #[serde(default)]
    metadata: Metadata,
}

/// Metadata carried alongside a document, invisible to user-facing
/// field access: the random sort key attached by $sample and a text
/// score slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub rand_sort_key: Option<f64>,
    pub text_score: Option<f64>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.rand_sort_key.is_none() && self.text_score.is_none()
    }
}

impl Document {
    pub fn new() -> Document {
        Document::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Top-level field lookup. Returns `None` when absent; callers
    /// that need the Missing value use [`Document::get_value`].
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Like [`Document::get`] but materializes absence as
    /// `Value::Missing`.
    pub fn get_value(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or(Value::Missing)
    }

    /// Dot-path navigation: nested objects and numeric array indices,
    /// e.g. `"address.city"` or `"items.0.name"`.
    pub fn get_path(&self, path: &str) -> Value {
        if path.is_empty() {
            return Value::Missing;
        }
        if !path.contains('.') {
            return self.get_value(path);
        }

        let mut parts = path.split('.');
        let mut current = self.get_value(parts.next().unwrap());
        for part in parts {
            current = match current {
                Value::Object(doc) => doc.get_value(part),
                Value::Array(arr) => match part.parse::<usize>() {
                    Ok(index) => arr.get(index).cloned().unwrap_or(Value::Missing),
                    Err(_) => Value::Missing,
                },
                _ => Value::Missing,
            };
            if current.is_missing() {
                return Value::Missing;
            }
        }
        current
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == name)
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Stable byte estimate, consistent with `Value::approximate_size`.
    pub fn approximate_size(&self) -> usize {
        std::mem::size_of::<Document>()
            + self
                .fields
                .iter()
                .map(|(k, v)| k.len() + v.approximate_size())
                .sum::<usize>()
    }

    /// Field-by-field comparison: name (byte order), then value, then
    /// field count. Matches the object ordering the value model
    /// promises.
    pub fn compare(a: &Document, b: &Document, collator: Option<&Collator>) -> Ordering {
        for ((ka, va), (kb, vb)) in a.fields.iter().zip(b.fields.iter()) {
            let name_cmp = ka.cmp(kb);
            if name_cmp != Ordering::Equal {
                return name_cmp;
            }
            let value_cmp = Value::compare(va, vb, collator);
            if value_cmp != Ordering::Equal {
                return value_cmp;
            }
        }
        a.fields.len().cmp(&b.fields.len())
    }

    pub fn hash_with<H: Hasher>(&self, state: &mut H, collator: Option<&Collator>) {
        state.write_usize(self.fields.len());
        for (k, v) in &self.fields {
            k.hash(state);
            v.hash_with(state, collator);
        }
    }

    /// Recursively replace string values with their collation keys;
    /// see `ValueComparator::canonicalize`.
    pub fn canonicalize(&self, collator: &Collator) -> Document {
        let cmp =
            crate::value::ValueComparator::new(Some(std::sync::Arc::new(collator.clone())));
        let mut builder = DocumentBuilder::new();
        for (k, v) in self.iter() {
            builder.set(k, cmp.canonicalize(v));
        }
        builder.freeze()
    }

    /// Parse from a JSON object. Non-object input yields an empty
    /// document; stage parsers validate shape before calling this.
    pub fn from_json(json: &serde_json::Value) -> Document {
        let mut builder = DocumentBuilder::new();
        if let serde_json::Value::Object(map) = json {
            for (k, v) in map {
                builder.set(k, Value::from_json(v));
            }
        }
        builder.freeze()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, v) in self.iter() {
            map.insert(k.to_string(), v.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Document::compare(self, other, None) == Ordering::Equal
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_with(state, None)
    }
}

/// Mutable builder, frozen into an immutable [`Document`].
#[derive(Debug, Clone, Default)]
pub struct DocumentBuilder {
    fields: Vec<(String, Value)>,
    metadata: Metadata,
}

impl DocumentBuilder {
    pub fn new() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    /// Start from an existing document, keeping field order and
    /// metadata.
    pub fn from_document(doc: &Document) -> DocumentBuilder {
        DocumentBuilder {
            fields: doc.fields.clone(),
            metadata: doc.metadata.clone(),
        }
    }

    /// Set a top-level field, replacing in place (order preserved) or
    /// appending.
    pub fn set(&mut self, name: &str, value: Value) -> &mut Self {
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
        self
    }

    /// Set a value at a dot path, creating intermediate objects as
    /// needed. Setting through a non-object intermediate replaces it.
    pub fn set_path(&mut self, path: &str, value: Value) -> &mut Self {
        if !path.contains('.') {
            return self.set(path, value);
        }
        let (head, rest) = path.split_once('.').unwrap();
        let nested = match self.fields.iter().find(|(k, _)| k == head).map(|(_, v)| v) {
            Some(Value::Object(doc)) => {
                let mut inner = DocumentBuilder::from_document(doc);
                inner.set_path(rest, value);
                Value::object(inner.freeze())
            }
            _ => {
                let mut inner = DocumentBuilder::new();
                inner.set_path(rest, value);
                Value::object(inner.freeze())
            }
        };
        self.set(head, nested)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Remove a dot path; intermediate misses are a no-op.
    pub fn remove_path(&mut self, path: &str) -> &mut Self {
        if !path.contains('.') {
            self.remove(path);
            return self;
        }
        let (head, rest) = path.split_once('.').unwrap();
        if let Some(Value::Object(doc)) =
            self.fields.iter().find(|(k, _)| k == head).map(|(_, v)| v)
        {
            let mut inner = DocumentBuilder::from_document(doc);
            inner.remove_path(rest);
            self.set(head, Value::object(inner.freeze()));
        }
        self
    }

    pub fn set_rand_sort_key(&mut self, key: f64) -> &mut Self {
        self.metadata.rand_sort_key = Some(key);
        self
    }

    pub fn set_text_score(&mut self, score: f64) -> &mut Self {
        self.metadata.text_score = Some(score);
        self
    }

    pub fn freeze(self) -> Document {
        Document {
            fields: self.fields,
            metadata: self.metadata,
        }
    }
}
