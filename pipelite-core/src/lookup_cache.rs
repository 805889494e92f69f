// pipelite-core/src/lookup_cache.rs
// Key -> document-list cache with LRU eviction and byte accounting
//
// Shared by $lookup and $graphLookup to avoid re-querying the foreign
// collection for a key that was just expanded. The order list is an
// explicit sequence because fresh entries enter at the *middle*: a key
// that was just queried is warmer than the eviction tail but has not
// earned the MRU end the way a repeat hit has.

use crate::document::Document;
use crate::value::{Value, ValueComparator};
use ahash::AHashMap;
use std::collections::VecDeque;

struct CacheEntry {
    values: Vec<Document>,
    /// Bytes charged for this entry: key size plus every value's
    /// size. Eviction subtracts exactly this figure.
    bytes: usize,
}

/// Bounded key -> value-list cache with strict LRU eviction.
///
/// Keys are canonicalized under the pipeline collator, so `"Foo"` and
/// `"foo"` share an entry under a case-insensitive collation.
pub struct LookupSetCache {
    /// front = most-recently-used, back = eviction candidate
    order: VecDeque<Value>,
    map: AHashMap<Value, CacheEntry>,
    cmp: ValueComparator,
    total_bytes: usize,
}

impl LookupSetCache {
    pub fn new(cmp: ValueComparator) -> LookupSetCache {
        LookupSetCache {
            order: VecDeque::new(),
            map: AHashMap::new(),
            cmp,
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    /// Append `value` under `key`, creating the entry if needed.
    ///
    /// Both the existing-key and new-key paths place the key at the
    /// middle of the sequence: recently touched, but not proven reused.
    pub fn insert(&mut self, key: &Value, value: Document) {
        let canonical = self.cmp.canonicalize(key);
        let added = value.approximate_size();

        if let Some(entry) = self.map.get_mut(&canonical) {
            entry.values.push(value);
            entry.bytes += added;
            self.total_bytes += added;
            self.remove_from_order(&canonical);
        } else {
            let bytes = canonical.approximate_size() + added;
            self.map.insert(
                canonical.clone(),
                CacheEntry {
                    values: vec![value],
                    bytes,
                },
            );
            self.total_bytes += bytes;
        }
        let middle = self.order.len() / 2;
        self.order.insert(middle, canonical);
    }

    /// Look up a key. A hit relocates the entry to the
    /// most-recently-used end; a miss has no side effects.
    pub fn get(&mut self, key: &Value) -> Option<&[Document]> {
        let canonical = self.cmp.canonicalize(key);
        if !self.map.contains_key(&canonical) {
            return None;
        }
        self.remove_from_order(&canonical);
        self.order.push_front(canonical.clone());
        self.map.get(&canonical).map(|e| e.values.as_slice())
    }

    /// Evict least-recently-used entries until the byte total is at or
    /// under `max_bytes`.
    pub fn evict_down_to(&mut self, max_bytes: usize) {
        while self.total_bytes > max_bytes {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Evict least-recently-used entries until at most `max_count`
    /// remain.
    pub fn evict_until_size(&mut self, max_count: usize) {
        while self.map.len() > max_count {
            if !self.evict_one() {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.map.clear();
        self.total_bytes = 0;
    }

    fn evict_one(&mut self) -> bool {
        let Some(victim) = self.order.pop_back() else {
            return false;
        };
        if let Some(entry) = self.map.remove(&victim) {
            self.total_bytes -= entry.bytes;
            crate::log_debug!(
                "evicted lookup cache entry ({} bytes, {} values)",
                entry.bytes,
                entry.values.len()
            );
        }
        true
    }

    fn remove_from_order(&mut self, key: &Value) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collation::Collator;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(json: serde_json::Value) -> Document {
        Document::from_json(&json)
    }

    fn cache() -> LookupSetCache {
        LookupSetCache::new(ValueComparator::default())
    }

    #[test]
    fn test_insert_and_get() {
        let mut c = cache();
        c.insert(&Value::Int64(1), doc(json!({"x": 1})));
        c.insert(&Value::Int64(1), doc(json!({"x": 2})));
        c.insert(&Value::Int64(2), doc(json!({"y": 1})));

        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&Value::Int64(1)).unwrap().len(), 2);
        assert!(c.get(&Value::Int64(3)).is_none());
    }

    #[test]
    fn test_eviction_is_lru() {
        let mut c = cache();
        for k in 0..4 {
            c.insert(&Value::Int64(k), doc(json!({"payload": "xxxxxxxx"})));
        }
        // Touch 0 and 2 so they move to the MRU end
        c.get(&Value::Int64(0));
        c.get(&Value::Int64(2));

        c.evict_until_size(2);
        assert_eq!(c.len(), 2);
        assert!(c.get(&Value::Int64(0)).is_some());
        assert!(c.get(&Value::Int64(2)).is_some());
        assert!(c.get(&Value::Int64(1)).is_none());
        assert!(c.get(&Value::Int64(3)).is_none());
    }

    #[test]
    fn test_evict_down_to_bytes() {
        let mut c = cache();
        for k in 0..10 {
            c.insert(&Value::Int64(k), doc(json!({"payload": "0123456789abcdef"})));
        }
        let before = c.bytes();
        let ceiling = before / 2;
        c.evict_down_to(ceiling);
        assert!(c.bytes() <= ceiling);
        assert!(c.len() < 10);
    }

    #[test]
    fn test_byte_accounting_cancels_exactly() {
        let mut c = cache();
        assert_eq!(c.bytes(), 0);
        c.insert(&Value::Int64(1), doc(json!({"a": "abc"})));
        c.insert(&Value::Int64(1), doc(json!({"b": "defg"})));
        c.insert(&Value::Int64(2), doc(json!({"c": 1})));
        c.evict_down_to(0);
        assert_eq!(c.len(), 0);
        assert_eq!(c.bytes(), 0, "eviction must cancel every added byte");
    }

    #[test]
    fn test_collated_keys_share_entry() {
        let cmp = ValueComparator::new(Some(Arc::new(Collator::case_insensitive())));
        let mut c = LookupSetCache::new(cmp);
        c.insert(&Value::string("Foo"), doc(json!({"n": 1})));
        c.insert(&Value::string("FOO"), doc(json!({"n": 2})));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&Value::string("foo")).unwrap().len(), 2);
    }

    #[test]
    fn test_miss_has_no_side_effects() {
        let mut c = cache();
        c.insert(&Value::Int64(1), doc(json!({"x": 1})));
        let before = c.bytes();
        assert!(c.get(&Value::Int64(99)).is_none());
        assert_eq!(c.bytes(), before);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut c = cache();
        c.insert(&Value::Int64(1), doc(json!({"x": 1})));
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.bytes(), 0);
    }
}
