//! Source Store: in-memory mapping of loaded sources to per-CPT rate
//! lists.

use crate::model::{CptEntry, RateRecord, Source};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Thread-safe table of named [`Source`]s.
///
/// Whole-map locking: a writer replacing a source in full holds an
/// exclusive lock; readers (`get`, `list_names`) take a shared lock.
pub struct SourceStore {
    sources: RwLock<HashMap<String, Source>>,
}

impl SourceStore {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Insert-or-merge a batch of CPT entries into `source_name`.
    pub fn upsert_many(&self, source_name: &str, entries: impl IntoIterator<Item = (String, String, Vec<RateRecord>)>) {
        let mut sources = self.sources.write().expect("source store poisoned");
        let source = sources
            .entry(source_name.to_string())
            .or_insert_with(|| Source::new(source_name));
        let mut n_codes = 0usize;
        let mut n_rates = 0usize;
        for (code, description, rates) in entries {
            n_codes += 1;
            n_rates += rates.len();
            source.upsert(&code, &description, rates);
        }
        debug!(source = source_name, codes = n_codes, rates = n_rates, "upserted into source store");
    }

    /// Replace a source's contents wholesale.
    pub fn replace(&self, source_name: &str, source: Source) {
        let mut sources = self.sources.write().expect("source store poisoned");
        debug!(source = source_name, codes = source.entries.len(), "replaced source in full");
        sources.insert(source_name.to_string(), source);
    }

    /// Look up a CPT entry within a source.
    pub fn lookup(&self, source_name: &str, code: &str) -> Option<CptEntry> {
        let sources = self.sources.read().expect("source store poisoned");
        sources.get(source_name)?.entries.get(code.trim()).cloned()
    }

    /// Clone an entire source's entry map, for comparators that need the
    /// full key set.
    pub fn snapshot(&self, source_name: &str) -> Option<HashMap<String, CptEntry>> {
        let sources = self.sources.read().expect("source store poisoned");
        sources.get(source_name).map(|s| s.entries.clone())
    }

    pub fn list_names(&self) -> Vec<String> {
        let sources = self.sources.read().expect("source store poisoned");
        let mut names: Vec<String> = sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, source_name: &str) -> bool {
        self.sources.read().expect("source store poisoned").contains_key(source_name)
    }

    pub fn delete(&self, source_name: &str) -> bool {
        let mut sources = self.sources.write().expect("source store poisoned");
        debug!(source = source_name, "deleted source");
        sources.remove(source_name).is_some()
    }
}

impl Default for SourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(v: f64) -> RateRecord {
        RateRecord {
            negotiated_rate: v,
            billing_class: "professional".to_string(),
            billing_code_modifier: vec![],
            service_code: vec![],
            negotiated_type: "negotiated".to_string(),
            expiration_date: None,
        }
    }

    #[test]
    fn upsert_then_lookup() {
        let store = SourceStore::new();
        store.upsert_many("a", vec![("99213".to_string(), "Office visit".to_string(), vec![rate(100.0)])]);
        let entry = store.lookup("a", "99213").unwrap();
        assert_eq!(entry.description, "Office visit");
        assert_eq!(entry.rates.len(), 1);
    }

    #[test]
    fn list_names_is_sorted_and_deduped() {
        let store = SourceStore::new();
        store.upsert_many("b", vec![]);
        store.upsert_many("a", vec![]);
        assert_eq!(store.list_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn replace_in_full_drops_prior_contents() {
        let store = SourceStore::new();
        store.upsert_many("a", vec![("1".to_string(), "x".to_string(), vec![rate(1.0)])]);
        let mut fresh = Source::new("a");
        fresh.upsert("2", "y", vec![rate(2.0)]);
        store.replace("a", fresh);
        assert!(store.lookup("a", "1").is_none());
        assert!(store.lookup("a", "2").is_some());
    }

    #[test]
    fn delete_reports_whether_it_existed() {
        let store = SourceStore::new();
        assert!(!store.delete("ghost"));
        store.upsert_many("a", vec![]);
        assert!(store.delete("a"));
        assert!(!store.contains("a"));
    }
}
