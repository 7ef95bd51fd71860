//! Registry of stores, resolvable by code or by database index.
//!
//! The registry is populated once at startup and read afterwards; share it as
//! `Arc<Registry>`. It holds handles only: connecting and closing the stores
//! stays with whoever created them.

use std::collections::HashMap;
use std::fmt;

use crate::store::SharedStore;

/// Directory of stores keyed by code and by db index.
#[derive(Default)]
pub struct Registry {
    by_code: HashMap<String, SharedStore>,
    by_db: HashMap<u32, SharedStore>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `store` under `code` and under its own db index.
    ///
    /// An existing entry for the same code or db index is replaced.
    pub fn add(&mut self, code: impl Into<String>, store: SharedStore) {
        self.by_db.insert(store.db(), store.clone());
        self.by_code.insert(code.into(), store);
    }

    pub fn by_code(&self, code: &str) -> Option<SharedStore> {
        self.by_code.get(code).cloned()
    }

    pub fn by_db(&self, db: u32) -> Option<SharedStore> {
        self.by_db.get(&db).cloned()
    }

    /// Registered codes, in no particular order.
    pub fn codes(&self) -> Vec<String> {
        self.by_code.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<(&str, u32)> = self
            .by_code
            .iter()
            .map(|(code, store)| (code.as_str(), store.db()))
            .collect();
        entries.sort_unstable();
        f.debug_struct("Registry").field("stores", &entries).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use tracing::Span;

    use super::*;
    use crate::redis::RedisStore;

    fn store(db: u32) -> SharedStore {
        Arc::new(RedisStore::new("127.0.0.1:6379", db, &Span::none()))
    }

    #[test]
    fn resolves_by_code_and_db() {
        let mut registry = Registry::new();
        let intraday = store(3);
        registry.add("intraday", intraday.clone());

        let by_code = registry.by_code("intraday").unwrap();
        let by_db = registry.by_db(3).unwrap();
        assert!(Arc::ptr_eq(&by_code, &intraday));
        assert!(Arc::ptr_eq(&by_db, &intraday));
        assert!(registry.by_db(4).is_none());
    }

    #[test]
    fn unknown_keys_are_absent() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        assert!(registry.by_code("missing").is_none());
        assert!(registry.by_db(0).is_none());
        assert!(registry.codes().is_empty());
    }

    #[test]
    fn every_code_resolves_to_its_own_db() {
        let mut registry = Registry::new();
        for (code, db) in [("a", 1), ("b", 2), ("c", 5)] {
            registry.add(code, store(db));
        }

        for code in registry.codes() {
            let by_code = registry.by_code(&code).unwrap();
            let by_db = registry.by_db(by_code.db()).unwrap();
            assert!(Arc::ptr_eq(&by_code, &by_db));
        }
        let codes: HashSet<String> = registry.codes().into_iter().collect();
        let expected: HashSet<String> = ["a", "b", "c"].iter().map(|c| c.to_string()).collect();
        assert_eq!(codes, expected);
    }

    #[test]
    fn re_adding_a_code_replaces_the_store() {
        let mut registry = Registry::new();
        let first = store(1);
        let second = store(2);
        registry.add("intraday", first.clone());
        registry.add("intraday", second.clone());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.codes(), vec!["intraday".to_string()]);
        assert!(Arc::ptr_eq(&registry.by_code("intraday").unwrap(), &second));
        // The db index of the replaced store still resolves to it.
        assert!(Arc::ptr_eq(&registry.by_db(1).unwrap(), &first));
    }

    #[test]
    fn shared_db_index_resolves_to_last_added() {
        let mut registry = Registry::new();
        let first = store(3);
        let second = store(3);
        registry.add("a", first.clone());
        registry.add("b", second.clone());

        assert!(Arc::ptr_eq(&registry.by_code("a").unwrap(), &first));
        assert!(Arc::ptr_eq(&registry.by_db(3).unwrap(), &second));
    }

    #[test]
    fn debug_lists_codes_with_db() {
        let mut registry = Registry::new();
        registry.add("b", store(2));
        registry.add("a", store(1));
        assert_eq!(
            format!("{:?}", registry),
            r#"Registry { stores: [("a", 1), ("b", 2)] }"#
        );
    }
}
