use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadModelError {
    #[error("read model lock poisoned")]
    Poisoned,
}

/// Key/value store abstraction for disposable read models.
///
/// Read models can be wiped and rebuilt from the event log at any time, so
/// the interface is deliberately small.
pub trait ReadModelStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>, ReadModelError>;
    fn upsert(&self, key: K, value: V) -> Result<(), ReadModelError>;
    fn list(&self) -> Result<Vec<V>, ReadModelError>;
    /// Drop every record (rebuild support).
    fn clear(&self) -> Result<(), ReadModelError>;
}

impl<K, V, S> ReadModelStore<K, V> for Arc<S>
where
    S: ReadModelStore<K, V> + ?Sized,
{
    fn get(&self, key: &K) -> Result<Option<V>, ReadModelError> {
        (**self).get(key)
    }

    fn upsert(&self, key: K, value: V) -> Result<(), ReadModelError> {
        (**self).upsert(key, value)
    }

    fn list(&self) -> Result<Vec<V>, ReadModelError> {
        (**self).list()
    }

    fn clear(&self) -> Result<(), ReadModelError> {
        (**self).clear()
    }
}

/// In-memory store for tests/dev and the default server wiring.
#[derive(Debug)]
pub struct InMemoryReadModelStore<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> InMemoryReadModelStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryReadModelStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ReadModelStore<K, V> for InMemoryReadModelStore<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Result<Option<V>, ReadModelError> {
        let map = self.inner.read().map_err(|_| ReadModelError::Poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn upsert(&self, key: K, value: V) -> Result<(), ReadModelError> {
        let mut map = self.inner.write().map_err(|_| ReadModelError::Poisoned)?;
        map.insert(key, value);
        Ok(())
    }

    fn list(&self) -> Result<Vec<V>, ReadModelError> {
        let map = self.inner.read().map_err(|_| ReadModelError::Poisoned)?;
        Ok(map.values().cloned().collect())
    }

    fn clear(&self) -> Result<(), ReadModelError> {
        let mut map = self.inner.write().map_err(|_| ReadModelError::Poisoned)?;
        map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_overwrites_and_clear_empties() {
        let store = InMemoryReadModelStore::<u32, &str>::new();
        store.upsert(1, "a").unwrap();
        store.upsert(1, "b").unwrap();
        assert_eq!(store.get(&1).unwrap(), Some("b"));
        assert_eq!(store.list().unwrap(), vec!["b"]);

        store.clear().unwrap();
        assert_eq!(store.get(&1).unwrap(), None);
    }

    #[test]
    fn poisoned_lock_is_an_error_not_an_empty_store() {
        let store = InMemoryReadModelStore::<u32, &str>::new();
        store.upsert(1, "a").unwrap();

        std::thread::scope(|s| {
            let writer = s.spawn(|| {
                let _guard = store.inner.write().unwrap();
                panic!("writer died holding the lock");
            });
            assert!(writer.join().is_err());
        });

        assert_eq!(store.get(&1), Err(ReadModelError::Poisoned));
        assert_eq!(store.list(), Err(ReadModelError::Poisoned));
        assert_eq!(store.upsert(2, "b"), Err(ReadModelError::Poisoned));
        assert_eq!(store.clear(), Err(ReadModelError::Poisoned));
    }
}
