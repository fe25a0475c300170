//! Key-value state for stateful transforms.
//!
//! The store is an injected capability rather than an embedded engine, so
//! local-disk, in-memory, or remote-backed implementations are
//! interchangeable. The runtime keeps one store instance per partition,
//! which makes writes visible to subsequent calls without any
//! cross-partition contention.

use std::collections::HashMap;

/// Key-value store capability available to stateful transforms.
pub trait StateStore: Send {
    /// Returns the value for `key`, if present.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&mut self, key: &[u8], value: Vec<u8>);

    /// Removes and returns the value for `key`.
    fn delete(&mut self, key: &[u8]) -> Option<Vec<u8>>;

    /// Returns the number of stored keys.
    fn len(&self) -> usize;

    /// Returns `true` if the store holds no keys.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory that builds one [`StateStore`] per assigned partition.
pub type StateStoreFactory = Box<dyn Fn(i32) -> Box<dyn StateStore> + Send>;

/// Simple in-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryStateStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) {
        self.entries.insert(key.to_vec(), value);
    }

    fn delete(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
