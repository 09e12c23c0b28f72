use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::error::{Result, TierCommError};
use crate::store::RendezvousStore;

/// Process-local rendezvous store.
///
/// Serves in-process multi-rank runs directly and backs the TCP store
/// server.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    published: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key` if it has been published.
    pub fn try_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("memory store"))?;
        Ok(entries.get(key).cloned())
    }

    /// Number of published keys.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("memory store"))?
            .insert(key.to_string(), value.to_vec());
        self.published.notify_waiters();
        Ok(())
    }

    pub(crate) async fn wait_for(&self, key: &str) -> Result<Vec<u8>> {
        loop {
            // Register before checking so a concurrent insert cannot slip
            // between the check and the wait.
            let notified = self.published.notified();
            if let Some(v) = self.try_get(key)? {
                return Ok(v);
            }
            notified.await;
        }
    }
}

impl RendezvousStore for MemoryStore {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.insert(key, value) })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.wait_for(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryStore::new();
        store.put("a", b"hello").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"hello");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.get("late").await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.put("late", &[1, 2, 3]).await.unwrap();
        assert_eq!(waiter.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_try_get_missing() {
        let store = MemoryStore::new();
        assert!(store.try_get("nope").unwrap().is_none());
        assert!(store.is_empty());
    }
}
