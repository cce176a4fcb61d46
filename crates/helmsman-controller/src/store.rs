//! The system keyspace the controller owns.
//!
//! Durable cluster state lives in coordinators and in a system keyspace of
//! the database itself; the controller only reads and writes it through
//! this narrow transactional interface. An in-memory implementation backs
//! tests and single-process bring-up.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use helmsman_core::class::ProcessClass;
use helmsman_core::error::{Error, Result};
use helmsman_core::types::{Locality, ProcessId};

/// Key prefix for per-process class overrides.
pub const PROCESS_CLASS_PREFIX: &str = "process_class/";
/// Guards the one-time process-class schema migration.
pub const PROCESS_CLASS_VERSION_KEY: &str = "process_class_version";
/// Value written by the migration.
pub const PROCESS_CLASS_VERSION_VALUE: &str = "1";
/// Touched by operators after changing class overrides.
pub const PROCESS_CLASS_CHANGE_KEY: &str = "process_class_change";
/// Key prefix for the worker list maintained by the controller.
pub const WORKER_LIST_PREFIX: &str = "worker_list/";
/// Key prefix for read-version samples keyed by wall clock.
pub const TIME_KEEPER_PREFIX: &str = "timekeeper/";
/// Guards the time-keeper schema version.
pub const TIME_KEEPER_VERSION_KEY: &str = "timekeeper_version";
/// Disables time-keeper sampling when present.
pub const TIME_KEEPER_DISABLE_KEY: &str = "timekeeper_disable";
/// Client transaction-sampling rate.
pub const CLIENT_TXN_SAMPLE_RATE_KEY: &str = "client_txn_sample_rate";
/// Client transaction-sampling size limit.
pub const CLIENT_TXN_SIZE_LIMIT_KEY: &str = "client_txn_size_limit";

/// Key for one process's class override.
pub fn process_class_key(id: &ProcessId) -> String {
    format!("{PROCESS_CLASS_PREFIX}{id}")
}

/// Key for one process's worker-list entry.
pub fn worker_list_key(id: &ProcessId) -> String {
    format!("{WORKER_LIST_PREFIX}{id}")
}

/// Key for one time-keeper sample.
pub fn time_keeper_key(epoch_secs: i64) -> String {
    format!("{TIME_KEEPER_PREFIX}{epoch_secs:020}")
}

/// The worker-list record persisted per known process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessData {
    /// Locality of the process.
    pub locality: Locality,
    /// Class it was registered with.
    pub process_class: ProcessClass,
    /// Its network address.
    pub address: std::net::SocketAddr,
}

/// One write in a store transaction.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Sets a key.
    Set(String, Vec<u8>),
    /// Clears a key.
    Clear(String),
    /// Clears the half-open key range `[start, end)`.
    ClearRange(String, String),
}

/// Transactional access to the system keyspace.
///
/// Implementations provide atomic application of a mutation batch and a
/// level-triggered watch per key. Callers wrap every commit in the retry
/// loop of [`retry`].
#[async_trait]
pub trait SystemStore: Send + Sync {
    /// Reads one key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads all keys with the given prefix, in key order.
    async fn get_range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Applies a batch atomically.
    async fn apply(&self, mutations: Vec<Mutation>) -> Result<()>;

    /// The store's current read version.
    async fn read_version(&self) -> Result<i64>;

    /// Completes after the key next changes (set or cleared).
    async fn watch(&self, key: &str) -> Result<()>;
}

/// Retries a store operation until it succeeds, backing off between
/// attempts. Mirrors the standard transaction `on_error` discipline:
/// commit conflicts and transient failures retry, task cancellation
/// propagates naturally.
pub async fn retry<T, F, Fut>(retry_delay: f64, mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Ok(value) => return value,
            Err(err) => {
                tracing::warn!(error = %err, "System store transaction failed; retrying");
                tokio::time::sleep(std::time::Duration::from_secs_f64(retry_delay)).await;
            }
        }
    }
}

/// In-memory [`SystemStore`] for tests and single-process clusters.
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    version: Mutex<i64>,
    changes: broadcast::Sender<String>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        Arc::new(Self { data: Mutex::new(BTreeMap::new()), version: Mutex::new(0), changes })
    }
}

#[async_trait]
impl SystemStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn get_range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.lock();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn apply(&self, mutations: Vec<Mutation>) -> Result<()> {
        let mut touched = Vec::new();
        {
            let mut data = self.data.lock();
            for mutation in mutations {
                match mutation {
                    Mutation::Set(key, value) => {
                        data.insert(key.clone(), value);
                        touched.push(key);
                    }
                    Mutation::Clear(key) => {
                        data.remove(&key);
                        touched.push(key);
                    }
                    Mutation::ClearRange(start, end) => {
                        let keys: Vec<String> = data
                            .range(start..end)
                            .map(|(k, _)| k.clone())
                            .collect();
                        for key in keys {
                            data.remove(&key);
                            touched.push(key);
                        }
                    }
                }
            }
            *self.version.lock() += 1;
        }
        for key in touched {
            let _ = self.changes.send(key);
        }
        Ok(())
    }

    async fn read_version(&self) -> Result<i64> {
        Ok(*self.version.lock())
    }

    async fn watch(&self, key: &str) -> Result<()> {
        let mut rx = self.changes.subscribe();
        loop {
            match rx.recv().await {
                Ok(changed) if changed == key => return Ok(()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Store("store closed".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_clear() {
        let store = MemoryStore::new();
        store.apply(vec![Mutation::Set("a".into(), b"1".to_vec())]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));

        store.apply(vec![Mutation::Clear("a".into())]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_range_reads_are_prefix_scoped() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                Mutation::Set("p/a".into(), b"1".to_vec()),
                Mutation::Set("p/b".into(), b"2".to_vec()),
                Mutation::Set("q/c".into(), b"3".to_vec()),
            ])
            .await
            .unwrap();

        let range = store.get_range("p/").await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, "p/a");
    }

    #[tokio::test]
    async fn test_clear_range_is_half_open() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                Mutation::Set("t/1".into(), b"1".to_vec()),
                Mutation::Set("t/2".into(), b"2".to_vec()),
                Mutation::Set("t/3".into(), b"3".to_vec()),
            ])
            .await
            .unwrap();

        store.apply(vec![Mutation::ClearRange("t/1".into(), "t/3".into())]).await.unwrap();
        let rest = store.get_range("t/").await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, "t/3");
    }

    #[tokio::test]
    async fn test_watch_fires_on_change() {
        let store = MemoryStore::new();
        let watched = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("k").await })
        };
        tokio::task::yield_now().await;
        store.apply(vec![Mutation::Set("k".into(), b"v".to_vec())]).await.unwrap();
        watched.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_version_advances_on_apply() {
        let store = MemoryStore::new();
        let v0 = store.read_version().await.unwrap();
        store.apply(vec![Mutation::Set("k".into(), b"v".to_vec())]).await.unwrap();
        assert!(store.read_version().await.unwrap() > v0);
    }

    #[test]
    fn test_time_keeper_keys_sort_numerically() {
        assert!(time_keeper_key(9) < time_keeper_key(10));
        assert!(time_keeper_key(99) < time_keeper_key(100));
    }
}
