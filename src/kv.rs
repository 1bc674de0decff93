//! Demo broker - Key-Value Store collaborator
//!
//! Spec §2 names the KV store as an external collaborator providing
//! durable storage for invites and the session-resume hint, with every
//! key carrying a TTL. This module defines the trait seam (`KvStore`)
//! and ships an in-memory implementation so the broker is runnable
//! without a real external KV service; a production deployment would
//! swap in a client backed by `kv_url` without changing any caller.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

/// Errors a KV backend can report.
#[derive(Debug, Clone, PartialEq)]
pub enum KvError {
    Unavailable(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "KV store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for KvError {}

/// A durable, TTL-bearing key-value store.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory TTL-evicting key-value store.
///
/// Values are stored behind a single `RwLock`, which is adequate for the
/// broker's load: invite reads/writes and resume-hint churn are low
/// frequency relative to the queue/session hot paths.
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Drop all expired entries. Intended to be driven by a periodic
    /// background sweep, mirroring the broker's other cleanup loops.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let reaped = before - entries.len();
        if reaped > 0 {
            debug!("kv: reaped {} expired entries", reaped);
        }
        reaped
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|e| e.expires_at > Instant::now()).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry { value, expires_at: Instant::now() + ttl });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at > now)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("invite:abc", "payload".to_string(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("invite:abc").await.unwrap(), Some("payload".to_string()));
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("k", "v".to_string(), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reap_expired_removes_stale_entries() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("k1", "v".to_string(), Duration::from_millis(1)).await.unwrap();
        kv.set_with_ttl("k2", "v".to_string(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = kv.reap_expired().await;
        assert_eq!(reaped, 1);
        assert!(kv.get("k2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("k", "v".to_string(), Duration::from_secs(60)).await.unwrap();
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_finds_matching_live_keys() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("session:a", "1".to_string(), Duration::from_secs(60)).await.unwrap();
        kv.set_with_ttl("session:b", "2".to_string(), Duration::from_secs(60)).await.unwrap();
        kv.set_with_ttl("invite:c", "3".to_string(), Duration::from_secs(60)).await.unwrap();
        let mut results = kv.scan_prefix("session:").await.unwrap();
        results.sort();
        assert_eq!(results, vec![("session:a".to_string(), "1".to_string()), ("session:b".to_string(), "2".to_string())]);
    }
}
