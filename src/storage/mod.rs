// [src/storage/mod.rs]
//! Backing storage abstraction.
//!
//! The spec treats the real storage backend as an external collaborator
//! (§6: "Storage backend: provides `get/put/delete/list` with strong
//! read-your-writes within a single key"). This module defines that
//! interface plus a reference in-memory implementation shaped after
//! `AppState::heartbeat_buffer` (`Arc<Mutex<HashMap<...>>>`), suitable for
//! tests and for hosts that layer a real backend underneath.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::CoreError;

/// Transient failures are retried by callers up to 3 times with exponential
/// backoff (base 100ms) per §7 before `CoreError::Storage` is surfaced;
/// this trait itself only reports success/failure of a single attempt.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    /// Ordered list of keys sharing `prefix`, lexicographically sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError>;
}

/// Reference in-memory `Storage` implementation. Not durable — intended
/// for tests and as a template for a real backend adapter.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError> {
        self.inner.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .inner
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Retries a fallible storage call up to 3 times with exponential backoff
/// (base 100ms), surfacing `CoreError::Storage` only after the final
/// attempt fails — the retry policy mandated by §7.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoreError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    const BASE_DELAY_MS: u64 = 100;

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff = BASE_DELAY_MS * 2u64.pow(attempt - 1);
                tracing::warn!(attempt, backoff_ms = backoff, error = %err, "storage operation retrying");
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
            Err(err) => return Err(CoreError::Storage(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let storage = InMemoryStorage::new();
        storage.put("config", b"hello".to_vec()).await.unwrap();
        assert_eq!(storage.get("config").await.unwrap(), Some(b"hello".to_vec()));
        storage.delete("config").await.unwrap();
        assert_eq!(storage.get("config").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_absent_key_succeeds() {
        let storage = InMemoryStorage::new();
        assert!(storage.delete("nope").await.is_ok());
    }

    #[tokio::test]
    async fn list_returns_ordered_prefix_matches() {
        let storage = InMemoryStorage::new();
        storage.put("role/b", vec![]).await.unwrap();
        storage.put("role/a", vec![]).await.unwrap();
        storage.put("config", vec![]).await.unwrap();
        let roles = storage.list("role/").await.unwrap();
        assert_eq!(roles, vec!["role/a".to_string(), "role/b".to_string()]);
    }
}
