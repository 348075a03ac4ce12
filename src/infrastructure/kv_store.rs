use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// A batch of writes applied atomically.
#[derive(Debug, Default)]
pub struct KvBatch {
    ops: Vec<BatchOp>,
}

#[derive(Debug)]
enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put(key.into(), value));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Key/value backend contract: string keys, atomic batches, ordered
/// iteration. The journal and the dataset both persist through this seam.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;
    async fn commit(&self, batch: KvBatch) -> EngineResult<()>;
    /// All `(key, value)` pairs under a prefix, in key order.
    async fn scan_prefix(&self, prefix: &str) -> EngineResult<Vec<(String, Vec<u8>)>>;
    /// The first pair with `prefix` whose key is strictly greater than
    /// `after`.
    async fn next_after(&self, after: &str, prefix: &str)
        -> EngineResult<Option<(String, Vec<u8>)>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        let mut batch = KvBatch::new();
        batch.put(key, value);
        self.commit(batch).await
    }
}

/// Persistent store on sled.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let db = sled::open(path.as_ref())?;
        info!("opened dataset at {}", path.as_ref().display());
        Ok(Self { db })
    }
}

#[async_trait]
impl KvStore for SledStore {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    async fn commit(&self, batch: KvBatch) -> EngineResult<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => sled_batch.insert(key.as_bytes(), value),
                BatchOp::Delete(key) => sled_batch.remove(key.as_bytes()),
            }
        }
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    async fn next_after(
        &self,
        after: &str,
        prefix: &str,
    ) -> EngineResult<Option<(String, Vec<u8>)>> {
        for item in self.db.range(after.as_bytes()..) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            if key.as_str() == after {
                continue;
            }
            return Ok(key.starts_with(prefix).then(|| (key, value.to_vec())));
        }
        Ok(None)
    }
}

/// In-memory store used by tests and transient clones.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn commit(&self, batch: KvBatch) -> EngineResult<()> {
        let mut map = self.map.write().await;
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        let map = self.map.read().await;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn next_after(
        &self,
        after: &str,
        prefix: &str,
    ) -> EngineResult<Option<(String, Vec<u8>)>> {
        let map = self.map.read().await;
        Ok(map
            .range((Bound::Excluded(after.to_string()), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

const DOMAIN_KEY: &str = "domain";

/// The stored domain marker: names the domain the dataset belongs to and,
/// while an engine is attached, the owning session.
#[derive(Debug, Serialize, Deserialize)]
pub struct DomainMarker {
    pub domain: String,
    pub owner: Option<String>,
}

/// Assert exclusive ownership of the dataset for `domain`. Returns the
/// session token to pass to [`release_dataset`], and whether the dataset
/// was empty (no marker) before this claim.
pub async fn claim_dataset(
    store: &dyn KvStore,
    domain: &str,
) -> EngineResult<(String, bool)> {
    let session = Uuid::new_v4().to_string();
    let (marker, new) = match store.get(DOMAIN_KEY).await? {
        Some(bytes) => {
            let marker: DomainMarker = rmp_serde::from_slice(&bytes)?;
            if marker.domain != domain {
                return Err(EngineError::Configuration(format!(
                    "dataset belongs to domain '{}', not '{}'",
                    marker.domain, domain
                )));
            }
            if let Some(owner) = &marker.owner {
                return Err(EngineError::DatasetInUse(format!(
                    "dataset for '{}' is owned by session {}",
                    domain, owner
                )));
            }
            (marker, false)
        }
        None => (
            DomainMarker {
                domain: domain.to_string(),
                owner: None,
            },
            true,
        ),
    };
    let claimed = DomainMarker {
        owner: Some(session.clone()),
        ..marker
    };
    store.put(DOMAIN_KEY, rmp_serde::to_vec(&claimed)?).await?;
    debug!(domain = %domain, session = %session, "claimed dataset");
    Ok((session, new))
}

/// Release a prior claim. A mismatched session token leaves the marker
/// alone.
pub async fn release_dataset(
    store: &dyn KvStore,
    domain: &str,
    session: &str,
) -> EngineResult<()> {
    if let Some(bytes) = store.get(DOMAIN_KEY).await? {
        let marker: DomainMarker = rmp_serde::from_slice(&bytes)?;
        if marker.owner.as_deref() == Some(session) {
            let released = DomainMarker {
                domain: domain.to_string(),
                owner: None,
            };
            store.put(DOMAIN_KEY, rmp_serde::to_vec(&released)?).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn exercise_store(store: &dyn KvStore) {
        store.put("a:1", b"one".to_vec()).await.unwrap();
        store.put("a:2", b"two".to_vec()).await.unwrap();
        store.put("b:1", b"other".to_vec()).await.unwrap();

        assert_eq!(store.get("a:1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let scanned = store.scan_prefix("a:").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, "a:1");

        let next = store.next_after("a:1", "a:").await.unwrap().unwrap();
        assert_eq!(next.0, "a:2");
        assert!(store.next_after("a:2", "a:").await.unwrap().is_none());

        let mut batch = KvBatch::new();
        batch.put("a:3", b"three".to_vec()).delete("a:1");
        store.commit(batch).await.unwrap();
        assert!(store.get("a:1").await.unwrap().is_none());
        assert!(store.get("a:3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise_store(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sled_store_contract() {
        let dir = tempdir().unwrap();
        exercise_store(&SledStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryStore::new();
        let (session, new) = claim_dataset(&store, "test.example.org").await.unwrap();
        assert!(new);
        assert!(matches!(
            claim_dataset(&store, "test.example.org").await,
            Err(EngineError::DatasetInUse(_))
        ));
        release_dataset(&store, "test.example.org", &session)
            .await
            .unwrap();
        let (_, new) = claim_dataset(&store, "test.example.org").await.unwrap();
        assert!(!new);
    }

    #[tokio::test]
    async fn claim_rejects_wrong_domain() {
        let store = MemoryStore::new();
        let (session, _) = claim_dataset(&store, "test.example.org").await.unwrap();
        release_dataset(&store, "test.example.org", &session)
            .await
            .unwrap();
        assert!(matches!(
            claim_dataset(&store, "other.example.org").await,
            Err(EngineError::Configuration(_))
        ));
    }
}
