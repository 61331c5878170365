//! Long-term storage for buckets flagged persistent.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::bucket::Bucket;
use crate::error::StoreError;

/// Durable store consulted on a cache miss for persistent resources and written on
/// every admitted take of a persistent bucket.
///
/// Writes only need to be eventually visible to later reads.
#[async_trait]
pub trait DurableBucketStore: Send + Sync {
    async fn read(&self, owner: &str, resource: &str) -> Result<Option<Bucket>, StoreError>;

    async fn write(&self, bucket: &Bucket) -> Result<(), StoreError>;
}

/// Store used when no durable tier is deployed: reads miss, writes are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDurableStore;

#[async_trait]
impl DurableBucketStore for NoDurableStore {
    async fn read(&self, _owner: &str, _resource: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(None)
    }

    async fn write(&self, _bucket: &Bucket) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory durable store for tests.
///
/// Clones share data. Reads and writes can be forced to fail to exercise the
/// outage and admitted-but-not-persisted paths.
#[derive(Default, Clone, Debug)]
pub struct InMemoryDurableStore {
    buckets: Arc<Mutex<HashMap<(String, String), Bucket>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent reads fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored copy of a bucket, if any.
    pub fn get(&self, owner: &str, resource: &str) -> Option<Bucket> {
        let guard = self.buckets.lock().ok()?;
        guard.get(&(owner.to_string(), resource.to_string())).cloned()
    }

    /// Seed a bucket directly.
    pub fn insert(&self, bucket: Bucket) {
        if let Ok(mut guard) = self.buckets.lock() {
            guard.insert((bucket.owner().to_string(), bucket.resource().to_string()), bucket);
        }
    }
}

#[async_trait]
impl DurableBucketStore for InMemoryDurableStore {
    async fn read(&self, owner: &str, resource: &str) -> Result<Option<Bucket>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::new("durable store unreachable"));
        }
        let guard = self.buckets.lock().map_err(|_| StoreError::new("durable store poisoned"))?;
        Ok(guard.get(&(owner.to_string(), resource.to_string())).cloned())
    }

    async fn write(&self, bucket: &Bucket) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::new("durable store rejected write"));
        }
        let mut guard =
            self.buckets.lock().map_err(|_| StoreError::new("durable store poisoned"))?;
        guard.insert((bucket.owner().to_string(), bucket.resource().to_string()), bucket.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl<T> DurableBucketStore for Arc<T>
where
    T: DurableBucketStore + ?Sized,
{
    async fn read(&self, owner: &str, resource: &str) -> Result<Option<Bucket>, StoreError> {
        (**self).read(owner, resource).await
    }

    async fn write(&self, bucket: &Bucket) -> Result<(), StoreError> {
        (**self).write(bucket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitSpec;

    #[tokio::test]
    async fn in_memory_store_round_trips_and_fails_on_demand() {
        let store = InMemoryDurableStore::new();
        let spec = LimitSpec::new(10, 60, 1, true).unwrap();
        let bucket = Bucket::new("o", "r", spec, 0, 3);

        store.write(&bucket).await.unwrap();
        assert_eq!(store.read("o", "r").await.unwrap(), Some(bucket.clone()));
        assert_eq!(store.write_count(), 1);

        store.fail_writes(true);
        assert!(store.write(&bucket).await.is_err());
        assert_eq!(store.write_count(), 1);

        store.fail_reads(true);
        assert!(store.read("o", "r").await.is_err());
        store.fail_reads(false);
        assert!(store.read("o", "r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_durable_store_never_finds_anything() {
        let spec = LimitSpec::new(10, 60, 1, true).unwrap();
        NoDurableStore.write(&Bucket::new("o", "r", spec, 0, 3)).await.unwrap();
        assert!(NoDurableStore.read("o", "r").await.unwrap().is_none());
    }
}
