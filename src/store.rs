//! Key-value client seam for the cache tier, with an in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bucket::{Bucket, TakeOutcome};
use crate::cache::{self, fields};
use crate::error::StoreError;

/// Reply from a store-side refill-and-debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicTakeReply {
    /// The client cannot run the combined step; the caller must fall back to round-trips.
    Unsupported,
    /// No bucket (or no `owner` field) exists under the key.
    Missing,
    /// The step ran; `bucket` is what the store now holds.
    Completed { bucket: Bucket, outcome: TakeOutcome },
}

/// Remote hash-map store holding bucket state.
///
/// Only [`hash_increment`](Self::hash_increment) is required to be atomic. The
/// optional [`atomic_take`](Self::atomic_take) folds refill, check, and debit into one
/// store-side operation and closes the lost-update window between concurrent takes.
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    /// All fields of the hash at `key`, or `None` if the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError>;

    /// Set the given fields, leaving other fields untouched.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// Replace the whole hash with exactly `fields`.
    ///
    /// The default delegates to [`hash_set`](Self::hash_set), which is equivalent when
    /// every field is always written.
    async fn hash_replace(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.hash_set(key, fields).await
    }

    /// Atomically add `delta` to an integer field and return the new value.
    ///
    /// A missing key or field counts as 0.
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Refill then debit `count` in one store-side step.
    async fn atomic_take(
        &self,
        _key: &str,
        _now: i64,
        _count: u32,
    ) -> Result<AtomicTakeReply, StoreError> {
        Ok(AtomicTakeReply::Unsupported)
    }
}

type Hashes = HashMap<String, HashMap<String, String>>;

/// In-memory key-value store for tests and single-process use.
///
/// Clones share the same data. The whole map sits behind one mutex, so every
/// operation (including [`atomic_take`](KeyValueClient::atomic_take)) is atomic.
#[derive(Clone, Debug)]
pub struct InMemoryKeyValue {
    data: Arc<Mutex<Hashes>>,
    atomic: bool,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryKeyValue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyValue {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            atomic: true,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A store that reports [`AtomicTakeReply::Unsupported`], like a plain hash service.
    pub fn without_atomic_take() -> Self {
        Self { atomic: false, ..Self::new() }
    }

    /// Make every subsequent call fail, as if the server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop a key, as a cache eviction would.
    pub fn evict(&self, key: &str) -> bool {
        self.data.lock().map(|mut guard| guard.remove(key).is_some()).unwrap_or(false)
    }

    /// Snapshot of the raw fields under `key`.
    pub fn fields(&self, key: &str) -> Option<HashMap<String, String>> {
        self.data.lock().ok().and_then(|guard| guard.get(key).cloned())
    }

    /// Overwrite raw fields, bypassing any encoding.
    pub fn insert_raw(&self, key: impl Into<String>, fields: HashMap<String, String>) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.into(), fields);
        }
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.data.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Hashes>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::new("in-memory store marked unavailable"));
        }
        self.data.lock().map_err(|_| StoreError::new("in-memory store poisoned"))
    }
}

fn parse_integer(raw: Option<&String>) -> Result<i64, StoreError> {
    match raw {
        None => Ok(0),
        Some(v) => v.parse().map_err(|_| StoreError::new("hash value is not an integer")),
    }
}

#[async_trait]
impl KeyValueClient for InMemoryKeyValue {
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        let guard = self.lock()?;
        Ok(guard.get(key).cloned())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let hash = guard.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_replace(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let hash = fields.iter().map(|(f, v)| ((*f).to_string(), v.clone())).collect();
        guard.insert(key.to_string(), hash);
        Ok(())
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut guard = self.lock()?;
        let hash = guard.entry(key.to_string()).or_default();
        let current = parse_integer(hash.get(field))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::new("increment or decrement would overflow"))?;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn atomic_take(
        &self,
        key: &str,
        now: i64,
        count: u32,
    ) -> Result<AtomicTakeReply, StoreError> {
        if !self.atomic {
            return Ok(AtomicTakeReply::Unsupported);
        }
        let mut guard = self.lock()?;
        let Some(hash) = guard.get_mut(key) else {
            return Ok(AtomicTakeReply::Missing);
        };
        let mut bucket = match cache::decode_fields(key, hash) {
            Ok(Some(bucket)) => bucket,
            // Malformed or ownerless state is rebuilt by the caller.
            Ok(None) | Err(_) => return Ok(AtomicTakeReply::Missing),
        };
        let outcome = bucket.take_in_place(now, count);
        hash.insert(fields::TOKEN.to_string(), outcome.token.to_string());
        hash.insert(fields::LAST_FILL_AT.to_string(), outcome.last_fill_at.to_string());
        Ok(AtomicTakeReply::Completed { bucket, outcome })
    }
}
