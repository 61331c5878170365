//! Mapping between [`Bucket`]s and hashes in the shared key-value store.
//!
//! # Key layout
//!
//! `"{prefix}:{owner}:{resource}"`, where `owner` and `resource` are percent-escaped
//! (`%` → `%25`, `:` → `%3A`). The separator can therefore never occur inside an
//! escaped component and distinct pairs always map to distinct keys.
//!
//! # Field layout
//!
//! One hash per bucket with the fields listed in [`fields`]. Numbers are stored as
//! decimal strings and `persistent` as `"true"`/`"false"`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::bucket::{Bucket, BucketError};
use crate::config::LimitSpec;
use crate::error::{LimiterError, LimiterResult};
use crate::store::{AtomicTakeReply, KeyValueClient};

/// Hash field names.
pub mod fields {
    pub const OWNER: &str = "owner";
    pub const RESOURCE: &str = "resource";
    pub const CAPACITY: &str = "capacity";
    pub const PERIOD_SECONDS: &str = "period_seconds";
    pub const REFILL_AMOUNT: &str = "refill_amount";
    pub const LAST_FILL_AT: &str = "last_fill_at";
    pub const PERSISTENT: &str = "persistent";
    pub const TOKEN: &str = "token";
}

/// Separator between key components.
pub const KEY_SEPARATOR: char = ':';

/// Percent-escape one key component so it cannot contain [`KEY_SEPARATOR`].
pub fn encode_component(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['%', KEY_SEPARATOR]) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            KEY_SEPARATOR => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Store key for an `(owner, resource)` pair.
pub fn bucket_key(prefix: &str, owner: &str, resource: &str) -> String {
    format!(
        "{prefix}{sep}{owner}{sep}{resource}",
        sep = KEY_SEPARATOR,
        owner = encode_component(owner),
        resource = encode_component(resource),
    )
}

/// Every field of `bucket`, ready for a full-hash write.
pub fn encode_fields(bucket: &Bucket) -> Vec<(&'static str, String)> {
    vec![
        (fields::OWNER, bucket.owner().to_string()),
        (fields::RESOURCE, bucket.resource().to_string()),
        (fields::CAPACITY, bucket.capacity().to_string()),
        (fields::PERIOD_SECONDS, bucket.period_seconds().to_string()),
        (fields::REFILL_AMOUNT, bucket.refill_amount().to_string()),
        (fields::LAST_FILL_AT, bucket.last_fill_at().to_string()),
        (fields::PERSISTENT, bucket.persistent().to_string()),
        (fields::TOKEN, bucket.token().to_string()),
    ]
}

fn malformed(key: &str, field: &'static str, value: Option<&String>) -> LimiterError {
    LimiterError::MalformedBucketState {
        key: key.to_string(),
        field,
        value: value.cloned().unwrap_or_default(),
    }
}

fn coerce<T: std::str::FromStr>(
    key: &str,
    hash: &HashMap<String, String>,
    field: &'static str,
) -> LimiterResult<T> {
    let raw = hash.get(field);
    raw.and_then(|v| v.trim().parse().ok()).ok_or_else(|| malformed(key, field, raw))
}

/// Rebuild a bucket from stored fields.
///
/// `Ok(None)` when the hash has no (or an empty) `owner`: a partially written or
/// increment-only hash counts as absent. Fields that fail coercion yield
/// [`LimiterError::MalformedBucketState`].
pub fn decode_fields(key: &str, hash: &HashMap<String, String>) -> LimiterResult<Option<Bucket>> {
    let owner = match hash.get(fields::OWNER) {
        Some(owner) if !owner.is_empty() => owner.clone(),
        _ => return Ok(None),
    };
    let resource = hash
        .get(fields::RESOURCE)
        .cloned()
        .ok_or_else(|| malformed(key, fields::RESOURCE, None))?;
    let capacity: u32 = coerce(key, hash, fields::CAPACITY)?;
    let period_seconds: u32 = coerce(key, hash, fields::PERIOD_SECONDS)?;
    let refill_amount: u32 = coerce(key, hash, fields::REFILL_AMOUNT)?;
    let last_fill_at: i64 = coerce(key, hash, fields::LAST_FILL_AT)?;
    let token: i64 = coerce(key, hash, fields::TOKEN)?;
    let persistent = match hash.get(fields::PERSISTENT).map(String::as_str) {
        None | Some("false") | Some("0") => false,
        Some("true") | Some("1") => true,
        Some(_) => return Err(malformed(key, fields::PERSISTENT, hash.get(fields::PERSISTENT))),
    };

    let spec = LimitSpec::new(capacity, period_seconds, refill_amount, persistent).map_err(|e| {
        let field = match e {
            BucketError::InvalidCapacity { .. } => fields::CAPACITY,
            BucketError::InvalidPeriod { .. } => fields::PERIOD_SECONDS,
            BucketError::InvalidRefill { .. } => fields::REFILL_AMOUNT,
        };
        malformed(key, field, hash.get(field))
    })?;
    Ok(Some(Bucket::new(owner, resource, spec, last_fill_at, token)))
}

/// Reads and writes buckets through a [`KeyValueClient`].
#[derive(Debug)]
pub struct BucketCache<K> {
    client: Arc<K>,
    prefix: String,
}

impl<K> Clone for BucketCache<K> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone(), prefix: self.prefix.clone() }
    }
}

impl<K> BucketCache<K> {
    /// Cache storing keys under `prefix`.
    pub fn new(client: K, prefix: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(client), prefix)
    }

    /// Cache over a shared client.
    pub fn from_arc(client: Arc<K>, prefix: impl Into<String>) -> Self {
        Self { client, prefix: prefix.into() }
    }

    /// The underlying client.
    pub fn client(&self) -> &K {
        &self.client
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store key for an `(owner, resource)` pair.
    pub fn key(&self, owner: &str, resource: &str) -> String {
        bucket_key(&self.prefix, owner, resource)
    }
}

impl<K> BucketCache<K>
where
    K: KeyValueClient,
{

    /// Fetch a bucket; `None` if absent or missing its `owner` field.
    pub async fn read(&self, owner: &str, resource: &str) -> LimiterResult<Option<Bucket>> {
        let key = self.key(owner, resource);
        match self.client.hash_get_all(&key).await? {
            Some(hash) if !hash.is_empty() => decode_fields(&key, &hash),
            _ => Ok(None),
        }
    }

    /// Overwrite the stored hash with every field of `bucket`.
    pub async fn write(&self, bucket: &Bucket) -> LimiterResult<()> {
        let key = self.key(bucket.owner(), bucket.resource());
        self.client.hash_replace(&key, &encode_fields(bucket)).await?;
        debug!(target: "ratekeeper::cache", key = %key, token = bucket.token(), "bucket written");
        Ok(())
    }

    /// Atomically add `delta` to the stored token count; returns the store's new value.
    pub async fn increment_token(&self, owner: &str, resource: &str, delta: i64) -> LimiterResult<i64> {
        let key = self.key(owner, resource);
        Ok(self.client.hash_increment(&key, fields::TOKEN, delta).await?)
    }

    /// Set `last_fill_at`. Not atomic with [`increment_token`](Self::increment_token).
    pub async fn touch_lastfill(&self, owner: &str, resource: &str, timestamp: i64) -> LimiterResult<()> {
        let key = self.key(owner, resource);
        self.client.hash_set(&key, &[(fields::LAST_FILL_AT, timestamp.to_string())]).await?;
        Ok(())
    }

    /// Run the store-side refill-and-debit, if the client supports it.
    pub async fn atomic_take(
        &self,
        owner: &str,
        resource: &str,
        now: i64,
        count: u32,
    ) -> LimiterResult<AtomicTakeReply> {
        let key = self.key(owner, resource);
        Ok(self.client.atomic_take(&key, now, count).await?)
    }
}
