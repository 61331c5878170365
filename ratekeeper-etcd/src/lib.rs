//! etcd durable bucket store for `ratekeeper` (companion crate).
//! Bring your own `etcd_client::Client`; persistent buckets are stored as JSON under a prefix.

use async_trait::async_trait;
use ratekeeper::{Bucket, DurableBucketStore, StoreError};
use std::borrow::Cow;

#[derive(Clone)]
pub struct EtcdBucketStore {
    prefix: String,
    client: etcd_client::Client,
}

impl std::fmt::Debug for EtcdBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdBucketStore")
            .field("prefix", &self.prefix)
            .field("client", &"<etcd_client::Client>")
            .finish()
    }
}

impl EtcdBucketStore {
    /// Create a store using an existing etcd client; keys will be `prefix/<owner>/<resource>`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains control characters.
    pub fn new(prefix: impl Into<String>, client: etcd_client::Client) -> Result<Self, String> {
        let prefix = normalize_prefix(prefix.into())?;
        Ok(Self { prefix, client })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// etcd key holding the bucket for `(owner, resource)`.
    pub fn key(&self, owner: &str, resource: &str) -> String {
        bucket_path(&self.prefix, owner, resource)
    }
}

fn normalize_prefix(raw: String) -> Result<String, String> {
    // Normalize: trim whitespace and strip trailing slashes
    let p = raw.trim().trim_end_matches('/').to_string();

    if p.is_empty() {
        return Err("prefix cannot be empty".to_string());
    }
    if p.chars().any(|c| c.is_control()) {
        return Err("prefix cannot contain control characters".to_string());
    }
    Ok(p)
}

/// Percent-escape one path segment (`%` → `%25`, `/` → `%2F`).
fn encode_segment(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['%', '/']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

fn bucket_path(prefix: &str, owner: &str, resource: &str) -> String {
    format!("{}/{}/{}", prefix, encode_segment(owner), encode_segment(resource))
}

fn etcd_error(op: &'static str, key: &str, e: etcd_client::Error) -> StoreError {
    tracing::warn!(target: "ratekeeper::etcd", key = %key, op, error = %e, "etcd request failed");
    StoreError::from_source(format!("etcd {} failed", op), e)
}

#[async_trait]
impl DurableBucketStore for EtcdBucketStore {
    async fn read(&self, owner: &str, resource: &str) -> Result<Option<Bucket>, StoreError> {
        let key = self.key(owner, resource);
        let mut client = self.client.clone();
        let resp = client.get(key.as_str(), None).await.map_err(|e| etcd_error("get", &key, e))?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        match serde_json::from_slice::<Bucket>(kv.value()) {
            Ok(bucket) => Ok(Some(bucket)),
            Err(e) => {
                // An unreadable record is treated as absent so the bucket is re-provisioned.
                tracing::warn!(
                    target: "ratekeeper::etcd",
                    key = %key,
                    error = %e,
                    "discarding undecodable bucket record"
                );
                Ok(None)
            }
        }
    }

    async fn write(&self, bucket: &Bucket) -> Result<(), StoreError> {
        let key = self.key(bucket.owner(), bucket.resource());
        let value = serde_json::to_vec(bucket)?;
        let mut client = self.client.clone();
        client.put(key.as_str(), value, None).await.map_err(|e| etcd_error("put", &key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_escape_separators() {
        assert_eq!(bucket_path("rk", "acme", "search"), "rk/acme/search");
        assert_eq!(bucket_path("rk", "a/b", "c"), "rk/a%2Fb/c");
        assert_ne!(bucket_path("rk", "a/b", "c"), bucket_path("rk", "a", "b/c"));
        assert_eq!(bucket_path("rk", "100%", "x"), "rk/100%25/x");
    }

    #[test]
    fn prefix_is_normalized_and_validated() {
        assert_eq!(normalize_prefix(" buckets/ ".to_string()).unwrap(), "buckets");
        assert!(normalize_prefix("///".to_string()).is_err());
        assert!(normalize_prefix("a\nb".to_string()).is_err());
    }
}
