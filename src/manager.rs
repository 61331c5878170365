//! Bucket orchestration: resolve, provision, refill, and take.
//!
//! ```rust
//! use ratekeeper::{BucketManager, InMemoryKeyValue, LimitSpec, LimiterConfig, ManualClock};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), ratekeeper::LimiterError> {
//! let config = LimiterConfig::builder()
//!     .limit("search", LimitSpec::new(100, 60, 10, false)?)
//!     .build()
//!     .expect("valid config");
//! let clock = ManualClock::new(1_700_000_000);
//! let manager = BucketManager::new(InMemoryKeyValue::new(), config).with_clock(clock.clone());
//!
//! assert!(manager.take("acme", "search", 1).await?);
//! assert_eq!(manager.info("acme", "search").await?.token(), 99);
//! # Ok(())
//! # }
//! ```
//!
//! # Consistency
//!
//! With [`ConsistencyMode::Atomic`] (the default) refill, admission, and debit run as one
//! store-side step through [`KeyValueClient::atomic_take`]. Clients that do not
//! implement it, and managers configured with [`ConsistencyMode::MultiStep`], use
//! separate read / increment / timestamp round-trips. In that mode two concurrent takes
//! can both observe `token > 0` from stale reads and over-admit; each individual
//! increment is still atomic, so no debit is ever lost.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::adaptive::DynamicConfig;
use crate::bucket::Bucket;
use crate::cache::BucketCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConsistencyMode, LimiterConfig};
use crate::durable::{DurableBucketStore, NoDurableStore};
use crate::error::{LimiterError, LimiterResult};
use crate::store::{AtomicTakeReply, KeyValueClient};
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink};

/// How many times an atomic take re-provisions an evicted entry before giving up.
pub const ATOMIC_TAKE_ATTEMPTS: u32 = 3;

/// Resolves buckets across the cache and durable tiers and decides admission.
///
/// Cheap to clone; clones share the store clients, configuration, and sink.
pub struct BucketManager<K, D = NoDurableStore, S = NullSink> {
    cache: BucketCache<K>,
    durable: Arc<D>,
    config: DynamicConfig<LimiterConfig>,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl<K, D, S: Clone> Clone for BucketManager<K, D, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            durable: self.durable.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<K, D, S> std::fmt::Debug for BucketManager<K, D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("prefix", &self.cache.prefix())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<K> BucketManager<K>
where
    K: KeyValueClient,
{
    /// Manager with no durable tier, no telemetry, and the system clock.
    ///
    /// Store keys use the configuration's key prefix, fixed for the manager's lifetime.
    pub fn new(client: K, config: LimiterConfig) -> Self {
        let cache = BucketCache::new(client, config.key_prefix());
        Self {
            cache,
            durable: Arc::new(NoDurableStore),
            config: DynamicConfig::new(config),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<K, D, S> BucketManager<K, D, S> {
    /// Use `store` for persistent buckets.
    pub fn with_durable<D2>(self, store: D2) -> BucketManager<K, D2, S>
    where
        D2: DurableBucketStore,
    {
        BucketManager {
            cache: self.cache,
            durable: Arc::new(store),
            config: self.config,
            clock: self.clock,
            sink: self.sink,
        }
    }

    /// Deliver limiter events to `sink`.
    pub fn with_sink<S2>(self, sink: S2) -> BucketManager<K, D, S2>
    where
        S2: TelemetrySink,
    {
        BucketManager {
            cache: self.cache,
            durable: self.durable,
            config: self.config,
            clock: self.clock,
            sink,
        }
    }

    /// Read "now" from `clock` instead of the system clock.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Arc<LimiterConfig> {
        self.config.get()
    }

    /// Swap the configuration; returns the previous one.
    ///
    /// Buckets already in the cache keep the parameters they were provisioned with.
    /// The key prefix cannot change on a live manager; a new prefix is ignored.
    pub fn reload(&self, config: LimiterConfig) -> Arc<LimiterConfig> {
        if config.key_prefix() != self.cache.prefix() {
            warn!(
                target: "ratekeeper::manager",
                active = %self.cache.prefix(),
                requested = %config.key_prefix(),
                "key prefix change ignored on reload"
            );
        }
        self.config.set(config)
    }

    pub fn cache(&self) -> &BucketCache<K> {
        &self.cache
    }

    pub fn durable(&self) -> &D {
        &self.durable
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Current time according to the injected clock.
    pub fn now(&self) -> i64 {
        self.clock.now_secs()
    }

    /// Build a fresh bucket for `(owner, resource)` from configuration at `now`.
    ///
    /// Nothing is written; [`resolve_at`](Self::resolve_at) stores the result.
    pub fn provision_at(&self, owner: &str, resource: &str, now: i64) -> LimiterResult<Bucket> {
        let config = self.config.get();
        let spec = config.resolve_limits(resource)?;
        let token = config.starting_allowance().tokens_for(&spec);
        Ok(Bucket::new(owner, resource, spec, now, token))
    }

    /// [`provision_at`](Self::provision_at) using the injected clock.
    pub fn provision(&self, owner: &str, resource: &str) -> LimiterResult<Bucket> {
        self.provision_at(owner, resource, self.now())
    }
}

impl<K, D, S> BucketManager<K, D, S>
where
    K: KeyValueClient,
    D: DurableBucketStore,
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
{
    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    /// Find the bucket for `(owner, resource)`, creating it if needed.
    ///
    /// Order: cache, then the durable store (persistent resources only), then a newly
    /// provisioned bucket. Whatever is found below the cache is written into it.
    /// Malformed cached state counts as a miss.
    pub async fn resolve_at(&self, owner: &str, resource: &str, now: i64) -> LimiterResult<Bucket> {
        match self.cache.read(owner, resource).await {
            Ok(Some(bucket)) => return Ok(bucket),
            Ok(None) => {}
            Err(LimiterError::MalformedBucketState { key, field, value }) => {
                warn!(
                    target: "ratekeeper::manager",
                    key = %key,
                    field,
                    value = %value,
                    "malformed bucket state in cache; re-provisioning"
                );
                self.emit(LimiterEvent::MalformedState { key, field }).await;
            }
            Err(e) => return Err(e),
        }

        let config = self.config.get();
        if config.is_persistent(resource) {
            if let Some(bucket) = self.durable.read(owner, resource).await? {
                self.cache.write(&bucket).await?;
                debug!(
                    target: "ratekeeper::manager",
                    owner,
                    resource,
                    token = bucket.token(),
                    "bucket restored from durable store"
                );
                self.emit(LimiterEvent::Restored {
                    owner: owner.to_string(),
                    resource: resource.to_string(),
                    token: bucket.token(),
                })
                .await;
                return Ok(bucket);
            }
        }

        let bucket = self.provision_at(owner, resource, now)?;
        self.cache.write(&bucket).await?;
        debug!(
            target: "ratekeeper::manager",
            owner,
            resource,
            token = bucket.token(),
            "bucket provisioned"
        );
        self.emit(LimiterEvent::Provisioned {
            owner: owner.to_string(),
            resource: resource.to_string(),
            token: bucket.token(),
        })
        .await;
        Ok(bucket)
    }

    /// [`resolve_at`](Self::resolve_at) using the injected clock.
    pub async fn resolve(&self, owner: &str, resource: &str) -> LimiterResult<Bucket> {
        self.resolve_at(owner, resource, self.now()).await
    }

    /// Apply lazy refill to `bucket` at `now`, persisting any grant to the cache.
    ///
    /// Returns the number of tokens added (0 when nothing changed).
    pub async fn refill(&self, bucket: &mut Bucket, now: i64) -> LimiterResult<i64> {
        let grant = bucket.refill_grant(now);
        if grant <= 0 {
            return Ok(0);
        }
        let token = self.cache.increment_token(bucket.owner(), bucket.resource(), grant).await?;
        self.cache.touch_lastfill(bucket.owner(), bucket.resource(), now).await?;
        bucket.set_token(token);
        bucket.set_last_fill_at(now);
        debug!(
            target: "ratekeeper::manager",
            owner = bucket.owner(),
            resource = bucket.resource(),
            grant,
            token,
            "bucket refilled"
        );
        self.emit(LimiterEvent::Refilled {
            owner: bucket.owner().to_string(),
            resource: bucket.resource().to_string(),
            granted: grant,
            token,
        })
        .await;
        Ok(grant)
    }

    /// Try to consume `count` tokens at `now`.
    ///
    /// `Ok(false)` is a normal denial. Store failures are errors, never a silent
    /// admit or deny.
    pub async fn take_at(
        &self,
        owner: &str,
        resource: &str,
        count: u32,
        now: i64,
    ) -> LimiterResult<bool> {
        if count == 0 {
            return Err(LimiterError::InvalidCount);
        }
        match self.config.get().consistency() {
            ConsistencyMode::Atomic => self.take_atomic(owner, resource, count, now).await,
            ConsistencyMode::MultiStep => self.take_multi_step(owner, resource, count, now).await,
        }
    }

    /// [`take_at`](Self::take_at) using the injected clock.
    pub async fn take(&self, owner: &str, resource: &str, count: u32) -> LimiterResult<bool> {
        self.take_at(owner, resource, count, self.now()).await
    }

    /// Current bucket state without applying refill.
    ///
    /// Provisions the bucket if it does not exist yet.
    pub async fn info(&self, owner: &str, resource: &str) -> LimiterResult<Bucket> {
        self.resolve(owner, resource).await
    }

    async fn take_atomic(
        &self,
        owner: &str,
        resource: &str,
        count: u32,
        now: i64,
    ) -> LimiterResult<bool> {
        for attempt in 1..=ATOMIC_TAKE_ATTEMPTS {
            match self.cache.atomic_take(owner, resource, now, count).await? {
                AtomicTakeReply::Unsupported => {
                    return self.take_multi_step(owner, resource, count, now).await;
                }
                AtomicTakeReply::Missing => {
                    debug!(target: "ratekeeper::manager", owner, resource, attempt, "bucket missing for atomic take");
                    self.resolve_at(owner, resource, now).await?;
                }
                AtomicTakeReply::Completed { bucket, outcome } => {
                    if outcome.granted > 0 {
                        self.emit(LimiterEvent::Refilled {
                            owner: owner.to_string(),
                            resource: resource.to_string(),
                            granted: outcome.granted,
                            token: outcome.token + if outcome.admitted { i64::from(count) } else { 0 },
                        })
                        .await;
                    }
                    return Ok(self.finish(&bucket, outcome.admitted, count).await);
                }
            }
        }
        Err(LimiterError::Contention {
            key: self.cache.key(owner, resource),
            attempts: ATOMIC_TAKE_ATTEMPTS,
        })
    }

    async fn take_multi_step(
        &self,
        owner: &str,
        resource: &str,
        count: u32,
        now: i64,
    ) -> LimiterResult<bool> {
        let mut bucket = self.resolve_at(owner, resource, now).await?;
        self.refill(&mut bucket, now).await?;
        if bucket.token() <= 0 {
            return Ok(self.finish(&bucket, false, count).await);
        }
        let token = self.cache.increment_token(owner, resource, -i64::from(count)).await?;
        bucket.set_token(token);
        Ok(self.finish(&bucket, true, count).await)
    }

    /// Record the decision and, for admitted persistent buckets, write the durable copy.
    async fn finish(&self, bucket: &Bucket, admitted: bool, count: u32) -> bool {
        let owner = bucket.owner().to_string();
        let resource = bucket.resource().to_string();
        if !admitted {
            debug!(target: "ratekeeper::manager", owner = %owner, resource = %resource, token = bucket.token(), "take denied");
            self.emit(LimiterEvent::Denied { owner, resource, token: bucket.token() }).await;
            return false;
        }

        if bucket.persistent() {
            if let Err(e) = self.durable.write(bucket).await {
                warn!(
                    target: "ratekeeper::manager",
                    owner = %owner,
                    resource = %resource,
                    error = %e,
                    "durable write failed; take stays admitted"
                );
                self.emit(LimiterEvent::DurableWriteFailed {
                    owner: owner.clone(),
                    resource: resource.clone(),
                    error: e.to_string(),
                })
                .await;
            }
        }

        debug!(target: "ratekeeper::manager", owner = %owner, resource = %resource, count, token = bucket.token(), "take admitted");
        self.emit(LimiterEvent::Admitted { owner, resource, count, remaining: bucket.token() }).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fields;
    use crate::clock::ManualClock;
    use crate::config::{LimitSpec, StartingAllowance, UnknownResourcePolicy};
    use crate::durable::InMemoryDurableStore;
    use crate::store::InMemoryKeyValue;
    use crate::telemetry::MemorySink;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    const T0: i64 = 1_700_000_000;

    fn config(mode: ConsistencyMode) -> LimiterConfig {
        LimiterConfig::builder()
            .limit("search", LimitSpec::new(100, 60, 10, false).unwrap())
            .limit("export", LimitSpec::new(100, 60, 10, true).unwrap())
            .consistency(mode)
            .build()
            .unwrap()
    }

    fn manager(
        kv: InMemoryKeyValue,
        mode: ConsistencyMode,
    ) -> BucketManager<InMemoryKeyValue, InMemoryDurableStore, MemorySink> {
        BucketManager::new(kv, config(mode))
            .with_durable(InMemoryDurableStore::new())
            .with_sink(MemorySink::new())
            .with_clock(ManualClock::new(T0))
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs() -> (Arc<Mutex<Vec<u8>>>, tracing::subscriber::DefaultGuard) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .without_time()
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (buffer, guard)
    }

    #[tokio::test]
    async fn zero_count_is_rejected_before_touching_the_store() {
        let kv = InMemoryKeyValue::new();
        let m = manager(kv.clone(), ConsistencyMode::Atomic);
        assert!(matches!(m.take("acme", "search", 0).await, Err(LimiterError::InvalidCount)));
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn provisioning_follows_starting_allowance() {
        let cfg = LimiterConfig::builder()
            .limit("search", LimitSpec::new(10, 60, 1, false).unwrap())
            .starting_allowance(StartingAllowance::WELCOME_GRANT)
            .build()
            .unwrap();
        let m = BucketManager::new(InMemoryKeyValue::new(), cfg).with_clock(ManualClock::new(T0));
        let bucket = m.resolve("acme", "search").await.unwrap();
        assert_eq!(bucket.token(), 100);
        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.last_fill_at(), T0);
    }

    #[tokio::test]
    async fn reject_policy_surfaces_unknown_resource() {
        let cfg = LimiterConfig::builder()
            .unknown_resource(UnknownResourcePolicy::Reject)
            .build()
            .unwrap();
        let m = BucketManager::new(InMemoryKeyValue::new(), cfg);
        let err = m.take("acme", "ghost", 1).await.unwrap_err();
        assert!(matches!(err, LimiterError::UnknownResource { .. }));
    }

    #[tokio::test]
    async fn malformed_cache_state_is_reprovisioned_and_reported() {
        let (logs, _guard) = capture_logs();
        let kv = InMemoryKeyValue::new();
        let m = manager(kv.clone(), ConsistencyMode::MultiStep);
        let key = m.cache().key("acme", "search");
        let mut raw = std::collections::HashMap::new();
        raw.insert(fields::OWNER.to_string(), "acme".to_string());
        raw.insert(fields::RESOURCE.to_string(), "search".to_string());
        raw.insert(fields::CAPACITY.to_string(), "lots".to_string());
        kv.insert_raw(key.clone(), raw);

        let bucket = m.resolve("acme", "search").await.unwrap();
        assert_eq!(bucket.capacity(), 100);
        assert_eq!(bucket.token(), 100);
        assert_eq!(kv.fields(&key).unwrap()[fields::CAPACITY], "100");

        let events = m.sink().events_of("malformed_state");
        assert_eq!(events, vec![LimiterEvent::MalformedState { key, field: fields::CAPACITY }]);
        let logs = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("malformed bucket state in cache"));
    }

    #[tokio::test]
    async fn durable_write_failure_keeps_the_admission() {
        let (logs, _guard) = capture_logs();
        let m = manager(InMemoryKeyValue::new(), ConsistencyMode::Atomic);
        m.durable().fail_writes(true);

        assert!(m.take("acme", "export", 1).await.unwrap());
        assert_eq!(m.info("acme", "export").await.unwrap().token(), 99);
        assert_eq!(m.durable().write_count(), 0);

        let failures = m.sink().events_of("durable_write_failed");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].resource(), "export");
        let logs = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("durable write failed"));
        assert!(logs.contains("ratekeeper::manager"));
    }

    #[tokio::test]
    async fn persistent_takes_write_the_durable_copy() {
        for mode in [ConsistencyMode::Atomic, ConsistencyMode::MultiStep] {
            let m = manager(InMemoryKeyValue::new(), mode);
            assert!(m.take("acme", "export", 3).await.unwrap());
            let stored = m.durable().get("acme", "export").unwrap();
            assert_eq!(stored.token(), 97, "mode {mode:?}");
            assert!(m.durable().get("acme", "search").is_none());
            assert!(m.take("acme", "search", 1).await.unwrap());
            assert!(m.durable().get("acme", "search").is_none());
        }
    }

    #[tokio::test]
    async fn atomic_mode_falls_back_when_unsupported() {
        let kv = InMemoryKeyValue::without_atomic_take();
        let m = manager(kv, ConsistencyMode::Atomic);
        assert!(m.take("acme", "search", 40).await.unwrap());
        assert_eq!(m.info("acme", "search").await.unwrap().token(), 60);
    }

    #[tokio::test]
    async fn unavailable_store_is_an_error_not_a_decision() {
        let kv = InMemoryKeyValue::new();
        let m = manager(kv.clone(), ConsistencyMode::Atomic);
        kv.set_unavailable(true);
        let err = m.take("acme", "search", 1).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(m.sink().is_empty());
    }

    #[tokio::test]
    async fn refill_persists_grant_and_timestamp() {
        let kv = InMemoryKeyValue::new();
        let m = manager(kv.clone(), ConsistencyMode::MultiStep);
        assert!(m.take_at("acme", "search", 100, T0).await.unwrap());

        let mut bucket = m.resolve_at("acme", "search", T0 + 30).await.unwrap();
        assert_eq!(m.refill(&mut bucket, T0 + 30).await.unwrap(), 5);
        assert_eq!(bucket.token(), 5);
        assert_eq!(bucket.last_fill_at(), T0 + 30);

        let stored = m.cache().read("acme", "search").await.unwrap().unwrap();
        assert_eq!(stored, bucket);
        assert_eq!(m.refill(&mut bucket, T0 + 30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reload_applies_to_new_buckets_only() {
        let m = manager(InMemoryKeyValue::new(), ConsistencyMode::Atomic);
        m.resolve("acme", "search").await.unwrap();

        let next = LimiterConfig::builder()
            .limit("search", LimitSpec::new(5, 60, 1, false).unwrap())
            .build()
            .unwrap();
        let previous = m.reload(next);
        assert_eq!(previous.limits_for("search").unwrap().capacity(), 100);

        assert_eq!(m.info("acme", "search").await.unwrap().capacity(), 100);
        assert_eq!(m.info("other", "search").await.unwrap().capacity(), 5);
    }

    /// Serves every hash call from memory but always reports the bucket as gone
    /// to the atomic take.
    struct AlwaysEvicted(InMemoryKeyValue);

    #[async_trait::async_trait]
    impl KeyValueClient for AlwaysEvicted {
        async fn hash_get_all(
            &self,
            key: &str,
        ) -> Result<Option<std::collections::HashMap<String, String>>, crate::error::StoreError> {
            self.0.hash_get_all(key).await
        }

        async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), crate::error::StoreError> {
            self.0.hash_set(key, fields).await
        }

        async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, crate::error::StoreError> {
            self.0.hash_increment(key, field, delta).await
        }

        async fn atomic_take(
            &self,
            _key: &str,
            _now: i64,
            _count: u32,
        ) -> Result<AtomicTakeReply, crate::error::StoreError> {
            Ok(AtomicTakeReply::Missing)
        }
    }

    #[tokio::test]
    async fn repeated_eviction_ends_in_contention() {
        let m = BucketManager::new(AlwaysEvicted(InMemoryKeyValue::new()), config(ConsistencyMode::Atomic))
            .with_clock(ManualClock::new(T0));
        match m.take("acme", "search", 1).await {
            Err(LimiterError::Contention { key, attempts }) => {
                assert_eq!(key, "ratekeeper:acme:search");
                assert_eq!(attempts, ATOMIC_TAKE_ATTEMPTS);
            }
            other => panic!("expected contention, got {other:?}"),
        }
        let bucket = m.info("acme", "search").await.unwrap();
        assert_eq!(bucket.token(), 100, "no debit without a completed take");
    }

    #[test]
    fn debug_shows_the_key_prefix() {
        let m = BucketManager::new(InMemoryKeyValue::new(), config(ConsistencyMode::Atomic));
        let rendered = format!("{m:?}");
        assert!(rendered.contains("BucketManager"));
        assert!(rendered.contains("ratekeeper"));
    }

    #[tokio::test]
    async fn reload_ignores_prefix_change() {
        let (logs, _guard) = capture_logs();
        let m = manager(InMemoryKeyValue::new(), ConsistencyMode::Atomic);
        m.reload(LimiterConfig::builder().key_prefix("other").build().unwrap());
        assert_eq!(m.cache().prefix(), "ratekeeper");
        let logs = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("key prefix change ignored"));
    }
}
