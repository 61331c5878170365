#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratekeeper
//!
//! Multi-tenant token-bucket rate limiting with bucket state held in a shared
//! key-value store, so any number of stateless instances enforce one quota per
//! `(owner, resource)` pair.
//!
//! ## Pieces
//!
//! - [`Bucket`]: quota state and the lazy refill arithmetic
//! - [`BucketCache`]: maps buckets onto hashes in a [`KeyValueClient`]
//! - [`BucketManager`]: resolve (cache, durable store, provision), refill, take
//! - [`LimiterConfig`]: per-resource limits and provisioning policies
//! - [`DurableBucketStore`]: optional long-term tier for persistent buckets
//! - [`telemetry`]: limiter events and sinks
//! - [`middleware`]: a tower layer charging quota per request
//!
//! ## Quick Start
//!
//! ```rust
//! use ratekeeper::{BucketManager, InMemoryKeyValue, LimitSpec, LimiterConfig, ManualClock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LimiterConfig::builder()
//!         .limit("search", LimitSpec::new(100, 60, 10, false)?)
//!         .build()?;
//!     let clock = ManualClock::new(1_700_000_000);
//!     let limiter = BucketManager::new(InMemoryKeyValue::new(), config).with_clock(clock.clone());
//!
//!     assert!(limiter.take("acme", "search", 100).await?);
//!     assert!(!limiter.take("acme", "search", 1).await?);
//!
//!     // One full period later, `refill_amount` tokens are back.
//!     clock.advance(60);
//!     assert!(limiter.take("acme", "search", 1).await?);
//!     assert_eq!(limiter.info("acme", "search").await?.token(), 9);
//!     Ok(())
//! }
//! ```
//!
//! Production deployments plug in a real store: `ratekeeper-redis` for the cache
//! tier, `ratekeeper-etcd` for the durable tier, and `ratekeeper-prometheus` for
//! event counters.

pub mod adaptive;
pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod durable;
pub mod error;
pub mod manager;
pub mod middleware;
pub mod prelude;
pub mod store;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use bucket::{Bucket, BucketError, TakeOutcome};
pub use cache::{bucket_key, BucketCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, ConsistencyMode, LimitSpec, LimiterConfig, LimiterConfigBuilder,
    StartingAllowance, UnknownResourcePolicy,
};
pub use durable::{DurableBucketStore, InMemoryDurableStore, NoDurableStore};
pub use error::{LimiterError, LimiterResult, QuotaError, StoreError};
pub use manager::BucketManager;
pub use middleware::{QuotaLayer, QuotaLimiter, QuotaRequest, QuotaService};
pub use store::{AtomicTakeReply, InMemoryKeyValue, KeyValueClient};
pub use telemetry::{
    LimiterEvent, LogSink, MemorySink, MulticastSink, NonBlockingSink, NullSink, TelemetrySink,
};
