//! Convenient re-exports for common ratekeeper types.
pub use crate::{
    bucket::{Bucket, BucketError, TakeOutcome},
    clock::{Clock, ManualClock, SystemClock},
    config::{
        ConsistencyMode, LimitSpec, LimiterConfig, StartingAllowance, UnknownResourcePolicy,
    },
    durable::{DurableBucketStore, InMemoryDurableStore, NoDurableStore},
    middleware::{QuotaLayer, QuotaLimiter, QuotaRequest},
    store::{InMemoryKeyValue, KeyValueClient},
    telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    BucketManager, LimiterError, QuotaError,
};
