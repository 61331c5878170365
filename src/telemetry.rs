//! Telemetry for the limiter.
//!
//! [`BucketManager`](crate::BucketManager) emits a [`LimiterEvent`] for every
//! provisioning, refill, and admission decision, and for failures that must not change
//! the caller's result (a durable write that failed after the take was admitted).
//! Events flow through a [`TelemetrySink`], which is a `tower::Service<LimiterEvent>`.
//!
//! ```rust
//! use ratekeeper::telemetry::LimiterEvent;
//!
//! let event = LimiterEvent::Admitted {
//!     owner: "acme".into(),
//!     resource: "search".into(),
//!     count: 1,
//!     remaining: 99,
//! };
//! assert_eq!(event.kind(), "admitted");
//! assert_eq!(event.resource(), "search");
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A telemetry sink that consumes limiter events.
///
/// Sinks are plain tower services, so they compose with tower combinators and with
/// [`MulticastSink`].
pub trait TelemetrySink:
    tower::Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry never fails or delays a take beyond the sink's own readiness.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted by the bucket manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// A new bucket was created from configuration.
    Provisioned { owner: String, resource: String, token: i64 },
    /// A persistent bucket was reloaded from the durable store into the cache.
    Restored { owner: String, resource: String, token: i64 },
    /// Lazy refill added tokens.
    Refilled { owner: String, resource: String, granted: i64, token: i64 },
    /// A take was admitted.
    Admitted { owner: String, resource: String, count: u32, remaining: i64 },
    /// A take was denied; nothing was debited.
    Denied { owner: String, resource: String, token: i64 },
    /// Cached state failed coercion and was re-provisioned.
    MalformedState { key: String, field: &'static str },
    /// A persistent bucket could not be written after an admitted take.
    DurableWriteFailed { owner: String, resource: String, error: String },
}

impl LimiterEvent {
    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LimiterEvent::Provisioned { .. } => "provisioned",
            LimiterEvent::Restored { .. } => "restored",
            LimiterEvent::Refilled { .. } => "refilled",
            LimiterEvent::Admitted { .. } => "admitted",
            LimiterEvent::Denied { .. } => "denied",
            LimiterEvent::MalformedState { .. } => "malformed_state",
            LimiterEvent::DurableWriteFailed { .. } => "durable_write_failed",
        }
    }

    /// Resource the event is about (empty for key-level events).
    pub fn resource(&self) -> &str {
        match self {
            LimiterEvent::Provisioned { resource, .. }
            | LimiterEvent::Restored { resource, .. }
            | LimiterEvent::Refilled { resource, .. }
            | LimiterEvent::Admitted { resource, .. }
            | LimiterEvent::Denied { resource, .. }
            | LimiterEvent::DurableWriteFailed { resource, .. } => resource,
            LimiterEvent::MalformedState { .. } => "",
        }
    }

    /// Owner the event is about (empty for key-level events).
    pub fn owner(&self) -> &str {
        match self {
            LimiterEvent::Provisioned { owner, .. }
            | LimiterEvent::Restored { owner, .. }
            | LimiterEvent::Refilled { owner, .. }
            | LimiterEvent::Admitted { owner, .. }
            | LimiterEvent::Denied { owner, .. }
            | LimiterEvent::DurableWriteFailed { owner, .. } => owner,
            LimiterEvent::MalformedState { .. } => "",
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Provisioned { owner, resource, token } => {
                write!(f, "Provisioned({}/{}, token={})", owner, resource, token)
            }
            LimiterEvent::Restored { owner, resource, token } => {
                write!(f, "Restored({}/{}, token={})", owner, resource, token)
            }
            LimiterEvent::Refilled { owner, resource, granted, token } => {
                write!(f, "Refilled({}/{}, +{}, token={})", owner, resource, granted, token)
            }
            LimiterEvent::Admitted { owner, resource, count, remaining } => {
                write!(f, "Admitted({}/{}, -{}, remaining={})", owner, resource, count, remaining)
            }
            LimiterEvent::Denied { owner, resource, token } => {
                write!(f, "Denied({}/{}, token={})", owner, resource, token)
            }
            LimiterEvent::MalformedState { key, field } => {
                write!(f, "MalformedState({}, field={})", key, field)
            }
            LimiterEvent::DurableWriteFailed { owner, resource, error } => {
                write!(f, "DurableWriteFailed({}/{}: {})", owner, resource, error)
            }
        }
    }
}

// ============================================================================
// Built-in Telemetry Sinks
// ============================================================================

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Failures are logged at WARN, everything else at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match &event {
            LimiterEvent::DurableWriteFailed { .. } | LimiterEvent::MalformedState { .. } => {
                tracing::warn!(target: "ratekeeper::telemetry", event = %event, "limiter_event")
            }
            _ => tracing::info!(target: "ratekeeper::telemetry", event = %event, "limiter_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Useful for testing and debugging. Oldest events are evicted past capacity.
///
/// ```rust
/// use ratekeeper::telemetry::{LimiterEvent, MemorySink};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = LimiterEvent::Denied { owner: "o".into(), resource: "r".into(), token: 0 };
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.events.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    /// Events of one kind, in arrival order.
    pub fn events_of(&self, kind: &str) -> Vec<LimiterEvent> {
        self.events().into_iter().filter(|e| e.kind() == kind).collect()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.events.lock() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        if let Ok(mut guard) = self.events.lock() {
            if guard.len() >= self.capacity {
                guard.remove(0);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            guard.push(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

// ============================================================================
// Non-blocking sink wrapper
// ============================================================================

/// Offloads emission to a bounded channel and worker task so a slow sink
/// never sits on the take path. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink<S> {
    tx: tokio::sync::mpsc::Sender<LimiterEvent>,
    dropped: Arc<AtomicU64>,
    _sink: Arc<tokio::sync::Mutex<S>>,
}

impl<S> NonBlockingSink<S>
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    /// Create a new non-blocking wrapper with bounded queue and background worker.
    pub fn with_capacity(sink: S, capacity: usize) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let sink_arc = Arc::new(tokio::sync::Mutex::new(sink));
        let sink_worker = sink_arc.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                use tower::ServiceExt;
                let mut guard = sink_worker.lock().await;
                if let Ok(ready) = guard.ready().await {
                    let _ = ready.call(event).await;
                }
            }
        });

        Self { tx, dropped, _sink: sink_arc }
    }

    /// How many events were dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S> fmt::Debug for NonBlockingSink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped).finish()
    }
}

impl<S> tower::Service<LimiterEvent> for NonBlockingSink<S>
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl<S> TelemetrySink for NonBlockingSink<S>
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    type SinkError = Infallible;
}

// ============================================================================
// Telemetry Sink Composition
// ============================================================================

/// Error type for composed telemetry sinks.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Multicasts events to two sinks concurrently.
///
/// ```rust
/// use ratekeeper::telemetry::{LogSink, MemorySink, MulticastSink};
///
/// let combined = MulticastSink::new(LogSink, MemorySink::new());
/// # let _ = combined;
/// ```
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    /// Create a new multicast sink that sends events to both `sink_a` and `sink_b`.
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<LimiterEvent> for MulticastSink<A, B>
where
    A: tower::Service<LimiterEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<LimiterEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_clone));

            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;

            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<LimiterEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<LimiterEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    fn denied() -> LimiterEvent {
        LimiterEvent::Denied { owner: "acme".into(), resource: "search".into(), token: 0 }
    }

    #[test]
    fn event_display_and_labels() {
        let event = LimiterEvent::Refilled {
            owner: "acme".into(),
            resource: "search".into(),
            granted: 20,
            token: 20,
        };
        assert!(event.to_string().contains("+20"));
        assert_eq!(event.kind(), "refilled");
        assert_eq!(event.owner(), "acme");

        let malformed = LimiterEvent::MalformedState { key: "rk:a:b".into(), field: "token" };
        assert_eq!(malformed.resource(), "");
        assert!(malformed.to_string().contains("field=token"));
    }

    #[tokio::test]
    async fn test_memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        let first = LimiterEvent::Provisioned { owner: "o".into(), resource: "r".into(), token: 1 };
        let second = denied();
        let third = LimiterEvent::Admitted {
            owner: "o".into(),
            resource: "r".into(),
            count: 1,
            remaining: 0,
        };
        sink.call(first).await.unwrap();
        sink.call(second.clone()).await.unwrap();
        sink.call(third.clone()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events(), vec![second, third.clone()]);
        assert_eq!(sink.events_of("admitted"), vec![third]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_multicast_reaches_both() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let mut both = MulticastSink::new(a.clone(), b.clone());
        both.call(denied()).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_non_blocking_sink_delivers() {
        let memory = MemorySink::new();
        let mut sink = NonBlockingSink::with_capacity(memory.clone(), 8);
        sink.call(denied()).await.unwrap();
        for _ in 0..50 {
            if !memory.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(memory.events(), vec![denied()]);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_emit_best_effort_swallows_errors() {
        #[derive(Clone)]
        struct Fails;
        impl TelemetrySink for Fails {
            type SinkError = std::io::Error;
        }
        impl tower_service::Service<LimiterEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _req: LimiterEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "fail")) })
            }
        }

        emit_best_effort(Fails, denied()).await;
    }

    #[tokio::test]
    async fn test_log_sink() {
        let mut sink = LogSink;
        sink.call(denied()).await.unwrap();
    }
}
