//! Prometheus metrics sink for `ratekeeper`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use prometheus::{IntCounterVec, Registry};
use ratekeeper::telemetry::{LimiterEvent, TelemetrySink};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Counter name registered by [`PrometheusSink`].
pub const EVENTS_TOTAL: &str = "ratekeeper_events_total";

/// Counts limiter events by resource and event kind. Owner is not a label.
#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new(EVENTS_TOTAL, "Rate limiter events"),
            &["resource", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for one `(resource, event kind)` pair.
    pub fn count(&self, resource: &str, event: &str) -> u64 {
        self.counter.with_label_values(&[resource, event]).get()
    }
}

impl tower_service::Service<LimiterEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        self.counter.with_label_values(&[event.resource(), event.kind()]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
