//! Tower adapter that charges a quota before calling the wrapped service.
//!
//! ```rust
//! use ratekeeper::middleware::{QuotaLayer, QuotaRequest};
//! use ratekeeper::{BucketManager, InMemoryKeyValue, LimiterConfig};
//! use tower::{service_fn, Layer, Service, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() {
//! struct Call { tenant: Option<String> }
//!
//! let manager = BucketManager::new(InMemoryKeyValue::new(), LimiterConfig::default());
//! let layer = QuotaLayer::new(manager, |call: &Call| {
//!     call.tenant.clone().map(|owner| QuotaRequest::new(owner, "search"))
//! });
//! let mut svc = layer.layer(service_fn(|_call: Call| async { Ok::<_, std::io::Error>("ok") }));
//!
//! let first = svc.ready().await.unwrap().call(Call { tenant: Some("acme".into()) }).await;
//! assert_eq!(first.unwrap(), "ok");
//! // Unknown resources default to a capacity of one.
//! let second = svc.ready().await.unwrap().call(Call { tenant: Some("acme".into()) }).await;
//! assert!(second.unwrap_err().is_denied());
//! # }
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

use crate::durable::DurableBucketStore;
use crate::error::{LimiterResult, QuotaError};
use crate::manager::BucketManager;
use crate::store::KeyValueClient;
use crate::telemetry::TelemetrySink;

/// What a request costs, as extracted from the request itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRequest {
    pub owner: String,
    pub resource: String,
    pub count: u32,
}

impl QuotaRequest {
    /// A request costing one token.
    pub fn new(owner: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { owner: owner.into(), resource: resource.into(), count: 1 }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

/// Anything that can answer "may this owner spend `count` on `resource`?".
#[async_trait]
pub trait QuotaLimiter: Send + Sync {
    async fn take(&self, owner: &str, resource: &str, count: u32) -> LimiterResult<bool>;
}

#[async_trait]
impl<K, D, S> QuotaLimiter for BucketManager<K, D, S>
where
    K: KeyValueClient,
    D: DurableBucketStore,
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
{
    async fn take(&self, owner: &str, resource: &str, count: u32) -> LimiterResult<bool> {
        BucketManager::take(self, owner, resource, count).await
    }
}

/// A layer that charges quota through a [`QuotaLimiter`].
pub struct QuotaLayer<L, F> {
    limiter: Arc<L>,
    extract: Arc<F>,
}

impl<L, F> QuotaLayer<L, F> {
    /// `extract` maps a request to its owner and cost; `None` means no owner was resolved.
    pub fn new(limiter: L, extract: F) -> Self {
        Self::from_arc(Arc::new(limiter), extract)
    }

    /// Share a limiter already held elsewhere.
    pub fn from_arc(limiter: Arc<L>, extract: F) -> Self {
        Self { limiter, extract: Arc::new(extract) }
    }
}

impl<L, F> Clone for QuotaLayer<L, F> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extract: self.extract.clone() }
    }
}

impl<Svc, L, F> Layer<Svc> for QuotaLayer<L, F> {
    type Service = QuotaService<Svc, L, F>;

    fn layer(&self, service: Svc) -> Self::Service {
        QuotaService {
            inner: service,
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
        }
    }
}

/// Middleware service that charges quota before forwarding.
pub struct QuotaService<Svc, L, F> {
    inner: Svc,
    limiter: Arc<L>,
    extract: Arc<F>,
}

impl<Svc: Clone, L, F> Clone for QuotaService<Svc, L, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
        }
    }
}

impl<Svc, L, F, Req> Service<Req> for QuotaService<Svc, L, F>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Error: Send + 'static,
    L: QuotaLimiter + 'static,
    F: Fn(&Req) -> Option<QuotaRequest> + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = QuotaError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(QuotaError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let quota = (self.extract)(&req);
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(QuotaRequest { owner, resource, count }) = quota else {
                return Err(QuotaError::MissingOwner);
            };
            match limiter.take(&owner, &resource, count).await {
                Ok(true) => inner.call(req).await.map_err(QuotaError::Inner),
                Ok(false) => Err(QuotaError::Denied { owner, resource }),
                Err(e) => Err(QuotaError::Limiter(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimiterError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
        answer: Option<bool>,
    }

    #[async_trait]
    impl QuotaLimiter for Scripted {
        async fn take(&self, _owner: &str, _resource: &str, _count: u32) -> LimiterResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.ok_or(LimiterError::InvalidCount)
        }
    }

    #[tokio::test]
    async fn missing_owner_skips_the_limiter() {
        let limiter = Arc::new(Scripted { answer: Some(true), ..Default::default() });
        let layer = QuotaLayer::from_arc(limiter.clone(), |_: &u32| -> Option<QuotaRequest> { None });
        let mut svc = layer.layer(tower::service_fn(|n: u32| async move { Ok::<_, std::io::Error>(n) }));
        let err = svc.call(1).await.unwrap_err();
        assert!(err.is_missing_owner());
        assert_eq!(limiter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn limiter_failure_is_not_a_denial() {
        let layer = QuotaLayer::new(Scripted::default(), |n: &u32| {
            Some(QuotaRequest::new("o", "r").with_count(*n))
        });
        let mut svc = layer.layer(tower::service_fn(|n: u32| async move { Ok::<_, std::io::Error>(n) }));
        let err = svc.call(2).await.unwrap_err();
        assert!(!err.is_denied());
        assert!(matches!(err.as_limiter(), Some(LimiterError::InvalidCount)));
    }

    #[tokio::test]
    async fn admitted_requests_reach_the_inner_service() {
        let layer = QuotaLayer::new(Scripted { answer: Some(true), ..Default::default() }, |_: &u32| {
            Some(QuotaRequest::new("o", "r"))
        });
        let mut svc = layer.layer(tower::service_fn(|n: u32| async move { Ok::<_, std::io::Error>(n) }));
        assert_eq!(svc.call(7).await.unwrap(), 7);
    }
}
