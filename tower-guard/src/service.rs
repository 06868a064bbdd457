use std::task::Context;
use std::task::Poll;

use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use shot_guard::Decision;
use shot_guard::Engine;
use tower::BoxError;
use tower::Service;
use tracing::debug;

use crate::classify::Classify;
use crate::error::RejectError;

#[derive(Clone, Debug)]
struct GuardServiceMetrics {
    rejected: Counter<u64>,
}

/// The service produced by [`GuardLayer`](crate::GuardLayer).
///
/// Admitted requests hold their engine entry until the inner future
/// resolves; an `Err` from the inner service is recorded as an exception.
/// Rejected requests fail with a [`RejectError`] and never reach the inner
/// service.
#[derive(Clone, Debug)]
pub struct GuardService<S, C> {
    inner: S,
    engine: Engine,
    classify: C,
    instruments: GuardServiceMetrics,
}

impl<S, C> GuardService<S, C> {
    pub fn new(inner: S, engine: Engine, classify: C) -> Self {
        let meter = global::meter("guard_service");
        let instruments = GuardServiceMetrics {
            rejected: meter.u64_counter("rejected").build(),
        };

        Self {
            inner,
            engine,
            classify,
            instruments,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl<S, C, Req> Service<Req> for GuardService<S, C>
where
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
    C: Classify<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let request = self.classify.classify(&req);
        // The ready service goes into the future; the clone waits for the
        // next poll_ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let engine = self.engine.clone();
        let rejected = self.instruments.rejected.clone();

        async move {
            match engine.entry(request).await {
                Decision::Allowed(mut entry) => {
                    let result = inner.call(req).await;
                    if result.is_err() {
                        entry.set_error();
                    }
                    entry.exit();
                    result
                }
                Decision::Blocked(block) => {
                    debug!(resource = block.resource(), reason = block.kind(), "request rejected");
                    rejected.add(
                        1,
                        &[
                            KeyValue::new("resource", block.resource().to_string()),
                            KeyValue::new("reason", block.kind()),
                        ],
                    );
                    Err(Box::new(RejectError::from(block)) as BoxError)
                }
            }
        }
        .boxed()
    }
}
