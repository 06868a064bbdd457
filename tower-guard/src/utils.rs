use std::time::Duration;

use shot_guard::Engine;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::layer::util::Stack;
use tower::util::BoxCloneSyncService;

use crate::GuardLayer;

/// Guard a service as `resource` and bound each request, queueing included,
/// by `timeout`.
pub fn make_guarded_svc<V, Req, Resp>(
    engine: Engine,
    resource: impl Into<String>,
    timeout: Duration,
    svc: V,
) -> BoxCloneSyncService<Req, Resp, BoxError>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    V: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + Sync + 'static,
    <V as Service<Req>>::Future: Send,
{
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .timeout(timeout)
            .layer(GuardLayer::new(engine, resource))
            .service(svc),
    )
}

/// Service Builder Extension with additional useful functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Guard every request as one resource.
    fn guard(self, engine: Engine, resource: impl Into<String>) -> ServiceBuilder<Stack<GuardLayer, L>>;

    /// Guard requests with a custom classifier.
    fn guard_with<C>(self, engine: Engine, classify: C) -> ServiceBuilder<Stack<GuardLayer<C>, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn guard(self, engine: Engine, resource: impl Into<String>) -> ServiceBuilder<Stack<GuardLayer, L>> {
        self.layer(GuardLayer::new(engine, resource))
    }

    fn guard_with<C>(self, engine: Engine, classify: C) -> ServiceBuilder<Stack<GuardLayer<C>, L>> {
        self.layer(GuardLayer::with_classifier(engine, classify))
    }
}
