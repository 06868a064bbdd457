use shot_guard::Engine;
use tower::Layer;

use crate::classify::FixedResource;
use crate::service::GuardService;

/// Admits requests through an [`Engine`] before they reach the inner service.
#[derive(Debug, Clone)]
pub struct GuardLayer<C = FixedResource> {
    engine: Engine,
    classify: C,
}

impl GuardLayer {
    /// Guard every request as the inbound resource `resource`.
    pub fn new(engine: Engine, resource: impl Into<String>) -> Self {
        Self {
            engine,
            classify: FixedResource::new(resource),
        }
    }
}

impl<C> GuardLayer<C> {
    /// Build each request's entry with `classify`.
    pub fn with_classifier(engine: Engine, classify: C) -> Self {
        Self { engine, classify }
    }
}

impl<S, C> Layer<S> for GuardLayer<C>
where
    C: Clone,
{
    type Service = GuardService<S, C>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService::new(service, self.engine.clone(), self.classify.clone())
    }
}
