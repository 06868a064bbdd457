//! Traffic shaping.
//!
//! Each flow rule gets one controller, chosen by its control behavior. A
//! controller only reads the statistics of the node it is handed; recording
//! the outcome is up to the engine.

use std::sync::Arc;

mod default;
mod throttling;
mod warm_up;

pub use default::DefaultController;
pub use throttling::RateLimiterController;
pub use warm_up::WarmUpController;
pub use warm_up::WarmUpRateLimiterController;

pub(crate) use throttling::Throttle;

use crate::EngineConfig;
use crate::engine::CallSite;
use crate::rule::ControlBehavior;
use crate::rule::FlowRule;
use crate::rule::FlowStrategy;
use crate::rule::LIMIT_APP_DEFAULT;
use crate::rule::LIMIT_APP_OTHER;
use crate::stat::ResourceNode;

/// Outcome of a single controller check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenResult {
    Pass,
    Blocked,
    /// Admitted after waiting this many milliseconds.
    Wait(u64),
    /// Admitted after waiting this many milliseconds against capacity
    /// borrowed from a future window. The pass is already accounted for.
    Occupied(u64),
}

impl TokenResult {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }
}

#[derive(Debug)]
pub enum TrafficShapingController {
    Default(DefaultController),
    WarmUp(WarmUpController),
    RateLimiter(RateLimiterController),
    WarmUpRateLimiter(WarmUpRateLimiterController),
}

impl TrafficShapingController {
    pub fn for_rule(rule: &FlowRule, config: &EngineConfig) -> Self {
        match rule.control_behavior {
            ControlBehavior::Default => Self::Default(DefaultController::new(
                rule.grade,
                rule.threshold,
                config.occupy_timeout_ms,
            )),
            ControlBehavior::WarmUp => Self::WarmUp(WarmUpController::new(
                rule.threshold,
                rule.warm_up_period_sec,
                config.cold_factor,
            )),
            ControlBehavior::RateLimiter => Self::RateLimiter(RateLimiterController::new(
                rule.threshold,
                rule.max_queueing_time_ms,
            )),
            ControlBehavior::WarmUpRateLimiter => {
                Self::WarmUpRateLimiter(WarmUpRateLimiterController::new(
                    rule.threshold,
                    rule.warm_up_period_sec,
                    config.cold_factor,
                    rule.max_queueing_time_ms,
                ))
            }
        }
    }

    pub fn check(&self, node: &ResourceNode, acquire: u64, prioritized: bool) -> TokenResult {
        match self {
            Self::Default(c) => c.check(node, acquire, prioritized),
            Self::WarmUp(c) => c.check(node, acquire),
            Self::RateLimiter(c) => c.check(node, acquire),
            Self::WarmUpRateLimiter(c) => c.check(node, acquire),
        }
    }
}

/// A flow rule bound to its controller.
#[derive(Debug)]
pub(crate) struct FlowChecker {
    rule: Arc<FlowRule>,
    controller: TrafficShapingController,
}

impl FlowChecker {
    pub(crate) fn new(rule: Arc<FlowRule>, config: &EngineConfig) -> Self {
        let controller = TrafficShapingController::for_rule(&rule, config);
        Self { rule, controller }
    }

    pub(crate) fn rule(&self) -> &Arc<FlowRule> {
        &self.rule
    }

    pub(crate) fn check(&self, node: &ResourceNode, acquire: u64, prioritized: bool) -> TokenResult {
        self.controller.check(node, acquire, prioritized)
    }

    /// The node whose statistics this rule limits for the given call, or
    /// `None` when the rule does not apply to it.
    ///
    /// `other_origin` tells whether the caller's origin is named by none of
    /// the resource's flow rules.
    pub(crate) fn select_node(
        &self,
        site: &CallSite<'_>,
        other_origin: bool,
    ) -> Option<Arc<ResourceNode>> {
        let limit_app = self.rule.limit_app.as_str();
        let origin = site.origin;
        let named_origin =
            !origin.is_empty() && origin != LIMIT_APP_DEFAULT && origin != LIMIT_APP_OTHER;

        if limit_app == origin && named_origin {
            if self.rule.strategy == FlowStrategy::Direct {
                return site.origin_node.cloned();
            }
            return self.reference_node(site);
        }
        if limit_app == LIMIT_APP_DEFAULT {
            if self.rule.strategy == FlowStrategy::Direct {
                return Some(Arc::clone(site.node));
            }
            return self.reference_node(site);
        }
        if limit_app == LIMIT_APP_OTHER && other_origin {
            if self.rule.strategy == FlowStrategy::Direct {
                return site.origin_node.cloned();
            }
            return self.reference_node(site);
        }
        None
    }

    fn reference_node(&self, site: &CallSite<'_>) -> Option<Arc<ResourceNode>> {
        let reference = self.rule.ref_resource.as_deref()?;
        match self.rule.strategy {
            FlowStrategy::Relate => site.registry.get(reference),
            FlowStrategy::Chain if reference == site.context => site.context_node.cloned(),
            _ => None,
        }
    }
}
