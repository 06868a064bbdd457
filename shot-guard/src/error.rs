use std::sync::Arc;
use std::time::Duration;

use crate::rule::AuthorityRule;
use crate::rule::DegradeRule;
use crate::rule::FlowRule;
use crate::rule::ParamFlowRule;
use crate::rule::Rule;

/// Errors produced by the engine and its collaborators.
///
/// Rejections are not errors; they are reported through [`BlockError`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
    /// A rule or configuration value was rejected at load time.
    ///
    /// The previously active configuration stays in place.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The cluster token server did not answer within the request timeout.
    #[error("cluster request timed out after {timeout:?}")]
    ClusterRequestTimeout { timeout: Duration },

    /// The cluster token client has no live connection.
    #[error("cluster token client is not ready")]
    ClusterClientNotReady,

    /// The cluster token server could not decode the request.
    #[error("cluster token server rejected a malformed request")]
    ClusterServerBadRequest,

    /// An internal invariant did not hold. Only the current operation is aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GuardError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Returns `true` for failures talking to the cluster token server.
    pub fn is_cluster_failure(&self) -> bool {
        matches!(
            self,
            Self::ClusterRequestTimeout { .. }
                | Self::ClusterClientNotReady
                | Self::ClusterServerBadRequest
        )
    }
}

/// Why a call was not admitted, carrying the rule that rejected it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BlockError {
    #[error("blocked by flow control on `{}`", .0.resource)]
    Flow(Arc<FlowRule>),

    #[error("blocked by an open circuit breaker on `{}`", .0.resource)]
    CircuitBreaker(Arc<DegradeRule>),

    #[error("blocked by authority rule on `{}`", .0.resource)]
    Authority(Arc<AuthorityRule>),

    #[error("blocked by hot parameter control on `{}`", .0.resource)]
    ParamFlow(Arc<ParamFlowRule>),
}

impl BlockError {
    /// The resource the rejecting rule protects.
    pub fn resource(&self) -> &str {
        match self {
            Self::Flow(rule) => &rule.resource,
            Self::CircuitBreaker(rule) => &rule.resource,
            Self::Authority(rule) => &rule.resource,
            Self::ParamFlow(rule) => &rule.resource,
        }
    }

    /// An owned copy of the rule that rejected the call.
    pub fn rule(&self) -> Rule {
        match self {
            Self::Flow(rule) => Rule::Flow(FlowRule::clone(rule)),
            Self::CircuitBreaker(rule) => Rule::Degrade(DegradeRule::clone(rule)),
            Self::Authority(rule) => Rule::Authority(AuthorityRule::clone(rule)),
            Self::ParamFlow(rule) => Rule::ParamFlow(ParamFlowRule::clone(rule)),
        }
    }

    /// A short, stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Flow(_) => "flow",
            Self::CircuitBreaker(_) => "circuit_breaker",
            Self::Authority(_) => "authority",
            Self::ParamFlow(_) => "param_flow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GuardError::ConfigInvalid("threshold must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: threshold must be positive"
        );

        let err = GuardError::ClusterRequestTimeout {
            timeout: Duration::from_millis(20),
        };
        assert_eq!(err.to_string(), "cluster request timed out after 20ms");
        assert!(err.is_cluster_failure());
        assert!(!GuardError::invalid("x").is_cluster_failure());
    }

    #[test]
    fn test_block_error_carries_rule() {
        let rule = Arc::new(FlowRule::qps("orders", 5.0));
        let err = BlockError::Flow(rule.clone());
        assert_eq!(err.resource(), "orders");
        assert_eq!(err.kind(), "flow");
        assert_eq!(err.rule(), Rule::Flow(FlowRule::clone(&rule)));
        assert_eq!(err.to_string(), "blocked by flow control on `orders`");
    }
}
