use std::time::Duration;

use shot_guard::BlockError;

/// Why the guard layer turned a request away.
///
/// Each variant keeps the [`BlockError`] the engine reported, so the rule
/// that fired is still reachable through [`RejectError::block`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RejectError {
    /// A flow or hot-parameter limit was reached.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error("too many requests: {0}")]
    RateLimited(BlockError),

    /// A circuit breaker is open for the resource.
    ///
    /// When the `axum` feature is enabled, this converts to
    /// `503 Service Unavailable` with a `Retry-After` header.
    #[error("service degraded, retry after {retry_after:?}: {block}")]
    Degraded {
        block: BlockError,
        retry_after: Duration,
    },

    /// The caller's origin is not allowed.
    ///
    /// When the `axum` feature is enabled, this converts to `403 Forbidden`.
    #[error("forbidden: {0}")]
    Forbidden(BlockError),
}

impl RejectError {
    pub fn block(&self) -> &BlockError {
        match self {
            Self::RateLimited(block) | Self::Forbidden(block) => block,
            Self::Degraded { block, .. } => block,
        }
    }
}

impl From<BlockError> for RejectError {
    fn from(block: BlockError) -> Self {
        match &block {
            BlockError::Flow(_) | BlockError::ParamFlow(_) => Self::RateLimited(block),
            BlockError::CircuitBreaker(rule) => {
                let retry_after = Duration::from_secs(u64::from(rule.time_window_sec));
                Self::Degraded { block, retry_after }
            }
            BlockError::Authority(_) => Self::Forbidden(block),
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for RejectError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, retry_after) = match &self {
            Self::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, None),
            Self::Degraded { retry_after, .. } => {
                let secs = retry_after.as_secs().max(1);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Some(axum::http::HeaderValue::from(secs)),
                )
            }
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, None),
        };

        let mut response = (status, self.to_string()).into_response();
        if let Some(value) = retry_after {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, value);
        }
        response
    }
}
