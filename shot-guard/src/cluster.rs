//! The seam between the engine and a shared token server.

use std::fmt::Debug;

use futures::future::BoxFuture;

use crate::GuardError;
use crate::rule::ParamValue;

/// Verdict of a token server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Ok,
    Blocked,
    /// Granted after waiting `wait_ms`.
    ShouldWait,
    NoRuleExists,
    BadRequest,
    Fail,
    /// The server itself is over its request budget.
    TooManyRequest,
    ReleaseOk,
    AlreadyReleased,
}

impl TokenStatus {
    pub fn code(self) -> i8 {
        match self {
            Self::BadRequest => -4,
            Self::TooManyRequest => -2,
            Self::Fail => -1,
            Self::Ok => 0,
            Self::Blocked => 1,
            Self::ShouldWait => 2,
            Self::NoRuleExists => 3,
            Self::ReleaseOk => 6,
            Self::AlreadyReleased => 7,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -4 => Self::BadRequest,
            -2 => Self::TooManyRequest,
            -1 => Self::Fail,
            0 => Self::Ok,
            1 => Self::Blocked,
            2 => Self::ShouldWait,
            3 => Self::NoRuleExists,
            6 => Self::ReleaseOk,
            7 => Self::AlreadyReleased,
            _ => return None,
        })
    }

    /// Statuses that carry no verdict about the call, so the caller's
    /// fallback policy applies.
    pub fn needs_fallback(self) -> bool {
        matches!(
            self,
            Self::NoRuleExists | Self::BadRequest | Self::Fail | Self::TooManyRequest
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTokenResult {
    pub status: TokenStatus,
    pub remaining: i32,
    pub wait_ms: u64,
    /// Lease id of a concurrency token, `0` otherwise.
    pub token_id: u64,
}

impl ClusterTokenResult {
    pub fn new(status: TokenStatus) -> Self {
        Self {
            status,
            remaining: 0,
            wait_ms: 0,
            token_id: 0,
        }
    }

    pub fn with_remaining(mut self, remaining: i32) -> Self {
        self.remaining = remaining;
        self
    }

    pub fn with_wait_ms(mut self, wait_ms: u64) -> Self {
        self.wait_ms = wait_ms;
        self
    }

    pub fn with_token_id(mut self, token_id: u64) -> Self {
        self.token_id = token_id;
        self
    }
}

/// Something that hands out cluster tokens: a remote server reached through a
/// client, or a server embedded in this process.
pub trait TokenService: Debug + Send + Sync {
    fn request_token(
        &self,
        flow_id: i64,
        acquire: u32,
        prioritized: bool,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>>;

    fn request_param_token(
        &self,
        flow_id: i64,
        acquire: u32,
        params: Vec<ParamValue>,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>>;

    fn acquire_concurrent_token(
        &self,
        flow_id: i64,
        acquire: u32,
        prioritized: bool,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>>;

    fn release_concurrent_token(
        &self,
        token_id: u64,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_maps_status_codes_both_ways() {
        for status in [
            TokenStatus::Ok,
            TokenStatus::Blocked,
            TokenStatus::ShouldWait,
            TokenStatus::NoRuleExists,
            TokenStatus::BadRequest,
            TokenStatus::Fail,
            TokenStatus::TooManyRequest,
            TokenStatus::ReleaseOk,
            TokenStatus::AlreadyReleased,
        ] {
            assert_eq!(TokenStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TokenStatus::from_code(42), None);
        assert!(TokenStatus::Fail.needs_fallback());
        assert!(!TokenStatus::Blocked.needs_fallback());
    }
}
