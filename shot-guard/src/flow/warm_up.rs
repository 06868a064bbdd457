use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::TokenResult;
use super::throttling::Throttle;
use crate::stat::ResourceNode;

/// Token-bucket model of a cold system.
///
/// A full bucket means the resource has been idle. While stored tokens stay
/// above `warning_token` the allowed rate climbs along a slope from
/// `threshold / cold_factor` to `threshold`. Every admitted permit takes one
/// token out, so saturating traffic drains the bucket to `warning_token`
/// within the warm-up period.
#[derive(Debug)]
pub(crate) struct WarmUpTokens {
    threshold: f64,
    cold_factor: u32,
    warning_token: i64,
    max_token: i64,
    slope: f64,
    stored_tokens: AtomicI64,
    last_filled_ms: AtomicU64,
}

impl WarmUpTokens {
    pub(crate) fn new(threshold: f64, warm_up_period_sec: u32, cold_factor: u32) -> Self {
        let warm_up = f64::from(warm_up_period_sec);
        let cold = f64::from(cold_factor);
        let warning_token =
            (warm_up * threshold) as i64 / i64::from(cold_factor.saturating_sub(1).max(1));
        let max_token = warning_token + (2.0 * warm_up * threshold / (1.0 + cold)) as i64;
        let slope = (cold - 1.0) / threshold / (max_token - warning_token).max(1) as f64;
        Self {
            threshold,
            cold_factor,
            warning_token,
            max_token,
            slope,
            // Start cold.
            stored_tokens: AtomicI64::new(max_token),
            last_filled_ms: AtomicU64::new(0),
        }
    }

    /// Refill the bucket once per second, judging from the traffic of the
    /// previous second whether the resource is cooling down.
    pub(crate) fn sync(&self, now: u64, previous_qps: f64) {
        let current = now - now % 1_000;
        let last_filled = self.last_filled_ms.load(Ordering::Acquire);
        if current <= last_filled {
            return;
        }
        let old = self.stored_tokens.load(Ordering::Acquire);
        let refilled = self.cool_down(old, current, last_filled, previous_qps as i64);
        if self
            .stored_tokens
            .compare_exchange(old, refilled, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.last_filled_ms.store(current, Ordering::Release);
        }
    }

    /// Takes the tokens of an admitted call out of the bucket.
    pub(crate) fn consume(&self, acquire: u64) {
        let acquire = i64::try_from(acquire).unwrap_or(i64::MAX);
        let _ = self
            .stored_tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |stored| {
                Some(stored.saturating_sub(acquire).max(0))
            });
    }

    fn cool_down(&self, old: i64, current: u64, last_filled: u64, previous_qps: i64) -> i64 {
        let refill = ((current - last_filled) as f64 * self.threshold / 1_000.0) as i64;
        let mut tokens = old;
        if old < self.warning_token {
            tokens = old + refill;
        } else if old > self.warning_token
            && previous_qps < self.threshold as i64 / i64::from(self.cold_factor.max(1))
        {
            // Too little traffic to keep warm.
            tokens = old + refill;
        }
        tokens.min(self.max_token)
    }

    /// The rate currently allowed by the bucket.
    pub(crate) fn allowed_qps(&self) -> f64 {
        let stored = self.stored_tokens.load(Ordering::Acquire);
        if stored >= self.warning_token {
            let above = (stored - self.warning_token) as f64;
            1.0 / (above * self.slope + 1.0 / self.threshold)
        } else {
            self.threshold
        }
    }
}

/// Ramps the admitted rate up after an idle period.
#[derive(Debug)]
pub struct WarmUpController {
    tokens: WarmUpTokens,
}

impl WarmUpController {
    pub fn new(threshold: f64, warm_up_period_sec: u32, cold_factor: u32) -> Self {
        Self {
            tokens: WarmUpTokens::new(threshold, warm_up_period_sec, cold_factor),
        }
    }

    pub fn allowed_qps(&self) -> f64 {
        self.tokens.allowed_qps()
    }

    pub fn check(&self, node: &ResourceNode, acquire: u64) -> TokenResult {
        if acquire == 0 {
            return TokenResult::Pass;
        }
        if self.tokens.threshold <= 0.0 {
            return TokenResult::Blocked;
        }
        self.tokens
            .sync(node.ticker().now_ms(), node.previous_pass_qps());
        // A fractional allowed rate still admits its last partial permit.
        let limit = self.tokens.allowed_qps().ceil().min(self.tokens.threshold);
        if node.pass_qps() + acquire as f64 <= limit {
            self.tokens.consume(acquire);
            TokenResult::Pass
        } else {
            TokenResult::Blocked
        }
    }
}

/// Queues calls like [`RateLimiterController`](super::RateLimiterController)
/// at the rate the warm-up bucket currently allows.
#[derive(Debug)]
pub struct WarmUpRateLimiterController {
    tokens: WarmUpTokens,
    throttle: Throttle,
}

impl WarmUpRateLimiterController {
    pub fn new(
        threshold: f64,
        warm_up_period_sec: u32,
        cold_factor: u32,
        max_queueing_time_ms: u64,
    ) -> Self {
        Self {
            tokens: WarmUpTokens::new(threshold, warm_up_period_sec, cold_factor),
            throttle: Throttle::new(max_queueing_time_ms),
        }
    }

    pub fn allowed_qps(&self) -> f64 {
        self.tokens.allowed_qps()
    }

    pub fn check(&self, node: &ResourceNode, acquire: u64) -> TokenResult {
        if acquire == 0 {
            return TokenResult::Pass;
        }
        if self.tokens.threshold <= 0.0 {
            return TokenResult::Blocked;
        }
        let now = node.ticker().now_ms();
        self.tokens.sync(now, node.previous_pass_qps());
        let cost = Throttle::cost_ms(acquire, self.tokens.allowed_qps());
        let result = self.throttle.reserve(now as i64, cost);
        if !result.is_blocked() {
            self.tokens.consume(acquire);
        }
        result
    }
}
