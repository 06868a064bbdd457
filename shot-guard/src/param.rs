//! Hot-parameter flow control.
//!
//! A hot-parameter rule limits each distinct value of one call argument
//! separately, e.g. each user id or each product id. Per-value state lives in
//! a concurrent map bounded by `max_param_values`.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::flow::Throttle;
use crate::flow::TokenResult;
use crate::rule::ControlBehavior;
use crate::rule::FlowGrade;
use crate::rule::ParamFlowRule;
use crate::rule::ParamValue;

#[derive(Debug)]
struct ValueState {
    last_add_token: AtomicU64,
    tokens: AtomicI64,
    threads: AtomicI64,
    throttle: Throttle,
}

impl ValueState {
    fn new(now: u64, tokens: i64, max_queueing_time_ms: u64) -> Self {
        Self {
            last_add_token: AtomicU64::new(now),
            tokens: AtomicI64::new(tokens),
            threads: AtomicI64::new(0),
            throttle: Throttle::new(max_queueing_time_ms),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ParamChecker {
    rule: Arc<ParamFlowRule>,
    values: DashMap<ParamValue, Arc<ValueState>>,
    max_values: usize,
}

impl ParamChecker {
    pub(crate) fn new(rule: Arc<ParamFlowRule>, max_values: usize) -> Self {
        Self {
            rule,
            values: DashMap::new(),
            max_values: max_values.max(1),
        }
    }

    pub(crate) fn rule(&self) -> &Arc<ParamFlowRule> {
        &self.rule
    }

    fn duration_ms(&self) -> u64 {
        self.rule.duration_sec.saturating_mul(1_000).max(1)
    }

    fn make_room(&self) {
        if self.values.len() < self.max_values {
            return;
        }
        let victim = self.values.iter().next().map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            debug!(resource = %self.rule.resource, value = %victim, "evicting parameter state");
            self.values.remove(&victim);
        }
    }

    /// Returns the state for `value` and whether this call created it with
    /// `initial` tokens.
    fn state(&self, value: &ParamValue, now: u64, initial: i64) -> (Arc<ValueState>, bool) {
        if let Some(state) = self.values.get(value) {
            return (Arc::clone(state.value()), false);
        }
        self.make_room();
        match self.values.entry(value.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let state = Arc::new(ValueState::new(
                    now,
                    initial,
                    self.rule.max_queueing_time_ms,
                ));
                entry.insert(Arc::clone(&state));
                (state, true)
            }
        }
    }

    pub(crate) fn check(&self, args: &[ParamValue], acquire: u64, now: u64) -> TokenResult {
        let Some(value) = self.rule.select(args) else {
            return TokenResult::Pass;
        };
        if acquire == 0 {
            return TokenResult::Pass;
        }
        let threshold = self.rule.threshold_for(value);
        match self.rule.grade {
            FlowGrade::Thread => self.check_threads(value, threshold, now),
            FlowGrade::Qps => match self.rule.control_behavior {
                ControlBehavior::RateLimiter => self.check_throttle(value, threshold, acquire, now),
                _ => self.check_tokens(value, threshold, acquire, now),
            },
        }
    }

    fn check_threads(&self, value: &ParamValue, threshold: f64, now: u64) -> TokenResult {
        let (state, _) = self.state(value, now, 0);
        let threads = state.threads.load(Ordering::Acquire);
        if (threads + 1) as f64 <= threshold {
            TokenResult::Pass
        } else {
            TokenResult::Blocked
        }
    }

    fn check_throttle(
        &self,
        value: &ParamValue,
        threshold: f64,
        acquire: u64,
        now: u64,
    ) -> TokenResult {
        if threshold <= 0.0 {
            return TokenResult::Blocked;
        }
        let rate = threshold / self.rule.duration_sec.max(1) as f64;
        let cost = Throttle::cost_ms(acquire, rate);
        let (state, _) = self.state(value, now, 0);
        state.throttle.reserve(now as i64, cost)
    }

    fn check_tokens(
        &self,
        value: &ParamValue,
        threshold: f64,
        acquire: u64,
        now: u64,
    ) -> TokenResult {
        let token_count = threshold as i64;
        if token_count <= 0 {
            return TokenResult::Blocked;
        }
        let acquire = i64::try_from(acquire).unwrap_or(i64::MAX);
        let burst = i64::try_from(self.rule.burst_count).unwrap_or(i64::MAX);
        let max_count = token_count.saturating_add(burst);
        if acquire > max_count {
            return TokenResult::Blocked;
        }
        let (state, created) = self.state(value, now, max_count - acquire);
        if created {
            return TokenResult::Pass;
        }
        let duration_ms = self.duration_ms();

        loop {
            let last = state.last_add_token.load(Ordering::Acquire);
            let rest = state.tokens.load(Ordering::Acquire);
            let passed = now.saturating_sub(last);
            if passed > duration_ms {
                let refill = (passed as f64 * token_count as f64 / duration_ms as f64) as i64;
                let next = if rest.saturating_add(refill) > max_count {
                    max_count - acquire
                } else {
                    rest + refill - acquire
                };
                if next < 0 {
                    return TokenResult::Blocked;
                }
                if state
                    .tokens
                    .compare_exchange(rest, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    state.last_add_token.store(now, Ordering::Release);
                    return TokenResult::Pass;
                }
            } else {
                if rest - acquire < 0 {
                    return TokenResult::Blocked;
                }
                if state
                    .tokens
                    .compare_exchange(rest, rest - acquire, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return TokenResult::Pass;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Counts an admitted call against its value's concurrency.
    pub(crate) fn enter(&self, args: &[ParamValue]) {
        if self.rule.grade != FlowGrade::Thread {
            return;
        }
        if let Some(state) = self.rule.select(args).and_then(|v| self.values.get(v)) {
            state.threads.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn exit(&self, args: &[ParamValue]) {
        if self.rule.grade != FlowGrade::Thread {
            return;
        }
        if let Some(state) = self.rule.select(args).and_then(|v| self.values.get(v)) {
            state.threads.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[cfg(test)]
    fn tracked_values(&self) -> usize {
        self.values.len()
    }
}
