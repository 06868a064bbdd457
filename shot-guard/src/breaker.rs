//! Circuit breakers.
//!
//! A breaker's state and its retry deadline share one atomic word, so every
//! transition is a single compare-and-swap and concurrent callers can trip or
//! reset a breaker at most once. An open breaker does not need a timer: the
//! deadline is honoured by the next admission check.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::info;
use tracing::warn;

use crate::config::BreakerRecovery;
use crate::rule::DegradeGrade;
use crate::rule::DegradeRule;
use crate::stat::MetricEvent;
use crate::stat::ResourceNode;

const STATE_BITS: u64 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// One probe call is in flight.
    HalfOpen,
}

impl BreakerState {
    fn bits(self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[inline]
fn pack(state: BreakerState, retry_at: u64) -> u64 {
    (retry_at << STATE_BITS) | state.bits()
}

#[inline]
fn unpack(word: u64) -> (BreakerState, u64) {
    (BreakerState::from_bits(word), word >> STATE_BITS)
}

/// Admission verdict of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Pass,
    /// Admitted as the single probe of a half-open breaker. Its completion
    /// must be reported with `probe = true`.
    Probe,
    Reject,
}

/// Breaker for one degrade rule.
#[derive(Debug)]
pub struct CircuitBreaker {
    rule: Arc<DegradeRule>,
    recovery: BreakerRecovery,
    rt_max_exceed_n: u32,
    word: AtomicU64,
    slow_streak: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(rule: Arc<DegradeRule>, recovery: BreakerRecovery, rt_max_exceed_n: u32) -> Self {
        Self {
            rule,
            recovery,
            rt_max_exceed_n,
            word: AtomicU64::new(pack(BreakerState::Closed, 0)),
            slow_streak: AtomicU32::new(0),
        }
    }

    pub fn rule(&self) -> &Arc<DegradeRule> {
        &self.rule
    }

    pub fn state(&self) -> BreakerState {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    fn transition(&self, from: u64, to: u64) -> bool {
        self.word
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn try_pass(&self, now: u64) -> Permit {
        loop {
            let word = self.word.load(Ordering::Acquire);
            let (state, retry_at) = unpack(word);
            match state {
                BreakerState::Closed => return Permit::Pass,
                BreakerState::HalfOpen => return Permit::Reject,
                BreakerState::Open if now < retry_at => return Permit::Reject,
                BreakerState::Open => match self.recovery {
                    BreakerRecovery::Timed => {
                        if self.transition(word, pack(BreakerState::Closed, 0)) {
                            self.slow_streak.store(0, Ordering::Release);
                            info!(resource = %self.rule.resource, "circuit breaker closed");
                            return Permit::Pass;
                        }
                    }
                    BreakerRecovery::Probe => {
                        if self.transition(word, pack(BreakerState::HalfOpen, 0)) {
                            info!(resource = %self.rule.resource, "circuit breaker half-open");
                            return Permit::Probe;
                        }
                    }
                },
            }
        }
    }

    /// Re-evaluates the breaker after a call completed.
    ///
    /// `rt` and `failed` describe the call itself; the trip conditions read
    /// the window statistics of `node`.
    pub fn on_complete(&self, node: &ResourceNode, now: u64, rt: u64, failed: bool, probe: bool) {
        if probe {
            let healthy = match self.rule.grade {
                DegradeGrade::Rt => !failed && (rt as f64) < self.rule.threshold,
                DegradeGrade::ExceptionRatio | DegradeGrade::ExceptionCount => !failed,
            };
            self.finish_probe(now, healthy);
            return;
        }
        if self.state() != BreakerState::Closed {
            return;
        }
        if self.should_trip(node) {
            self.trip(now);
        }
    }

    fn should_trip(&self, node: &ResourceNode) -> bool {
        let rule = &self.rule;
        match rule.grade {
            DegradeGrade::Rt => {
                if node.avg_rt() < rule.threshold {
                    self.slow_streak.store(0, Ordering::Release);
                    return false;
                }
                self.slow_streak.fetch_add(1, Ordering::AcqRel) + 1 >= self.rt_max_exceed_n
            }
            DegradeGrade::ExceptionRatio => {
                let exception = node.count(MetricEvent::Exception);
                let total = node
                    .count(MetricEvent::Success)
                    .saturating_add(exception);
                if total < rule.min_request_amount {
                    return false;
                }
                exception as f64 / total as f64 >= rule.threshold
            }
            DegradeGrade::ExceptionCount => {
                if node.total_count_minute() < rule.min_request_amount {
                    return false;
                }
                node.exception_count_minute() as f64 >= rule.threshold
            }
        }
    }

    fn retry_at(&self, now: u64) -> u64 {
        now + u64::from(self.rule.time_window_sec) * 1_000
    }

    fn trip(&self, now: u64) {
        let closed = pack(BreakerState::Closed, 0);
        if self.transition(closed, pack(BreakerState::Open, self.retry_at(now))) {
            self.slow_streak.store(0, Ordering::Release);
            warn!(
                resource = %self.rule.resource,
                grade = ?self.rule.grade,
                threshold = self.rule.threshold,
                time_window_sec = self.rule.time_window_sec,
                "circuit breaker opened"
            );
        }
    }

    /// Returns a probe that never ran because another rule rejected the call.
    pub fn abort_probe(&self, now: u64) {
        let half_open = pack(BreakerState::HalfOpen, 0);
        self.transition(half_open, pack(BreakerState::Open, self.retry_at(now)));
    }

    fn finish_probe(&self, now: u64, healthy: bool) {
        let half_open = pack(BreakerState::HalfOpen, 0);
        if healthy {
            if self.transition(half_open, pack(BreakerState::Closed, 0)) {
                self.slow_streak.store(0, Ordering::Release);
                info!(resource = %self.rule.resource, "probe succeeded, circuit breaker closed");
            }
        } else if self.transition(half_open, pack(BreakerState::Open, self.retry_at(now))) {
            warn!(resource = %self.rule.resource, "probe failed, circuit breaker reopened");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use quanta::Clock;

    use super::*;
    use crate::Ticker;
    use crate::stat::EntryType;

    fn node() -> (ResourceNode, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (
            ResourceNode::new("res", EntryType::Out, 2, 1_000, Ticker::with_clock(clock)),
            mock,
        )
    }

    fn complete(breaker: &CircuitBreaker, node: &ResourceNode, rt: u64, failed: bool) {
        if failed {
            node.add_exception(1);
        } else {
            node.add_success(1);
            node.add_rt(rt);
        }
        breaker.on_complete(node, node.ticker().now_ms(), rt, failed, false);
    }

    #[test]
    fn test_rt_breaker_hysteresis() {
        let (node, mock) = node();
        let breaker = CircuitBreaker::new(
            Arc::new(DegradeRule::rt("res", 50.0, 10)),
            BreakerRecovery::Timed,
            5,
        );

        for _ in 0..4 {
            complete(&breaker, &node, 100, false);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_pass(node.ticker().now_ms()), Permit::Pass);

        complete(&breaker, &node, 100, false);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_pass(node.ticker().now_ms()), Permit::Reject);

        mock.increment(Duration::from_millis(9_999));
        assert_eq!(breaker.try_pass(node.ticker().now_ms()), Permit::Reject);
        mock.increment(Duration::from_millis(1));
        assert_eq!(breaker.try_pass(node.ticker().now_ms()), Permit::Pass);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn it_resets_the_slow_streak_on_a_fast_average() {
        let (node, mock) = node();
        let breaker = CircuitBreaker::new(
            Arc::new(DegradeRule::rt("res", 50.0, 10)),
            BreakerRecovery::Timed,
            5,
        );
        for _ in 0..4 {
            complete(&breaker, &node, 100, false);
        }
        // Let the slow calls leave the window, then report a fast one.
        mock.increment(Duration::from_secs(2));
        complete(&breaker, &node, 5, false);
        for _ in 0..4 {
            complete(&breaker, &node, 5, false);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn it_needs_enough_requests_to_trip_on_ratio() {
        let (node, _mock) = node();
        let breaker = CircuitBreaker::new(
            Arc::new(DegradeRule::exception_ratio("res", 0.5, 5)),
            BreakerRecovery::Timed,
            5,
        );
        for _ in 0..4 {
            complete(&breaker, &node, 1, true);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        complete(&breaker, &node, 1, true);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn it_counts_exceptions_over_the_minute() {
        let (node, mock) = node();
        let breaker = CircuitBreaker::new(
            Arc::new(DegradeRule::exception_count("res", 3.0, 5).with_min_request_amount(1)),
            BreakerRecovery::Timed,
            5,
        );
        complete(&breaker, &node, 1, true);
        mock.increment(Duration::from_secs(20));
        complete(&breaker, &node, 1, true);
        mock.increment(Duration::from_secs(20));
        assert_eq!(breaker.state(), BreakerState::Closed);
        complete(&breaker, &node, 1, true);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn it_recovers_through_a_single_probe() {
        let (node, mock) = node();
        let breaker = CircuitBreaker::new(
            Arc::new(DegradeRule::exception_ratio("res", 0.5, 1).with_min_request_amount(1)),
            BreakerRecovery::Probe,
            5,
        );
        complete(&breaker, &node, 1, true);
        assert_eq!(breaker.state(), BreakerState::Open);

        mock.increment(Duration::from_secs(1));
        let now = node.ticker().now_ms();
        assert_eq!(breaker.try_pass(now), Permit::Probe);
        assert_eq!(breaker.try_pass(now), Permit::Reject);

        // A failed probe reopens for another window.
        breaker.on_complete(&node, now, 1, true, true);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_pass(now), Permit::Reject);

        mock.increment(Duration::from_secs(1));
        let now = node.ticker().now_ms();
        assert_eq!(breaker.try_pass(now), Permit::Probe);
        breaker.on_complete(&node, now, 1, false, true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_concurrent_trips_open_once() {
        let (node, _mock) = node();
        let node = Arc::new(node);
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(DegradeRule::exception_ratio("res", 0.1, 10).with_min_request_amount(1)),
            BreakerRecovery::Timed,
            5,
        ));
        node.add_exception(10);

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let node = Arc::clone(&node);
                let breaker = Arc::clone(&breaker);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    breaker.on_complete(&node, 0, 1, true, false);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        let (_, retry_at) = unpack(breaker.word.load(Ordering::Acquire));
        assert_eq!(retry_at, 10_000);
    }
}
