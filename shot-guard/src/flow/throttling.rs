use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use super::TokenResult;
use crate::stat::ResourceNode;

/// Reservation clock shared by the queueing controllers.
///
/// `latest_passed` is the time slot reserved by the most recently admitted
/// call. A call costing `cost` ms either takes the current instant (when the
/// previous reservation has already elapsed) or queues behind it.
#[derive(Debug)]
pub(crate) struct Throttle {
    latest_passed: AtomicI64,
    max_queueing_time_ms: i64,
}

impl Throttle {
    pub(crate) fn new(max_queueing_time_ms: u64) -> Self {
        Self {
            // Far enough in the past that the first call never queues.
            latest_passed: AtomicI64::new(i64::MIN / 2),
            max_queueing_time_ms: i64::try_from(max_queueing_time_ms).unwrap_or(i64::MAX),
        }
    }

    /// Milliseconds one call of `acquire` permits costs at `rate` per second.
    pub(crate) fn cost_ms(acquire: u64, rate: f64) -> i64 {
        (acquire as f64 / rate * 1_000.0).round() as i64
    }

    pub(crate) fn reserve(&self, now: i64, cost: i64) -> TokenResult {
        let latest = self.latest_passed.load(Ordering::Acquire);
        if latest.saturating_add(cost) <= now
            && self
                .latest_passed
                .compare_exchange(latest, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return TokenResult::Pass;
        }

        let latest = self.latest_passed.load(Ordering::Acquire);
        if latest.saturating_add(cost) - now > self.max_queueing_time_ms {
            return TokenResult::Blocked;
        }
        let reserved = self.latest_passed.fetch_add(cost, Ordering::AcqRel) + cost;
        let wait = reserved - now;
        if wait > self.max_queueing_time_ms {
            self.latest_passed.fetch_sub(cost, Ordering::AcqRel);
            return TokenResult::Blocked;
        }
        if wait <= 0 {
            TokenResult::Pass
        } else {
            TokenResult::Wait(wait as u64)
        }
    }
}

/// Spaces calls evenly at `threshold` per second, queueing the excess.
#[derive(Debug)]
pub struct RateLimiterController {
    threshold: f64,
    throttle: Throttle,
}

impl RateLimiterController {
    pub fn new(threshold: f64, max_queueing_time_ms: u64) -> Self {
        Self {
            threshold,
            throttle: Throttle::new(max_queueing_time_ms),
        }
    }

    pub fn check(&self, node: &ResourceNode, acquire: u64) -> TokenResult {
        if acquire == 0 {
            return TokenResult::Pass;
        }
        if self.threshold <= 0.0 {
            return TokenResult::Blocked;
        }
        let now = node.ticker().now_ms() as i64;
        self.throttle
            .reserve(now, Throttle::cost_ms(acquire, self.threshold))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quanta::Clock;

    use super::*;
    use crate::Ticker;
    use crate::stat::EntryType;

    fn node() -> (ResourceNode, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (
            ResourceNode::new("res", EntryType::In, 2, 1_000, Ticker::with_clock(clock)),
            mock,
        )
    }

    #[test]
    fn it_admits_a_wait_equal_to_the_queueing_limit() {
        let (node, _mock) = node();
        let controller = RateLimiterController::new(10.0, 200);

        assert_eq!(controller.check(&node, 1), TokenResult::Pass);
        assert_eq!(controller.check(&node, 1), TokenResult::Wait(100));
        assert_eq!(controller.check(&node, 1), TokenResult::Wait(200));
        assert_eq!(controller.check(&node, 1), TokenResult::Blocked);
    }

    #[test]
    fn it_rejects_one_millisecond_over_the_limit() {
        let (node, _mock) = node();
        let controller = RateLimiterController::new(10.0, 199);

        assert_eq!(controller.check(&node, 1), TokenResult::Pass);
        assert_eq!(controller.check(&node, 1), TokenResult::Wait(100));
        assert_eq!(controller.check(&node, 1), TokenResult::Blocked);
    }

    #[test]
    fn it_releases_the_queue_as_time_passes() {
        let (node, mock) = node();
        let controller = RateLimiterController::new(10.0, 100);

        assert_eq!(controller.check(&node, 1), TokenResult::Pass);
        assert_eq!(controller.check(&node, 1), TokenResult::Wait(100));
        assert_eq!(controller.check(&node, 1), TokenResult::Blocked);

        mock.increment(Duration::from_millis(150));
        assert_eq!(controller.check(&node, 1), TokenResult::Wait(50));
        mock.increment(Duration::from_millis(1_000));
        assert_eq!(controller.check(&node, 1), TokenResult::Pass);
    }

    #[test]
    fn it_charges_by_acquire_count() {
        let (node, _mock) = node();
        let controller = RateLimiterController::new(4.0, 1_000);

        assert_eq!(controller.check(&node, 2), TokenResult::Pass);
        // Two permits at 4/s cost 500ms.
        assert_eq!(controller.check(&node, 2), TokenResult::Wait(500));
        assert_eq!(controller.check(&node, 0), TokenResult::Pass);
    }
}
