use super::TokenResult;
use crate::rule::FlowGrade;
use crate::stat::ResourceNode;

/// Rejects as soon as the window count would exceed the threshold.
#[derive(Debug)]
pub struct DefaultController {
    grade: FlowGrade,
    threshold: f64,
    occupy_timeout_ms: u64,
}

impl DefaultController {
    pub fn new(grade: FlowGrade, threshold: f64, occupy_timeout_ms: u64) -> Self {
        Self {
            grade,
            threshold,
            occupy_timeout_ms,
        }
    }

    pub fn check(&self, node: &ResourceNode, acquire: u64, prioritized: bool) -> TokenResult {
        if acquire == 0 {
            return TokenResult::Pass;
        }
        if self.threshold <= 0.0 {
            return TokenResult::Blocked;
        }
        match self.grade {
            FlowGrade::Thread => {
                let current = node.cur_concurrency().max(0) as f64;
                if current + acquire as f64 <= self.threshold {
                    TokenResult::Pass
                } else {
                    TokenResult::Blocked
                }
            }
            FlowGrade::Qps => {
                let requested = acquire as f64 / node.interval_sec();
                if node.pass_qps() + requested <= self.threshold {
                    return TokenResult::Pass;
                }
                if prioritized {
                    let now = node.ticker().now_ms();
                    let wait =
                        node.try_occupy_next(now, acquire, self.threshold, self.occupy_timeout_ms);
                    if wait < self.occupy_timeout_ms {
                        node.add_waiting(now + wait, acquire);
                        node.add_occupied_pass(acquire);
                        return TokenResult::Occupied(wait);
                    }
                }
                TokenResult::Blocked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quanta::Clock;

    use super::*;
    use crate::Ticker;
    use crate::stat::EntryType;

    #[test]
    fn it_admits_up_to_the_threshold() {
        let (clock, _mock) = Clock::mock();
        let node = ResourceNode::new("res", EntryType::In, 2, 1_000, Ticker::with_clock(clock));
        let controller = DefaultController::new(FlowGrade::Qps, 5.0, 500);

        for _ in 0..5 {
            assert_eq!(controller.check(&node, 1, false), TokenResult::Pass);
            node.add_pass(1);
        }
        assert_eq!(controller.check(&node, 1, false), TokenResult::Blocked);
        assert_eq!(controller.check(&node, 0, false), TokenResult::Pass);
    }

    #[test]
    fn it_limits_concurrency() {
        let node = ResourceNode::new("res", EntryType::In, 2, 1_000, Ticker::new());
        let controller = DefaultController::new(FlowGrade::Thread, 2.0, 500);

        node.increase_concurrency();
        assert_eq!(controller.check(&node, 1, false), TokenResult::Pass);
        node.increase_concurrency();
        assert_eq!(controller.check(&node, 1, false), TokenResult::Blocked);
        node.decrease_concurrency();
        assert_eq!(controller.check(&node, 1, false), TokenResult::Pass);
    }

    #[test]
    fn it_lets_prioritized_requests_borrow_the_next_window() {
        let (clock, mock) = Clock::mock();
        let node = ResourceNode::new("res", EntryType::In, 2, 1_000, Ticker::with_clock(clock));
        let controller = DefaultController::new(FlowGrade::Qps, 5.0, 500);

        node.add_pass(5);
        mock.increment(Duration::from_millis(700));
        assert_eq!(controller.check(&node, 1, false), TokenResult::Blocked);
        assert_eq!(controller.check(&node, 1, true), TokenResult::Occupied(300));
        assert_eq!(node.waiting(), 1);

        // Only one window frees up within the timeout; it is now spoken for.
        assert_eq!(controller.check(&node, 5, true), TokenResult::Blocked);
    }

    #[test]
    fn it_blocks_everything_without_a_threshold() {
        let node = ResourceNode::new("res", EntryType::In, 2, 1_000, Ticker::new());
        let controller = DefaultController::new(FlowGrade::Qps, 0.0, 500);
        assert_eq!(controller.check(&node, 1, false), TokenResult::Blocked);
    }
}
