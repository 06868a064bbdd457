use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use super::LeapArray;
use super::MetricBucket;
use super::MetricEvent;
use crate::Ticker;

/// Direction of the traffic a resource sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Inbound traffic, e.g. an API handler.
    In,
    /// Outbound traffic, e.g. a downstream call.
    #[default]
    Out,
}

/// Read-only view of a node's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub pass_qps: f64,
    pub block_qps: f64,
    pub success_qps: f64,
    pub exception_qps: f64,
    pub total_qps: f64,
    pub avg_rt: f64,
    pub min_rt: u64,
    pub cur_concurrency: i64,
}

/// Statistics for one resource (or one resource seen from one origin).
///
/// Holds a fine second-level window for rates, a minute-level window of
/// one-second buckets for trailing counts, and a window of future buckets
/// for prioritized requests that borrowed capacity ahead of time.
#[derive(Debug)]
pub struct ResourceNode {
    name: String,
    entry_type: EntryType,
    second: LeapArray<MetricBucket>,
    minute: LeapArray<MetricBucket>,
    borrowed: LeapArray<MetricBucket>,
    concurrency: AtomicI64,
    ticker: Ticker,
}

impl ResourceNode {
    pub fn new(
        name: impl Into<String>,
        entry_type: EntryType,
        sample_count: u32,
        interval_ms: u32,
        ticker: Ticker,
    ) -> Self {
        Self {
            name: name.into(),
            entry_type,
            second: LeapArray::new(sample_count, interval_ms),
            minute: LeapArray::new(60, 60_000),
            borrowed: LeapArray::new(sample_count, interval_ms),
            concurrency: AtomicI64::new(0),
            ticker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    pub fn interval_sec(&self) -> f64 {
        self.second.interval_sec()
    }

    fn record(&self, now: u64, event: MetricEvent, n: u64) {
        let borrowed = &self.borrowed;
        if let Some(w) = self.second.current_window_with(now, |bucket, start| {
            // Passes reserved earlier for this window become real passes.
            if let Some(future) = borrowed.window_at(start) {
                bucket.add(MetricEvent::Pass, future.bucket().get(MetricEvent::Pass));
            }
        }) {
            w.bucket().add(event, n);
        }
        if let Some(w) = self.minute.current_window(now) {
            w.bucket().add(event, n);
        }
    }

    pub fn add_pass(&self, n: u64) {
        self.record(self.ticker.now_ms(), MetricEvent::Pass, n);
    }

    pub fn add_block(&self, n: u64) {
        self.record(self.ticker.now_ms(), MetricEvent::Block, n);
    }

    pub fn add_success(&self, n: u64) {
        self.record(self.ticker.now_ms(), MetricEvent::Success, n);
    }

    pub fn add_exception(&self, n: u64) {
        self.record(self.ticker.now_ms(), MetricEvent::Exception, n);
    }

    pub fn add_occupied_pass(&self, n: u64) {
        self.record(self.ticker.now_ms(), MetricEvent::OccupiedPass, n);
    }

    pub fn add_rt(&self, rt: u64) {
        let now = self.ticker.now_ms();
        if let Some(w) = self.second.current_window(now) {
            w.bucket().add_rt(rt);
        }
        if let Some(w) = self.minute.current_window(now) {
            w.bucket().add_rt(rt);
        }
    }

    pub fn increase_concurrency(&self) {
        let current = self.concurrency.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(w) = self.second.current_window(self.ticker.now_ms()) {
            w.bucket().observe_concurrency(current);
        }
    }

    pub fn decrease_concurrency(&self) {
        self.concurrency.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn cur_concurrency(&self) -> i64 {
        self.concurrency.load(Ordering::Acquire)
    }

    fn sum(&self, array: &LeapArray<MetricBucket>, event: MetricEvent) -> u64 {
        let now = self.ticker.now_ms();
        array
            .values(now)
            .fold(0u64, |acc, w| acc.saturating_add(w.bucket().get(event)))
    }

    /// Count of `event` over the second-level window.
    pub fn count(&self, event: MetricEvent) -> u64 {
        self.sum(&self.second, event)
    }

    fn qps(&self, event: MetricEvent) -> f64 {
        self.count(event) as f64 / self.second.interval_sec()
    }

    pub fn pass_qps(&self) -> f64 {
        self.qps(MetricEvent::Pass)
    }

    pub fn block_qps(&self) -> f64 {
        self.qps(MetricEvent::Block)
    }

    pub fn success_qps(&self) -> f64 {
        self.qps(MetricEvent::Success)
    }

    pub fn exception_qps(&self) -> f64 {
        self.qps(MetricEvent::Exception)
    }

    pub fn occupied_pass_qps(&self) -> f64 {
        self.qps(MetricEvent::OccupiedPass)
    }

    /// Admitted plus rejected requests per second.
    pub fn total_qps(&self) -> f64 {
        self.pass_qps() + self.block_qps()
    }

    /// Average response time of successful calls, `0.0` when there were none.
    pub fn avg_rt(&self) -> f64 {
        let success = self.count(MetricEvent::Success);
        if success == 0 {
            return 0.0;
        }
        self.count(MetricEvent::Rt) as f64 / success as f64
    }

    pub fn min_rt(&self) -> u64 {
        let now = self.ticker.now_ms();
        self.second
            .values(now)
            .filter_map(|w| w.bucket().min_rt())
            .min()
            .unwrap_or(0)
    }

    /// `exception / max(1, success + exception)` over the second-level window.
    pub fn exception_ratio(&self) -> f64 {
        let success = self.count(MetricEvent::Success);
        let exception = self.count(MetricEvent::Exception);
        exception as f64 / success.saturating_add(exception).max(1) as f64
    }

    fn previous_second(&self, event: MetricEvent) -> f64 {
        let now = self.ticker.now_ms();
        let current = self.minute.window_start_of(now);
        let Some(previous) = current.checked_sub(self.minute.window_length_ms()) else {
            return 0.0;
        };
        self.minute
            .window_at(previous)
            .map(|w| w.bucket().get(event) as f64)
            .unwrap_or(0.0)
    }

    /// Passes recorded during the previous whole second.
    pub fn previous_pass_qps(&self) -> f64 {
        self.previous_second(MetricEvent::Pass)
    }

    pub fn previous_block_qps(&self) -> f64 {
        self.previous_second(MetricEvent::Block)
    }

    /// Exceptions over the trailing 60 seconds.
    pub fn exception_count_minute(&self) -> u64 {
        self.sum(&self.minute, MetricEvent::Exception)
    }

    /// Completed calls (successes and exceptions) over the trailing 60 seconds.
    pub fn total_count_minute(&self) -> u64 {
        self.sum(&self.minute, MetricEvent::Success)
            .saturating_add(self.sum(&self.minute, MetricEvent::Exception))
    }

    /// Passes already reserved in future windows.
    pub fn waiting(&self) -> u64 {
        let now = self.ticker.now_ms();
        self.borrowed
            .future_values(now)
            .map(|w| w.bucket().get(MetricEvent::Pass))
            .sum()
    }

    /// Reserve `acquire` passes in the window that starts at `future_time`.
    pub fn add_waiting(&self, future_time: u64, acquire: u64) {
        if let Some(w) = self.borrowed.current_window(future_time) {
            w.bucket().add(MetricEvent::Pass, acquire);
        }
    }

    fn window_pass(&self, start: u64) -> u64 {
        self.second
            .window_at(start)
            .map(|w| w.bucket().get(MetricEvent::Pass))
            .unwrap_or(0)
    }

    /// How long a prioritized request has to wait until the oldest buckets of
    /// the window expire and leave room for `acquire` more passes.
    ///
    /// Returns `occupy_timeout_ms` when no window within the timeout frees
    /// enough room.
    pub fn try_occupy_next(
        &self,
        now: u64,
        acquire: u64,
        threshold: f64,
        occupy_timeout_ms: u64,
    ) -> u64 {
        let window_length = self.second.window_length_ms();
        let interval = self.second.interval_ms();
        let max_count = threshold * self.second.interval_sec();
        let mut current_pass = self.count(MetricEvent::Pass) as f64;
        let borrowed = self.waiting() as f64;

        // May start before the anchor; such windows hold nothing.
        let mut earliest = (now - now % window_length + window_length) as i64 - interval as i64;
        let mut idx = 0;
        while earliest < now as i64 {
            let wait = idx * window_length + window_length - now % window_length;
            if wait >= occupy_timeout_ms {
                break;
            }
            let window_pass = u64::try_from(earliest)
                .map(|start| self.window_pass(start))
                .unwrap_or(0) as f64;
            if current_pass + borrowed + acquire as f64 - window_pass <= max_count {
                return wait;
            }
            earliest += window_length as i64;
            current_pass -= window_pass;
            idx += 1;
        }
        occupy_timeout_ms
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            pass_qps: self.pass_qps(),
            block_qps: self.block_qps(),
            success_qps: self.success_qps(),
            exception_qps: self.exception_qps(),
            total_qps: self.total_qps(),
            avg_rt: self.avg_rt(),
            min_rt: self.min_rt(),
            cur_concurrency: self.cur_concurrency(),
        }
    }
}
