use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Counter state that can be recycled when its window slot is reused.
pub trait Bucket: Default + Send + Sync {
    /// Zero every counter. Called by the single thread that advances a slot.
    fn reset(&self);
}

/// Events recorded per time slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    Pass,
    Block,
    Success,
    Exception,
    /// Sum of response times, in milliseconds.
    Rt,
    /// Prioritized passes borrowed from a future window.
    OccupiedPass,
}

impl MetricEvent {
    pub const COUNT: usize = 6;
}

/// Counters for one time slice.
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicU64; MetricEvent::COUNT],
    min_rt: AtomicU64,
    peak_concurrency: AtomicI64,
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self {
            counters: Default::default(),
            min_rt: AtomicU64::new(u64::MAX),
            peak_concurrency: AtomicI64::new(0),
        }
    }
}

impl Bucket for MetricBucket {
    fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_rt.store(u64::MAX, Ordering::Relaxed);
        self.peak_concurrency.store(0, Ordering::Relaxed);
    }
}

impl MetricBucket {
    #[inline]
    pub fn add(&self, event: MetricEvent, n: u64) {
        self.counters[event as usize].fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, event: MetricEvent) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    /// Record one response time sample.
    pub fn add_rt(&self, rt: u64) {
        self.add(MetricEvent::Rt, rt);
        self.min_rt.fetch_min(rt, Ordering::Relaxed);
    }

    /// Smallest response time seen in this slice, if any was recorded.
    pub fn min_rt(&self) -> Option<u64> {
        match self.min_rt.load(Ordering::Relaxed) {
            u64::MAX => None,
            rt => Some(rt),
        }
    }

    pub fn observe_concurrency(&self, concurrency: i64) {
        self.peak_concurrency
            .fetch_max(concurrency, Ordering::Relaxed);
    }

    pub fn peak_concurrency(&self) -> i64 {
        self.peak_concurrency.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_counts_and_resets() {
        let bucket = MetricBucket::default();
        bucket.add(MetricEvent::Pass, 3);
        bucket.add(MetricEvent::Block, 1);
        bucket.add_rt(40);
        bucket.add_rt(15);
        bucket.observe_concurrency(4);
        bucket.observe_concurrency(2);

        assert_eq!(bucket.get(MetricEvent::Pass), 3);
        assert_eq!(bucket.get(MetricEvent::Block), 1);
        assert_eq!(bucket.get(MetricEvent::Rt), 55);
        assert_eq!(bucket.min_rt(), Some(15));
        assert_eq!(bucket.peak_concurrency(), 4);

        bucket.reset();
        assert_eq!(bucket.get(MetricEvent::Pass), 0);
        assert_eq!(bucket.get(MetricEvent::Rt), 0);
        assert_eq!(bucket.min_rt(), None);
        assert_eq!(bucket.peak_concurrency(), 0);
    }
}
