use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::Bucket;

/// Marks a slot that has never been written.
const EMPTY: u64 = u64::MAX;

/// A bucket together with the window `[start, start + length)` it covers.
#[derive(Debug)]
pub struct WindowWrap<B> {
    start: AtomicU64,
    length_ms: u64,
    bucket: B,
}

impl<B> WindowWrap<B> {
    #[inline]
    pub fn window_start(&self) -> u64 {
        self.start.load(Ordering::Acquire)
    }

    pub fn window_length_ms(&self) -> u64 {
        self.length_ms
    }

    #[inline]
    pub fn bucket(&self) -> &B {
        &self.bucket
    }
}

#[derive(Debug)]
struct Slot<B> {
    wrap: WindowWrap<B>,
    updating: AtomicBool,
}

/// A circular array of time buckets forming a sliding window.
///
/// Slot `i` always holds one of the windows of the last `interval_ms`
/// milliseconds, or is stale. Writers advance stale slots lazily; readers
/// skip them and never reset anything.
#[derive(Debug)]
pub struct LeapArray<B> {
    window_length_ms: u64,
    interval_ms: u64,
    slots: Box<[Slot<B>]>,
}

impl<B: Bucket> LeapArray<B> {
    /// # Panics
    ///
    /// Panics if `sample_count` is zero or does not divide `interval_ms`.
    pub fn new(sample_count: u32, interval_ms: u32) -> Self {
        assert!(sample_count > 0, "sample count must be positive");
        assert!(
            interval_ms % sample_count == 0,
            "interval must be a multiple of the sample count"
        );
        let window_length_ms = u64::from(interval_ms / sample_count);
        let slots = (0..sample_count)
            .map(|_| Slot {
                wrap: WindowWrap {
                    start: AtomicU64::new(EMPTY),
                    length_ms: window_length_ms,
                    bucket: B::default(),
                },
                updating: AtomicBool::new(false),
            })
            .collect();
        Self {
            window_length_ms,
            interval_ms: u64::from(interval_ms),
            slots,
        }
    }

    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn sample_count(&self) -> usize {
        self.slots.len()
    }

    /// Interval length in seconds, used to turn sums into rates.
    pub fn interval_sec(&self) -> f64 {
        self.interval_ms as f64 / 1000.0
    }

    #[inline]
    fn index_of(&self, time_ms: u64) -> usize {
        ((time_ms / self.window_length_ms) % self.slots.len() as u64) as usize
    }

    #[inline]
    pub fn window_start_of(&self, time_ms: u64) -> u64 {
        time_ms - time_ms % self.window_length_ms
    }

    /// The window containing `now`, advancing its slot if it is stale.
    ///
    /// Returns `None` only when `now` is older than the window the slot
    /// already moved on to, i.e. the caller was descheduled while another
    /// thread advanced the array.
    #[inline]
    pub fn current_window(&self, now: u64) -> Option<&WindowWrap<B>> {
        self.current_window_with(now, |_, _| {})
    }

    /// Like [`current_window`](Self::current_window), but runs `init` on the
    /// freshly reset bucket when this call is the one that advances the slot.
    pub fn current_window_with<F>(&self, now: u64, init: F) -> Option<&WindowWrap<B>>
    where
        F: FnOnce(&B, u64),
    {
        let expected = self.window_start_of(now);
        let slot = self.slots.get(self.index_of(now))?;
        let mut init = Some(init);

        loop {
            let start = slot.wrap.start.load(Ordering::Acquire);
            if start == expected {
                return Some(&slot.wrap);
            }
            if start != EMPTY && start > expected {
                return None;
            }

            if slot
                .updating
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Re-check: a previous winner may have advanced the slot
                // between our load and the flag.
                let start = slot.wrap.start.load(Ordering::Acquire);
                if start == EMPTY || start < expected {
                    slot.wrap.bucket.reset();
                    if let Some(init) = init.take() {
                        init(&slot.wrap.bucket, expected);
                    }
                    slot.wrap.start.store(expected, Ordering::Release);
                }
                slot.updating.store(false, Ordering::Release);
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Buckets whose window overlaps the last `interval_ms` ending at `now`.
    pub fn values(&self, now: u64) -> impl Iterator<Item = &WindowWrap<B>> + '_ {
        let interval = self.interval_ms;
        self.slots.iter().map(|slot| &slot.wrap).filter(move |wrap| {
            let start = wrap.window_start();
            start != EMPTY && start <= now && now - start < interval
        })
    }

    /// Buckets that start strictly after `now`, for arrays recording future
    /// windows.
    pub fn future_values(&self, now: u64) -> impl Iterator<Item = &WindowWrap<B>> + '_ {
        let interval = self.interval_ms;
        self.slots.iter().map(|slot| &slot.wrap).filter(move |wrap| {
            let start = wrap.window_start();
            start != EMPTY && start > now && start - now <= interval
        })
    }

    /// The window starting exactly at `start`, if a slot currently holds it.
    pub fn window_at(&self, start: u64) -> Option<&WindowWrap<B>> {
        let wrap = &self.slots.get(self.index_of(start))?.wrap;
        (wrap.window_start() == start).then_some(wrap)
    }
}
