use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

/// Millisecond time source shared by every window and controller of an engine.
///
/// Time is measured from an anchor taken when the ticker is built, so the
/// first window starts at zero. Tests drive it with [`Clock::mock`].
#[derive(Debug, Clone)]
pub struct Ticker {
    clock: Clock,
    anchor: Instant,
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Self {
        let anchor = clock.now();
        Self { clock, anchor }
    }

    /// Milliseconds elapsed since the anchor.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.clock.now().duration_since(self.anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_follows_the_mock_clock() {
        let (clock, mock) = Clock::mock();
        let ticker = Ticker::with_clock(clock);
        assert_eq!(ticker.now_ms(), 0);

        mock.increment(Duration::from_millis(1_250));
        assert_eq!(ticker.now_ms(), 1_250);

        let cloned = ticker.clone();
        mock.increment(Duration::from_millis(5));
        assert_eq!(cloned.now_ms(), 1_255);
    }
}
