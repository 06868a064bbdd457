use serde::Deserialize;
use serde::Serialize;

use crate::GuardError;
use crate::rule::ClusterFallback;

/// How an open circuit breaker recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerRecovery {
    /// Close again once the rule's time window has elapsed.
    #[default]
    Timed,
    /// After the time window admit one probe call; its outcome decides.
    Probe,
}

/// Engine-wide settings.
///
/// ```rust
/// use shot_guard::EngineConfig;
///
/// let config = EngineConfig::default().with_sample_count(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buckets in the second-level window.
    pub sample_count: u32,
    /// Span of the second-level window.
    pub interval_ms: u32,
    /// Warm-up cold factor; the cold rate is `threshold / cold_factor`.
    pub cold_factor: u32,
    /// Longest wait a prioritized request may borrow from future windows.
    pub occupy_timeout_ms: u64,
    /// Response times are capped to this before being recorded.
    pub max_rt_ms: u64,
    /// Consecutive slow completions that trip an RT breaker.
    pub rt_max_exceed_n: u32,
    pub breaker_recovery: BreakerRecovery,
    /// What to do when the token server cannot answer.
    pub cluster_fallback: ClusterFallback,
    /// Distinct resources tracked before new ones go unguarded.
    pub max_resources: usize,
    /// Distinct values tracked per hot-parameter rule.
    pub max_param_values: usize,
    /// Carry controllers and breakers of unchanged rules over a reload
    /// instead of starting them fresh.
    pub keep_state_on_reload: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_count: 2,
            interval_ms: 1_000,
            cold_factor: 3,
            occupy_timeout_ms: 500,
            max_rt_ms: 4_900,
            rt_max_exceed_n: 5,
            breaker_recovery: BreakerRecovery::Timed,
            cluster_fallback: ClusterFallback::Pass,
            max_resources: 6_000,
            max_param_values: 4_000,
            keep_state_on_reload: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, GuardError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GuardError::invalid(format!("malformed engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        if self.sample_count == 0 || self.interval_ms == 0 {
            return Err(GuardError::invalid(
                "sample_count and interval_ms must be positive",
            ));
        }
        if self.interval_ms % self.sample_count != 0 {
            return Err(GuardError::invalid(format!(
                "interval_ms ({}) must be a multiple of sample_count ({})",
                self.interval_ms, self.sample_count
            )));
        }
        if self.cold_factor <= 1 {
            return Err(GuardError::invalid("cold_factor must be greater than 1"));
        }
        if self.rt_max_exceed_n == 0 {
            return Err(GuardError::invalid("rt_max_exceed_n must be positive"));
        }
        if self.max_resources == 0 {
            return Err(GuardError::invalid("max_resources must be positive"));
        }
        Ok(())
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u32) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn with_cold_factor(mut self, cold_factor: u32) -> Self {
        self.cold_factor = cold_factor;
        self
    }

    pub fn with_occupy_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.occupy_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_rt_ms(mut self, max_rt_ms: u64) -> Self {
        self.max_rt_ms = max_rt_ms;
        self
    }

    pub fn with_rt_max_exceed_n(mut self, n: u32) -> Self {
        self.rt_max_exceed_n = n;
        self
    }

    pub fn with_breaker_recovery(mut self, recovery: BreakerRecovery) -> Self {
        self.breaker_recovery = recovery;
        self
    }

    pub fn with_cluster_fallback(mut self, fallback: ClusterFallback) -> Self {
        self.cluster_fallback = fallback;
        self
    }

    pub fn with_max_resources(mut self, max_resources: usize) -> Self {
        self.max_resources = max_resources;
        self
    }

    pub fn with_max_param_values(mut self, max_param_values: usize) -> Self {
        self.max_param_values = max_param_values;
        self
    }

    pub fn with_keep_state_on_reload(mut self, keep: bool) -> Self {
        self.keep_state_on_reload = keep;
        self
    }
}
