//! Rule definitions.
//!
//! Rules are immutable values. They are loaded as whole lists, validated as
//! a unit and swapped into the engine atomically. Every rule kind
//! round-trips through JSON:
//!
//! ```rust
//! use shot_guard::Rule;
//!
//! let rules = Rule::list_from_json(
//!     r#"[{"kind": "flow", "resource": "orders", "threshold": 5.0}]"#,
//! )
//! .unwrap();
//! assert_eq!(rules[0].resource(), "orders");
//! ```

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::GuardError;

/// `limit_app` value matching every caller.
pub const LIMIT_APP_DEFAULT: &str = "default";
/// `limit_app` value matching callers no other rule of the resource names.
pub const LIMIT_APP_OTHER: &str = "other";

fn default_limit_app() -> String {
    LIMIT_APP_DEFAULT.to_string()
}

fn default_warm_up_period_sec() -> u32 {
    10
}

fn default_max_queueing_time_ms() -> u64 {
    500
}

fn default_min_request_amount() -> u64 {
    5
}

fn default_duration_sec() -> u64 {
    1
}

fn default_resource_timeout_ms() -> u64 {
    2_000
}

/// A call argument that hot-parameter rules can key on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// What a flow rule counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowGrade {
    /// Concurrent calls in flight.
    Thread,
    /// Calls admitted per second.
    #[default]
    Qps,
}

/// Which statistics a flow rule reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStrategy {
    /// The resource's own statistics.
    #[default]
    Direct,
    /// The statistics of `ref_resource`.
    Relate,
    /// Only calls made under the context named by `ref_resource`.
    Chain,
}

/// How a flow rule shapes traffic over its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlBehavior {
    /// Reject immediately.
    #[default]
    Default,
    /// Ramp the allowed rate up after a cold period.
    WarmUp,
    /// Space calls evenly, queueing them up to a deadline.
    RateLimiter,
    /// Queue like `RateLimiter` at the warm-up rate.
    WarmUpRateLimiter,
}

/// What to do when the cluster token server cannot decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterFallback {
    /// Admit the call.
    #[default]
    Pass,
    /// Reject the call.
    Block,
    /// Check the rule against local statistics instead.
    Local,
}

/// How the server derives a global threshold from the rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterThresholdType {
    /// The threshold is per client; the server multiplies it by the number of
    /// connected clients.
    AvgLocal,
    /// The threshold is the cluster-wide total.
    #[default]
    Global,
}

/// Cluster settings of a flow or hot-parameter rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFlowConfig {
    /// Identifies the shared counter on the token server.
    pub flow_id: i64,
    #[serde(default)]
    pub threshold_type: ClusterThresholdType,
    /// Overrides the engine-wide fallback policy for this rule.
    #[serde(default)]
    pub fallback: Option<ClusterFallback>,
    /// Lease of a concurrency token before the server reclaims it.
    #[serde(default = "default_resource_timeout_ms")]
    pub resource_timeout_ms: u64,
}

impl ClusterFlowConfig {
    pub fn new(flow_id: i64) -> Self {
        Self {
            flow_id,
            threshold_type: ClusterThresholdType::default(),
            fallback: None,
            resource_timeout_ms: default_resource_timeout_ms(),
        }
    }

    pub fn with_threshold_type(mut self, threshold_type: ClusterThresholdType) -> Self {
        self.threshold_type = threshold_type;
        self
    }

    pub fn with_fallback(mut self, fallback: ClusterFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_resource_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.resource_timeout_ms = timeout_ms;
        self
    }
}

/// Limits the rate or concurrency of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRule {
    pub resource: String,
    #[serde(default = "default_limit_app")]
    pub limit_app: String,
    #[serde(default)]
    pub grade: FlowGrade,
    pub threshold: f64,
    #[serde(default)]
    pub strategy: FlowStrategy,
    #[serde(default)]
    pub ref_resource: Option<String>,
    #[serde(default)]
    pub control_behavior: ControlBehavior,
    #[serde(default = "default_warm_up_period_sec")]
    pub warm_up_period_sec: u32,
    #[serde(default = "default_max_queueing_time_ms")]
    pub max_queueing_time_ms: u64,
    #[serde(default)]
    pub cluster_mode: bool,
    #[serde(default)]
    pub cluster_config: Option<ClusterFlowConfig>,
}

impl FlowRule {
    fn new(resource: impl Into<String>, grade: FlowGrade, threshold: f64) -> Self {
        Self {
            resource: resource.into(),
            limit_app: default_limit_app(),
            grade,
            threshold,
            strategy: FlowStrategy::Direct,
            ref_resource: None,
            control_behavior: ControlBehavior::Default,
            warm_up_period_sec: default_warm_up_period_sec(),
            max_queueing_time_ms: default_max_queueing_time_ms(),
            cluster_mode: false,
            cluster_config: None,
        }
    }

    /// At most `threshold` calls per second.
    pub fn qps(resource: impl Into<String>, threshold: f64) -> Self {
        Self::new(resource, FlowGrade::Qps, threshold)
    }

    /// At most `threshold` calls in flight.
    pub fn concurrency(resource: impl Into<String>, threshold: f64) -> Self {
        Self::new(resource, FlowGrade::Thread, threshold)
    }

    pub fn with_limit_app(mut self, limit_app: impl Into<String>) -> Self {
        self.limit_app = limit_app.into();
        self
    }

    pub fn with_control_behavior(mut self, behavior: ControlBehavior) -> Self {
        self.control_behavior = behavior;
        self
    }

    pub fn with_warm_up_period_sec(mut self, secs: u32) -> Self {
        self.warm_up_period_sec = secs;
        self
    }

    pub fn with_max_queueing_time_ms(mut self, ms: u64) -> Self {
        self.max_queueing_time_ms = ms;
        self
    }

    /// Read the statistics of another resource.
    pub fn relate_to(mut self, resource: impl Into<String>) -> Self {
        self.strategy = FlowStrategy::Relate;
        self.ref_resource = Some(resource.into());
        self
    }

    /// Only count calls made under the named context.
    pub fn chain_from(mut self, context: impl Into<String>) -> Self {
        self.strategy = FlowStrategy::Chain;
        self.ref_resource = Some(context.into());
        self
    }

    pub fn with_cluster(mut self, config: ClusterFlowConfig) -> Self {
        self.cluster_mode = true;
        self.cluster_config = Some(config);
        self
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        validate_common(&self.resource, self.threshold, &self.limit_app)?;
        if self.strategy != FlowStrategy::Direct
            && self.ref_resource.as_deref().unwrap_or_default().is_empty()
        {
            return Err(GuardError::invalid(format!(
                "flow rule on `{}`: {:?} strategy needs a ref_resource",
                self.resource, self.strategy
            )));
        }
        match self.control_behavior {
            ControlBehavior::Default => {}
            ControlBehavior::WarmUp
            | ControlBehavior::RateLimiter
            | ControlBehavior::WarmUpRateLimiter
                if self.grade == FlowGrade::Thread =>
            {
                return Err(GuardError::invalid(format!(
                    "flow rule on `{}`: {:?} only applies to the QPS grade",
                    self.resource, self.control_behavior
                )));
            }
            ControlBehavior::WarmUp | ControlBehavior::WarmUpRateLimiter
                if self.warm_up_period_sec == 0 =>
            {
                return Err(GuardError::invalid(format!(
                    "flow rule on `{}`: warm-up period must be positive",
                    self.resource
                )));
            }
            _ => {}
        }
        if self.cluster_mode && self.cluster_config.is_none() {
            return Err(GuardError::invalid(format!(
                "flow rule on `{}`: cluster mode needs a cluster_config",
                self.resource
            )));
        }
        Ok(())
    }

    /// The token server flow id, when the rule runs in cluster mode.
    pub fn cluster_flow_id(&self) -> Option<i64> {
        if !self.cluster_mode {
            return None;
        }
        self.cluster_config.as_ref().map(|c| c.flow_id)
    }
}

/// What a degrade rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeGrade {
    /// Average response time, in milliseconds.
    #[default]
    Rt,
    /// Share of failed calls over the second-level window.
    ExceptionRatio,
    /// Failed calls over the trailing minute.
    ExceptionCount,
}

/// Trips a circuit breaker when a resource is unhealthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradeRule {
    pub resource: String,
    #[serde(default = "default_limit_app")]
    pub limit_app: String,
    #[serde(default)]
    pub grade: DegradeGrade,
    pub threshold: f64,
    /// How long the breaker stays open, in seconds.
    pub time_window_sec: u32,
    #[serde(default = "default_min_request_amount")]
    pub min_request_amount: u64,
}

impl DegradeRule {
    fn new(resource: impl Into<String>, grade: DegradeGrade, threshold: f64, time_window_sec: u32) -> Self {
        Self {
            resource: resource.into(),
            limit_app: default_limit_app(),
            grade,
            threshold,
            time_window_sec,
            min_request_amount: default_min_request_amount(),
        }
    }

    pub fn rt(resource: impl Into<String>, max_avg_rt_ms: f64, time_window_sec: u32) -> Self {
        Self::new(resource, DegradeGrade::Rt, max_avg_rt_ms, time_window_sec)
    }

    pub fn exception_ratio(resource: impl Into<String>, ratio: f64, time_window_sec: u32) -> Self {
        Self::new(resource, DegradeGrade::ExceptionRatio, ratio, time_window_sec)
    }

    pub fn exception_count(resource: impl Into<String>, count: f64, time_window_sec: u32) -> Self {
        Self::new(resource, DegradeGrade::ExceptionCount, count, time_window_sec)
    }

    pub fn with_min_request_amount(mut self, amount: u64) -> Self {
        self.min_request_amount = amount;
        self
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        validate_common(&self.resource, self.threshold, &self.limit_app)?;
        if self.time_window_sec == 0 {
            return Err(GuardError::invalid(format!(
                "degrade rule on `{}`: time window must be positive",
                self.resource
            )));
        }
        if self.grade == DegradeGrade::ExceptionRatio && self.threshold > 1.0 {
            return Err(GuardError::invalid(format!(
                "degrade rule on `{}`: exception ratio must not exceed 1.0",
                self.resource
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityStrategy {
    /// Only the listed origins may call.
    #[default]
    White,
    /// The listed origins may not call.
    Black,
}

/// Admits or rejects callers by origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityRule {
    pub resource: String,
    /// Comma-separated origins.
    pub limit_app: String,
    #[serde(default)]
    pub strategy: AuthorityStrategy,
}

impl AuthorityRule {
    pub fn white_list(resource: impl Into<String>, origins: &[&str]) -> Self {
        Self {
            resource: resource.into(),
            limit_app: origins.join(","),
            strategy: AuthorityStrategy::White,
        }
    }

    pub fn black_list(resource: impl Into<String>, origins: &[&str]) -> Self {
        Self {
            resource: resource.into(),
            limit_app: origins.join(","),
            strategy: AuthorityStrategy::Black,
        }
    }

    /// Whether `origin` appears in the list.
    pub fn lists(&self, origin: &str) -> bool {
        self.limit_app.split(',').any(|app| app.trim() == origin)
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        if self.resource.is_empty() {
            return Err(GuardError::invalid("authority rule with an empty resource"));
        }
        if self.limit_app.trim().is_empty() {
            return Err(GuardError::invalid(format!(
                "authority rule on `{}`: limit_app lists no origin",
                self.resource
            )));
        }
        Ok(())
    }
}

/// A per-value threshold overriding the rule threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamFlowItem {
    pub value: ParamValue,
    pub threshold: f64,
}

/// Limits calls per distinct value of one argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamFlowRule {
    pub resource: String,
    #[serde(default)]
    pub grade: FlowGrade,
    /// Argument position; negative values count from the end.
    pub param_idx: i32,
    pub threshold: f64,
    #[serde(default)]
    pub control_behavior: ControlBehavior,
    #[serde(default = "default_max_queueing_time_ms")]
    pub max_queueing_time_ms: u64,
    #[serde(default)]
    pub burst_count: u64,
    #[serde(default = "default_duration_sec")]
    pub duration_sec: u64,
    #[serde(default)]
    pub items: Vec<ParamFlowItem>,
    #[serde(default)]
    pub cluster_mode: bool,
    #[serde(default)]
    pub cluster_config: Option<ClusterFlowConfig>,
}

impl ParamFlowRule {
    pub fn new(resource: impl Into<String>, param_idx: i32, threshold: f64) -> Self {
        Self {
            resource: resource.into(),
            grade: FlowGrade::Qps,
            param_idx,
            threshold,
            control_behavior: ControlBehavior::Default,
            max_queueing_time_ms: default_max_queueing_time_ms(),
            burst_count: 0,
            duration_sec: default_duration_sec(),
            items: Vec::new(),
            cluster_mode: false,
            cluster_config: None,
        }
    }

    pub fn with_grade(mut self, grade: FlowGrade) -> Self {
        self.grade = grade;
        self
    }

    pub fn with_control_behavior(mut self, behavior: ControlBehavior) -> Self {
        self.control_behavior = behavior;
        self
    }

    pub fn with_max_queueing_time_ms(mut self, ms: u64) -> Self {
        self.max_queueing_time_ms = ms;
        self
    }

    pub fn with_burst_count(mut self, burst: u64) -> Self {
        self.burst_count = burst;
        self
    }

    pub fn with_duration_sec(mut self, secs: u64) -> Self {
        self.duration_sec = secs;
        self
    }

    pub fn with_item(mut self, value: impl Into<ParamValue>, threshold: f64) -> Self {
        self.items.push(ParamFlowItem {
            value: value.into(),
            threshold,
        });
        self
    }

    pub fn with_cluster(mut self, config: ClusterFlowConfig) -> Self {
        self.cluster_mode = true;
        self.cluster_config = Some(config);
        self
    }

    /// Threshold for `value`, taking item overrides into account.
    pub fn threshold_for(&self, value: &ParamValue) -> f64 {
        self.items
            .iter()
            .find(|item| &item.value == value)
            .map(|item| item.threshold)
            .unwrap_or(self.threshold)
    }

    /// The argument this rule keys on, if the call has it.
    pub fn select<'a>(&self, args: &'a [ParamValue]) -> Option<&'a ParamValue> {
        let idx = if self.param_idx < 0 {
            args.len().checked_sub(self.param_idx.unsigned_abs() as usize)?
        } else {
            self.param_idx as usize
        };
        args.get(idx)
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        validate_common(&self.resource, self.threshold, LIMIT_APP_DEFAULT)?;
        if self.duration_sec == 0 {
            return Err(GuardError::invalid(format!(
                "param flow rule on `{}`: duration must be positive",
                self.resource
            )));
        }
        if matches!(
            self.control_behavior,
            ControlBehavior::WarmUp | ControlBehavior::WarmUpRateLimiter
        ) {
            return Err(GuardError::invalid(format!(
                "param flow rule on `{}`: warm-up is not supported per parameter",
                self.resource
            )));
        }
        if let Some(item) = self
            .items
            .iter()
            .find(|item| !item.threshold.is_finite() || item.threshold < 0.0)
        {
            return Err(GuardError::invalid(format!(
                "param flow rule on `{}`: invalid threshold for value `{}`",
                self.resource, item.value
            )));
        }
        if self.cluster_mode && self.cluster_config.is_none() {
            return Err(GuardError::invalid(format!(
                "param flow rule on `{}`: cluster mode needs a cluster_config",
                self.resource
            )));
        }
        Ok(())
    }

    /// The token server flow id, when the rule runs in cluster mode.
    pub fn cluster_flow_id(&self) -> Option<i64> {
        if !self.cluster_mode {
            return None;
        }
        self.cluster_config.as_ref().map(|c| c.flow_id)
    }
}

fn validate_common(resource: &str, threshold: f64, limit_app: &str) -> Result<(), GuardError> {
    if resource.is_empty() {
        return Err(GuardError::invalid("rule with an empty resource"));
    }
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(GuardError::invalid(format!(
            "rule on `{resource}`: threshold must be a positive number, got {threshold}"
        )));
    }
    if limit_app.is_empty() {
        return Err(GuardError::invalid(format!(
            "rule on `{resource}`: limit_app must not be empty"
        )));
    }
    Ok(())
}

/// Any rule the engine understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    Flow(FlowRule),
    Degrade(DegradeRule),
    Authority(AuthorityRule),
    ParamFlow(ParamFlowRule),
}

impl Rule {
    pub fn resource(&self) -> &str {
        match self {
            Self::Flow(r) => &r.resource,
            Self::Degrade(r) => &r.resource,
            Self::Authority(r) => &r.resource,
            Self::ParamFlow(r) => &r.resource,
        }
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        match self {
            Self::Flow(r) => r.validate(),
            Self::Degrade(r) => r.validate(),
            Self::Authority(r) => r.validate(),
            Self::ParamFlow(r) => r.validate(),
        }
    }

    /// Parse a JSON array of rules.
    pub fn list_from_json(json: &str) -> Result<Vec<Rule>, GuardError> {
        serde_json::from_str(json).map_err(|e| GuardError::invalid(format!("malformed rules: {e}")))
    }
}

impl From<FlowRule> for Rule {
    fn from(rule: FlowRule) -> Self {
        Self::Flow(rule)
    }
}

impl From<DegradeRule> for Rule {
    fn from(rule: DegradeRule) -> Self {
        Self::Degrade(rule)
    }
}

impl From<AuthorityRule> for Rule {
    fn from(rule: AuthorityRule) -> Self {
        Self::Authority(rule)
    }
}

impl From<ParamFlowRule> for Rule {
    fn from(rule: ParamFlowRule) -> Self {
        Self::ParamFlow(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_rules_with_defaults() {
        let rules = Rule::list_from_json(
            r#"[
                {"kind": "flow", "resource": "orders", "threshold": 5.0},
                {"kind": "flow", "resource": "search", "threshold": 100.0,
                 "control_behavior": "warm_up", "warm_up_period_sec": 30},
                {"kind": "degrade", "resource": "orders", "grade": "exception_ratio",
                 "threshold": 0.5, "time_window_sec": 10},
                {"kind": "authority", "resource": "admin", "limit_app": "ops,billing",
                 "strategy": "black"},
                {"kind": "param_flow", "resource": "orders", "param_idx": 0, "threshold": 2.0,
                 "items": [{"value": "vip", "threshold": 20.0}, {"value": 7, "threshold": 1.0}]}
            ]"#,
        )
        .unwrap();

        assert_eq!(rules.len(), 5);
        let Rule::Flow(flow) = &rules[0] else {
            panic!("expected a flow rule")
        };
        assert_eq!(flow, &FlowRule::qps("orders", 5.0));
        assert_eq!(flow.limit_app, LIMIT_APP_DEFAULT);
        assert_eq!(flow.max_queueing_time_ms, 500);

        let Rule::Degrade(degrade) = &rules[2] else {
            panic!("expected a degrade rule")
        };
        assert_eq!(degrade.min_request_amount, 5);

        let Rule::Authority(authority) = &rules[3] else {
            panic!("expected an authority rule")
        };
        assert!(authority.lists("billing"));
        assert!(!authority.lists("bill"));

        let Rule::ParamFlow(param) = &rules[4] else {
            panic!("expected a param flow rule")
        };
        assert_eq!(param.threshold_for(&ParamValue::from("vip")), 20.0);
        assert_eq!(param.threshold_for(&ParamValue::Int(7)), 1.0);
        assert_eq!(param.threshold_for(&ParamValue::from("other")), 2.0);

        assert!(rules.iter().all(|r| r.validate().is_ok()));
    }

    #[test]
    fn it_rejects_malformed_rules() {
        assert!(FlowRule::qps("orders", 0.0).validate().is_err());
        assert!(FlowRule::qps("orders", -1.0).validate().is_err());
        assert!(FlowRule::qps("orders", f64::NAN).validate().is_err());
        assert!(FlowRule::qps("", 1.0).validate().is_err());
        assert!(
            FlowRule::concurrency("orders", 3.0)
                .with_control_behavior(ControlBehavior::RateLimiter)
                .validate()
                .is_err()
        );
        assert!(
            FlowRule::qps("orders", 3.0)
                .with_control_behavior(ControlBehavior::WarmUp)
                .with_warm_up_period_sec(0)
                .validate()
                .is_err()
        );
        let mut relate = FlowRule::qps("orders", 3.0);
        relate.strategy = FlowStrategy::Relate;
        assert!(relate.validate().is_err());

        let mut cluster = FlowRule::qps("orders", 3.0);
        cluster.cluster_mode = true;
        assert!(cluster.validate().is_err());

        assert!(DegradeRule::rt("orders", 50.0, 0).validate().is_err());
        assert!(DegradeRule::exception_ratio("orders", 1.5, 5).validate().is_err());
        assert!(AuthorityRule::white_list("orders", &[]).validate().is_err());
        assert!(
            ParamFlowRule::new("orders", 0, 5.0)
                .with_duration_sec(0)
                .validate()
                .is_err()
        );
        assert!(Rule::list_from_json("[{\"kind\": \"nope\"}]").is_err());
    }

    #[test]
    fn it_selects_arguments_from_either_end() {
        let rule = ParamFlowRule::new("orders", -1, 5.0);
        let args = vec![ParamValue::from("a"), ParamValue::Int(2)];
        assert_eq!(rule.select(&args), Some(&ParamValue::Int(2)));

        let rule = ParamFlowRule::new("orders", 0, 5.0);
        assert_eq!(rule.select(&args), Some(&ParamValue::from("a")));

        let rule = ParamFlowRule::new("orders", -3, 5.0);
        assert_eq!(rule.select(&args), None);
        let rule = ParamFlowRule::new("orders", 2, 5.0);
        assert_eq!(rule.select(&args), None);
    }
}
