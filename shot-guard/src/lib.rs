//! # shot-guard
//!
//! `shot-guard` decides, per call, whether a protected resource may be
//! entered. It keeps sliding-window statistics for every resource and applies
//! flow rules, hot-parameter rules, authority rules and circuit breakers
//! against them.
//!
//! ## Core Philosophy
//!
//! Admission sits on the hot path of every request. Statistics are plain
//! atomic counters in a ring of time buckets; a bucket is recycled by exactly
//! one writer when its window comes round again. Rules are immutable and
//! swapped in as a whole, so readers never take a lock.
//!
//! ## Key Concepts
//!
//! * **Resources**: anything worth protecting, named by a string.
//! * **Rules**: [`FlowRule`], [`DegradeRule`], [`AuthorityRule`] and
//!   [`ParamFlowRule`], loaded as JSON or built in code.
//! * **Decisions**: a rejection is a value ([`Decision::Blocked`]), never an
//!   error. An admitted call holds an [`Entry`] and reports its outcome on
//!   exit.
//! * **Cluster mode**: flow rules can draw tokens from a shared
//!   [`TokenService`] and fall back locally when it cannot answer.
//!
//! ## Example
//!
//! ```rust
//! use shot_guard::Decision;
//! use shot_guard::Engine;
//! use shot_guard::EngineConfig;
//! use shot_guard::EntryRequest;
//! use shot_guard::Rule;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let engine = Engine::new(EngineConfig::default()).unwrap();
//!     let rules = Rule::list_from_json(
//!         r#"[{"kind": "flow", "resource": "orders", "threshold": 100.0}]"#,
//!     )
//!     .unwrap();
//!     engine.load_rules(rules).unwrap();
//!
//!     match engine.entry(EntryRequest::new("orders")).await {
//!         Decision::Allowed(entry) => {
//!             // Call `entry.set_error()` first if the work failed.
//!             entry.exit();
//!         }
//!         Decision::Blocked(reason) => println!("rejected: {reason}"),
//!     }
//! });
//! ```

mod authority;
mod breaker;
mod clock;
mod cluster;
mod config;
mod engine;
mod error;
mod flow;
mod param;
mod rule;
pub mod stat;

pub use breaker::BreakerState;
pub use breaker::CircuitBreaker;
pub use breaker::Permit;
pub use clock::Ticker;
pub use cluster::ClusterTokenResult;
pub use cluster::TokenService;
pub use cluster::TokenStatus;
pub use config::BreakerRecovery;
pub use config::EngineConfig;
pub use engine::Decision;
pub use engine::Engine;
pub use engine::Entry;
pub use engine::EntryRequest;
pub use engine::RuleChangeEvent;
pub use error::BlockError;
pub use error::GuardError;
pub use flow::DefaultController;
pub use flow::RateLimiterController;
pub use flow::TokenResult;
pub use flow::TrafficShapingController;
pub use flow::WarmUpController;
pub use flow::WarmUpRateLimiterController;
pub use rule::AuthorityRule;
pub use rule::AuthorityStrategy;
pub use rule::ClusterFallback;
pub use rule::ClusterFlowConfig;
pub use rule::ClusterThresholdType;
pub use rule::ControlBehavior;
pub use rule::DegradeGrade;
pub use rule::DegradeRule;
pub use rule::FlowGrade;
pub use rule::FlowRule;
pub use rule::FlowStrategy;
pub use rule::LIMIT_APP_DEFAULT;
pub use rule::LIMIT_APP_OTHER;
pub use rule::ParamFlowItem;
pub use rule::ParamFlowRule;
pub use rule::ParamValue;
pub use rule::Rule;
pub use stat::EntryType;
pub use stat::ResourceSnapshot;
