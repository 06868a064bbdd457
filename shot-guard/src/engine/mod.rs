//! The rule checker.
//!
//! [`Engine::entry`] runs every rule of a resource against a call, in order:
//! authority, hot parameters, flow, circuit breakers. The first rejection wins
//! and is recorded as a block; otherwise the call is recorded as a pass and
//! handed back as an [`Entry`] that reports the outcome on exit.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use quanta::Clock;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

mod entry;
mod rules;

pub use entry::Decision;
pub use entry::Entry;
pub use entry::EntryRequest;
pub use rules::RuleChangeEvent;

use entry::ClusterTokens;
use rules::ResourceRules;
use rules::RuleSet;

use crate::BlockError;
use crate::EngineConfig;
use crate::GuardError;
use crate::Ticker;
use crate::authority;
use crate::breaker::Permit;
use crate::cluster::ClusterTokenResult;
use crate::cluster::TokenService;
use crate::cluster::TokenStatus;
use crate::flow::FlowChecker;
use crate::flow::TokenResult;
use crate::param::ParamChecker;
use crate::rule::ClusterFallback;
use crate::rule::ClusterFlowConfig;
use crate::rule::FlowGrade;
use crate::rule::Rule;
use crate::stat::NodeRegistry;
use crate::stat::ResourceNode;
use crate::stat::ResourceSnapshot;

/// The nodes one call is accounted against.
#[derive(Debug)]
pub(crate) struct CallSite<'a> {
    pub(crate) resource: &'a str,
    pub(crate) origin: &'a str,
    pub(crate) context: &'a str,
    pub(crate) node: &'a Arc<ResourceNode>,
    pub(crate) origin_node: Option<&'a Arc<ResourceNode>>,
    pub(crate) context_node: Option<&'a Arc<ResourceNode>>,
    pub(crate) registry: &'a NodeRegistry,
}

/// Side effects of a successful admission that the entry must undo later.
#[derive(Debug, Default)]
struct Admission {
    occupied: bool,
    probes: Vec<usize>,
    cluster_tokens: ClusterTokens,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    ticker: Ticker,
    registry: NodeRegistry,
    rules: ArcSwap<RuleSet>,
    /// Serializes rule writers; holds the last applied sequence.
    writer: Mutex<Option<u64>>,
    token_service: RwLock<Option<Arc<dyn TokenService>>>,
    watchers: Mutex<Vec<AbortHandle>>,
}

/// A request admission engine.
///
/// Cheap to clone; clones share statistics and rules.
///
/// ```rust
/// use shot_guard::Engine;
/// use shot_guard::EngineConfig;
/// use shot_guard::EntryRequest;
/// use shot_guard::FlowRule;
///
/// let runtime = tokio::runtime::Runtime::new().unwrap();
/// runtime.block_on(async {
///     let engine = Engine::new(EngineConfig::default()).unwrap();
///     engine.load_rules(vec![FlowRule::qps("orders", 5.0).into()]).unwrap();
///
///     if let Ok(entry) = engine.entry(EntryRequest::new("orders")).await.into_result() {
///         // do the work
///         entry.exit();
///     }
/// });
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, GuardError> {
        Self::with_clock(config, Clock::new())
    }

    /// An engine reading time from `clock`, e.g. a [`Clock::mock`].
    pub fn with_clock(config: EngineConfig, clock: Clock) -> Result<Self, GuardError> {
        config.validate()?;
        let ticker = Ticker::with_clock(clock);
        let registry = NodeRegistry::new(
            config.sample_count,
            config.interval_ms,
            config.max_resources,
            ticker.clone(),
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                ticker,
                registry,
                rules: ArcSwap::from_pointee(RuleSet::default()),
                writer: Mutex::new(None),
                token_service: RwLock::new(None),
                watchers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Replaces every active rule.
    pub fn load_rules(&self, rules: Vec<Rule>) -> Result<(), GuardError> {
        self.apply(RuleChangeEvent::replace_all(rules))
    }

    /// Applies a rule update atomically.
    ///
    /// An invalid update is rejected as a whole and the active rules stay in
    /// place. Stale sequences are ignored.
    pub fn apply(&self, event: RuleChangeEvent) -> Result<(), GuardError> {
        let mut last_sequence = self.inner.writer.lock();
        if let (Some(sequence), Some(last)) = (event.sequence, *last_sequence) {
            if sequence <= last {
                debug!(sequence, last, "ignoring stale rule update");
                return Ok(());
            }
        }

        let current = self.inner.rules.load_full();
        let next = match current.apply(&event, &self.inner.config) {
            Ok(next) => next,
            Err(err) => {
                error!(error = %err, "rejected rule update; keeping the active rules");
                return Err(err);
            }
        };
        let resources = next.resource_count();
        self.inner.rules.store(Arc::new(next));
        if event.sequence.is_some() {
            *last_sequence = event.sequence;
        }
        info!(
            rules = event.rules.len(),
            resources,
            sequence = ?event.sequence,
            partial = event.resources.is_some(),
            "rules loaded"
        );
        Ok(())
    }

    /// Applies every event received on `events` until the sender goes away or
    /// the engine is closed.
    pub fn watch_rules(&self, mut events: mpsc::Receiver<RuleChangeEvent>) -> JoinHandle<()> {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Rejections are logged by `apply`.
                let _ = Engine { inner }.apply(event);
            }
            debug!("rule watcher stopped");
        });
        self.inner.watchers.lock().push(handle.abort_handle());
        handle
    }

    /// The active rules, grouped by resource.
    pub fn rules(&self) -> Vec<Rule> {
        self.inner.rules.load().rules()
    }

    /// Routes cluster-mode rules through `service`.
    pub fn set_token_service(&self, service: Arc<dyn TokenService>) {
        *self.inner.token_service.write() = Some(service);
    }

    pub fn clear_token_service(&self) {
        *self.inner.token_service.write() = None;
    }

    /// Stops rule watchers and detaches the token service.
    ///
    /// Admission keeps working with the rules active at that point.
    pub fn close(&self) {
        for watcher in self.inner.watchers.lock().drain(..) {
            watcher.abort();
        }
        self.clear_token_service();
        info!("engine closed");
    }

    pub fn snapshot(&self, resource: &str) -> Option<ResourceSnapshot> {
        self.inner.registry.get(resource).map(|node| node.snapshot())
    }

    /// Snapshots of every resource, sorted by name.
    pub fn snapshots(&self) -> Vec<(String, ResourceSnapshot)> {
        let mut all: Vec<_> = self
            .inner
            .registry
            .resources()
            .into_iter()
            .map(|(name, node)| (name, node.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Decides whether the call may proceed.
    ///
    /// Queueing controllers and prioritized borrowing make the call wait on a
    /// Tokio timer; dropping the future abandons the call.
    pub async fn entry(&self, request: EntryRequest) -> Decision {
        let inner = &self.inner;
        let acquire = u64::from(request.acquire_count);
        let start_ms = inner.ticker.now_ms();
        let token_service = inner.token_service.read().clone();

        let Some(node) = inner
            .registry
            .resource_node(&request.resource, request.entry_type)
        else {
            return Decision::Allowed(Entry {
                ticker: inner.ticker.clone(),
                max_rt_ms: inner.config.max_rt_ms,
                start_ms,
                acquire,
                node: None,
                extra_nodes: Vec::new(),
                rules: None,
                args: request.args,
                probes: Vec::new(),
                cluster_tokens: ClusterTokens::default(),
                failed: false,
                exited: false,
            });
        };
        let rules = inner.rules.load().get(&request.resource).cloned();
        // Per-caller nodes exist only for resources whose rules read them.
        let origin_node = rules
            .as_ref()
            .filter(|r| r.tracks_origins && !request.origin.is_empty())
            .and_then(|_| {
                inner
                    .registry
                    .origin_node(&request.resource, &request.origin, request.entry_type)
            });
        let context_node = rules
            .as_ref()
            .filter(|r| r.tracks_contexts && !request.context.is_empty())
            .and_then(|_| {
                inner
                    .registry
                    .context_node(&request.resource, &request.context, request.entry_type)
            });

        let mut admission = Admission {
            cluster_tokens: ClusterTokens::new(token_service.clone()),
            ..Admission::default()
        };
        if let Some(rules) = &rules {
            let site = CallSite {
                resource: &request.resource,
                origin: &request.origin,
                context: &request.context,
                node: &node,
                origin_node: origin_node.as_ref(),
                context_node: context_node.as_ref(),
                registry: &inner.registry,
            };
            let checked = self
                .check(rules, &site, &request, acquire, token_service.as_ref(), &mut admission)
                .await;
            if let Err(blocked) = checked {
                let nodes = std::iter::once(&node)
                    .chain(origin_node.as_ref())
                    .chain(context_node.as_ref());
                for n in nodes {
                    n.add_block(acquire);
                }
                let now = inner.ticker.now_ms();
                for idx in admission.probes {
                    if let Some(breaker) = rules.breakers.get(idx) {
                        breaker.abort_probe(now);
                    }
                }
                // Dropping the admission hands its cluster tokens back.
                debug!(
                    resource = %request.resource,
                    origin = %request.origin,
                    rule = blocked.kind(),
                    "call blocked"
                );
                return Decision::Blocked(blocked);
            }
        }

        let extra_nodes: Vec<Arc<ResourceNode>> =
            origin_node.into_iter().chain(context_node).collect();
        for n in std::iter::once(&node).chain(extra_nodes.iter()) {
            if !admission.occupied {
                n.add_pass(acquire);
            }
            n.increase_concurrency();
        }
        if let Some(rules) = &rules {
            for checker in &rules.params {
                checker.enter(&request.args);
            }
        }

        Decision::Allowed(Entry {
            ticker: inner.ticker.clone(),
            max_rt_ms: inner.config.max_rt_ms,
            start_ms,
            acquire,
            node: Some(node),
            extra_nodes,
            rules,
            args: request.args,
            probes: admission.probes,
            cluster_tokens: admission.cluster_tokens,
            failed: false,
            exited: false,
        })
    }

    async fn check(
        &self,
        rules: &ResourceRules,
        site: &CallSite<'_>,
        request: &EntryRequest,
        acquire: u64,
        service: Option<&Arc<dyn TokenService>>,
        admission: &mut Admission,
    ) -> Result<(), BlockError> {
        for rule in &rules.authority {
            if !authority::passes(rule, site.origin) {
                return Err(BlockError::Authority(Arc::clone(rule)));
            }
        }

        for checker in &rules.params {
            let result = match checker.rule().cluster_flow_id() {
                Some(flow_id) => {
                    self.check_cluster_param(checker, flow_id, request, acquire, service)
                        .await
                }
                None => checker.check(&request.args, acquire, self.inner.ticker.now_ms()),
            };
            if !settle(result, admission).await {
                return Err(BlockError::ParamFlow(Arc::clone(checker.rule())));
            }
        }

        let other_origin = !site.origin.is_empty() && !rules.named_origins.contains(site.origin);
        for checker in &rules.flows {
            let result = match checker.rule().cluster_flow_id() {
                Some(flow_id) => {
                    self.check_cluster_flow(
                        checker,
                        flow_id,
                        site,
                        other_origin,
                        acquire,
                        request.prioritized,
                        service,
                        admission,
                    )
                    .await
                }
                None => check_local_flow(checker, site, other_origin, acquire, request.prioritized),
            };
            if !settle(result, admission).await {
                return Err(BlockError::Flow(Arc::clone(checker.rule())));
            }
        }

        let now = self.inner.ticker.now_ms();
        for (idx, breaker) in rules.breakers.iter().enumerate() {
            match breaker.try_pass(now) {
                Permit::Pass => {}
                Permit::Probe => admission.probes.push(idx),
                Permit::Reject => {
                    return Err(BlockError::CircuitBreaker(Arc::clone(breaker.rule())));
                }
            }
        }
        Ok(())
    }

    fn fallback_policy(&self, config: Option<&ClusterFlowConfig>) -> ClusterFallback {
        config
            .and_then(|c| c.fallback)
            .unwrap_or(self.inner.config.cluster_fallback)
    }

    #[allow(clippy::too_many_arguments)]
    async fn check_cluster_flow(
        &self,
        checker: &FlowChecker,
        flow_id: i64,
        site: &CallSite<'_>,
        other_origin: bool,
        acquire: u64,
        prioritized: bool,
        service: Option<&Arc<dyn TokenService>>,
        admission: &mut Admission,
    ) -> TokenResult {
        let rule = checker.rule();
        if let Some(service) = service {
            let count = u32::try_from(acquire).unwrap_or(u32::MAX);
            let response = if rule.grade == FlowGrade::Thread {
                service
                    .acquire_concurrent_token(flow_id, count, prioritized)
                    .await
            } else {
                service.request_token(flow_id, count, prioritized).await
            };
            if let Some(result) = cluster_verdict(site.resource, flow_id, response, admission) {
                return result;
            }
        }
        match self.fallback_policy(rule.cluster_config.as_ref()) {
            ClusterFallback::Pass => TokenResult::Pass,
            ClusterFallback::Block => TokenResult::Blocked,
            ClusterFallback::Local => {
                check_local_flow(checker, site, other_origin, acquire, prioritized)
            }
        }
    }

    async fn check_cluster_param(
        &self,
        checker: &ParamChecker,
        flow_id: i64,
        request: &EntryRequest,
        acquire: u64,
        service: Option<&Arc<dyn TokenService>>,
    ) -> TokenResult {
        let rule = checker.rule();
        let Some(value) = rule.select(&request.args) else {
            return TokenResult::Pass;
        };
        if let Some(service) = service {
            let count = u32::try_from(acquire).unwrap_or(u32::MAX);
            let response = service
                .request_param_token(flow_id, count, vec![value.clone()])
                .await;
            let mut ignored = Admission::default();
            if let Some(result) = cluster_verdict(&request.resource, flow_id, response, &mut ignored)
            {
                return result;
            }
        }
        match self.fallback_policy(rule.cluster_config.as_ref()) {
            ClusterFallback::Pass => TokenResult::Pass,
            ClusterFallback::Block => TokenResult::Blocked,
            ClusterFallback::Local => {
                checker.check(&request.args, acquire, self.inner.ticker.now_ms())
            }
        }
    }
}

fn check_local_flow(
    checker: &FlowChecker,
    site: &CallSite<'_>,
    other_origin: bool,
    acquire: u64,
    prioritized: bool,
) -> TokenResult {
    match checker.select_node(site, other_origin) {
        Some(node) => checker.check(&node, acquire, prioritized),
        None => TokenResult::Pass,
    }
}

/// Turns a token server response into a decision, or `None` when the
/// fallback policy has to decide.
fn cluster_verdict(
    resource: &str,
    flow_id: i64,
    response: Result<ClusterTokenResult, GuardError>,
    admission: &mut Admission,
) -> Option<TokenResult> {
    match response {
        Ok(result) => match result.status {
            TokenStatus::Ok => {
                if result.token_id != 0 {
                    admission.cluster_tokens.push(result.token_id);
                }
                Some(TokenResult::Pass)
            }
            TokenStatus::ShouldWait => Some(TokenResult::Wait(result.wait_ms)),
            TokenStatus::Blocked => Some(TokenResult::Blocked),
            status => {
                debug!(resource, flow_id, ?status, "token server gave no verdict");
                None
            }
        },
        Err(error) => {
            warn!(resource, flow_id, %error, "cluster token request failed");
            None
        }
    }
}

/// Waits out a queued admission. Returns `false` for a rejection.
async fn settle(result: TokenResult, admission: &mut Admission) -> bool {
    match result {
        TokenResult::Pass => true,
        TokenResult::Blocked => false,
        TokenResult::Wait(ms) => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            true
        }
        TokenResult::Occupied(ms) => {
            admission.occupied = true;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            true
        }
    }
}
