use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use quanta::Clock;
use shot_guard::ClusterFlowConfig;
use shot_guard::ClusterThresholdType;
use shot_guard::ClusterTokenResult;
use shot_guard::FlowGrade;
use shot_guard::FlowRule;
use shot_guard::GuardError;
use shot_guard::ParamFlowRule;
use shot_guard::ParamValue;
use shot_guard::Ticker;
use shot_guard::TokenService;
use shot_guard::TokenStatus;
use shot_guard::stat::EntryType;
use shot_guard::stat::LeapArray;
use shot_guard::stat::MetricBucket;
use shot_guard::stat::MetricEvent;
use shot_guard::stat::ResourceNode;
use tracing::debug;
use tracing::info;

use super::ServerConfig;
use super::concurrency::ConcurrencyManager;
use crate::ClusterError;

#[derive(Debug)]
struct ClusterFlow {
    rule: Arc<FlowRule>,
    node: Arc<ResourceNode>,
}

#[derive(Debug)]
struct ClusterParam {
    rule: Arc<ParamFlowRule>,
    values: DashMap<ParamValue, Arc<LeapArray<MetricBucket>>>,
}

/// Grants cluster tokens against rules shared by every client.
///
/// Serves a [`TokenServer`](super::TokenServer), or runs embedded: it is a
/// [`TokenService`] in its own right and can be installed on an engine in
/// the same process.
#[derive(Debug)]
pub struct DefaultTokenService {
    config: ServerConfig,
    ticker: Ticker,
    flows: ArcSwap<HashMap<i64, Arc<ClusterFlow>>>,
    params: ArcSwap<HashMap<i64, Arc<ClusterParam>>>,
    /// Server-wide request rate.
    requests: ResourceNode,
    connected: AtomicUsize,
    concurrency: ConcurrencyManager,
}

impl DefaultTokenService {
    /// Must be called from within a Tokio runtime, which drives lease expiry.
    pub fn new(config: ServerConfig) -> Result<Self, ClusterError> {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: ServerConfig, clock: Clock) -> Result<Self, ClusterError> {
        config.validate()?;
        let ticker = Ticker::with_clock(clock);
        let requests = ResourceNode::new(
            "token-server",
            EntryType::In,
            config.sample_count,
            config.interval_ms,
            ticker.clone(),
        );
        Ok(Self {
            concurrency: ConcurrencyManager::new()?,
            config,
            ticker,
            flows: ArcSwap::from_pointee(HashMap::new()),
            params: ArcSwap::from_pointee(HashMap::new()),
            requests,
            connected: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Replaces the flow rules. Every rule needs a cluster config; flows that
    /// keep their id keep their statistics.
    pub fn load_flow_rules(&self, rules: Vec<FlowRule>) -> Result<(), GuardError> {
        let previous = self.flows.load();
        let mut flows = HashMap::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let flow_id = rule.cluster_flow_id().ok_or_else(|| {
                GuardError::ConfigInvalid(format!(
                    "flow rule for `{}` has no cluster flow id",
                    rule.resource
                ))
            })?;
            let node = match previous.get(&flow_id) {
                Some(flow) => Arc::clone(&flow.node),
                None => Arc::new(self.new_node(&rule.resource)),
            };
            let flow = Arc::new(ClusterFlow {
                rule: Arc::new(rule),
                node,
            });
            if flows.insert(flow_id, flow).is_some() {
                return Err(GuardError::ConfigInvalid(format!(
                    "duplicate cluster flow id {flow_id}"
                )));
            }
        }
        info!(flows = flows.len(), "cluster flow rules loaded");
        self.flows.store(Arc::new(flows));
        Ok(())
    }

    pub fn load_param_rules(&self, rules: Vec<ParamFlowRule>) -> Result<(), GuardError> {
        let mut params = HashMap::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let flow_id = rule.cluster_flow_id().ok_or_else(|| {
                GuardError::ConfigInvalid(format!(
                    "param rule for `{}` has no cluster flow id",
                    rule.resource
                ))
            })?;
            let param = Arc::new(ClusterParam {
                rule: Arc::new(rule),
                values: DashMap::new(),
            });
            if params.insert(flow_id, param).is_some() {
                return Err(GuardError::ConfigInvalid(format!(
                    "duplicate cluster flow id {flow_id}"
                )));
            }
        }
        info!(params = params.len(), "cluster param rules loaded");
        self.params.store(Arc::new(params));
        Ok(())
    }

    pub fn connected_clients(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    pub(crate) fn client_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn client_disconnected(&self) {
        let _ = self
            .connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Concurrency tokens currently held for `flow_id`.
    pub fn in_flight(&self, flow_id: i64) -> u64 {
        self.concurrency.in_flight(flow_id)
    }

    fn new_node(&self, name: &str) -> ResourceNode {
        ResourceNode::new(
            name,
            EntryType::In,
            self.config.sample_count,
            self.config.interval_ms,
            self.ticker.clone(),
        )
    }

    /// Scales a per-client threshold to the whole cluster.
    fn global_threshold(&self, threshold: f64, cluster: Option<&ClusterFlowConfig>) -> f64 {
        let clients = match cluster.map(|c| c.threshold_type).unwrap_or_default() {
            ClusterThresholdType::AvgLocal => self.connected_clients().max(1) as f64,
            ClusterThresholdType::Global => 1.0,
        };
        threshold * clients * self.config.exceed_count
    }

    fn admit_request(&self) -> bool {
        if self.requests.pass_qps() + 1.0 > self.config.max_allowed_qps {
            self.requests.add_block(1);
            return false;
        }
        self.requests.add_pass(1);
        true
    }

    pub fn acquire_flow(&self, flow_id: i64, acquire: u32, prioritized: bool) -> ClusterTokenResult {
        if acquire == 0 {
            return ClusterTokenResult::new(TokenStatus::BadRequest);
        }
        if !self.admit_request() {
            return ClusterTokenResult::new(TokenStatus::TooManyRequest);
        }
        let flows = self.flows.load();
        let Some(flow) = flows.get(&flow_id) else {
            debug!(flow_id, "no cluster rule for flow");
            return ClusterTokenResult::new(TokenStatus::NoRuleExists);
        };
        self.check_flow(flow, u64::from(acquire), prioritized)
    }

    fn check_flow(&self, flow: &ClusterFlow, acquire: u64, prioritized: bool) -> ClusterTokenResult {
        let node = &flow.node;
        let threshold = self.global_threshold(flow.rule.threshold, flow.rule.cluster_config.as_ref());
        let left = threshold - node.pass_qps() - acquire as f64;
        if left >= 0.0 {
            node.add_pass(acquire);
            return ClusterTokenResult::new(TokenStatus::Ok).with_remaining(left as i32);
        }

        if prioritized && node.waiting() as f64 <= self.config.max_occupy_ratio * threshold {
            let now = self.ticker.now_ms();
            let timeout = self.config.occupy_timeout_ms;
            let wait = node.try_occupy_next(now, acquire, threshold, timeout);
            if wait < timeout {
                node.add_waiting(now + wait, acquire);
                node.add_occupied_pass(acquire);
                return ClusterTokenResult::new(TokenStatus::ShouldWait).with_wait_ms(wait);
            }
        }

        node.add_block(acquire);
        ClusterTokenResult::new(TokenStatus::Blocked)
    }

    /// Checks one token against each flow. Counts as a single request
    /// against the server-wide limit.
    pub fn acquire_batch(&self, flow_ids: &[i64], acquire: u32) -> Vec<(i64, ClusterTokenResult)> {
        if acquire == 0 {
            let bad = ClusterTokenResult::new(TokenStatus::BadRequest);
            return flow_ids.iter().map(|id| (*id, bad)).collect();
        }
        if !self.admit_request() {
            let busy = ClusterTokenResult::new(TokenStatus::TooManyRequest);
            return flow_ids.iter().map(|id| (*id, busy)).collect();
        }
        let flows = self.flows.load();
        flow_ids
            .iter()
            .map(|flow_id| {
                let result = match flows.get(flow_id) {
                    Some(flow) => self.check_flow(flow, u64::from(acquire), false),
                    None => ClusterTokenResult::new(TokenStatus::NoRuleExists),
                };
                (*flow_id, result)
            })
            .collect()
    }

    /// Passes only if every value is under its threshold; then counts the
    /// call against all of them.
    pub fn acquire_param(&self, flow_id: i64, acquire: u32, values: &[ParamValue]) -> ClusterTokenResult {
        if acquire == 0 || values.is_empty() {
            return ClusterTokenResult::new(TokenStatus::BadRequest);
        }
        if !self.admit_request() {
            return ClusterTokenResult::new(TokenStatus::TooManyRequest);
        }
        let params = self.params.load();
        let Some(param) = params.get(&flow_id) else {
            debug!(flow_id, "no cluster param rule for flow");
            return ClusterTokenResult::new(TokenStatus::NoRuleExists);
        };

        let now = self.ticker.now_ms();
        let acquire = u64::from(acquire);
        let rule = &param.rule;
        // The rule counts per `duration_sec`; the windows span `interval_ms`.
        let scale = (f64::from(self.config.interval_ms) / 1000.0) / rule.duration_sec.max(1) as f64;

        let mut counters = Vec::with_capacity(values.len());
        let mut left = f64::MAX;
        for value in values {
            let counter = self.param_counter(param, value);
            let threshold =
                self.global_threshold(rule.threshold_for(value), rule.cluster_config.as_ref()) * scale;
            let passed: u64 = counter
                .values(now)
                .map(|w| w.bucket().get(MetricEvent::Pass))
                .sum();
            let value_left = threshold - passed as f64 - acquire as f64;
            if value_left < 0.0 {
                return ClusterTokenResult::new(TokenStatus::Blocked);
            }
            left = left.min(value_left);
            counters.push(counter);
        }
        for counter in counters {
            if let Some(window) = counter.current_window(now) {
                window.bucket().add(MetricEvent::Pass, acquire);
            }
        }
        ClusterTokenResult::new(TokenStatus::Ok).with_remaining(left as i32)
    }

    fn param_counter(&self, param: &ClusterParam, value: &ParamValue) -> Arc<LeapArray<MetricBucket>> {
        if let Some(counter) = param.values.get(value) {
            return Arc::clone(counter.value());
        }
        if param.values.len() >= self.config.max_param_values {
            let victim = param.values.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                debug!(value = %victim, "evicting hot parameter counter");
                param.values.remove(&victim);
            }
        }
        let counter = param
            .values
            .entry(value.clone())
            .or_insert_with(|| {
                Arc::new(LeapArray::new(self.config.sample_count, self.config.interval_ms))
            });
        Arc::clone(counter.value())
    }

    pub fn acquire_concurrent(&self, flow_id: i64, acquire: u32) -> ClusterTokenResult {
        if acquire == 0 {
            return ClusterTokenResult::new(TokenStatus::BadRequest);
        }
        if !self.admit_request() {
            return ClusterTokenResult::new(TokenStatus::TooManyRequest);
        }
        let flows = self.flows.load();
        let Some(flow) = flows.get(&flow_id) else {
            return ClusterTokenResult::new(TokenStatus::NoRuleExists);
        };
        if flow.rule.grade != FlowGrade::Thread {
            debug!(flow_id, "concurrency token asked for a QPS flow");
            return ClusterTokenResult::new(TokenStatus::BadRequest);
        }
        let cluster = flow.rule.cluster_config.as_ref();
        let threshold = self.global_threshold(flow.rule.threshold, cluster);
        let lease = Duration::from_millis(cluster.map(|c| c.resource_timeout_ms).unwrap_or(2_000));
        self.concurrency
            .acquire(flow_id, u64::from(acquire), threshold, lease)
    }

    pub fn release_concurrent(&self, token_id: u64) -> ClusterTokenResult {
        self.concurrency.release(token_id)
    }
}

impl TokenService for DefaultTokenService {
    fn request_token(
        &self,
        flow_id: i64,
        acquire: u32,
        prioritized: bool,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        futures::future::ready(Ok(self.acquire_flow(flow_id, acquire, prioritized))).boxed()
    }

    fn request_param_token(
        &self,
        flow_id: i64,
        acquire: u32,
        params: Vec<ParamValue>,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        futures::future::ready(Ok(self.acquire_param(flow_id, acquire, &params))).boxed()
    }

    fn acquire_concurrent_token(
        &self,
        flow_id: i64,
        acquire: u32,
        _prioritized: bool,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        futures::future::ready(Ok(self.acquire_concurrent(flow_id, acquire))).boxed()
    }

    fn release_concurrent_token(
        &self,
        token_id: u64,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        futures::future::ready(Ok(self.release_concurrent(token_id))).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (DefaultTokenService, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let service = DefaultTokenService::with_clock(ServerConfig::default(), clock).unwrap();
        (service, mock)
    }

    fn cluster(flow_id: i64) -> ClusterFlowConfig {
        ClusterFlowConfig::new(flow_id)
    }

    #[tokio::test]
    async fn test_global_flow_limit() {
        let (service, mock) = service();
        service
            .load_flow_rules(vec![FlowRule::qps("orders", 3.0).with_cluster(cluster(1))])
            .unwrap();

        let first = service.acquire_flow(1, 1, false);
        assert_eq!(first.status, TokenStatus::Ok);
        assert_eq!(first.remaining, 2);
        assert_eq!(service.acquire_flow(1, 2, false).status, TokenStatus::Ok);
        assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::Blocked);
        assert_eq!(service.acquire_flow(2, 1, false).status, TokenStatus::NoRuleExists);
        assert_eq!(service.acquire_flow(1, 0, false).status, TokenStatus::BadRequest);

        mock.increment(Duration::from_secs(1));
        assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::Ok);
    }

    #[tokio::test]
    async fn test_average_threshold_scales_with_clients() {
        let (service, _mock) = service();
        let config = cluster(1).with_threshold_type(ClusterThresholdType::AvgLocal);
        service
            .load_flow_rules(vec![FlowRule::qps("orders", 2.0).with_cluster(config)])
            .unwrap();
        service.client_connected();
        service.client_connected();

        for _ in 0..4 {
            assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::Ok);
        }
        assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::Blocked);
    }

    #[tokio::test]
    async fn test_prioritized_requests_wait_for_the_next_window() {
        let (service, mock) = service();
        service
            .load_flow_rules(vec![FlowRule::qps("orders", 2.0).with_cluster(cluster(1))])
            .unwrap();
        service.acquire_flow(1, 2, false);
        mock.increment(Duration::from_millis(950));

        let result = service.acquire_flow(1, 1, true);
        assert_eq!(result.status, TokenStatus::ShouldWait);
        assert_eq!(result.wait_ms, 50);
        assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::Blocked);
    }

    #[tokio::test]
    async fn test_server_wide_request_limit() {
        let (clock, _mock) = Clock::mock();
        let config = ServerConfig::default().with_max_allowed_qps(2.0);
        let service = DefaultTokenService::with_clock(config, clock).unwrap();

        assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::NoRuleExists);
        assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::NoRuleExists);
        assert_eq!(service.acquire_flow(1, 1, false).status, TokenStatus::TooManyRequest);
    }

    #[tokio::test]
    async fn test_batch_checks_each_flow() {
        let (service, _mock) = service();
        service
            .load_flow_rules(vec![
                FlowRule::qps("a", 1.0).with_cluster(cluster(1)),
                FlowRule::qps("b", 5.0).with_cluster(cluster(2)),
            ])
            .unwrap();
        service.acquire_flow(1, 1, false);

        let results = service.acquire_batch(&[1, 2, 3], 1);
        let statuses: Vec<_> = results.iter().map(|(id, r)| (*id, r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (1, TokenStatus::Blocked),
                (2, TokenStatus::Ok),
                (3, TokenStatus::NoRuleExists),
            ]
        );
    }

    #[tokio::test]
    async fn test_param_limits_are_per_value() {
        let (service, _mock) = service();
        service
            .load_param_rules(vec![
                ParamFlowRule::new("orders", 0, 2.0).with_cluster(cluster(5)),
            ])
            .unwrap();

        let alice = [ParamValue::from("alice")];
        assert_eq!(service.acquire_param(5, 1, &alice).status, TokenStatus::Ok);
        assert_eq!(service.acquire_param(5, 1, &alice).status, TokenStatus::Ok);
        assert_eq!(service.acquire_param(5, 1, &alice).status, TokenStatus::Blocked);

        let bob = [ParamValue::from("bob")];
        assert_eq!(service.acquire_param(5, 1, &bob).status, TokenStatus::Ok);
        // Alice is over her limit, so the pair is rejected and Bob is not charged.
        let both = [ParamValue::from("bob"), ParamValue::from("alice")];
        assert_eq!(service.acquire_param(5, 1, &both).status, TokenStatus::Blocked);
        assert_eq!(service.acquire_param(5, 1, &bob).status, TokenStatus::Ok);
        assert_eq!(service.acquire_param(5, 1, &bob).status, TokenStatus::Blocked);
    }

    #[tokio::test]
    async fn test_concurrency_tokens_need_a_thread_rule() {
        let (service, _mock) = service();
        service
            .load_flow_rules(vec![
                FlowRule::qps("qps", 5.0).with_cluster(cluster(1)),
                FlowRule::concurrency("db", 1.0).with_cluster(cluster(2)),
            ])
            .unwrap();

        assert_eq!(service.acquire_concurrent(1, 1).status, TokenStatus::BadRequest);
        let token = service.acquire_concurrent(2, 1);
        assert_eq!(token.status, TokenStatus::Ok);
        assert_eq!(service.acquire_concurrent(2, 1).status, TokenStatus::Blocked);
        assert_eq!(service.in_flight(2), 1);
        assert_eq!(
            service.release_concurrent(token.token_id).status,
            TokenStatus::ReleaseOk
        );
        assert_eq!(service.in_flight(2), 0);
    }

    #[tokio::test]
    async fn test_rejects_rules_without_flow_ids() {
        let (service, _mock) = service();
        let err = service
            .load_flow_rules(vec![FlowRule::qps("orders", 1.0)])
            .unwrap_err();
        assert!(matches!(err, GuardError::ConfigInvalid(_)));

        let err = service
            .load_flow_rules(vec![
                FlowRule::qps("a", 1.0).with_cluster(cluster(1)),
                FlowRule::qps("b", 1.0).with_cluster(cluster(1)),
            ])
            .unwrap_err();
        assert!(matches!(err, GuardError::ConfigInvalid(_)));
    }
}
