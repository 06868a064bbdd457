use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use super::rules::ResourceRules;
use crate::BlockError;
use crate::Ticker;
use crate::cluster::TokenService;
use crate::rule::ParamValue;
use crate::rule::Rule;
use crate::stat::EntryType;
use crate::stat::ResourceNode;

/// A call asking to enter a resource.
///
/// ```rust
/// use shot_guard::EntryRequest;
///
/// let request = EntryRequest::new("orders")
///     .with_origin("web")
///     .with_arg("user-42");
/// assert_eq!(request.acquire_count, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRequest {
    pub resource: String,
    pub entry_type: EntryType,
    pub acquire_count: u32,
    /// Caller identity, matched by `limit_app` and authority rules.
    pub origin: String,
    /// Invocation chain the call belongs to, matched by chain rules.
    pub context: String,
    /// Call arguments, inspected by hot-parameter rules.
    pub args: Vec<ParamValue>,
    /// May borrow capacity from the next window instead of being rejected.
    pub prioritized: bool,
}

impl EntryRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            entry_type: EntryType::default(),
            acquire_count: 1,
            origin: String::new(),
            context: String::new(),
            args: Vec::new(),
            prioritized: false,
        }
    }

    pub fn with_entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = entry_type;
        self
    }

    pub fn with_acquire_count(mut self, acquire_count: u32) -> Self {
        self.acquire_count = acquire_count;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_arg(mut self, arg: impl Into<ParamValue>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args(mut self, args: Vec<ParamValue>) -> Self {
        self.args = args;
        self
    }

    pub fn prioritized(mut self) -> Self {
        self.prioritized = true;
        self
    }
}

/// The engine's answer to an [`EntryRequest`].
#[derive(Debug)]
pub enum Decision {
    Allowed(Entry),
    Blocked(BlockError),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// The rule that rejected the call, if any.
    pub fn blocking_rule(&self) -> Option<Rule> {
        match self {
            Self::Allowed(_) => None,
            Self::Blocked(err) => Some(err.rule()),
        }
    }

    pub fn into_result(self) -> Result<Entry, BlockError> {
        match self {
            Self::Allowed(entry) => Ok(entry),
            Self::Blocked(err) => Err(err),
        }
    }
}

/// An admitted call.
///
/// Completing the call is reported by [`exit`](Entry::exit). Completion
/// records the response time and the outcome, releases concurrency and lets
/// circuit breakers re-evaluate.
///
/// An entry dropped without `exit` (a cancelled or timed out call) still
/// releases everything it holds, but is recorded as an exception and fails
/// any probe it carries.
#[derive(Debug)]
pub struct Entry {
    pub(super) ticker: Ticker,
    pub(super) max_rt_ms: u64,
    pub(super) start_ms: u64,
    pub(super) acquire: u64,
    pub(super) node: Option<Arc<ResourceNode>>,
    /// Origin and context nodes, which track concurrency alongside `node`.
    pub(super) extra_nodes: Vec<Arc<ResourceNode>>,
    pub(super) rules: Option<Arc<ResourceRules>>,
    pub(super) args: Vec<ParamValue>,
    /// Breakers that admitted this call as their probe.
    pub(super) probes: Vec<usize>,
    pub(super) cluster_tokens: ClusterTokens,
    pub(super) failed: bool,
    pub(super) exited: bool,
}

impl Entry {
    /// Marks the call as failed; it is counted as an exception on exit.
    pub fn set_error(&mut self) {
        self.failed = true;
    }

    /// Milliseconds since the call was admitted.
    pub fn elapsed_ms(&self) -> u64 {
        self.ticker.now_ms().saturating_sub(self.start_ms)
    }

    pub fn exit(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;

        let now = self.ticker.now_ms();
        let rt = now.saturating_sub(self.start_ms).min(self.max_rt_ms);

        if let Some(node) = &self.node {
            for node in std::iter::once(node).chain(self.extra_nodes.iter()) {
                if self.failed {
                    node.add_exception(self.acquire);
                } else {
                    node.add_success(self.acquire);
                    node.add_rt(rt);
                }
                node.decrease_concurrency();
            }

            if let Some(rules) = &self.rules {
                for (idx, breaker) in rules.breakers.iter().enumerate() {
                    let probe = self.probes.contains(&idx);
                    breaker.on_complete(node, now, rt, self.failed, probe);
                }
                for checker in &rules.params {
                    checker.exit(&self.args);
                }
            }
        }

        drop(std::mem::take(&mut self.cluster_tokens));
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if !self.exited {
            self.failed = true;
            self.complete();
        }
    }
}

/// Cluster concurrency tokens held by one call. Dropping it returns them to
/// the token server, also when the call is abandoned before admission ends.
#[derive(Debug, Default)]
pub(super) struct ClusterTokens {
    service: Option<Arc<dyn TokenService>>,
    ids: Vec<u64>,
}

impl ClusterTokens {
    pub(super) fn new(service: Option<Arc<dyn TokenService>>) -> Self {
        Self {
            service,
            ids: Vec::new(),
        }
    }

    pub(super) fn push(&mut self, token_id: u64) {
        self.ids.push(token_id);
    }
}

impl Drop for ClusterTokens {
    fn drop(&mut self) {
        release_cluster_tokens(self.service.take(), std::mem::take(&mut self.ids));
    }
}

/// Returns concurrency tokens to the token server in the background.
fn release_cluster_tokens(service: Option<Arc<dyn TokenService>>, tokens: Vec<u64>) {
    if tokens.is_empty() {
        return;
    }
    let Some(service) = service else {
        return;
    };
    let Ok(handle) = Handle::try_current() else {
        warn!(
            tokens = tokens.len(),
            "no runtime to release cluster tokens; the server will expire them"
        );
        return;
    };
    handle.spawn(async move {
        for token_id in tokens {
            if let Err(error) = service.release_concurrent_token(token_id).await {
                warn!(token_id, %error, "failed to release cluster token");
            }
        }
    });
}
