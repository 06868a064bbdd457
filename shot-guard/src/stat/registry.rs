use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tracing::warn;

use super::EntryType;
use super::ResourceNode;
use crate::Ticker;

type SubNodes = DashMap<(String, String), Arc<ResourceNode>>;

/// Nodes for every resource seen by one engine.
///
/// Besides the per-resource node, it keeps per-origin nodes (for rules that
/// name a caller) and per-context nodes (for chain rules). Each of the three
/// maps holds at most `max_resources` nodes. Nodes live as long as the
/// registry.
#[derive(Debug)]
pub struct NodeRegistry {
    resources: DashMap<String, Arc<ResourceNode>>,
    origins: SubNodes,
    contexts: SubNodes,
    sample_count: u32,
    interval_ms: u32,
    max_resources: usize,
    overflow_logged: AtomicBool,
    origins_overflow_logged: AtomicBool,
    contexts_overflow_logged: AtomicBool,
    ticker: Ticker,
}

impl NodeRegistry {
    pub fn new(sample_count: u32, interval_ms: u32, max_resources: usize, ticker: Ticker) -> Self {
        Self {
            resources: DashMap::new(),
            origins: DashMap::new(),
            contexts: DashMap::new(),
            sample_count,
            interval_ms,
            max_resources,
            overflow_logged: AtomicBool::new(false),
            origins_overflow_logged: AtomicBool::new(false),
            contexts_overflow_logged: AtomicBool::new(false),
            ticker,
        }
    }

    fn new_node(&self, name: &str, entry_type: EntryType) -> Arc<ResourceNode> {
        Arc::new(ResourceNode::new(
            name,
            entry_type,
            self.sample_count,
            self.interval_ms,
            self.ticker.clone(),
        ))
    }

    /// The node for `resource`, created on first use.
    ///
    /// Returns `None` once `max_resources` distinct resources exist; such
    /// calls go unchecked.
    pub fn resource_node(&self, resource: &str, entry_type: EntryType) -> Option<Arc<ResourceNode>> {
        if let Some(node) = self.resources.get(resource) {
            return Some(Arc::clone(node.value()));
        }
        if self.resources.len() >= self.max_resources {
            if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                warn!(
                    max_resources = self.max_resources,
                    resource, "resource limit reached; new resources are not guarded"
                );
            }
            return None;
        }
        let node = self
            .resources
            .entry(resource.to_string())
            .or_insert_with(|| self.new_node(resource, entry_type));
        Some(Arc::clone(node.value()))
    }

    /// Looks up an existing resource node without creating it.
    pub fn get(&self, resource: &str) -> Option<Arc<ResourceNode>> {
        self.resources.get(resource).map(|n| Arc::clone(n.value()))
    }

    /// The node of `origin` calling `resource`, or `None` once
    /// `max_resources` origin nodes exist.
    pub fn origin_node(
        &self,
        resource: &str,
        origin: &str,
        entry_type: EntryType,
    ) -> Option<Arc<ResourceNode>> {
        self.sub_node(
            &self.origins,
            &self.origins_overflow_logged,
            "origin",
            (resource, origin),
            entry_type,
        )
    }

    /// The node of `resource` entered within `context`, or `None` once
    /// `max_resources` context nodes exist.
    pub fn context_node(
        &self,
        resource: &str,
        context: &str,
        entry_type: EntryType,
    ) -> Option<Arc<ResourceNode>> {
        self.sub_node(
            &self.contexts,
            &self.contexts_overflow_logged,
            "context",
            (resource, context),
            entry_type,
        )
    }

    fn sub_node(
        &self,
        nodes: &SubNodes,
        overflow_logged: &AtomicBool,
        kind: &'static str,
        (resource, name): (&str, &str),
        entry_type: EntryType,
    ) -> Option<Arc<ResourceNode>> {
        let key = (resource.to_string(), name.to_string());
        if let Some(node) = nodes.get(&key) {
            return Some(Arc::clone(node.value()));
        }
        if nodes.len() >= self.max_resources {
            if !overflow_logged.swap(true, Ordering::Relaxed) {
                warn!(
                    max_resources = self.max_resources,
                    resource,
                    kind,
                    name,
                    "node limit reached; new callers are not tracked"
                );
            }
            return None;
        }
        let node = nodes
            .entry(key)
            .or_insert_with(|| self.new_node(resource, entry_type));
        Some(Arc::clone(node.value()))
    }

    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Names of every registered resource with its node.
    pub fn resources(&self) -> Vec<(String, Arc<ResourceNode>)> {
        self.resources
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_shares_one_node_per_resource() {
        let registry = NodeRegistry::new(2, 1_000, 10, Ticker::new());
        let a = registry.resource_node("orders", EntryType::In).unwrap();
        let b = registry.resource_node("orders", EntryType::In).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let o1 = registry.origin_node("orders", "app-a", EntryType::In).unwrap();
        let o2 = registry.origin_node("orders", "app-b", EntryType::In).unwrap();
        assert!(!Arc::ptr_eq(&o1, &o2));
        assert!(Arc::ptr_eq(
            &o1,
            &registry.origin_node("orders", "app-a", EntryType::In).unwrap()
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn it_stops_creating_nodes_past_the_limit() {
        let registry = NodeRegistry::new(2, 1_000, 2, Ticker::new());
        assert!(registry.resource_node("a", EntryType::Out).is_some());
        assert!(registry.resource_node("b", EntryType::Out).is_some());
        assert!(registry.resource_node("c", EntryType::Out).is_none());
        // Existing resources keep working.
        assert!(registry.resource_node("a", EntryType::Out).is_some());
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn it_bounds_origin_and_context_nodes() {
        let registry = NodeRegistry::new(2, 1_000, 2, Ticker::new());
        registry.resource_node("orders", EntryType::In).unwrap();
        for i in 0..10_000 {
            let caller = format!("caller-{i}");
            let _ = registry.origin_node("orders", &caller, EntryType::In);
            let _ = registry.context_node("orders", &caller, EntryType::In);
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.origin_count(), 2);
        assert_eq!(registry.context_count(), 2);

        // Callers seen before the limit keep their nodes.
        assert!(registry.origin_node("orders", "caller-1", EntryType::In).is_some());
        assert!(registry.origin_node("orders", "caller-2", EntryType::In).is_none());
        assert!(registry.context_node("orders", "caller-0", EntryType::In).is_some());
    }
}
