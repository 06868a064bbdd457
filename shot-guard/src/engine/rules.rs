use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::EngineConfig;
use crate::GuardError;
use crate::breaker::CircuitBreaker;
use crate::flow::FlowChecker;
use crate::param::ParamChecker;
use crate::rule::AuthorityRule;
use crate::rule::FlowStrategy;
use crate::rule::LIMIT_APP_DEFAULT;
use crate::rule::LIMIT_APP_OTHER;
use crate::rule::Rule;

/// A batch of rule changes.
///
/// With `resources: None` the rules replace the whole rule set. Otherwise only
/// the named resources are replaced; a named resource without rules in the
/// batch loses its rules. Events carrying a `sequence` at or below the last
/// applied one are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleChangeEvent {
    pub resources: Option<HashSet<String>>,
    pub rules: Vec<Rule>,
    pub sequence: Option<u64>,
}

impl RuleChangeEvent {
    pub fn replace_all(rules: Vec<Rule>) -> Self {
        Self {
            resources: None,
            rules,
            sequence: None,
        }
    }

    pub fn replace<I, S>(resources: I, rules: Vec<Rule>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resources: Some(resources.into_iter().map(Into::into).collect()),
            rules,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Everything that guards one resource, in check order.
#[derive(Debug, Default)]
pub(crate) struct ResourceRules {
    pub(crate) authority: Vec<Arc<AuthorityRule>>,
    pub(crate) params: Vec<Arc<ParamChecker>>,
    pub(crate) flows: Vec<Arc<FlowChecker>>,
    pub(crate) breakers: Vec<Arc<CircuitBreaker>>,
    /// Origins named by flow rules; callers outside it match `other`.
    pub(crate) named_origins: HashSet<String>,
    /// Some flow rule limits callers by origin.
    pub(crate) tracks_origins: bool,
    /// Some flow rule limits a call chain.
    pub(crate) tracks_contexts: bool,
}

/// Picks the checker to carry over for `wanted`, skipping those already taken.
fn reuse<T, R>(
    previous: Option<&[Arc<T>]>,
    taken: &[Arc<T>],
    rule_of: impl Fn(&T) -> &R,
    wanted: &R,
) -> Option<Arc<T>>
where
    R: PartialEq,
{
    previous?
        .iter()
        .find(|old| rule_of(&**old) == wanted && !taken.iter().any(|t| Arc::ptr_eq(t, old)))
        .cloned()
}

impl ResourceRules {
    /// Builds fresh checkers for `rules`.
    ///
    /// With `keep_state_on_reload`, checkers of unchanged rules are taken
    /// from `previous` instead, so warm-up, queueing and breaker state carry
    /// over.
    fn build(rules: Vec<Rule>, previous: Option<&ResourceRules>, config: &EngineConfig) -> Self {
        let previous = previous.filter(|_| config.keep_state_on_reload);
        let mut out = Self::default();
        for rule in rules {
            match rule {
                Rule::Authority(rule) => out.authority.push(Arc::new(rule)),
                Rule::ParamFlow(rule) => {
                    let checker = reuse(
                        previous.map(|p| p.params.as_slice()),
                        &out.params,
                        |c| c.rule().as_ref(),
                        &rule,
                    )
                    .unwrap_or_else(|| {
                        Arc::new(ParamChecker::new(Arc::new(rule), config.max_param_values))
                    });
                    out.params.push(checker);
                }
                Rule::Flow(rule) => {
                    if rule.limit_app != LIMIT_APP_DEFAULT {
                        out.tracks_origins = true;
                        if rule.limit_app != LIMIT_APP_OTHER {
                            out.named_origins.insert(rule.limit_app.clone());
                        }
                    }
                    if rule.strategy == FlowStrategy::Chain {
                        out.tracks_contexts = true;
                    }
                    let checker = reuse(
                        previous.map(|p| p.flows.as_slice()),
                        &out.flows,
                        |c| c.rule().as_ref(),
                        &rule,
                    )
                    .unwrap_or_else(|| Arc::new(FlowChecker::new(Arc::new(rule), config)));
                    out.flows.push(checker);
                }
                Rule::Degrade(rule) => {
                    let breaker = reuse(
                        previous.map(|p| p.breakers.as_slice()),
                        &out.breakers,
                        |b| b.rule().as_ref(),
                        &rule,
                    )
                    .unwrap_or_else(|| {
                        Arc::new(CircuitBreaker::new(
                            Arc::new(rule),
                            config.breaker_recovery,
                            config.rt_max_exceed_n,
                        ))
                    });
                    out.breakers.push(breaker);
                }
            }
        }
        out
    }

    fn rules(&self) -> impl Iterator<Item = Rule> + '_ {
        let authority = self
            .authority
            .iter()
            .map(|r| Rule::Authority(r.as_ref().clone()));
        let params = self
            .params
            .iter()
            .map(|c| Rule::ParamFlow(c.rule().as_ref().clone()));
        let flows = self
            .flows
            .iter()
            .map(|c| Rule::Flow(c.rule().as_ref().clone()));
        let breakers = self
            .breakers
            .iter()
            .map(|b| Rule::Degrade(b.rule().as_ref().clone()));
        authority.chain(params).chain(flows).chain(breakers)
    }
}

/// Immutable snapshot of all active rules, keyed by resource.
#[derive(Debug, Default)]
pub(crate) struct RuleSet {
    resources: HashMap<String, Arc<ResourceRules>>,
}

impl RuleSet {
    pub(crate) fn get(&self, resource: &str) -> Option<&Arc<ResourceRules>> {
        self.resources.get(resource)
    }

    pub(crate) fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn rules(&self) -> Vec<Rule> {
        let mut names: Vec<&String> = self.resources.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.resources.get(name))
            .flat_map(|rules| rules.rules())
            .collect()
    }

    /// The rule set that results from applying `event` to this one.
    ///
    /// Fails without side effects if any rule of the event is invalid.
    pub(crate) fn apply(
        &self,
        event: &RuleChangeEvent,
        config: &EngineConfig,
    ) -> Result<RuleSet, GuardError> {
        let mut grouped: HashMap<String, Vec<Rule>> = HashMap::new();
        for rule in &event.rules {
            rule.validate()?;
            if let Some(scope) = &event.resources {
                if !scope.contains(rule.resource()) {
                    return Err(GuardError::invalid(format!(
                        "rule for `{}` is outside the resources of the update",
                        rule.resource()
                    )));
                }
            }
            grouped
                .entry(rule.resource().to_string())
                .or_default()
                .push(rule.clone());
        }

        let mut resources: HashMap<String, Arc<ResourceRules>> = match &event.resources {
            None => HashMap::new(),
            Some(scope) => self
                .resources
                .iter()
                .filter(|(name, _)| !scope.contains(name.as_str()))
                .map(|(name, rules)| (name.clone(), Arc::clone(rules)))
                .collect(),
        };
        for (resource, rules) in grouped {
            let previous = self.resources.get(&resource).map(Arc::as_ref);
            let built = ResourceRules::build(rules, previous, config);
            resources.insert(resource, Arc::new(built));
        }
        Ok(RuleSet { resources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::DegradeRule;
    use crate::rule::FlowRule;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn it_replaces_only_the_named_resources() {
        let set = RuleSet::default()
            .apply(
                &RuleChangeEvent::replace_all(vec![
                    FlowRule::qps("a", 1.0).into(),
                    FlowRule::qps("b", 1.0).into(),
                ]),
                &config(),
            )
            .unwrap();
        let untouched = Arc::clone(set.get("b").unwrap());

        let next = set
            .apply(
                &RuleChangeEvent::replace(["a", "c"], vec![FlowRule::qps("a", 2.0).into()]),
                &config(),
            )
            .unwrap();
        assert_eq!(next.resource_count(), 2);
        assert_eq!(next.get("a").unwrap().flows[0].rule().threshold, 2.0);
        assert!(Arc::ptr_eq(next.get("b").unwrap(), &untouched));
        assert!(next.get("c").is_none());
    }

    fn reload_twice(config: &EngineConfig) -> (RuleSet, RuleSet) {
        let breaker_rule: Rule = DegradeRule::rt("a", 10.0, 5).into();
        let set = RuleSet::default()
            .apply(
                &RuleChangeEvent::replace_all(vec![
                    breaker_rule.clone(),
                    FlowRule::qps("a", 1.0).into(),
                ]),
                config,
            )
            .unwrap();
        let next = set
            .apply(
                &RuleChangeEvent::replace_all(vec![breaker_rule, FlowRule::qps("a", 3.0).into()]),
                config,
            )
            .unwrap();
        (set, next)
    }

    #[test]
    fn it_rebuilds_every_checker_on_reload() {
        let (set, next) = reload_twice(&config());
        let before = set.get("a").unwrap();
        let after = next.get("a").unwrap();
        assert!(!Arc::ptr_eq(&before.breakers[0], &after.breakers[0]));
        assert!(!Arc::ptr_eq(&before.flows[0], &after.flows[0]));
    }

    #[test]
    fn it_keeps_state_of_unchanged_rules_when_asked() {
        let (set, next) = reload_twice(&config().with_keep_state_on_reload(true));
        let before = set.get("a").unwrap();
        let after = next.get("a").unwrap();
        assert!(Arc::ptr_eq(&before.breakers[0], &after.breakers[0]));
        assert!(!Arc::ptr_eq(&before.flows[0], &after.flows[0]));
    }

    #[test]
    fn it_rejects_the_whole_batch_on_one_bad_rule() {
        let set = RuleSet::default();
        let err = set
            .apply(
                &RuleChangeEvent::replace_all(vec![
                    FlowRule::qps("a", 1.0).into(),
                    FlowRule::qps("b", -1.0).into(),
                ]),
                &config(),
            )
            .unwrap_err();
        assert!(matches!(err, GuardError::ConfigInvalid(_)));

        let err = set
            .apply(
                &RuleChangeEvent::replace(["a"], vec![FlowRule::qps("b", 1.0).into()]),
                &config(),
            )
            .unwrap_err();
        assert!(matches!(err, GuardError::ConfigInvalid(_)));
    }

    #[test]
    fn it_collects_named_origins() {
        let set = RuleSet::default()
            .apply(
                &RuleChangeEvent::replace_all(vec![
                    FlowRule::qps("a", 1.0).with_limit_app("app-a").into(),
                    FlowRule::qps("a", 1.0).with_limit_app(LIMIT_APP_OTHER).into(),
                ]),
                &config(),
            )
            .unwrap();
        let rules = set.get("a").unwrap();
        assert!(rules.named_origins.contains("app-a"));
        assert_eq!(rules.named_origins.len(), 1);
        assert!(rules.tracks_origins);
        assert!(!rules.tracks_contexts);
        assert_eq!(set.rules().len(), 2);
    }

    #[test]
    fn it_tracks_callers_only_when_a_rule_needs_them() {
        let set = RuleSet::default()
            .apply(
                &RuleChangeEvent::replace_all(vec![
                    FlowRule::qps("plain", 1.0).into(),
                    AuthorityRule::black_list("plain", &["bot"]).into(),
                    FlowRule::qps("chained", 1.0).chain_from("checkout").into(),
                ]),
                &config(),
            )
            .unwrap();
        let plain = set.get("plain").unwrap();
        assert!(!plain.tracks_origins);
        assert!(!plain.tracks_contexts);
        let chained = set.get("chained").unwrap();
        assert!(!chained.tracks_origins);
        assert!(chained.tracks_contexts);
    }
}
