use crate::rule::AuthorityRule;
use crate::rule::AuthorityStrategy;

/// Whether a caller with `origin` may call the resource.
///
/// Calls without an origin are never rejected by authority rules.
pub(crate) fn passes(rule: &AuthorityRule, origin: &str) -> bool {
    if origin.is_empty() {
        return true;
    }
    let listed = rule.lists(origin);
    match rule.strategy {
        AuthorityStrategy::White => listed,
        AuthorityStrategy::Black => !listed,
    }
}
