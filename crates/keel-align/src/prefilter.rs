//! Deterministic scope/lifecycle pre-filter.
//!
//! Re-applies the retrieval business filters (selection may have been coarser
//! than the per-scope retrieval) and adds the scope-membership check against
//! the currently active scenario/step sets.

use std::collections::HashSet;

use tracing::{debug, info};
use uuid::Uuid;

use keel_catalog::types::Scope;
use keel_retrieval::retriever::{RuleFireState, ScoredRule};

#[derive(Default)]
pub struct ScopePreFilter;

#[derive(Debug, Default)]
struct FilterStats {
    disabled: usize,
    scope_mismatch: usize,
    cooldown_or_fires: usize,
    passed: usize,
}

impl ScopePreFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn filter(
        &self,
        candidates: Vec<ScoredRule>,
        active_scenario_ids: &HashSet<Uuid>,
        active_step_ids: &HashSet<Uuid>,
        fire_state: &RuleFireState,
    ) -> Vec<ScoredRule> {
        if candidates.is_empty() {
            return candidates;
        }

        let total = candidates.len();
        let mut stats = FilterStats::default();
        let mut passed = Vec::with_capacity(total);

        for candidate in candidates {
            let rule = &candidate.rule;

            if !rule.enabled {
                stats.disabled += 1;
                debug!(rule_id = %rule.id, rule_name = %rule.name, "rule filtered: disabled");
                continue;
            }

            let scope_ok = match rule.scope {
                Scope::Global => true,
                Scope::Scenario => rule
                    .scope_id
                    .map_or(false, |sid| active_scenario_ids.contains(&sid)),
                Scope::Step => rule
                    .scope_id
                    .map_or(false, |sid| active_step_ids.contains(&sid)),
            };
            if !scope_ok {
                stats.scope_mismatch += 1;
                debug!(
                    rule_id = %rule.id,
                    rule_name = %rule.name,
                    scope = %rule.scope,
                    "rule filtered: scope not active"
                );
                continue;
            }

            if !fire_state.passes(rule) {
                stats.cooldown_or_fires += 1;
                debug!(
                    rule_id = %rule.id,
                    rule_name = %rule.name,
                    "rule filtered: cooldown or max fires"
                );
                continue;
            }

            stats.passed += 1;
            passed.push(candidate);
        }

        info!(
            total_candidates = total,
            disabled = stats.disabled,
            scope_mismatch = stats.scope_mismatch,
            cooldown_or_fires = stats.cooldown_or_fires,
            passed = stats.passed,
            "scope prefilter completed"
        );
        passed
    }
}
