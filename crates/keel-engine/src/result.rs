//! Turn results and outcome resolution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_align::types::{ResponseCategory, ResponseType};
use keel_core::{SessionId, TurnId};
use keel_migrate::reconcile::ReconciliationResult;

/// Per-phase timing entry; one per pipeline step, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineTiming {
    pub step: &'static str,
    pub duration_ms: f64,
    pub skipped: bool,
    pub error: Option<String>,
}

/// How the turn resolved from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnResolution {
    Answered,
    Partial,
    Redirected,
    Blocked,
    Error,
}

/// Compact view of an applied rule carried in the result.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedRule {
    pub rule_id: Uuid,
    pub name: String,
    pub relevance_score: f64,
    pub is_hard_constraint: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub model: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub from_template: Option<Uuid>,
}

/// Everything a caller gets back from one processed turn.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentResult {
    pub response: String,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub outcome: TurnResolution,
    pub matched_rules: Vec<AppliedRule>,
    pub blocking_rule_id: Option<Uuid>,
    pub reconciliation: Option<serde_json::Value>,
    pub tool_results: serde_json::Value,
    pub generation: GenerationSummary,
    pub total_time_ms: f64,
    pub pipeline_timings: Vec<PipelineTiming>,
    pub sensor_degraded: bool,
}

/// Outcome resolution, first match wins:
/// POLICY_RESTRICTION → BLOCKED, SYSTEM_ERROR → ERROR, ESCALATE → REDIRECTED,
/// awaiting-user-input shapes → PARTIAL, otherwise ANSWERED.
pub fn resolve_outcome(
    blocked: bool,
    categories: &[ResponseCategory],
    response_type: ResponseType,
    reconciliation: Option<&ReconciliationResult>,
) -> TurnResolution {
    if blocked || categories.contains(&ResponseCategory::PolicyRestriction) {
        return TurnResolution::Blocked;
    }
    if categories.contains(&ResponseCategory::SystemError) {
        return TurnResolution::Error;
    }
    if response_type == ResponseType::Escalate {
        return TurnResolution::Redirected;
    }
    let awaiting = categories.contains(&ResponseCategory::AwaitingUserInput)
        || matches!(
            response_type,
            ResponseType::Collect | ResponseType::Reroute | ResponseType::Ask
        )
        || reconciliation.map_or(false, |r| !r.collect_fields.is_empty());
    if awaiting {
        return TurnResolution::Partial;
    }
    TurnResolution::Answered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_order_first_match_wins() {
        assert_eq!(
            resolve_outcome(true, &[], ResponseType::Answer, None),
            TurnResolution::Blocked
        );
        assert_eq!(
            resolve_outcome(false, &[ResponseCategory::SystemError], ResponseType::Answer, None),
            TurnResolution::Error
        );
        assert_eq!(
            resolve_outcome(false, &[], ResponseType::Escalate, None),
            TurnResolution::Redirected
        );
        assert_eq!(
            resolve_outcome(false, &[], ResponseType::Collect, None),
            TurnResolution::Partial
        );
        assert_eq!(
            resolve_outcome(false, &[], ResponseType::Answer, None),
            TurnResolution::Answered
        );
        // Blocked outranks a simultaneous system error.
        assert_eq!(
            resolve_outcome(true, &[ResponseCategory::SystemError], ResponseType::Answer, None),
            TurnResolution::Blocked
        );
    }
}
