//! Shared turn-processing types flowing between alignment phases.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use keel_catalog::types::{Rule, Template, ToolBinding};

/// A rule that survived filtering and applies to this turn.
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub rule: Rule,
    /// Retrieval score at selection time.
    pub match_score: f64,
    /// Classifier relevance in [0, 1]; matched rules sort by this.
    pub relevance_score: f64,
    pub reasoning: String,
}

#[derive(Debug, Default)]
pub struct RuleFilterResult {
    pub matched_rules: Vec<MatchedRule>,
    pub rejected_rule_ids: Vec<Uuid>,
    pub unsure_rule_ids: Vec<Uuid>,
    pub filter_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioLifecycleAction {
    Start,
    Continue,
    Pause,
    Complete,
    Cancel,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleDecision {
    pub scenario_id: Uuid,
    pub action: ScenarioLifecycleAction,
    pub reasoning: String,
    /// Score that justified a START; absent for existing instances.
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionDecision {
    pub scenario_id: Uuid,
    pub from_step_id: Uuid,
    pub to_step_id: Option<Uuid>,
    pub fired: bool,
    pub confidence: f64,
    pub reason: String,
    /// Set when the target step is flagged reachable_from_anywhere.
    pub relocalization: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionType {
    Inform,
    Prompt,
    Collect,
    Act,
}

/// A scenario's proposed influence on the turn.
#[derive(Debug, Clone)]
pub struct ScenarioContribution {
    pub scenario_id: Uuid,
    pub scenario_name: String,
    pub current_step_id: Uuid,
    pub current_step_name: String,
    pub contribution_type: ContributionType,
    pub step_instructions: Option<String>,
    pub required_fields: Vec<String>,
    pub suggested_tools: Vec<ToolBinding>,
    /// Priority used for ACT conflict resolution.
    pub priority: i32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ScenarioContributionPlan {
    pub contributions: Vec<ScenarioContribution>,
}

/// Combined output of the scenario orchestration phase.
#[derive(Debug, Default)]
pub struct ScenarioResult {
    pub lifecycle: Vec<LifecycleDecision>,
    pub transitions: Vec<TransitionDecision>,
    pub plan: ScenarioContributionPlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    Ask,
    Answer,
    Act,
    Escalate,
    Collect,
    Reroute,
}

/// Hard-constraint obligations carried into enforcement.
#[derive(Debug, Clone)]
pub struct RuleConstraint {
    pub rule_id: Uuid,
    pub action_text: String,
    pub enforcement_expression: Option<String>,
    pub fallback_template_ids: Vec<Uuid>,
    /// Tools the rule binds; a failure among these (and only these) counts
    /// against the constraint when the expression cannot be evaluated.
    pub bound_tool_ids: Vec<String>,
}

/// What the planner decided the turn's response should be.
#[derive(Debug)]
pub struct ResponsePlan {
    pub response_type: ResponseType,
    pub constraints: Vec<RuleConstraint>,
    pub contributions: Vec<ScenarioContribution>,
    pub suggested_templates: Vec<Template>,
    /// STRICT-mode template that replaces generation entirely.
    pub forced_template: Option<Template>,
    pub tools_to_execute: Vec<ToolBinding>,
    pub variables_to_resolve: Vec<String>,
    pub collect_fields: Vec<String>,
    /// Question put to the user when response_type is REROUTE.
    pub reroute_question: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_id: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCategory {
    PolicyRestriction,
    SystemError,
    AwaitingUserInput,
}

/// Generated (or template-rendered) response plus bookkeeping.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub model: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub categories: Vec<ResponseCategory>,
    pub from_template: Option<Uuid>,
}
