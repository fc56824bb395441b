//! Response planning: merge rules, contributions, and reconciliation into
//! one plan for generation.

use std::sync::Arc;

use tracing::debug;

use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{Template, TemplateMode, ToolTiming};
use keel_core::TenantId;
use keel_migrate::reconcile::{ReconciliationAction, ReconciliationResult};

use crate::error::Result;
use crate::snapshot::SituationSnapshot;
use crate::types::*;

pub struct ResponsePlanner {
    config_store: Arc<dyn AgentConfigStore>,
}

impl ResponsePlanner {
    pub fn new(config_store: Arc<dyn AgentConfigStore>) -> Self {
        Self { config_store }
    }

    pub async fn plan(
        &self,
        tenant_id: TenantId,
        snapshot: &SituationSnapshot,
        matched_rules: &[MatchedRule],
        scenario_result: &ScenarioResult,
        reconciliation: Option<&ReconciliationResult>,
        missing_fields: &[String],
    ) -> Result<ResponsePlan> {
        let contributions = scenario_result.plan.contributions.clone();

        // Hard-constraint rules become enforcement obligations.
        let mut constraints = Vec::new();
        for matched in matched_rules {
            if matched.rule.is_hard_constraint {
                constraints.push(RuleConstraint {
                    rule_id: matched.rule.id,
                    action_text: matched.rule.action_text.clone(),
                    enforcement_expression: matched.rule.enforcement_expression.clone(),
                    fallback_template_ids: matched.rule.attached_template_ids.clone(),
                    bound_tool_ids: matched
                        .rule
                        .tool_bindings
                        .iter()
                        .map(|b| b.tool_id.clone())
                        .collect(),
                });
            }
        }

        // Templates attached to applied rules, best mode first.
        let mut suggested_templates: Vec<Template> = Vec::new();
        let mut forced_template = None;
        for matched in matched_rules {
            for template_id in &matched.rule.attached_template_ids {
                if let Some(template) =
                    self.config_store.get_template(tenant_id, *template_id).await?
                {
                    match template.mode {
                        TemplateMode::Strict => {
                            let replace = forced_template
                                .as_ref()
                                .map_or(true, |t: &Template| template.priority > t.priority);
                            if replace {
                                forced_template = Some(template);
                            }
                        }
                        TemplateMode::Suggest => suggested_templates.push(template),
                        TemplateMode::Fallback => {}
                    }
                }
            }
        }
        suggested_templates.sort_by_key(|t| std::cmp::Reverse(t.priority));

        // BEFORE_STEP tool bindings from applied rules and contributions.
        let mut tools_to_execute = Vec::new();
        for matched in matched_rules {
            for binding in &matched.rule.tool_bindings {
                if binding.timing == ToolTiming::BeforeStep {
                    tools_to_execute.push(binding.clone());
                }
            }
        }
        for contribution in &contributions {
            for binding in &contribution.suggested_tools {
                if binding.timing == ToolTiming::BeforeStep {
                    tools_to_execute.push(binding.clone());
                }
            }
        }

        // Collect targets: reconciliation gaps first, then scenario-required
        // missing fields.
        let mut collect_fields: Vec<String> = Vec::new();
        if let Some(r) = reconciliation {
            collect_fields.extend(r.collect_fields.iter().cloned());
        }
        for field in missing_fields {
            if !collect_fields.contains(field) {
                collect_fields.push(field.clone());
            }
        }

        let response_type = decide_response_type(
            snapshot,
            &contributions,
            reconciliation,
            &collect_fields,
        );

        let reroute_question = reconciliation
            .filter(|r| r.action == ReconciliationAction::ReRoute)
            .and_then(|r| r.branch_question.clone());

        let variables_to_resolve = contributions
            .iter()
            .flat_map(|c| c.required_fields.iter().cloned())
            .collect();

        debug!(?response_type, constraints = constraints.len(), "plan assembled");
        Ok(ResponsePlan {
            response_type,
            constraints,
            contributions,
            suggested_templates,
            forced_template,
            tools_to_execute,
            variables_to_resolve,
            collect_fields,
            reroute_question,
        })
    }
}

/// Priority when the signals disagree:
/// ESCALATE > COLLECT > ACT > ASK > ANSWER (REROUTE sits with its marker).
fn decide_response_type(
    snapshot: &SituationSnapshot,
    contributions: &[ScenarioContribution],
    reconciliation: Option<&ReconciliationResult>,
    collect_fields: &[String],
) -> ResponseType {
    if let Some(r) = reconciliation {
        match r.action {
            ReconciliationAction::Escalate => return ResponseType::Escalate,
            ReconciliationAction::ReRoute => return ResponseType::Reroute,
            _ => {}
        }
    }
    if snapshot.urgency == crate::snapshot::Urgency::Critical {
        return ResponseType::Escalate;
    }
    if !collect_fields.is_empty() {
        return ResponseType::Collect;
    }
    if contributions
        .iter()
        .any(|c| c.contribution_type == ContributionType::Act)
    {
        return ResponseType::Act;
    }
    if contributions
        .iter()
        .any(|c| c.contribution_type == ContributionType::Prompt)
    {
        return ResponseType::Ask;
    }
    ResponseType::Answer
}
