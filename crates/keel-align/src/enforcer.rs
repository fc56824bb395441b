//! Hard-constraint enforcement over the generated response.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{Agent, TemplateMode};
use keel_core::config::ResolvedConfig;
use keel_core::{FieldValue, TenantId};
use keel_llm::json::extract_json;
use keel_llm::template::TemplateContext;
use keel_llm::{ChatMessage, LlmExecutor};

use crate::expr::{evaluate, EvalContext};
use crate::generator::ResponseGenerator;
use crate::prompts::enforcement_template;
use crate::snapshot::HistoryTurn;
use crate::types::*;

#[derive(Debug)]
pub struct EnforcementOutcome {
    pub generation: GenerationOutput,
    pub blocked: bool,
    pub blocking_rule_id: Option<Uuid>,
    pub regenerated: bool,
}

pub struct ConstraintEnforcer {
    config_store: Arc<dyn AgentConfigStore>,
    /// Classifier used when a constraint has no enforcement expression.
    executor: LlmExecutor,
}

impl ConstraintEnforcer {
    pub fn new(config_store: Arc<dyn AgentConfigStore>, executor: LlmExecutor) -> Self {
        Self {
            config_store,
            executor,
        }
    }

    /// Validate the generated response against every hard constraint. On
    /// violation: regenerate once with the policy verbatim, then fall back to
    /// the rule's FALLBACK template, then escalate with POLICY_RESTRICTION.
    #[allow(clippy::too_many_arguments)]
    pub async fn enforce(
        &self,
        tenant_id: TenantId,
        agent: &Agent,
        plan: &ResponsePlan,
        generation: GenerationOutput,
        generator: &ResponseGenerator,
        message: &str,
        history: &[HistoryTurn],
        tool_results: &HashMap<String, ToolResult>,
        variables: &HashMap<String, FieldValue>,
        config: &ResolvedConfig,
    ) -> EnforcementOutcome {
        if plan.constraints.is_empty() {
            return EnforcementOutcome {
                generation,
                blocked: false,
                blocking_rule_id: None,
                regenerated: false,
            };
        }

        let violated = self
            .first_violation(plan, &generation.text, tool_results, variables)
            .await;
        let violated = match violated {
            Some(v) => v,
            None => {
                return EnforcementOutcome {
                    generation,
                    blocked: false,
                    blocking_rule_id: None,
                    regenerated: false,
                }
            }
        };

        info!(rule_id = %violated.rule_id, "hard constraint violated, regenerating");
        // Stage 1: one constrained regeneration.
        if let Some(regenerated) = generator
            .regenerate_with_constraint(
                agent,
                plan,
                message,
                history,
                tool_results,
                &violated.action_text,
                config,
            )
            .await
        {
            let still_violated = self
                .first_violation(plan, &regenerated.text, tool_results, variables)
                .await;
            if still_violated.is_none() {
                return EnforcementOutcome {
                    generation: regenerated,
                    blocked: false,
                    blocking_rule_id: None,
                    regenerated: true,
                };
            }
        }

        // Stage 2: the rule's highest-priority FALLBACK template.
        if let Some(text) = self.fallback_text(tenant_id, &violated, variables).await {
            return EnforcementOutcome {
                generation: GenerationOutput {
                    text,
                    model: None,
                    tokens_in: 0,
                    tokens_out: 0,
                    categories: vec![ResponseCategory::PolicyRestriction],
                    from_template: None,
                },
                blocked: true,
                blocking_rule_id: Some(violated.rule_id),
                regenerated: true,
            };
        }

        // Stage 3: escalate.
        EnforcementOutcome {
            generation: GenerationOutput {
                text: "I need to hand this over to a human colleague.".to_string(),
                model: None,
                tokens_in: 0,
                tokens_out: 0,
                categories: vec![ResponseCategory::PolicyRestriction],
                from_template: None,
            },
            blocked: true,
            blocking_rule_id: Some(violated.rule_id),
            regenerated: true,
        }
    }

    /// First violated constraint, or `None` when the response satisfies all.
    async fn first_violation(
        &self,
        plan: &ResponsePlan,
        response: &str,
        tool_results: &HashMap<String, ToolResult>,
        variables: &HashMap<String, FieldValue>,
    ) -> Option<RuleConstraint> {
        for constraint in &plan.constraints {
            // A failed tool bound to THIS rule means the evidence to satisfy
            // it is missing: treat as violated. Failures of tools the rule
            // never bound do not count against it.
            let tool_failed = constraint.bound_tool_ids.iter().any(|tool_id| {
                tool_results
                    .get(tool_id)
                    .map_or(false, |r| !r.succeeded())
            });
            let violated = match &constraint.enforcement_expression {
                Some(expression) => {
                    let mut ctx = EvalContext::new().with_response(response);
                    for (name, value) in variables {
                        ctx = ctx.set_field(name, value);
                    }
                    match evaluate(expression, &ctx) {
                        // The expression states what must HOLD.
                        Ok(holds) => !holds,
                        Err(e) => {
                            warn!(rule_id = %constraint.rule_id, error = %e,
                                  "enforcement expression failed to evaluate");
                            tool_failed
                        }
                    }
                }
                None => self.llm_violation_check(constraint, response).await,
            };
            if violated {
                return Some(constraint.clone());
            }
        }
        None
    }

    async fn llm_violation_check(&self, constraint: &RuleConstraint, response: &str) -> bool {
        let ctx = TemplateContext::new()
            .set("action_text", &constraint.action_text)
            .set("response", response);
        let prompt = enforcement_template().render(&ctx);
        let result = self
            .executor
            .generate_with(
                "You verify policy compliance.",
                vec![ChatMessage::user(prompt)],
                0.0,
                self.executor.config().max_tokens,
            )
            .await;
        match result.map(|r| extract_json(&r.content)) {
            Ok(Ok(v)) => v.get("violates").and_then(|b| b.as_bool()).unwrap_or(false),
            _ => {
                // Classifier unavailable: do not block on uncertainty.
                warn!(rule_id = %constraint.rule_id, "enforcement classifier unavailable");
                false
            }
        }
    }

    async fn fallback_text(
        &self,
        tenant_id: TenantId,
        constraint: &RuleConstraint,
        variables: &HashMap<String, FieldValue>,
    ) -> Option<String> {
        let mut best = None;
        for template_id in &constraint.fallback_template_ids {
            if let Ok(Some(template)) = self.config_store.get_template(tenant_id, *template_id).await
            {
                if template.mode != TemplateMode::Fallback {
                    continue;
                }
                let replace = best
                    .as_ref()
                    .map_or(true, |t: &keel_catalog::types::Template| {
                        template.priority > t.priority
                    });
                if replace {
                    best = Some(template);
                }
            }
        }
        best.map(|t| {
            match keel_llm::template::TextTemplate::parse(&t.text) {
                Ok(compiled) => {
                    let mut ctx = TemplateContext::new();
                    for (name, value) in variables {
                        ctx = ctx.set(name.clone(), value.to_string());
                    }
                    compiled.render(&ctx)
                }
                Err(_) => t.text.clone(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_catalog::inmemory::InMemoryAgentConfigStore;
    use keel_catalog::types::{Rule, Template};
    use keel_core::config::StepLlmConfig;
    use keel_core::AgentId;
    use keel_llm::mock::MockLlmProvider;

    fn executor(provider: Arc<MockLlmProvider>) -> LlmExecutor {
        LlmExecutor::new(
            provider,
            StepLlmConfig {
                retries: 0,
                ..StepLlmConfig::default()
            },
            "enforcement",
        )
    }

    fn plan_with_constraint(constraint: RuleConstraint) -> ResponsePlan {
        ResponsePlan {
            response_type: ResponseType::Answer,
            constraints: vec![constraint],
            contributions: Vec::new(),
            suggested_templates: Vec::new(),
            forced_template: None,
            tools_to_execute: Vec::new(),
            variables_to_resolve: Vec::new(),
            collect_fields: Vec::new(),
            reroute_question: None,
        }
    }

    fn generation(text: &str) -> GenerationOutput {
        GenerationOutput {
            text: text.to_string(),
            model: Some("test".into()),
            tokens_in: 1,
            tokens_out: 1,
            categories: Vec::new(),
            from_template: None,
        }
    }

    fn agent() -> Agent {
        Agent::new(TenantId::new(), "a", "primary", "sys")
    }

    #[tokio::test]
    async fn satisfied_expression_passes_through() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let enforcer = ConstraintEnforcer::new(
            store,
            executor(Arc::new(MockLlmProvider::new("unused"))),
        );
        let generator =
            ResponseGenerator::new(executor(Arc::new(MockLlmProvider::new("regen"))));

        let constraint = RuleConstraint {
            rule_id: Uuid::now_v7(),
            action_text: "never mention discounts".into(),
            enforcement_expression: Some(
                "not (response contains \"discount\")".into(),
            ),
            fallback_template_ids: Vec::new(),
            bound_tool_ids: Vec::new(),
        };
        let outcome = enforcer
            .enforce(
                TenantId::new(),
                &agent(),
                &plan_with_constraint(constraint),
                generation("Your order has shipped."),
                &generator,
                "user message",
                &[],
                &HashMap::new(),
                &HashMap::new(),
                &ResolvedConfig::default(),
            )
            .await;
        assert!(!outcome.blocked);
        assert!(!outcome.regenerated);
        assert_eq!(outcome.generation.text, "Your order has shipped.");
    }

    #[tokio::test]
    async fn persistent_violation_falls_back_to_template_and_blocks() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let tenant = TenantId::new();
        let agent_id = AgentId::new();
        let template = Template::new(
            tenant,
            agent_id,
            "polite_fallback",
            "I'm here to help, could you rephrase?",
            TemplateMode::Fallback,
        );
        let template_id = template.id;
        store.save_template(template).await.unwrap();

        let rule = Rule::new(tenant, agent_id, "no profanity", "always", "never swear");
        let constraint = RuleConstraint {
            rule_id: rule.id,
            action_text: rule.action_text.clone(),
            enforcement_expression: Some("not (response contains \"damn\")".into()),
            fallback_template_ids: vec![template_id],
            bound_tool_ids: Vec::new(),
        };

        // Regeneration also emits the banned word.
        let regen_provider = Arc::new(MockLlmProvider::new("well damn, again"));
        let generator = ResponseGenerator::new(executor(regen_provider));
        let enforcer = ConstraintEnforcer::new(
            store,
            executor(Arc::new(MockLlmProvider::new("unused"))),
        );

        let outcome = enforcer
            .enforce(
                tenant,
                &agent(),
                &plan_with_constraint(constraint),
                generation("damn, that's broken"),
                &generator,
                "user message",
                &[],
                &HashMap::new(),
                &HashMap::new(),
                &ResolvedConfig::default(),
            )
            .await;

        assert!(outcome.blocked);
        assert_eq!(outcome.blocking_rule_id, Some(rule.id));
        assert_eq!(outcome.generation.text, "I'm here to help, could you rephrase?");
        assert_eq!(
            outcome.generation.categories,
            vec![ResponseCategory::PolicyRestriction]
        );
    }

    #[tokio::test]
    async fn successful_regeneration_unblocks() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let regen_provider = Arc::new(MockLlmProvider::new("A perfectly clean answer."));
        let generator = ResponseGenerator::new(executor(regen_provider));
        let enforcer = ConstraintEnforcer::new(
            store,
            executor(Arc::new(MockLlmProvider::new("unused"))),
        );

        let constraint = RuleConstraint {
            rule_id: Uuid::now_v7(),
            action_text: "never swear".into(),
            enforcement_expression: Some("not (response contains \"damn\")".into()),
            fallback_template_ids: Vec::new(),
            bound_tool_ids: Vec::new(),
        };
        let outcome = enforcer
            .enforce(
                TenantId::new(),
                &agent(),
                &plan_with_constraint(constraint),
                generation("damn it"),
                &generator,
                "user message",
                &[],
                &HashMap::new(),
                &HashMap::new(),
                &ResolvedConfig::default(),
            )
            .await;
        assert!(!outcome.blocked);
        assert!(outcome.regenerated);
        assert_eq!(outcome.generation.text, "A perfectly clean answer.");
    }

    #[tokio::test]
    async fn unevaluable_expression_falls_back_to_the_rules_own_tools() {
        fn result(tool_id: &str, failed: bool) -> ToolResult {
            ToolResult {
                tool_id: tool_id.to_string(),
                output: (!failed).then(|| serde_json::json!({})),
                error: failed.then(|| "boom".to_string()),
                duration_ms: 1,
            }
        }
        let mut tool_results = HashMap::new();
        tool_results.insert("limit_lookup".to_string(), result("limit_lookup", true));
        tool_results.insert("unrelated".to_string(), result("unrelated", true));

        // An unrelated tool failure never counts against this rule.
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let enforcer = ConstraintEnforcer::new(
            store.clone(),
            executor(Arc::new(MockLlmProvider::new("unused"))),
        );
        let generator =
            ResponseGenerator::new(executor(Arc::new(MockLlmProvider::new("regen"))));
        let unbound = RuleConstraint {
            rule_id: Uuid::now_v7(),
            action_text: "cap at limit".into(),
            enforcement_expression: Some("amount ?? limit".into()),
            fallback_template_ids: Vec::new(),
            bound_tool_ids: Vec::new(),
        };
        let outcome = enforcer
            .enforce(
                TenantId::new(),
                &agent(),
                &plan_with_constraint(unbound),
                generation("Here you go."),
                &generator,
                "user message",
                &[],
                &tool_results,
                &HashMap::new(),
                &ResolvedConfig::default(),
            )
            .await;
        assert!(!outcome.blocked);
        assert_eq!(outcome.generation.text, "Here you go.");

        // The same failure on a tool the rule binds blocks the turn.
        let bound = RuleConstraint {
            rule_id: Uuid::now_v7(),
            action_text: "cap at limit".into(),
            enforcement_expression: Some("amount ?? limit".into()),
            fallback_template_ids: Vec::new(),
            bound_tool_ids: vec!["limit_lookup".to_string()],
        };
        let rule_id = bound.rule_id;
        let outcome = enforcer
            .enforce(
                TenantId::new(),
                &agent(),
                &plan_with_constraint(bound),
                generation("Here you go."),
                &generator,
                "user message",
                &[],
                &tool_results,
                &HashMap::new(),
                &ResolvedConfig::default(),
            )
            .await;
        assert!(outcome.blocked);
        assert_eq!(outcome.blocking_rule_id, Some(rule_id));
    }

    #[tokio::test]
    async fn llm_classifier_detects_violations_without_expression() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let classifier = Arc::new(MockLlmProvider::new(
            r#"{"violates": false, "reasoning": "clean"}"#,
        ));
        classifier.push_response(r#"{"violates": true, "reasoning": "mentions a refund"}"#);
        // Second check (after regeneration) returns the default "clean".
        let enforcer = ConstraintEnforcer::new(store, executor(classifier));
        let generator =
            ResponseGenerator::new(executor(Arc::new(MockLlmProvider::new("No refunds here."))));

        let constraint = RuleConstraint {
            rule_id: Uuid::now_v7(),
            action_text: "never promise refunds".into(),
            enforcement_expression: None,
            fallback_template_ids: Vec::new(),
            bound_tool_ids: Vec::new(),
        };
        let outcome = enforcer
            .enforce(
                TenantId::new(),
                &agent(),
                &plan_with_constraint(constraint),
                generation("You'll get a refund tomorrow!"),
                &generator,
                "user message",
                &[],
                &HashMap::new(),
                &HashMap::new(),
                &ResolvedConfig::default(),
            )
            .await;
        assert!(!outcome.blocked);
        assert!(outcome.regenerated);
        assert_eq!(outcome.generation.text, "No refunds here.");
    }
}
