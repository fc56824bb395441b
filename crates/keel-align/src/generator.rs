//! Bounded response generation.

use std::collections::HashMap;

use tracing::{info, warn};

use keel_catalog::types::{Agent, Template, TemplateMode};
use keel_core::config::ResolvedConfig;
use keel_core::FieldValue;
use keel_llm::template::{TemplateContext, TextTemplate};
use keel_llm::{ChatMessage, LlmExecutor};

use crate::snapshot::HistoryTurn;
use crate::types::*;

pub struct ResponseGenerator {
    executor: LlmExecutor,
}

impl ResponseGenerator {
    pub fn new(executor: LlmExecutor) -> Self {
        Self { executor }
    }

    /// Generate the turn's response. STRICT templates bypass the model; LLM
    /// failure retries once and then falls back to the best FALLBACK template
    /// with a SYSTEM_ERROR category.
    #[allow(clippy::too_many_arguments)]
    pub async fn generate(
        &self,
        agent: &Agent,
        plan: &ResponsePlan,
        message: &str,
        history: &[HistoryTurn],
        tool_results: &HashMap<String, ToolResult>,
        variables: &HashMap<String, FieldValue>,
        fallback_templates: &[Template],
        config: &ResolvedConfig,
    ) -> GenerationOutput {
        if let Some(template) = &plan.forced_template {
            info!(template_id = %template.id, "strict template bypasses generation");
            return GenerationOutput {
                text: render_template(template, variables),
                model: None,
                tokens_in: 0,
                tokens_out: 0,
                categories: Vec::new(),
                from_template: Some(template.id),
            };
        }

        let system = self.build_system_prompt(agent, plan, tool_results);
        let messages = build_messages(history, message);

        // One retry on top of the executor's own transient-retry policy.
        for attempt in 0..2 {
            match self
                .executor
                .generate_with(
                    &system,
                    messages.clone(),
                    config.temperature,
                    config.max_response_tokens,
                )
                .await
            {
                Ok(response) => {
                    let (text, categories) = parse_envelope(&response.content);
                    let mut text = text;
                    text.truncate_to_chars(config.max_response_length);
                    return GenerationOutput {
                        text,
                        model: Some(response.model),
                        tokens_in: response.tokens_in,
                        tokens_out: response.tokens_out,
                        categories,
                        from_template: None,
                    };
                }
                Err(e) => {
                    warn!(attempt, error = %e, "generation failed");
                }
            }
        }

        // Exhausted: render the best fallback template.
        let fallback = fallback_templates
            .iter()
            .filter(|t| t.mode == TemplateMode::Fallback)
            .max_by_key(|t| t.priority);
        let (text, from_template) = match fallback {
            Some(t) => (render_template(t, variables), Some(t.id)),
            None => (
                "I'm sorry, something went wrong on my side. Could you try again?".to_string(),
                None,
            ),
        };
        GenerationOutput {
            text,
            model: None,
            tokens_in: 0,
            tokens_out: 0,
            categories: vec![ResponseCategory::SystemError],
            from_template,
        }
    }

    /// Regenerate once with the violated policy spelled out verbatim.
    #[allow(clippy::too_many_arguments)]
    pub async fn regenerate_with_constraint(
        &self,
        agent: &Agent,
        plan: &ResponsePlan,
        message: &str,
        history: &[HistoryTurn],
        tool_results: &HashMap<String, ToolResult>,
        violated_action_text: &str,
        config: &ResolvedConfig,
    ) -> Option<GenerationOutput> {
        let mut system = self.build_system_prompt(agent, plan, tool_results);
        system.push_str("\n\nYour previous draft violated this policy. It is non-negotiable:\n");
        system.push_str(violated_action_text);
        system.push_str("\nProduce a response that satisfies it.");

        match self
            .executor
            .generate_with(
                &system,
                build_messages(history, message),
                config.temperature,
                config.max_response_tokens,
            )
            .await
        {
            Ok(response) => {
                let (text, categories) = parse_envelope(&response.content);
                Some(GenerationOutput {
                    text,
                    model: Some(response.model),
                    tokens_in: response.tokens_in,
                    tokens_out: response.tokens_out,
                    categories,
                    from_template: None,
                })
            }
            Err(e) => {
                warn!(error = %e, "constrained regeneration failed");
                None
            }
        }
    }

    /// Deterministic prompt assembly: agent prompt, applied rule actions,
    /// contribution instructions, tool outputs.
    fn build_system_prompt(
        &self,
        agent: &Agent,
        plan: &ResponsePlan,
        tool_results: &HashMap<String, ToolResult>,
    ) -> String {
        let mut out = agent.system_prompt.clone();

        if !plan.constraints.is_empty() {
            out.push_str("\n\n## Policies that must hold\n");
            for c in &plan.constraints {
                out.push_str(&format!("- {}\n", c.action_text));
            }
        }

        if !plan.contributions.is_empty() {
            out.push_str("\n## Current flow\n");
            for c in &plan.contributions {
                out.push_str(&format!("- [{}] step: {}", c.scenario_name, c.current_step_name));
                if let Some(instructions) = &c.step_instructions {
                    out.push_str(&format!(" — {}", instructions));
                }
                out.push('\n');
            }
        }

        if !plan.collect_fields.is_empty() {
            out.push_str(&format!(
                "\n## Ask the user for\n{}\n",
                plan.collect_fields.join(", ")
            ));
        }

        if let Some(question) = &plan.reroute_question {
            out.push_str(&format!("\n## Clarify first\n{}\n", question));
        }

        if !plan.suggested_templates.is_empty() {
            out.push_str("\n## Suggested phrasing\n");
            for t in &plan.suggested_templates {
                out.push_str(&format!("- {}\n", t.text));
            }
        }

        let successful: Vec<&ToolResult> =
            tool_results.values().filter(|r| r.succeeded()).collect();
        if !successful.is_empty() {
            out.push_str("\n## Tool results\n");
            for r in successful {
                out.push_str(&format!(
                    "- {}: {}\n",
                    r.tool_id,
                    r.output.as_ref().map(|o| o.to_string()).unwrap_or_default()
                ));
            }
        }

        out
    }
}

/// Window of prior turns plus the current user message.
fn build_messages(history: &[HistoryTurn], message: &str) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = history
        .iter()
        .map(|t| {
            if t.role == "assistant" {
                ChatMessage::assistant(&t.content)
            } else {
                ChatMessage::user(&t.content)
            }
        })
        .collect();
    messages.push(ChatMessage::user(message));
    messages
}

/// Render a template with `{{placeholder}}` substitution from turn variables.
fn render_template(template: &Template, variables: &HashMap<String, FieldValue>) -> String {
    match TextTemplate::parse(&template.text) {
        Ok(compiled) => {
            let mut ctx = TemplateContext::new();
            for (name, value) in variables {
                ctx = ctx.set(name.clone(), value.to_string());
            }
            compiled.render(&ctx)
        }
        Err(e) => {
            warn!(template_id = %template.id, error = %e, "template failed to parse, using raw text");
            template.text.clone()
        }
    }
}

/// Generator output is plain text, but a structured envelope with a
/// `categories` list is honoured when present.
fn parse_envelope(content: &str) -> (String, Vec<ResponseCategory>) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(content.trim()) {
        if let (Some(text), Some(categories)) = (
            value.get("text").and_then(|t| t.as_str()),
            value.get("categories").and_then(|c| c.as_array()),
        ) {
            let parsed: Vec<ResponseCategory> = categories
                .iter()
                .filter_map(|c| c.as_str())
                .filter_map(|c| match c {
                    "POLICY_RESTRICTION" => Some(ResponseCategory::PolicyRestriction),
                    "SYSTEM_ERROR" => Some(ResponseCategory::SystemError),
                    "AWAITING_USER_INPUT" => Some(ResponseCategory::AwaitingUserInput),
                    _ => None,
                })
                .collect();
            return (text.to_string(), parsed);
        }
    }
    (content.to_string(), Vec::new())
}

trait TruncateChars {
    fn truncate_to_chars(&mut self, max: usize);
}

impl TruncateChars for String {
    fn truncate_to_chars(&mut self, max: usize) {
        if self.chars().count() > max {
            *self = self.chars().take(max).collect();
        }
    }
}
