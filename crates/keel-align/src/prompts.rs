//! Prompt templates for the LLM-backed phases.
//!
//! Plain `{{ident}}` / `{{#each}}` templates, precompiled once at startup.
//! Anything dynamic is passed through the context; the templates themselves
//! never change at runtime.

use std::sync::OnceLock;

use keel_llm::template::TextTemplate;

pub const SENSOR_TEMPLATE: &str = "\
You are the situation sensor of a conversational agent. Analyse the latest \
user message in context and answer with a single JSON object.

Previous canonical intent: {{previous_intent}}

Conversation window:
{{#each history}}{{this}}
{{/each}}
Customer data schema (field name, type, whether a value exists — values are \
never shown):
{{#each schema_mask}}{{this}}
{{/each}}
Domain glossary:
{{#each glossary}}{{this}}
{{/each}}
User message: {{message}}

Respond with JSON only:
{
  \"language\": \"two-letter ISO 639-1 code\",
  \"previous_intent_label\": \"...\" or null,
  \"intent_changed\": true/false,
  \"new_intent_label\": \"...\" or null,
  \"new_intent_text\": \"...\" or null,
  \"topic\": \"...\" or null,
  \"topic_changed\": true/false,
  \"tone\": \"...\",
  \"sentiment\": \"positive\"|\"neutral\"|\"negative\",
  \"frustration_level\": \"low\"|\"medium\"|\"high\" or null,
  \"urgency\": \"low\"|\"normal\"|\"high\"|\"critical\",
  \"scenario_signal\": \"CONTINUE\"|\"PAUSE\"|\"CANCEL\"|\"UNKNOWN\",
  \"situation_facts\": [\"...\"],
  \"candidate_variables\": {\"field_name\": {\"value\": ..., \"scope\": \"...\", \"is_update\": true/false}}
}";

pub const FILTER_TEMPLATE: &str = "\
You decide which behavioural rules apply to the current user message.

Situation:
- message: {{message}}
- topic: {{topic}}
- sentiment: {{sentiment}}
- urgency: {{urgency}}

Candidate rules:
{{#each rules}}{{this}}
{{/each}}
For each rule, classify applicability as APPLIES, NOT_RELATED, or UNSURE. \
Respond with JSON only:
{\"evaluations\": [{\"rule_id\": \"...\", \"applicability\": \"APPLIES\", \
\"confidence\": 0.0, \"relevance\": 0.0, \"reasoning\": \"...\"}]}";

pub const TRANSITION_TEMPLATE: &str = "\
Decide whether the conversation should move to the next step.

Current step: {{current_step}}
Transition condition: {{condition}}
Known customer fields (existence only):
{{#each fields}}{{this}}
{{/each}}
User message: {{message}}

Respond with JSON only: {\"fires\": true/false, \"confidence\": 0.0, \"reasoning\": \"...\"}";

pub const ENFORCEMENT_TEMPLATE: &str = "\
You verify that a drafted response satisfies a policy.

Policy: {{action_text}}
Drafted response: {{response}}

Does the response violate the policy? Respond with JSON only: \
{\"violates\": true/false, \"reasoning\": \"...\"}";

fn compiled(source: &'static str, slot: &'static OnceLock<TextTemplate>) -> &'static TextTemplate {
    slot.get_or_init(|| TextTemplate::parse(source).expect("builtin template parses"))
}

pub fn sensor_template() -> &'static TextTemplate {
    static SLOT: OnceLock<TextTemplate> = OnceLock::new();
    compiled(SENSOR_TEMPLATE, &SLOT)
}

pub fn filter_template() -> &'static TextTemplate {
    static SLOT: OnceLock<TextTemplate> = OnceLock::new();
    compiled(FILTER_TEMPLATE, &SLOT)
}

pub fn transition_template() -> &'static TextTemplate {
    static SLOT: OnceLock<TextTemplate> = OnceLock::new();
    compiled(TRANSITION_TEMPLATE, &SLOT)
}

pub fn enforcement_template() -> &'static TextTemplate {
    static SLOT: OnceLock<TextTemplate> = OnceLock::new();
    compiled(ENFORCEMENT_TEMPLATE, &SLOT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_templates_compile() {
        sensor_template();
        filter_template();
        transition_template();
        enforcement_template();
    }
}
