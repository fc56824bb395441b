//! Situation sensor: one structured LLM call per turn.

use std::collections::BTreeMap;

use tracing::warn;

use keel_catalog::types::{CustomerDataField, GlossaryItem};
use keel_core::config::SensorConfig;
use keel_customer::types::CustomerProfile;
use keel_llm::json::extract_json;
use keel_llm::template::TemplateContext;
use keel_llm::{ChatMessage, LlmExecutor};

use crate::prompts::sensor_template;
use crate::snapshot::*;

pub struct SituationSensor {
    executor: LlmExecutor,
    config: SensorConfig,
}

impl SituationSensor {
    pub fn new(executor: LlmExecutor, config: SensorConfig) -> Self {
        Self { executor, config }
    }

    /// Extract a snapshot from the message. On LLM exhaustion the turn
    /// continues with a degraded snapshot rather than failing.
    pub async fn sense(
        &self,
        message: &str,
        history: &[HistoryTurn],
        profile: Option<&CustomerProfile>,
        field_definitions: &[CustomerDataField],
        glossary: &[GlossaryItem],
        previous_intent_label: Option<&str>,
    ) -> SituationSnapshot {
        let schema_mask = self
            .config
            .include_schema_mask
            .then(|| build_schema_mask(profile, field_definitions));

        let prompt = self.render_prompt(
            message,
            history,
            schema_mask.as_ref(),
            glossary,
            previous_intent_label,
        );

        // Sensor always runs at temperature 0 regardless of the step default.
        let response = self
            .executor
            .generate_with(
                "You extract structured conversational context.",
                vec![ChatMessage::user(prompt)],
                0.0,
                self.executor.config().max_tokens,
            )
            .await;

        let raw = match response {
            Ok(r) => r.content,
            Err(e) => {
                warn!(error = %e, "sensor llm exhausted retries, degrading");
                return SituationSnapshot::degraded(
                    message,
                    previous_intent_label.map(|s| s.to_string()),
                );
            }
        };

        match extract_json(&raw) {
            Ok(value) => parse_snapshot(&value, message, previous_intent_label),
            Err(e) => {
                warn!(error = %e, "sensor output unparseable, degrading");
                SituationSnapshot::degraded(message, previous_intent_label.map(|s| s.to_string()))
            }
        }
    }

    fn render_prompt(
        &self,
        message: &str,
        history: &[HistoryTurn],
        schema_mask: Option<&SchemaMask>,
        glossary: &[GlossaryItem],
        previous_intent_label: Option<&str>,
    ) -> String {
        let window: Vec<String> = history
            .iter()
            .rev()
            .take(self.config.history_turns)
            .rev()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect();

        let mask_rows: Vec<String> = schema_mask
            .map(|mask| {
                mask.entries
                    .iter()
                    .map(|(name, entry)| {
                        format!(
                            "- {} ({}, {:?}, {})",
                            name,
                            entry.display_name,
                            entry.value_type,
                            if entry.exists { "has value" } else { "empty" }
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let glossary_rows: Vec<String> = if self.config.include_glossary {
            glossary
                .iter()
                .map(|g| format!("- {}: {}", g.term, g.definition))
                .collect()
        } else {
            Vec::new()
        };

        let ctx = TemplateContext::new()
            .set("message", message)
            .set("previous_intent", previous_intent_label.unwrap_or("none"))
            .set_list("history", window)
            .set_list("schema_mask", mask_rows)
            .set_list("glossary", glossary_rows);
        sensor_template().render(&ctx)
    }
}

/// Build the privacy-safe mask: field shape and existence, never values.
pub fn build_schema_mask(
    profile: Option<&CustomerProfile>,
    field_definitions: &[CustomerDataField],
) -> SchemaMask {
    let mut entries = BTreeMap::new();
    for def in field_definitions {
        entries.insert(
            def.name.clone(),
            SchemaMaskEntry {
                scope: def.scope.clone(),
                value_type: def.value_type,
                exists: profile.map_or(false, |p| p.has_active_field(&def.name)),
                display_name: def.display_name.clone(),
            },
        );
    }
    SchemaMask { entries }
}

/// Parse the sensor's JSON, tolerating invalid enum values (defaults + warn).
fn parse_snapshot(
    value: &serde_json::Value,
    message: &str,
    previous_intent_label: Option<&str>,
) -> SituationSnapshot {
    let sentiment = parse_enum_field(value, "sentiment", Sentiment::Neutral);
    let urgency = parse_enum_field(value, "urgency", Urgency::Normal);
    let scenario_signal = value
        .get("scenario_signal")
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value(serde_json::json!(s.to_uppercase())).ok())
        .unwrap_or_else(|| {
            if value.get("scenario_signal").is_some() {
                warn!("invalid scenario_signal, defaulting to UNKNOWN");
            }
            ScenarioSignal::Unknown
        });

    // "none" and other junk collapse to absent.
    let frustration_level = value
        .get("frustration_level")
        .and_then(|v| v.as_str())
        .and_then(|s| match s.to_lowercase().as_str() {
            "low" => Some(FrustrationLevel::Low),
            "medium" => Some(FrustrationLevel::Medium),
            "high" => Some(FrustrationLevel::High),
            _ => None,
        });

    let candidate_variables: BTreeMap<String, CandidateVariable> = value
        .get("candidate_variables")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(name, raw)| {
                    serde_json::from_value::<CandidateVariable>(raw.clone())
                        .ok()
                        .map(|cv| (name.clone(), cv))
                })
                .collect()
        })
        .unwrap_or_default();

    let language = validate_language(
        value.get("language").and_then(|v| v.as_str()).unwrap_or("en"),
    );

    SituationSnapshot {
        message: message.to_string(),
        language,
        previous_intent_label: value
            .get("previous_intent_label")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| previous_intent_label.map(|s| s.to_string())),
        intent_changed: value
            .get("intent_changed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        new_intent_label: value
            .get("new_intent_label")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        new_intent_text: value
            .get("new_intent_text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        topic: value.get("topic").and_then(|v| v.as_str()).map(|s| s.to_string()),
        topic_changed: value
            .get("topic_changed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        tone: value
            .get("tone")
            .and_then(|v| v.as_str())
            .unwrap_or("neutral")
            .to_string(),
        sentiment,
        frustration_level,
        urgency,
        scenario_signal,
        situation_facts: value
            .get("situation_facts")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|f| f.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default(),
        candidate_variables,
        embedding: None,
        sensor_degraded: false,
    }
}

fn parse_enum_field<T: serde::de::DeserializeOwned + Default>(
    value: &serde_json::Value,
    key: &str,
    default: T,
) -> T {
    match value.get(key).and_then(|v| v.as_str()) {
        Some(s) => match serde_json::from_value(serde_json::json!(s.to_lowercase())) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(field = key, value = s, "invalid sensor enum value, using default");
                default
            }
        },
        None => default,
    }
}

/// Two ascii letters, lowercased; anything else falls back to "en".
fn validate_language(language: &str) -> String {
    if language.len() == 2 && language.chars().all(|c| c.is_ascii_alphabetic()) {
        language.to_lowercase()
    } else {
        warn!(language, "invalid language code, defaulting to en");
        "en".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::config::StepLlmConfig;
    use keel_llm::mock::MockLlmProvider;
    use std::sync::Arc;

    fn sensor_with(response: &str) -> SituationSensor {
        let provider = Arc::new(MockLlmProvider::new(response));
        let executor = LlmExecutor::new(provider, StepLlmConfig::default(), "situation_sensor");
        SituationSensor::new(executor, SensorConfig::default())
    }

    #[tokio::test]
    async fn parses_a_full_snapshot() {
        let response = r#"```json
        {
          "language": "FR",
          "intent_changed": true,
          "new_intent_label": "billing",
          "topic": "invoice",
          "topic_changed": true,
          "tone": "frustrated",
          "sentiment": "negative",
          "frustration_level": "high",
          "urgency": "high",
          "scenario_signal": "CONTINUE",
          "situation_facts": ["user mentions double charge"],
          "candidate_variables": {"invoice_number": {"value": "INV-9", "scope": "CONTEXT", "is_update": false}}
        }
        ```"#;
        let sensor = sensor_with(response);
        let snapshot = sensor
            .sense("on m'a facturé deux fois", &[], None, &[], &[], Some("greeting"))
            .await;

        assert_eq!(snapshot.language, "fr");
        assert!(snapshot.intent_changed);
        assert_eq!(snapshot.sentiment, Sentiment::Negative);
        assert_eq!(snapshot.frustration_level, Some(FrustrationLevel::High));
        assert_eq!(snapshot.urgency, Urgency::High);
        assert_eq!(snapshot.scenario_signal, ScenarioSignal::Continue);
        assert_eq!(snapshot.candidate_variables.len(), 1);
        assert!(!snapshot.sensor_degraded);
    }

    #[tokio::test]
    async fn invalid_enums_fall_back_to_defaults() {
        let response = r#"{"language": "english", "sentiment": "ecstatic", "urgency": "apocalyptic", "scenario_signal": "MAYBE", "frustration_level": "none"}"#;
        let sensor = sensor_with(response);
        let snapshot = sensor.sense("hi", &[], None, &[], &[], None).await;

        assert_eq!(snapshot.language, "en");
        assert_eq!(snapshot.sentiment, Sentiment::Neutral);
        assert_eq!(snapshot.urgency, Urgency::Normal);
        assert_eq!(snapshot.scenario_signal, ScenarioSignal::Unknown);
        assert_eq!(snapshot.frustration_level, None);
        assert!(!snapshot.sensor_degraded);
    }

    #[tokio::test]
    async fn unparseable_output_degrades() {
        let sensor = sensor_with("I have no idea.");
        let snapshot = sensor.sense("hello", &[], None, &[], &[], Some("greeting")).await;
        assert!(snapshot.sensor_degraded);
        assert_eq!(snapshot.scenario_signal, ScenarioSignal::Unknown);
        assert_eq!(snapshot.previous_intent_label.as_deref(), Some("greeting"));
    }

    #[test]
    fn schema_mask_never_carries_values() {
        use keel_core::{AgentId, Channel, FieldValue, TenantId, ValueType};
        use keel_customer::types::{ChannelIdentity, EntrySource, VariableEntry};

        let tenant = TenantId::new();
        let agent = AgentId::new();
        let mut profile = CustomerProfile::new(
            tenant,
            ChannelIdentity {
                channel: Channel::Webchat,
                channel_user_id: "u".into(),
                primary: true,
            },
        );
        profile.fields.insert(
            "phone_number".into(),
            VariableEntry::new(
                "phone_number",
                FieldValue::Str("+15550100".into()),
                EntrySource::UserProvided,
            ),
        );

        let defs = vec![
            CustomerDataField::new(tenant, agent, "phone_number", "Phone", ValueType::String)
                .unwrap(),
            CustomerDataField::new(tenant, agent, "email", "Email", ValueType::String).unwrap(),
        ];

        let mask = build_schema_mask(Some(&profile), &defs);
        assert!(mask.entries["phone_number"].exists);
        assert!(!mask.entries["email"].exists);
        let rendered = serde_json::to_string(&mask).unwrap();
        assert!(!rendered.contains("+15550100"));
    }
}
