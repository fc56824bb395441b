//! Situation snapshot: everything the sensor extracted from one utterance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_core::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrustrationLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// The user's stance towards any ongoing scenario, as read by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScenarioSignal {
    Continue,
    Pause,
    Cancel,
    #[default]
    Unknown,
}

/// A value the sensor believes should land in the customer data store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateVariable {
    pub value: serde_json::Value,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub is_update: bool,
}

fn default_scope() -> String {
    "IDENTITY".to_string()
}

/// Privacy-safe projection of the customer data store for LLM prompts: which
/// fields exist and their shape, never their values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaMask {
    pub entries: BTreeMap<String, SchemaMaskEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMaskEntry {
    pub scope: String,
    pub value_type: ValueType,
    pub exists: bool,
    pub display_name: String,
}

/// One past exchange rendered into the sensor's conversation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SituationSnapshot {
    pub message: String,
    /// ISO 639-1, lowercased; "en" when the sensor's answer was unusable.
    pub language: String,
    pub previous_intent_label: Option<String>,
    pub intent_changed: bool,
    pub new_intent_label: Option<String>,
    pub new_intent_text: Option<String>,
    pub topic: Option<String>,
    pub topic_changed: bool,
    pub tone: String,
    pub sentiment: Sentiment,
    pub frustration_level: Option<FrustrationLevel>,
    pub urgency: Urgency,
    pub scenario_signal: ScenarioSignal,
    pub situation_facts: Vec<String>,
    pub candidate_variables: BTreeMap<String, CandidateVariable>,
    /// Query embedding of the message, filled by the pipeline after sensing.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Set when the sensor exhausted retries and defaults were substituted.
    pub sensor_degraded: bool,
}

impl SituationSnapshot {
    /// Neutral snapshot used when the sensor is down; the turn continues with
    /// retrieval running on the raw message.
    pub fn degraded(message: &str, previous_intent_label: Option<String>) -> Self {
        Self {
            message: message.to_string(),
            language: "en".to_string(),
            previous_intent_label,
            intent_changed: false,
            new_intent_label: None,
            new_intent_text: None,
            topic: None,
            topic_changed: false,
            tone: "neutral".to_string(),
            sentiment: Sentiment::Neutral,
            frustration_level: None,
            urgency: Urgency::Normal,
            scenario_signal: ScenarioSignal::Unknown,
            situation_facts: Vec::new(),
            candidate_variables: BTreeMap::new(),
            embedding: None,
            sensor_degraded: true,
        }
    }
}
