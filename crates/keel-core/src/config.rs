use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Hard limits shared by the turn API and the orchestrator.
pub const MAX_MESSAGE_CHARS: usize = 10_000;
pub const DEFAULT_TURN_DEADLINE_MS: u64 = 30_000;
pub const IDEMPOTENCY_WINDOW_SECS: i64 = 300;
pub const DERIVATION_MAX_DEPTH: usize = 10;

/// Top-level engine config (keel.toml + KEEL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub filtering: FilterConfig,
    #[serde(default)]
    pub scenarios: ScenarioConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl EngineConfig {
    /// Load from `keel.toml` (if present) with `KEEL_*` env overrides.
    /// Nested keys use double underscores: `KEEL_FILTERING__CONFIDENCE_THRESHOLD=0.8`.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("keel.toml"))
            .merge(Env::prefixed("KEEL_").split("__"))
            .extract()
    }
}

/// Per-step LLM settings. Every pipeline step that talks to a model gets an
/// independent block so environments can tune them separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLlmConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for StepLlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_ms: default_step_timeout_ms(),
            retries: default_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub situation_sensor: SensorConfig,
    #[serde(default)]
    pub rule_filtering: RuleFilteringConfig,
    #[serde(default = "generation_defaults")]
    pub generation: StepLlmConfig,
    #[serde(default)]
    pub enforcement: StepLlmConfig,
    #[serde(default)]
    pub transitions: StepLlmConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            situation_sensor: SensorConfig::default(),
            rule_filtering: RuleFilteringConfig::default(),
            generation: generation_defaults(),
            enforcement: StepLlmConfig::default(),
            transitions: StepLlmConfig::default(),
        }
    }
}

fn generation_defaults() -> StepLlmConfig {
    StepLlmConfig {
        temperature: 0.7,
        ..StepLlmConfig::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(flatten)]
    pub llm: StepLlmConfig,
    /// Conversation window size (last K turns).
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "bool_true")]
    pub include_schema_mask: bool,
    #[serde(default = "bool_true")]
    pub include_glossary: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            llm: StepLlmConfig::default(),
            history_turns: default_history_turns(),
            include_schema_mask: true,
            include_glossary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFilteringConfig {
    #[serde(flatten)]
    pub llm: StepLlmConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub unsure_policy: UnsurePolicy,
}

impl Default for RuleFilteringConfig {
    fn default() -> Self {
        Self {
            llm: StepLlmConfig::default(),
            batch_size: default_batch_size(),
            confidence_threshold: default_confidence_threshold(),
            unsure_policy: UnsurePolicy::default(),
        }
    }
}

/// How UNSURE classifications are treated after the ternary filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsurePolicy {
    #[default]
    Exclude,
    Include,
    LogOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_min_k")]
    pub min_k: usize,
    /// Strategy-specific knobs (k, drop_threshold, alpha, eps, ...).
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            min_score: default_min_score(),
            max_k: default_max_k(),
            min_k: default_min_k(),
            params: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f64,
    #[serde(default = "default_normalization")]
    pub normalization: String,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            vector_weight: default_vector_weight(),
            bm25_weight: default_bm25_weight(),
            normalization: default_normalization(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Re-ranking of selected candidates via an external provider.
    #[serde(default)]
    pub rerank_enabled: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            rerank_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_start_threshold")]
    pub start_threshold: f64,
    #[serde(default = "default_transition_threshold")]
    pub transition_threshold: f64,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            start_threshold: default_start_threshold(),
            transition_threshold: default_transition_threshold(),
            loop_threshold: default_loop_threshold(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
    /// When true, cache backend errors fall through to the store instead of
    /// surfacing.
    #[serde(default = "bool_true")]
    pub fallback_on_error: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
            key_prefix: default_cache_prefix(),
            fallback_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_turn_deadline_ms")]
    pub turn_deadline_ms: u64,
    /// When a second turn arrives for a busy session: fail fast or queue.
    #[serde(default)]
    pub busy_behavior: BusyBehavior,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            turn_deadline_ms: default_turn_deadline_ms(),
            busy_behavior: BusyBehavior::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyBehavior {
    #[default]
    FailFast,
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_ingest_capacity")]
    pub ingest_queue_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ingest_queue_capacity: default_ingest_capacity(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_model() -> String {
    "primary".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_step_timeout_ms() -> u64 {
    10_000
}
fn default_retries() -> u32 {
    2
}
fn default_history_turns() -> usize {
    10
}
fn default_batch_size() -> usize {
    5
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_strategy() -> String {
    "fixed_k".to_string()
}
fn default_min_score() -> f64 {
    0.3
}
fn default_max_k() -> usize {
    10
}
fn default_min_k() -> usize {
    1
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_bm25_weight() -> f64 {
    0.3
}
fn default_normalization() -> String {
    "min_max".to_string()
}
fn default_start_threshold() -> f64 {
    0.5
}
fn default_transition_threshold() -> f64 {
    0.55
}
fn default_loop_threshold() -> u32 {
    5
}
fn default_max_concurrent() -> usize {
    3
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_cache_prefix() -> String {
    "keel".to_string()
}
fn default_turn_deadline_ms() -> u64 {
    DEFAULT_TURN_DEADLINE_MS
}
fn default_ingest_capacity() -> usize {
    1024
}

/// Fully resolved per-turn runtime configuration.
///
/// Produced by layering platform defaults ← tenant ← agent ← channel ←
/// scenario ← step; `None` at a layer means no-op, `extra` maps merge deeply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub accumulation_window_ms: u64,
    pub max_response_length: usize,
    pub max_response_tokens: u32,
    pub processing_timeout_ms: u64,
    pub tool_execution_timeout_ms: u64,
    pub temperature: f64,
    pub enable_memory_retrieval: bool,
    pub enable_rule_retrieval: bool,
    pub enable_scenario_tracking: bool,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            accumulation_window_ms: 3000,
            max_response_length: 4096,
            max_response_tokens: 1024,
            processing_timeout_ms: DEFAULT_TURN_DEADLINE_MS,
            tool_execution_timeout_ms: 10_000,
            temperature: 0.7,
            enable_memory_retrieval: true,
            enable_rule_retrieval: true,
            enable_scenario_tracking: true,
            extra: serde_json::Map::new(),
        }
    }
}

/// A sparse override layer: only `Some` fields take effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverride {
    pub accumulation_window_ms: Option<u64>,
    pub max_response_length: Option<usize>,
    pub max_response_tokens: Option<u32>,
    pub processing_timeout_ms: Option<u64>,
    pub tool_execution_timeout_ms: Option<u64>,
    pub temperature: Option<f64>,
    pub enable_memory_retrieval: Option<bool>,
    pub enable_rule_retrieval: Option<bool>,
    pub enable_scenario_tracking: Option<bool>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResolvedConfig {
    /// Apply one override layer in place. Later layers win; `extra` merges
    /// key-by-key instead of replacing wholesale.
    pub fn apply(&mut self, layer: &ConfigOverride) {
        if let Some(v) = layer.accumulation_window_ms {
            self.accumulation_window_ms = v;
        }
        if let Some(v) = layer.max_response_length {
            self.max_response_length = v;
        }
        if let Some(v) = layer.max_response_tokens {
            self.max_response_tokens = v;
        }
        if let Some(v) = layer.processing_timeout_ms {
            self.processing_timeout_ms = v;
        }
        if let Some(v) = layer.tool_execution_timeout_ms {
            self.tool_execution_timeout_ms = v;
        }
        if let Some(v) = layer.temperature {
            self.temperature = v;
        }
        if let Some(v) = layer.enable_memory_retrieval {
            self.enable_memory_retrieval = v;
        }
        if let Some(v) = layer.enable_rule_retrieval {
            self.enable_rule_retrieval = v;
        }
        if let Some(v) = layer.enable_scenario_tracking {
            self.enable_scenario_tracking = v;
        }
        for (k, v) in &layer.extra {
            merge_extra(&mut self.extra, k, v);
        }
    }
}

/// Deep-merge a single `extra` entry: nested objects merge, scalars replace.
fn merge_extra(
    target: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
    value: &serde_json::Value,
) {
    match (target.get_mut(key), value) {
        (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_extra(existing, k, v);
            }
        }
        _ => {
            target.insert(key.to_string(), value.clone());
        }
    }
}
