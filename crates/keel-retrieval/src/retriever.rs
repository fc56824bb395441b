//! Candidate retrieval with scope hierarchy and business filters.
//!
//! Rules are retrieved per scope (GLOBAL always; SCENARIO/STEP only when an
//! instance is active), scored vector-only or hybrid, then cut by the
//! configured selection strategy. The business pre-filter runs before scoring
//! so the BM25 corpus only contains eligible rules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{Rule, Scenario, Scope};
use keel_core::config::{HybridConfig, SelectionConfig};
use keel_core::{AgentId, TenantId};
use keel_llm::{EmbeddingProvider, RerankProvider};

use crate::bm25::{tokenize, Bm25};
use crate::error::Result;
use crate::hybrid::{HybridScorer, Normalization};
use crate::selection::{ScoredItem, SelectionMetadata, SelectionStrategy};
use crate::vector::clamped_similarity;

/// Which scope a rule candidate was retrieved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSource {
    Global,
    Scenario,
    Step,
}

#[derive(Debug, Clone)]
pub struct ScoredRule {
    pub rule: Rule,
    pub score: f64,
    pub source: RuleSource,
}

#[derive(Debug, Clone)]
pub struct ScoredScenario {
    pub scenario_id: Uuid,
    pub scenario_name: String,
    pub version: u32,
    pub entry_step_id: Uuid,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct RetrievalResult {
    pub rules: Vec<ScoredRule>,
    pub scenarios: Vec<ScoredScenario>,
    pub retrieval_time_ms: f64,
    pub selection_metadata: Option<SelectionMetadata>,
    /// Set when the candidate source failed and empty results were returned.
    pub degraded: bool,
}

/// Session-side state the business filters read.
#[derive(Debug, Default, Clone)]
pub struct RuleFireState {
    pub fired_counts: HashMap<Uuid, u32>,
    pub last_fired_turns: HashMap<Uuid, u32>,
    pub current_turn: u32,
}

impl RuleFireState {
    /// enabled / max-fires / cooldown gate. Blocked while
    /// `turns_since_fire < cooldown_turns`.
    pub fn passes(&self, rule: &Rule) -> bool {
        if !rule.enabled {
            return false;
        }
        if rule.max_fires_per_session > 0 {
            let fired = self.fired_counts.get(&rule.id).copied().unwrap_or(0);
            if fired >= rule.max_fires_per_session {
                return false;
            }
        }
        if rule.cooldown_turns > 0 {
            if let Some(last) = self.last_fired_turns.get(&rule.id) {
                let since = self.current_turn.saturating_sub(*last);
                if since < rule.cooldown_turns {
                    return false;
                }
            }
        }
        true
    }
}

pub struct RuleRetriever {
    config_store: Arc<dyn AgentConfigStore>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    selection_config: SelectionConfig,
    strategy: SelectionStrategy,
    hybrid: Option<HybridScorer>,
    reranker: Option<Arc<dyn RerankProvider>>,
}

impl RuleRetriever {
    pub fn new(
        config_store: Arc<dyn AgentConfigStore>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        selection_config: SelectionConfig,
        hybrid_config: &HybridConfig,
        reranker: Option<Arc<dyn RerankProvider>>,
    ) -> Result<Self> {
        let strategy = SelectionStrategy::from_config(
            &selection_config.strategy,
            selection_config.min_score,
            &selection_config.params,
        )?;
        let hybrid = hybrid_config.enabled.then(|| {
            HybridScorer::new(
                hybrid_config.vector_weight,
                hybrid_config.bm25_weight,
                Normalization::parse(&hybrid_config.normalization),
            )
        });
        Ok(Self {
            config_store,
            embedding_provider,
            selection_config,
            strategy,
            hybrid,
            reranker,
        })
    }

    /// Retrieve candidate rules for a turn. An embedding for the message is
    /// generated when the caller has none yet.
    pub async fn retrieve(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        message: &str,
        embedding: Option<&[f32]>,
        active_scenario_ids: &[Uuid],
        active_step_ids: &[Uuid],
        fire_state: &RuleFireState,
    ) -> RetrievalResult {
        let start = Instant::now();
        let owned_embedding;
        let embedding = match embedding {
            Some(e) => e,
            None => match self.embedding_provider.embed_single(message).await {
                Ok(e) => {
                    owned_embedding = e;
                    &owned_embedding
                }
                Err(e) => {
                    warn!(error = %e, "query embedding failed, returning empty candidates");
                    return RetrievalResult {
                        degraded: true,
                        retrieval_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                        ..Default::default()
                    };
                }
            },
        };

        let mut candidates: Vec<ScoredRule> = Vec::new();
        let mut degraded = false;

        let mut scopes: Vec<(Scope, Option<Uuid>, RuleSource)> =
            vec![(Scope::Global, None, RuleSource::Global)];
        scopes.extend(
            active_scenario_ids
                .iter()
                .map(|id| (Scope::Scenario, Some(*id), RuleSource::Scenario)),
        );
        scopes.extend(
            active_step_ids
                .iter()
                .map(|id| (Scope::Step, Some(*id), RuleSource::Step)),
        );

        for (scope, scope_id, source) in scopes {
            match self
                .retrieve_scope(tenant_id, agent_id, scope, scope_id, source, message, embedding, fire_state)
                .await
            {
                Ok(scored) => candidates.extend(scored),
                Err(e) => {
                    warn!(%scope, error = %e, "scope retrieval failed");
                    degraded = true;
                }
            }
        }

        if let Some(reranker) = &self.reranker {
            candidates = self.rerank(reranker, message, candidates).await;
        }

        let (rules, metadata) = self.apply_selection(candidates);

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            selected = rules.len(),
            elapsed_ms = elapsed,
            "rules retrieved"
        );
        RetrievalResult {
            rules,
            scenarios: Vec::new(),
            retrieval_time_ms: elapsed,
            selection_metadata: Some(metadata),
            degraded,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn retrieve_scope(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        scope: Scope,
        scope_id: Option<Uuid>,
        source: RuleSource,
        message: &str,
        embedding: &[f32],
        fire_state: &RuleFireState,
    ) -> std::result::Result<Vec<ScoredRule>, keel_catalog::CatalogError> {
        let rules = self
            .config_store
            .get_rules(tenant_id, agent_id, Some(scope), scope_id, true)
            .await?;

        let eligible: Vec<Rule> = rules
            .into_iter()
            .filter(|r| fire_state.passes(r))
            .collect();
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = match &self.hybrid {
            Some(scorer) => self.hybrid_scores(scorer, &eligible, embedding, message),
            None => self.vector_scores(&eligible, embedding),
        }
        .into_iter()
        .zip(eligible)
        .map(|(score, rule)| ScoredRule {
            rule,
            score,
            source,
        })
        .collect::<Vec<_>>();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }

    fn vector_scores(&self, rules: &[Rule], embedding: &[f32]) -> Vec<f64> {
        rules
            .iter()
            .map(|rule| {
                rule.condition_embedding
                    .as_deref()
                    .and_then(|e| clamped_similarity(embedding, e).ok())
                    .unwrap_or(0.0)
            })
            .collect()
    }

    fn hybrid_scores(
        &self,
        scorer: &HybridScorer,
        rules: &[Rule],
        embedding: &[f32],
        message: &str,
    ) -> Vec<f64> {
        let vector_scores = self.vector_scores(rules, embedding);
        let corpus: Vec<Vec<String>> = rules
            .iter()
            .map(|r| tokenize(&r.condition_text))
            .collect();
        let bm25_scores = Bm25::new(&corpus).scores(&tokenize(message));
        scorer
            .combine(&vector_scores, &bm25_scores)
            .unwrap_or(vector_scores)
    }

    async fn rerank(
        &self,
        reranker: &Arc<dyn RerankProvider>,
        message: &str,
        candidates: Vec<ScoredRule>,
    ) -> Vec<ScoredRule> {
        if candidates.is_empty() {
            return candidates;
        }
        let docs: Vec<String> = candidates
            .iter()
            .map(|c| c.rule.condition_text.clone())
            .collect();
        match reranker.rerank(message, &docs).await {
            Ok(order) => {
                // Preserve rerank order, retain the candidate payload.
                let mut out = Vec::with_capacity(candidates.len());
                let mut taken = vec![false; candidates.len()];
                for item in order {
                    if let Some(candidate) = candidates.get(item.index) {
                        if !taken[item.index] {
                            taken[item.index] = true;
                            out.push(ScoredRule {
                                score: item.score.clamp(0.0, 1.0),
                                ..candidate.clone()
                            });
                        }
                    }
                }
                for (i, candidate) in candidates.into_iter().enumerate() {
                    if !taken[i] {
                        out.push(candidate);
                    }
                }
                out
            }
            Err(e) => {
                warn!(error = %e, "rerank failed, keeping retrieval order");
                candidates
            }
        }
    }

    fn apply_selection(
        &self,
        mut candidates: Vec<ScoredRule>,
    ) -> (Vec<ScoredRule>, SelectionMetadata) {
        if candidates.is_empty() {
            return (candidates, SelectionMetadata::default());
        }
        candidates
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let items: Vec<ScoredItem<ScoredRule>> = candidates
            .into_iter()
            .map(|c| {
                let score = c.score.clamp(0.0, 1.0);
                ScoredItem { item: c, score }
            })
            .collect();

        match self.strategy.select(
            items,
            self.selection_config.max_k,
            self.selection_config.min_k,
        ) {
            Ok(result) => {
                let metadata = result.metadata;
                (
                    result.selected.into_iter().map(|i| i.item).collect(),
                    metadata,
                )
            }
            Err(e) => {
                warn!(error = %e, "selection failed, returning empty");
                (Vec::new(), SelectionMetadata::default())
            }
        }
    }
}

/// Scenario candidate retrieval: vector similarity of the snapshot embedding
/// against each enabled scenario's entry condition embedding.
pub struct ScenarioRetriever {
    config_store: Arc<dyn AgentConfigStore>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
}

impl ScenarioRetriever {
    pub fn new(
        config_store: Arc<dyn AgentConfigStore>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config_store,
            embedding_provider,
        }
    }

    pub async fn retrieve(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        message: &str,
        embedding: Option<&[f32]>,
    ) -> Vec<ScoredScenario> {
        let owned;
        let embedding = match embedding {
            Some(e) => e,
            None => match self.embedding_provider.embed_single(message).await {
                Ok(e) => {
                    owned = e;
                    &owned
                }
                Err(e) => {
                    warn!(error = %e, "scenario query embedding failed");
                    return Vec::new();
                }
            },
        };

        let scenarios = match self.config_store.get_scenarios(tenant_id, agent_id, true).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "scenario listing failed, returning no candidates");
                return Vec::new();
            }
        };

        let mut scored: Vec<ScoredScenario> = scenarios
            .iter()
            .filter_map(|s: &Scenario| {
                let entry = s.entry_embedding.as_deref()?;
                let score = clamped_similarity(embedding, entry).ok()?;
                Some(ScoredScenario {
                    scenario_id: s.id,
                    scenario_name: s.name.clone(),
                    version: s.version,
                    entry_step_id: s.entry_step_id,
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_catalog::inmemory::InMemoryAgentConfigStore;
    use keel_llm::MockEmbeddingProvider;

    fn fire_state(current_turn: u32) -> RuleFireState {
        RuleFireState {
            current_turn,
            ..Default::default()
        }
    }

    fn rule_with(name: &str, cooldown: u32, max_fires: u32) -> Rule {
        let mut r = Rule::new(TenantId::new(), AgentId::new(), name, "cond", "act");
        r.cooldown_turns = cooldown;
        r.max_fires_per_session = max_fires;
        r
    }

    #[test]
    fn business_filter_blocks_disabled_rules() {
        let mut r = rule_with("r", 0, 0);
        r.enabled = false;
        assert!(!fire_state(1).passes(&r));
    }

    #[test]
    fn business_filter_blocks_inside_cooldown() {
        let r = rule_with("r", 3, 0);
        let mut state = fire_state(5);
        state.last_fired_turns.insert(r.id, 3);
        // turns since fire = 2 < 3: blocked.
        assert!(!state.passes(&r));
        state.current_turn = 6;
        // turns since fire = 3: allowed again.
        assert!(state.passes(&r));
    }

    #[test]
    fn business_filter_blocks_at_max_fires() {
        let r = rule_with("r", 0, 2);
        let mut state = fire_state(9);
        state.fired_counts.insert(r.id, 2);
        assert!(!state.passes(&r));
        state.fired_counts.insert(r.id, 1);
        assert!(state.passes(&r));
    }

    #[test]
    fn business_filter_is_monotonic_in_cooldown() {
        // Increasing cooldown never lets more rules through.
        let mut state = fire_state(10);
        let r = rule_with("r", 0, 0);
        state.last_fired_turns.insert(r.id, 8);
        let mut passed_with_smaller = true;
        for cooldown in 0..6 {
            let mut rule = r.clone();
            rule.cooldown_turns = cooldown;
            let passes = state.passes(&rule);
            assert!(passed_with_smaller || !passes);
            passed_with_smaller = passes;
        }
    }

    #[tokio::test]
    async fn retrieval_scores_and_selects_per_scope() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let tenant = TenantId::new();
        let agent = AgentId::new();

        // A rule whose condition embedding matches the query exactly and one
        // that does not.
        let mut matching = Rule::new(tenant, agent, "balance", "check balance", "answer");
        matching.condition_embedding = Some(provider.embed_single("check balance").await.unwrap());
        let mut other = Rule::new(tenant, agent, "transfer", "make a transfer", "answer");
        other.condition_embedding = Some(provider.embed_single("make a transfer").await.unwrap());
        store.save_rule(matching).await.unwrap();
        store.save_rule(other).await.unwrap();

        let retriever = RuleRetriever::new(
            store,
            provider,
            SelectionConfig {
                strategy: "fixed_k".into(),
                min_score: 0.0,
                max_k: 10,
                min_k: 1,
                params: serde_json::Map::new(),
            },
            &HybridConfig::default(),
            None,
        )
        .unwrap();

        let result = retriever
            .retrieve(
                tenant,
                agent,
                "check balance",
                None,
                &[],
                &[],
                &fire_state(1),
            )
            .await;
        assert!(!result.degraded);
        assert_eq!(result.rules.len(), 2);
        assert_eq!(result.rules[0].rule.name, "balance");
        assert!(result.rules[0].score > result.rules[1].score);
        assert_eq!(result.rules[0].source, RuleSource::Global);
    }

    #[tokio::test]
    async fn hybrid_with_zero_bm25_weight_matches_vector_only() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let tenant = TenantId::new();
        let agent = AgentId::new();

        let mut rule = Rule::new(tenant, agent, "r", "user greets the agent", "respond");
        rule.condition_embedding = Some(provider.embed_single("user greets the agent").await.unwrap());
        store.save_rule(rule).await.unwrap();

        let selection = SelectionConfig {
            strategy: "fixed_k".into(),
            min_score: 0.0,
            max_k: 10,
            min_k: 1,
            params: serde_json::Map::new(),
        };

        let vector_only = RuleRetriever::new(
            store.clone(),
            provider.clone(),
            selection.clone(),
            &HybridConfig::default(),
            None,
        )
        .unwrap();
        let hybrid_zero = RuleRetriever::new(
            store,
            provider,
            selection,
            &HybridConfig {
                enabled: true,
                vector_weight: 1.0,
                bm25_weight: 0.0,
                normalization: "min_max".into(),
            },
            None,
        )
        .unwrap();

        let a = vector_only
            .retrieve(tenant, agent, "hello there", None, &[], &[], &fire_state(0))
            .await;
        let b = hybrid_zero
            .retrieve(tenant, agent, "hello there", None, &[], &[], &fire_state(0))
            .await;
        assert!((a.rules[0].score - b.rules[0].score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scenario_retrieval_ranks_by_entry_similarity() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let tenant = TenantId::new();
        let agent = AgentId::new();

        let step = keel_catalog::types::ScenarioStep::new(Uuid::now_v7(), "entry");
        let mut scenario =
            keel_catalog::types::Scenario::new(tenant, agent, "orders", vec![step]).unwrap();
        scenario.steps[0].scenario_id = scenario.id;
        scenario.entry_condition_text = Some("user asks about an order".into());
        scenario.entry_embedding =
            Some(provider.embed_single("user asks about an order").await.unwrap());
        store.save_scenario(scenario).await.unwrap();

        let retriever = ScenarioRetriever::new(store, provider);
        let scored = retriever
            .retrieve(tenant, agent, "user asks about an order", None)
            .await;
        assert_eq!(scored.len(), 1);
        assert!(scored[0].score > 0.99);
    }
}
