//! LLM ternary rule filter: APPLIES / NOT_RELATED / UNSURE.

use std::collections::HashMap;
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use keel_core::config::{RuleFilteringConfig, UnsurePolicy};
use keel_llm::json::extract_json;
use keel_llm::template::TemplateContext;
use keel_llm::{ChatMessage, LlmExecutor};
use keel_retrieval::retriever::ScoredRule;

use crate::prompts::filter_template;
use crate::snapshot::SituationSnapshot;
use crate::types::{MatchedRule, RuleFilterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum Applicability {
    Applies,
    NotRelated,
    Unsure,
}

#[derive(Debug)]
struct Evaluation {
    applicability: Applicability,
    confidence: f64,
    relevance: f64,
    reasoning: String,
}

pub struct RuleFilter {
    executor: LlmExecutor,
    config: RuleFilteringConfig,
}

impl RuleFilter {
    pub fn new(executor: LlmExecutor, config: RuleFilteringConfig) -> Self {
        Self { executor, config }
    }

    pub async fn filter(
        &self,
        snapshot: &SituationSnapshot,
        candidates: Vec<ScoredRule>,
    ) -> RuleFilterResult {
        let start = Instant::now();
        if candidates.is_empty() {
            return RuleFilterResult::default();
        }

        debug!(
            num_candidates = candidates.len(),
            batch_size = self.config.batch_size,
            "filtering rules"
        );

        let mut result = RuleFilterResult::default();
        for batch in candidates.chunks(self.config.batch_size.max(1)) {
            let evaluations = self.evaluate_batch(snapshot, batch).await;
            for (candidate, evaluation) in batch.iter().zip(evaluations) {
                self.decide(candidate, evaluation, &mut result);
            }
        }

        result
            .matched_rules
            .sort_by(|a, b| {
                b.relevance_score
                    .partial_cmp(&a.relevance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        result.filter_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        info!(
            matched = result.matched_rules.len(),
            rejected = result.rejected_rule_ids.len(),
            unsure = result.unsure_rule_ids.len(),
            unsure_policy = ?self.config.unsure_policy,
            "rules filtered"
        );
        result
    }

    fn decide(&self, candidate: &ScoredRule, evaluation: Evaluation, result: &mut RuleFilterResult) {
        match evaluation.applicability {
            Applicability::Applies => {
                if evaluation.confidence >= self.config.confidence_threshold {
                    result.matched_rules.push(MatchedRule {
                        rule: candidate.rule.clone(),
                        match_score: candidate.score,
                        relevance_score: evaluation.relevance,
                        reasoning: evaluation.reasoning,
                    });
                }
                // APPLIES below threshold drops silently: neither matched nor
                // rejected.
            }
            Applicability::NotRelated => {
                result.rejected_rule_ids.push(candidate.rule.id);
            }
            Applicability::Unsure => {
                result.unsure_rule_ids.push(candidate.rule.id);
                match self.config.unsure_policy {
                    UnsurePolicy::Include => {
                        result.matched_rules.push(MatchedRule {
                            rule: candidate.rule.clone(),
                            match_score: candidate.score,
                            relevance_score: evaluation.relevance,
                            reasoning: format!(
                                "UNSURE (included by policy): {}",
                                evaluation.reasoning
                            ),
                        });
                    }
                    UnsurePolicy::Exclude => {}
                    UnsurePolicy::LogOnly => {
                        info!(
                            rule_id = %candidate.rule.id,
                            confidence = evaluation.confidence,
                            reasoning = %evaluation.reasoning,
                            "unsure rule dropped (log_only policy)"
                        );
                    }
                }
            }
        }
    }

    async fn evaluate_batch(
        &self,
        snapshot: &SituationSnapshot,
        batch: &[ScoredRule],
    ) -> Vec<Evaluation> {
        let rule_rows: Vec<String> = batch
            .iter()
            .map(|c| {
                format!(
                    "- rule_id: {} | condition: {} | action: {}",
                    c.rule.id, c.rule.condition_text, c.rule.action_text
                )
            })
            .collect();
        let ctx = TemplateContext::new()
            .set("message", &snapshot.message)
            .set("topic", snapshot.topic.as_deref().unwrap_or("unknown"))
            .set("sentiment", format!("{:?}", snapshot.sentiment).to_lowercase())
            .set("urgency", format!("{:?}", snapshot.urgency).to_lowercase())
            .set_list("rules", rule_rows);
        let prompt = filter_template().render(&ctx);

        let response = self
            .executor
            .generate_with(
                "You classify rule applicability.",
                vec![ChatMessage::user(prompt)],
                0.0,
                self.executor.config().max_tokens,
            )
            .await;

        match response {
            Ok(r) => self.parse_evaluations(&r.content, batch),
            Err(e) => {
                warn!(error = %e, "filter llm failed, degrading batch to UNSURE");
                batch
                    .iter()
                    .map(|_| Evaluation {
                        applicability: Applicability::Unsure,
                        confidence: 0.0,
                        relevance: 0.0,
                        reasoning: "Filter call failed".to_string(),
                    })
                    .collect()
            }
        }
    }

    /// Match evaluations back by rule_id; rules absent from the response
    /// default to UNSURE, and parse failures degrade the whole batch.
    fn parse_evaluations(&self, content: &str, batch: &[ScoredRule]) -> Vec<Evaluation> {
        let parsed = match extract_json(content) {
            Ok(v) => v,
            Err(_) => {
                let preview: String = content.chars().take(100).collect();
                warn!(content_preview = %preview, "failed to parse filter response");
                return batch
                    .iter()
                    .map(|_| Evaluation {
                        applicability: Applicability::Unsure,
                        confidence: 0.0,
                        relevance: 0.5,
                        reasoning: "Parse error in LLM response".to_string(),
                    })
                    .collect();
            }
        };

        let by_rule_id: HashMap<Uuid, &serde_json::Value> = parsed
            .get("evaluations")
            .and_then(|v| v.as_array())
            .map(|evals| {
                evals
                    .iter()
                    .filter_map(|e| {
                        e.get("rule_id")
                            .and_then(|id| id.as_str())
                            .and_then(|id| Uuid::parse_str(id).ok())
                            .map(|id| (id, e))
                    })
                    .collect()
            })
            .unwrap_or_default();

        batch
            .iter()
            .map(|candidate| match by_rule_id.get(&candidate.rule.id) {
                Some(e) => {
                    let applicability = e
                        .get("applicability")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_value(serde_json::json!(s)).ok())
                        .unwrap_or_else(|| {
                            warn!(rule_id = %candidate.rule.id, "invalid applicability value");
                            Applicability::Unsure
                        });
                    Evaluation {
                        applicability,
                        confidence: e.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5),
                        relevance: e.get("relevance").and_then(|v| v.as_f64()).unwrap_or(0.5),
                        reasoning: e
                            .get("reasoning")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                    }
                }
                None => Evaluation {
                    applicability: Applicability::Unsure,
                    confidence: 0.0,
                    relevance: 0.0,
                    reasoning: "Not evaluated by LLM".to_string(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_catalog::types::Rule;
    use keel_core::config::StepLlmConfig;
    use keel_core::{AgentId, TenantId};
    use keel_llm::mock::MockLlmProvider;
    use keel_retrieval::retriever::RuleSource;
    use std::sync::Arc;

    fn candidate(name: &str) -> ScoredRule {
        ScoredRule {
            rule: Rule::new(TenantId::new(), AgentId::new(), name, "cond", "act"),
            score: 0.8,
            source: RuleSource::Global,
        }
    }

    fn filter_with(response: String, policy: UnsurePolicy) -> RuleFilter {
        let provider = Arc::new(MockLlmProvider::new(response));
        let executor = LlmExecutor::new(provider, StepLlmConfig::default(), "rule_filtering");
        RuleFilter::new(
            executor,
            RuleFilteringConfig {
                unsure_policy: policy,
                ..RuleFilteringConfig::default()
            },
        )
    }

    fn snapshot() -> SituationSnapshot {
        SituationSnapshot::degraded("check my balance", None)
    }

    #[tokio::test]
    async fn ternary_decision_rule() {
        let balance = candidate("balance");
        let transfer = candidate("transfer");
        let response = format!(
            r#"{{"evaluations": [
                {{"rule_id": "{}", "applicability": "APPLIES", "confidence": 0.9, "relevance": 0.85, "reasoning": "asks for balance"}},
                {{"rule_id": "{}", "applicability": "NOT_RELATED", "confidence": 0.95, "relevance": 0.1, "reasoning": "no transfer"}}
            ]}}"#,
            balance.rule.id, transfer.rule.id
        );
        let transfer_id = transfer.rule.id;
        let balance_id = balance.rule.id;

        let filter = filter_with(response, UnsurePolicy::Exclude);
        let result = filter.filter(&snapshot(), vec![balance, transfer]).await;

        assert_eq!(result.matched_rules.len(), 1);
        assert_eq!(result.matched_rules[0].rule.id, balance_id);
        assert!((result.matched_rules[0].relevance_score - 0.85).abs() < 1e-9);
        assert_eq!(result.rejected_rule_ids, vec![transfer_id]);
    }

    #[tokio::test]
    async fn applies_below_threshold_drops_silently() {
        let c = candidate("weak");
        let response = format!(
            r#"{{"evaluations": [{{"rule_id": "{}", "applicability": "APPLIES", "confidence": 0.5, "relevance": 0.9, "reasoning": "maybe"}}]}}"#,
            c.rule.id
        );
        let filter = filter_with(response, UnsurePolicy::Exclude);
        let result = filter.filter(&snapshot(), vec![c]).await;
        assert!(result.matched_rules.is_empty());
        assert!(result.rejected_rule_ids.is_empty());
    }

    #[tokio::test]
    async fn unsure_policy_include_prefixes_reasoning() {
        let c = candidate("unsure");
        let response = format!(
            r#"{{"evaluations": [{{"rule_id": "{}", "applicability": "UNSURE", "confidence": 0.4, "relevance": 0.6, "reasoning": "ambiguous"}}]}}"#,
            c.rule.id
        );
        let filter = filter_with(response, UnsurePolicy::Include);
        let result = filter.filter(&snapshot(), vec![c]).await;
        assert_eq!(result.matched_rules.len(), 1);
        assert!(result.matched_rules[0]
            .reasoning
            .starts_with("UNSURE (included by policy): "));
    }

    #[tokio::test]
    async fn log_only_never_reaches_matched_rules() {
        let c = candidate("unsure");
        let response = format!(
            r#"{{"evaluations": [{{"rule_id": "{}", "applicability": "UNSURE", "confidence": 0.4, "relevance": 0.6, "reasoning": "ambiguous"}}]}}"#,
            c.rule.id
        );
        let id = c.rule.id;
        let filter = filter_with(response, UnsurePolicy::LogOnly);
        let result = filter.filter(&snapshot(), vec![c]).await;
        assert!(result.matched_rules.is_empty());
        assert_eq!(result.unsure_rule_ids, vec![id]);
        assert!(result.rejected_rule_ids.is_empty());
    }

    #[tokio::test]
    async fn parse_error_degrades_batch_to_unsure() {
        let a = candidate("a");
        let b = candidate("b");
        let filter = filter_with("not json at all".to_string(), UnsurePolicy::Exclude);
        let result = filter.filter(&snapshot(), vec![a, b]).await;
        assert!(result.matched_rules.is_empty());
        assert_eq!(result.unsure_rule_ids.len(), 2);
    }

    #[tokio::test]
    async fn rules_absent_from_response_default_to_unsure() {
        let present = candidate("present");
        let absent = candidate("absent");
        let response = format!(
            r#"{{"evaluations": [{{"rule_id": "{}", "applicability": "APPLIES", "confidence": 0.9, "relevance": 0.8, "reasoning": "ok"}}]}}"#,
            present.rule.id
        );
        let absent_id = absent.rule.id;
        let filter = filter_with(response, UnsurePolicy::Exclude);
        let result = filter.filter(&snapshot(), vec![present, absent]).await;
        assert_eq!(result.matched_rules.len(), 1);
        assert_eq!(result.unsure_rule_ids, vec![absent_id]);
    }
}
