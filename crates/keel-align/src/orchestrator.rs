//! Scenario orchestration: lifecycle, step transitions, contributions.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{Scenario, ScenarioStep, StepTransition};
use keel_core::config::ScenarioConfig;
use keel_customer::types::CustomerProfile;
use keel_llm::json::extract_json;
use keel_llm::template::TemplateContext;
use keel_llm::{ChatMessage, LlmExecutor};
use keel_migrate::hash::node_content_hash;
use keel_retrieval::retriever::ScoredScenario;
use keel_retrieval::vector::clamped_similarity;
use keel_sessions::types::{InstanceStatus, ScenarioInstance, Session, StepVisit};

use crate::error::Result;
use crate::prompts::transition_template;
use crate::snapshot::{ScenarioSignal, SituationSnapshot};
use crate::types::*;

pub struct ScenarioOrchestrator {
    config_store: Arc<dyn AgentConfigStore>,
    /// Used when a transition condition references customer-data fields.
    transition_executor: Option<LlmExecutor>,
    config: ScenarioConfig,
}

impl ScenarioOrchestrator {
    pub fn new(
        config_store: Arc<dyn AgentConfigStore>,
        transition_executor: Option<LlmExecutor>,
        config: ScenarioConfig,
    ) -> Self {
        Self {
            config_store,
            transition_executor,
            config,
        }
    }

    /// Run the full orchestration phase, mutating instance state on the
    /// session in place. The caller persists the session at turn end.
    pub async fn orchestrate(
        &self,
        session: &mut Session,
        snapshot: &SituationSnapshot,
        candidates: &[ScoredScenario],
        profile: Option<&CustomerProfile>,
    ) -> Result<ScenarioResult> {
        let mut result = ScenarioResult::default();

        let lifecycle = self.decide_lifecycle(session, snapshot, candidates).await?;
        self.apply_lifecycle(session, &lifecycle).await?;
        result.lifecycle = lifecycle;

        // Transitions only for instances whose lifecycle action is CONTINUE.
        let continuing: Vec<Uuid> = result
            .lifecycle
            .iter()
            .filter(|d| d.action == ScenarioLifecycleAction::Continue)
            .map(|d| d.scenario_id)
            .collect();
        for scenario_id in continuing {
            if let Some(decision) = self
                .evaluate_transitions(session, snapshot, scenario_id, profile)
                .await?
            {
                result.transitions.push(decision);
            }
        }

        result.plan = self.plan_contributions(session).await?;
        info!(
            lifecycle = result.lifecycle.len(),
            transitions_fired = result.transitions.iter().filter(|t| t.fired).count(),
            contributions = result.plan.contributions.len(),
            "scenario orchestration complete"
        );
        Ok(result)
    }

    /// One decision per active/paused instance (first matching row of the
    /// decision table wins), plus START decisions for fresh candidates.
    async fn decide_lifecycle(
        &self,
        session: &Session,
        snapshot: &SituationSnapshot,
        candidates: &[ScoredScenario],
    ) -> Result<Vec<LifecycleDecision>> {
        let mut decisions = Vec::new();

        for instance in session.running_instances() {
            let decision = self.decide_instance(session, snapshot, instance).await?;
            decisions.push(decision);
        }

        // START candidates that do not match any running instance.
        let running: HashSet<Uuid> = session.running_instances().map(|i| i.scenario_id).collect();
        let mut slots = self
            .config
            .max_concurrent
            .saturating_sub(running.len());
        for candidate in candidates {
            if slots == 0 {
                break;
            }
            if candidate.score < self.config.start_threshold {
                continue;
            }
            if running.contains(&candidate.scenario_id) {
                continue;
            }
            decisions.push(LifecycleDecision {
                scenario_id: candidate.scenario_id,
                action: ScenarioLifecycleAction::Start,
                reasoning: format!("entry condition matched (score {:.2})", candidate.score),
                score: Some(candidate.score),
            });
            slots -= 1;
        }

        Ok(decisions)
    }

    async fn decide_instance(
        &self,
        session: &Session,
        snapshot: &SituationSnapshot,
        instance: &ScenarioInstance,
    ) -> Result<LifecycleDecision> {
        let scenario_id = instance.scenario_id;
        let make = |action, reasoning: String| LifecycleDecision {
            scenario_id,
            action,
            reasoning,
            score: None,
        };

        if snapshot.scenario_signal == ScenarioSignal::Cancel {
            return Ok(make(
                ScenarioLifecycleAction::Cancel,
                "user cancelled the flow".into(),
            ));
        }
        if snapshot.scenario_signal == ScenarioSignal::Pause {
            return Ok(make(
                ScenarioLifecycleAction::Pause,
                "user asked to pause".into(),
            ));
        }

        // The decision table evaluates top-down: terminal and loop rows come
        // before retirement, so an instance that just finished its flow
        // completes even when the scenario was disabled underneath it.
        let scenario = self.load_for_instance(session, instance).await?;

        if let Some(step) = scenario
            .as_ref()
            .and_then(|s| s.step(instance.current_step_id))
        {
            if step.is_terminal {
                return Ok(make(
                    ScenarioLifecycleAction::Complete,
                    "terminal step reached".into(),
                ));
            }
        }

        if instance
            .visited_steps
            .values()
            .any(|count| *count >= self.config.loop_threshold)
        {
            return Ok(make(
                ScenarioLifecycleAction::Pause,
                "loop detected: step revisited without advancing".into(),
            ));
        }

        match scenario {
            Some(s) if s.enabled => {}
            _ => {
                return Ok(make(
                    ScenarioLifecycleAction::Cancel,
                    "scenario retired".into(),
                ));
            }
        }

        Ok(make(ScenarioLifecycleAction::Continue, "flow continues".into()))
    }

    async fn apply_lifecycle(
        &self,
        session: &mut Session,
        decisions: &[LifecycleDecision],
    ) -> Result<()> {
        let now = Utc::now();
        for decision in decisions {
            match decision.action {
                ScenarioLifecycleAction::Start => {
                    let scenario = self
                        .config_store
                        .get_scenario(session.tenant_id, decision.scenario_id)
                        .await?;
                    let scenario = match scenario {
                        Some(s) => s,
                        None => {
                            warn!(scenario_id = %decision.scenario_id, "start candidate vanished");
                            continue;
                        }
                    };
                    let instance = ScenarioInstance::start(
                        scenario.id,
                        scenario.version,
                        scenario.entry_step_id,
                    );
                    if let Some(entry) = scenario.entry_step() {
                        session.step_history.push(StepVisit {
                            step_id: entry.id,
                            step_name: Some(entry.name.clone()),
                            entered_at: now,
                            turn_number: session.turn_count + 1,
                            transition_reason: Some("scenario started".into()),
                            confidence: decision.score.unwrap_or(1.0).clamp(0.0, 1.0),
                            is_checkpoint: entry.is_checkpoint,
                            checkpoint_description: entry.checkpoint_description.clone(),
                            step_content_hash: Some(node_content_hash(entry)),
                        });
                    }
                    session.active_scenarios.push(instance);
                }
                ScenarioLifecycleAction::Pause => {
                    if let Some(instance) = session.instance_mut(decision.scenario_id) {
                        instance.status = InstanceStatus::Paused;
                        instance.paused_at = Some(now);
                    }
                }
                ScenarioLifecycleAction::Cancel => {
                    if let Some(instance) = session.instance_mut(decision.scenario_id) {
                        instance.status = InstanceStatus::Cancelled;
                    }
                }
                ScenarioLifecycleAction::Complete => {
                    if let Some(instance) = session.instance_mut(decision.scenario_id) {
                        instance.status = InstanceStatus::Completed;
                    }
                }
                ScenarioLifecycleAction::Continue => {
                    if let Some(instance) = session.instance_mut(decision.scenario_id) {
                        // A paused instance the user resumes.
                        instance.status = InstanceStatus::Active;
                        instance.paused_at = None;
                        instance.last_active_at = now;
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate the current step's outgoing transitions in priority order;
    /// the first one above the threshold fires.
    async fn evaluate_transitions(
        &self,
        session: &mut Session,
        snapshot: &SituationSnapshot,
        scenario_id: Uuid,
        profile: Option<&CustomerProfile>,
    ) -> Result<Option<TransitionDecision>> {
        let instance = match session.instance(scenario_id) {
            Some(i) => i.clone(),
            None => return Ok(None),
        };
        let scenario = match self.load_for_instance(session, &instance).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        let step = match scenario.step(instance.current_step_id) {
            Some(s) => s.clone(),
            None => return Ok(None),
        };

        let mut transitions: Vec<&StepTransition> = step.transitions.iter().collect();
        transitions.sort_by_key(|t| std::cmp::Reverse(t.priority));

        for transition in transitions {
            let (score, reason) = self
                .score_transition(snapshot, &step, transition, profile)
                .await;
            debug!(
                from = %step.name,
                condition = %transition.condition_text,
                score,
                "transition scored"
            );
            if score >= self.config.transition_threshold {
                let target = scenario.step(transition.to_step_id).cloned();
                let relocalization = target
                    .as_ref()
                    .map(|t| t.reachable_from_anywhere)
                    .unwrap_or(false);
                self.advance(session, scenario_id, &scenario, transition.to_step_id, score, "transition");
                if relocalization {
                    session.relocalization_count += 1;
                }
                return Ok(Some(TransitionDecision {
                    scenario_id,
                    from_step_id: step.id,
                    to_step_id: Some(transition.to_step_id),
                    fired: true,
                    confidence: score,
                    reason,
                    relocalization,
                }));
            }
        }

        // Nothing fired. Skippable steps fall through to their default edge;
        // everything else stays put and accumulates a loop count.
        if step.can_skip {
            if let Some(default) = step
                .transitions
                .iter()
                .max_by_key(|t| t.priority)
            {
                let to = default.to_step_id;
                self.advance(session, scenario_id, &scenario, to, 0.0, "skip");
                return Ok(Some(TransitionDecision {
                    scenario_id,
                    from_step_id: step.id,
                    to_step_id: Some(to),
                    fired: true,
                    confidence: 0.0,
                    reason: "skippable step advanced to default".into(),
                    relocalization: false,
                }));
            }
        }

        if let Some(instance) = session.instance_mut(scenario_id) {
            instance.record_visit(step.id);
        }
        Ok(Some(TransitionDecision {
            scenario_id,
            from_step_id: step.id,
            to_step_id: None,
            fired: false,
            confidence: 0.0,
            reason: "no transition condition met".into(),
            relocalization: false,
        }))
    }

    async fn score_transition(
        &self,
        snapshot: &SituationSnapshot,
        step: &ScenarioStep,
        transition: &StepTransition,
        profile: Option<&CustomerProfile>,
    ) -> (f64, String) {
        // Conditions that reference customer data go through the LLM; pure
        // intent conditions score by embedding similarity.
        if !transition.condition_fields.is_empty() {
            if let Some(executor) = &self.transition_executor {
                return self
                    .llm_transition_decision(executor, snapshot, step, transition, profile)
                    .await;
            }
        }

        let score = match (&snapshot.embedding, &transition.condition_embedding) {
            (Some(query), Some(condition)) => {
                clamped_similarity(query, condition).unwrap_or(0.0)
            }
            _ => 0.0,
        };
        (score, "embedding similarity".into())
    }

    async fn llm_transition_decision(
        &self,
        executor: &LlmExecutor,
        snapshot: &SituationSnapshot,
        step: &ScenarioStep,
        transition: &StepTransition,
        profile: Option<&CustomerProfile>,
    ) -> (f64, String) {
        let field_rows: Vec<String> = transition
            .condition_fields
            .iter()
            .map(|f| {
                let exists = profile.map_or(false, |p| p.has_active_field(f));
                format!("- {} ({})", f, if exists { "known" } else { "unknown" })
            })
            .collect();
        let ctx = TemplateContext::new()
            .set("current_step", &step.name)
            .set("condition", &transition.condition_text)
            .set("message", &snapshot.message)
            .set_list("fields", field_rows);
        let prompt = transition_template().render(&ctx);

        let response = executor
            .generate_with(
                "You decide step transitions.",
                vec![ChatMessage::user(prompt)],
                0.0,
                executor.config().max_tokens,
            )
            .await;
        match response.map(|r| extract_json(&r.content)) {
            Ok(Ok(v)) => {
                let fires = v.get("fires").and_then(|f| f.as_bool()).unwrap_or(false);
                let confidence = v.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0);
                let reasoning = v
                    .get("reasoning")
                    .and_then(|r| r.as_str())
                    .unwrap_or("llm decision")
                    .to_string();
                (if fires { confidence } else { 0.0 }, reasoning)
            }
            _ => {
                warn!("transition llm decision failed, treating as not fired");
                (0.0, "llm decision unavailable".into())
            }
        }
    }

    /// Move the instance to `to_step`. Leaving a step resets its consecutive
    /// visit counter, so a step only trips loop detection when it is revisited
    /// without the flow advancing in between.
    fn advance(
        &self,
        session: &mut Session,
        scenario_id: Uuid,
        scenario: &Scenario,
        to_step: Uuid,
        confidence: f64,
        reason: &str,
    ) {
        let turn_number = session.turn_count + 1;
        if let Some(instance) = session.instance_mut(scenario_id) {
            let leaving = instance.current_step_id;
            instance.visited_steps.insert(leaving, 0);
            instance.current_step_id = to_step;
            instance.record_visit(to_step);
        }
        let step = scenario.step(to_step);
        session.step_history.push(StepVisit {
            step_id: to_step,
            step_name: step.map(|s| s.name.clone()),
            entered_at: Utc::now(),
            turn_number,
            transition_reason: Some(reason.to_string()),
            confidence: confidence.clamp(0.0, 1.0),
            is_checkpoint: step.map(|s| s.is_checkpoint).unwrap_or(false),
            checkpoint_description: step.and_then(|s| s.checkpoint_description.clone()),
            step_content_hash: step.map(node_content_hash),
        });
    }

    /// One contribution per instance that is neither paused nor cancelled.
    /// Conflicting ACT proposals on the same tool resolve by priority, then
    /// earlier start.
    async fn plan_contributions(&self, session: &Session) -> Result<ScenarioContributionPlan> {
        let mut contributions = Vec::new();
        for instance in &session.active_scenarios {
            if matches!(
                instance.status,
                InstanceStatus::Paused | InstanceStatus::Cancelled
            ) {
                continue;
            }
            let scenario = match self.load_for_instance(session, instance).await? {
                Some(s) => s,
                None => continue,
            };
            let step = match scenario.step(instance.current_step_id) {
                Some(s) => s,
                None => continue,
            };

            let contribution_type = if !step.collects_profile_fields.is_empty() {
                ContributionType::Collect
            } else if step.performs_action {
                ContributionType::Act
            } else if step.instructions.is_some() {
                ContributionType::Inform
            } else {
                ContributionType::Prompt
            };

            contributions.push(ScenarioContribution {
                scenario_id: scenario.id,
                scenario_name: scenario.name.clone(),
                current_step_id: step.id,
                current_step_name: step.name.clone(),
                contribution_type,
                step_instructions: step.instructions.clone(),
                required_fields: step.collects_profile_fields.clone(),
                suggested_tools: step.tool_bindings.clone(),
                priority: scenario.priority,
                started_at: instance.started_at,
            });
        }

        resolve_act_conflicts(&mut contributions);
        Ok(ScenarioContributionPlan { contributions })
    }

    /// Prefer the live scenario when versions agree, else the archive.
    async fn load_for_instance(
        &self,
        session: &Session,
        instance: &ScenarioInstance,
    ) -> Result<Option<Scenario>> {
        if let Some(live) = self
            .config_store
            .get_scenario(session.tenant_id, instance.scenario_id)
            .await?
        {
            if live.version == instance.scenario_version {
                return Ok(Some(live));
            }
        }
        Ok(self
            .config_store
            .get_archived_scenario(
                session.tenant_id,
                instance.scenario_id,
                instance.scenario_version,
            )
            .await?)
    }
}

/// Drop lower-priority duplicates among ACT contributions proposing the same
/// tool; ties break by earlier `started_at`.
fn resolve_act_conflicts(contributions: &mut Vec<ScenarioContribution>) {
    let mut winners: std::collections::HashMap<String, (i32, chrono::DateTime<Utc>, Uuid)> =
        std::collections::HashMap::new();
    for c in contributions.iter() {
        if c.contribution_type != ContributionType::Act {
            continue;
        }
        for tool in &c.suggested_tools {
            let entry = winners.entry(tool.tool_id.clone()).or_insert((
                c.priority,
                c.started_at,
                c.scenario_id,
            ));
            let better = c.priority > entry.0 || (c.priority == entry.0 && c.started_at < entry.1);
            if better {
                *entry = (c.priority, c.started_at, c.scenario_id);
            }
        }
    }
    contributions.retain(|c| {
        if c.contribution_type != ContributionType::Act {
            return true;
        }
        c.suggested_tools.iter().all(|tool| {
            winners
                .get(&tool.tool_id)
                .map_or(true, |w| w.2 == c.scenario_id)
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_catalog::inmemory::InMemoryAgentConfigStore;
    use keel_core::{AgentId, Channel, TenantId};
    use keel_llm::MockEmbeddingProvider;
    use keel_llm::EmbeddingProvider;

    fn snapshot(signal: ScenarioSignal) -> SituationSnapshot {
        let mut s = SituationSnapshot::degraded("test", None);
        s.scenario_signal = signal;
        s.sensor_degraded = false;
        s
    }

    struct Fixture {
        store: Arc<InMemoryAgentConfigStore>,
        orchestrator: ScenarioOrchestrator,
        tenant: TenantId,
        agent: AgentId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let orchestrator =
            ScenarioOrchestrator::new(store.clone(), None, ScenarioConfig::default());
        Fixture {
            store,
            orchestrator,
            tenant: TenantId::new(),
            agent: AgentId::new(),
        }
    }

    /// step1 -> step2 -> step3(terminal).
    async fn multi_step_scenario(f: &Fixture) -> Scenario {
        let s1 = ScenarioStep::new(Uuid::now_v7(), "step1");
        let s2 = ScenarioStep::new(Uuid::now_v7(), "step2");
        let mut s3 = ScenarioStep::new(Uuid::now_v7(), "step3");
        s3.is_terminal = true;
        let mut s1 = s1;
        s1.transitions.push(StepTransition::new(s2.id, "default"));
        let mut s2 = s2;
        s2.transitions.push(StepTransition::new(s3.id, "default"));
        let mut scenario = Scenario::new(f.tenant, f.agent, "Multi", vec![s1, s2, s3]).unwrap();
        for st in &mut scenario.steps {
            st.scenario_id = scenario.id;
        }
        f.store.save_scenario(scenario.clone()).await.unwrap();
        scenario
    }

    fn session_with_instance(f: &Fixture, scenario: &Scenario, step_id: Uuid) -> Session {
        let mut session = Session::new(f.tenant, f.agent, Channel::Webchat, "u", 1);
        let mut instance = ScenarioInstance::start(scenario.id, scenario.version, step_id);
        instance.visited_steps.clear();
        instance.visited_steps.insert(step_id, 1);
        session.active_scenarios.push(instance);
        session
    }

    #[tokio::test]
    async fn start_continue_complete_flow() {
        let f = fixture();
        let scenario = multi_step_scenario(&f).await;

        // 1. START from a candidate above threshold.
        let mut session = Session::new(f.tenant, f.agent, Channel::Webchat, "u", 1);
        let candidates = vec![ScoredScenario {
            scenario_id: scenario.id,
            scenario_name: scenario.name.clone(),
            version: 1,
            entry_step_id: scenario.entry_step_id,
            score: 0.8,
        }];
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &candidates, None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle.len(), 1);
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Start);
        assert_eq!(session.active_scenarios.len(), 1);

        // 2. CONTINUE at a non-terminal step.
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Continue);

        // 3. COMPLETE once positioned on the terminal step.
        session.active_scenarios[0].current_step_id = scenario.steps[2].id;
        session.active_scenarios[0].visited_steps.clear();
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Complete);
        assert_eq!(
            session.active_scenarios[0].status,
            InstanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn pause_and_cancel_signals_win_over_everything() {
        let f = fixture();
        let scenario = multi_step_scenario(&f).await;

        let mut session = session_with_instance(&f, &scenario, scenario.steps[0].id);
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Pause), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Pause);
        assert_eq!(session.active_scenarios[0].status, InstanceStatus::Paused);

        // Resume: paused instance + UNKNOWN signal decides CONTINUE.
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Continue);
        assert_eq!(session.active_scenarios[0].status, InstanceStatus::Active);

        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Cancel), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Cancel);
        assert_eq!(
            session.active_scenarios[0].status,
            InstanceStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn loop_detection_pauses_after_threshold_visits() {
        let f = fixture();
        let scenario = multi_step_scenario(&f).await;
        let mut session = session_with_instance(&f, &scenario, scenario.steps[0].id);
        session.active_scenarios[0]
            .visited_steps
            .insert(scenario.steps[0].id, 5);

        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Pause);
        assert!(result.lifecycle[0].reasoning.to_lowercase().contains("loop"));
    }

    #[tokio::test]
    async fn advancing_resets_the_consecutive_visit_counter() {
        let f = fixture();
        let scenario = multi_step_scenario(&f).await;
        let mut session = session_with_instance(&f, &scenario, scenario.steps[0].id);
        session.active_scenarios[0]
            .visited_steps
            .insert(scenario.steps[0].id, 4);

        // Fire a transition by embedding similarity.
        let provider = MockEmbeddingProvider::new(32);
        let cond = provider.embed_single("default").await.unwrap();
        let mut snapshot = snapshot(ScenarioSignal::Unknown);
        snapshot.embedding = Some(cond.clone());
        {
            // Give step1's transition a matching embedding.
            let mut s = f
                .store
                .get_scenario(f.tenant, scenario.id)
                .await
                .unwrap()
                .unwrap();
            s.steps[0].transitions[0].condition_embedding = Some(cond);
            f.store.save_scenario(s).await.unwrap();
        }

        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot, &[], None)
            .await
            .unwrap();
        assert!(result.transitions[0].fired);

        // The step that was left no longer counts towards loop detection.
        assert_eq!(
            session.active_scenarios[0].visited_steps[&scenario.steps[0].id],
            0
        );
        assert_eq!(
            session.active_scenarios[0].current_step_id,
            scenario.steps[1].id
        );
        let visit = session.step_history.last().unwrap();
        assert_eq!(visit.step_id, scenario.steps[1].id);
        assert!(visit.step_content_hash.is_some());
    }

    #[tokio::test]
    async fn retired_scenario_cancels() {
        let f = fixture();
        let scenario = multi_step_scenario(&f).await;
        let mut session = session_with_instance(&f, &scenario, scenario.steps[0].id);
        f.store.delete_scenario(f.tenant, scenario.id).await.unwrap();

        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Cancel);
        assert_eq!(result.lifecycle[0].reasoning, "scenario retired");
    }

    #[tokio::test]
    async fn start_respects_max_concurrent_and_dedup() {
        let f = fixture();
        let scenario = multi_step_scenario(&f).await;
        let mut session = session_with_instance(&f, &scenario, scenario.steps[0].id);

        // Same scenario already active: candidate ignored.
        let dup = vec![ScoredScenario {
            scenario_id: scenario.id,
            scenario_name: scenario.name.clone(),
            version: 1,
            entry_step_id: scenario.entry_step_id,
            score: 0.9,
        }];
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &dup, None)
            .await
            .unwrap();
        assert!(result
            .lifecycle
            .iter()
            .all(|d| d.action != ScenarioLifecycleAction::Start));

        // Below threshold: ignored.
        let second = multi_step_scenario(&f).await;
        let weak = vec![ScoredScenario {
            scenario_id: second.id,
            scenario_name: second.name.clone(),
            version: 1,
            entry_step_id: second.entry_step_id,
            score: 0.2,
        }];
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &weak, None)
            .await
            .unwrap();
        assert!(result
            .lifecycle
            .iter()
            .all(|d| d.action != ScenarioLifecycleAction::Start));
    }

    #[tokio::test]
    async fn terminal_step_completes_even_when_scenario_was_disabled() {
        let f = fixture();
        let scenario = multi_step_scenario(&f).await;
        let mut session = session_with_instance(&f, &scenario, scenario.steps[2].id);

        let mut disabled = f
            .store
            .get_scenario(f.tenant, scenario.id)
            .await
            .unwrap()
            .unwrap();
        disabled.enabled = false;
        f.store.save_scenario(disabled).await.unwrap();

        // Terminal row of the decision table outranks retirement.
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &[], None)
            .await
            .unwrap();
        assert_eq!(result.lifecycle[0].action, ScenarioLifecycleAction::Complete);
    }

    #[test]
    fn act_conflicts_resolve_by_priority_then_start_time() {
        use keel_catalog::types::{ToolBinding, ToolTiming};

        let binding = ToolBinding {
            tool_id: "charge_card".into(),
            timing: ToolTiming::BeforeStep,
            params: serde_json::Map::new(),
        };
        let make = |priority: i32, started_offset_secs: i64| ScenarioContribution {
            scenario_id: Uuid::now_v7(),
            scenario_name: "s".into(),
            current_step_id: Uuid::now_v7(),
            current_step_name: "act".into(),
            contribution_type: ContributionType::Act,
            step_instructions: None,
            required_fields: Vec::new(),
            suggested_tools: vec![binding.clone()],
            priority,
            started_at: Utc::now() + chrono::Duration::seconds(started_offset_secs),
        };

        // The younger instance wins on priority alone.
        let low_old = make(0, -60);
        let high_new = make(5, 0);
        let winner = high_new.scenario_id;
        let mut contributions = vec![low_old, high_new];
        resolve_act_conflicts(&mut contributions);
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].scenario_id, winner);

        // Equal priority: the earlier start wins the tie.
        let first = make(1, -60);
        let second = make(1, 0);
        let winner = first.scenario_id;
        let mut contributions = vec![second, first];
        resolve_act_conflicts(&mut contributions);
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].scenario_id, winner);
    }

    #[tokio::test]
    async fn contributions_reflect_step_shape() {
        let f = fixture();
        let mut collect = ScenarioStep::new(Uuid::now_v7(), "collect phone");
        collect.collects_profile_fields = vec!["phone_number".into()];
        let mut scenario = Scenario::new(f.tenant, f.agent, "Collector", vec![collect]).unwrap();
        for st in &mut scenario.steps {
            st.scenario_id = scenario.id;
        }
        f.store.save_scenario(scenario.clone()).await.unwrap();

        let mut session = session_with_instance(&f, &scenario, scenario.steps[0].id);
        let result = f
            .orchestrator
            .orchestrate(&mut session, &snapshot(ScenarioSignal::Unknown), &[], None)
            .await
            .unwrap();
        assert_eq!(result.plan.contributions.len(), 1);
        let c = &result.plan.contributions[0];
        assert_eq!(c.contribution_type, ContributionType::Collect);
        assert_eq!(c.required_fields, vec!["phone_number"]);
    }
}
