//! The turn pipeline orchestrator.
//!
//! One call to `process_turn` runs the ordered phases: resolve config, JIT
//! migration, sensor, retrieval (rules and scenarios concurrently), scope
//! pre-filter, LLM filter, scenario orchestration, customer-data
//! reconciliation, planning, BEFORE_STEP tools, generation, enforcement,
//! AFTER_STEP tools, persist. The session lease is held for the whole turn
//! and released on every exit path; cancellation persists nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use keel_align::enforcer::ConstraintEnforcer;
use keel_align::filter::RuleFilter;
use keel_align::generator::ResponseGenerator;
use keel_align::orchestrator::ScenarioOrchestrator;
use keel_align::planner::ResponsePlanner;
use keel_align::prefilter::ScopePreFilter;
use keel_align::sensor::SituationSensor;
use keel_align::snapshot::{HistoryTurn, SituationSnapshot};
use keel_align::tools::{ToolBindingCollector, ToolExecutor};
use keel_align::types::{ScenarioResult, ToolResult};
use keel_catalog::resolve::{ConfigContext, ConfigResolver};
use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{RequiredLevel, TemplateMode, ToolTiming};
use keel_core::config::{
    BusyBehavior, EngineConfig, ResolvedConfig, IDEMPOTENCY_WINDOW_SECS, MAX_MESSAGE_CHARS,
};
use keel_core::{AgentId, Channel, EngineError, FieldValue, SessionId, TenantId, TurnId};
use keel_customer::requirements::missing_fields;
use keel_customer::store::CustomerDataStore;
use keel_customer::types::{CustomerProfile, EntrySource, VariableEntry};
use keel_llm::{EmbeddingProvider, LlmExecutor, LlmProvider, RerankProvider};
use keel_memory::ingest::MemoryIngestor;
use keel_memory::types::Episode;
use keel_migrate::reconcile::JitReconciler;
use keel_retrieval::retriever::{RuleFireState, RuleRetriever, ScenarioRetriever};
use keel_sessions::store::SessionStore;
use keel_sessions::types::{Session, SessionStatus};
use keel_sessions::SessionError;

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::result::*;
use crate::turns::{TurnRecord, TurnSort, TurnStore};

/// Everything the engine consumes from the outside world.
pub struct EngineDeps {
    pub config_store: Arc<dyn AgentConfigStore>,
    pub session_store: Arc<dyn SessionStore>,
    pub customer_store: Arc<dyn CustomerDataStore>,
    pub turn_store: Arc<dyn TurnStore>,
    pub llm_provider: Arc<dyn LlmProvider>,
    pub embedding_provider: Arc<dyn EmbeddingProvider>,
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub reranker: Option<Arc<dyn RerankProvider>>,
    pub memory: Option<Arc<MemoryIngestor>>,
    pub audit: Option<Arc<dyn AuditSink>>,
    pub config: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub session_id: Option<SessionId>,
    pub channel: Channel,
    pub user_channel_id: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
}

pub struct AlignmentEngine {
    config_store: Arc<dyn AgentConfigStore>,
    session_store: Arc<dyn SessionStore>,
    customer_store: Arc<dyn CustomerDataStore>,
    turn_store: Arc<dyn TurnStore>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    tool_executor: Arc<dyn ToolExecutor>,
    memory: Option<Arc<MemoryIngestor>>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,

    config_resolver: Arc<ConfigResolver>,
    sensor: SituationSensor,
    rule_retriever: RuleRetriever,
    scenario_retriever: ScenarioRetriever,
    prefilter: ScopePreFilter,
    rule_filter: RuleFilter,
    orchestrator: ScenarioOrchestrator,
    reconciler: JitReconciler,
    planner: ResponsePlanner,
    generator: ResponseGenerator,
    enforcer: ConstraintEnforcer,

    idempotency: DashMap<String, (Instant, AlignmentResult)>,
}

impl AlignmentEngine {
    pub fn new(deps: EngineDeps) -> Result<Self, EngineError> {
        let config = deps.config;
        let pipeline = &config.pipeline;

        let sensor = SituationSensor::new(
            LlmExecutor::new(
                deps.llm_provider.clone(),
                pipeline.situation_sensor.llm.clone(),
                "situation_sensor",
            ),
            pipeline.situation_sensor.clone(),
        );
        let rule_filter = RuleFilter::new(
            LlmExecutor::new(
                deps.llm_provider.clone(),
                pipeline.rule_filtering.llm.clone(),
                "rule_filtering",
            ),
            pipeline.rule_filtering.clone(),
        );
        // A configured-off reranker stays out of the path even when injected.
        let reranker = deps
            .reranker
            .clone()
            .filter(|_| config.filtering.rerank_enabled);
        let rule_retriever = RuleRetriever::new(
            deps.config_store.clone(),
            deps.embedding_provider.clone(),
            config.selection.clone(),
            &config.hybrid,
            reranker,
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;
        let scenario_retriever = ScenarioRetriever::new(
            deps.config_store.clone(),
            deps.embedding_provider.clone(),
        );
        let orchestrator = ScenarioOrchestrator::new(
            deps.config_store.clone(),
            Some(LlmExecutor::new(
                deps.llm_provider.clone(),
                pipeline.transitions.clone(),
                "transitions",
            )),
            config.scenarios.clone(),
        );
        let reconciler = JitReconciler::new(
            deps.config_store.clone(),
            deps.embedding_provider.clone(),
            config.scenarios.transition_threshold,
        );
        let planner = ResponsePlanner::new(deps.config_store.clone());
        let generator = ResponseGenerator::new(LlmExecutor::new(
            deps.llm_provider.clone(),
            pipeline.generation.clone(),
            "generation",
        ));
        let enforcer = ConstraintEnforcer::new(
            deps.config_store.clone(),
            LlmExecutor::new(
                deps.llm_provider.clone(),
                pipeline.enforcement.clone(),
                "enforcement",
            ),
        );
        let platform_defaults = ResolvedConfig {
            temperature: pipeline.generation.temperature,
            max_response_tokens: pipeline.generation.max_tokens,
            processing_timeout_ms: config.limits.turn_deadline_ms,
            ..ResolvedConfig::default()
        };
        let config_resolver = Arc::new(ConfigResolver::new(
            deps.config_store.clone(),
            platform_defaults,
        ));

        Ok(Self {
            config_store: deps.config_store,
            session_store: deps.session_store,
            customer_store: deps.customer_store,
            turn_store: deps.turn_store,
            embedding_provider: deps.embedding_provider,
            tool_executor: deps.tool_executor,
            memory: deps.memory,
            audit: deps
                .audit
                .unwrap_or_else(|| Arc::new(TracingAuditSink::default())),
            config,
            config_resolver,
            sensor,
            rule_retriever,
            scenario_retriever,
            prefilter: ScopePreFilter::new(),
            rule_filter,
            orchestrator,
            reconciler,
            planner,
            generator,
            enforcer,
            idempotency: DashMap::new(),
        })
    }

    /// Shared layered-config resolver; the publish job invalidates it after
    /// a version swap.
    pub fn config_resolver(&self) -> Arc<ConfigResolver> {
        self.config_resolver.clone()
    }

    /// Process a single turn end-to-end.
    #[instrument(skip(self, request, cancel), fields(tenant = %request.tenant_id, agent = %request.agent_id))]
    pub async fn process_turn(
        &self,
        request: TurnRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<AlignmentResult, EngineError> {
        counter!(crate::observe::metric::REQUEST_COUNT).increment(1);
        let start = Instant::now();

        let char_count = request.message.chars().count();
        if char_count == 0 || char_count > MAX_MESSAGE_CHARS {
            return Err(EngineError::InvalidRequest(format!(
                "message length {} outside [1, {}]",
                char_count, MAX_MESSAGE_CHARS
            )));
        }

        // Idempotent replay: byte-identical result, same turn_id.
        if let Some(key) = &request.idempotency_key {
            if let Some(entry) = self.idempotency.get(key) {
                let (stored_at, result) = entry.value();
                if stored_at.elapsed().as_secs() < IDEMPOTENCY_WINDOW_SECS as u64 {
                    info!(turn_id = %result.turn_id, "idempotent replay");
                    return Ok(result.clone());
                }
            }
        }

        let mut session = self.resolve_session(&request).await?;
        let session_id = session.session_id;
        self.acquire_lease(&request, session_id).await?;

        let cancel = cancel.unwrap_or_default();
        let deadline = Duration::from_millis(self.config.limits.turn_deadline_ms);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.audit.record(AuditEvent::new(
                    request.tenant_id,
                    session_id,
                    None,
                    "cancelled",
                    serde_json::json!({}),
                ));
                Err(EngineError::Internal("turn cancelled".to_string()))
            }
            run = tokio::time::timeout(deadline, self.run_pipeline(&request, &mut session)) => {
                match run {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::TurnDeadlineExceeded {
                        ms: self.config.limits.turn_deadline_ms,
                    }),
                }
            }
        };

        if let Err(e) = self
            .session_store
            .release_lease(request.tenant_id, session_id)
            .await
        {
            warn!(error = %e, "lease release failed");
        }

        match outcome {
            Ok(result) => {
                if let Some(key) = &request.idempotency_key {
                    self.idempotency
                        .insert(key.clone(), (Instant::now(), result.clone()));
                }
                histogram!(crate::observe::metric::REQUEST_LATENCY)
                    .record(start.elapsed().as_secs_f64() * 1000.0);
                Ok(result)
            }
            Err(e) => {
                counter!(crate::observe::metric::ERRORS, "type" => e.code()).increment(1);
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &TurnRequest,
        session: &mut Session,
    ) -> Result<AlignmentResult, EngineError> {
        let start = Instant::now();
        let turn_id = TurnId::new();
        let turn_number = session.turn_count + 1;
        let mut timings: Vec<PipelineTiming> = Vec::new();

        // Phase 1: resolve runtime config, layered platform <- tenant <-
        // agent <- channel <- scenario <- step and cached on that full key.
        let phase = Instant::now();
        let agent = self
            .config_store
            .get_agent(request.tenant_id, request.agent_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::AgentNotFound {
                id: request.agent_id.to_string(),
            })?;
        let primary_instance = session.running_instances().next();
        let resolved = self
            .config_resolver
            .resolve(ConfigContext {
                tenant_id: request.tenant_id,
                agent_id: request.agent_id,
                channel: Some(request.channel),
                scenario_id: primary_instance.map(|i| i.scenario_id),
                step_id: primary_instance.map(|i| i.current_step_id),
            })
            .await
            .map_err(internal)?;
        let field_definitions = self
            .config_store
            .get_field_definitions(request.tenant_id, request.agent_id, true)
            .await
            .map_err(internal)?;
        let glossary = self
            .config_store
            .get_glossary(request.tenant_id, request.agent_id)
            .await
            .map_err(internal)?;
        push_timing(&mut timings, "resolve_config", phase, None);

        // Customer profile for this channel identity; status-aware read runs
        // the expiry sweep first.
        let mut profile = self
            .customer_store
            .get_or_create(request.tenant_id, request.channel, &request.user_channel_id)
            .await
            .map_err(internal)?;
        session.customer_profile_id = Some(profile.id);
        let _ = self
            .customer_store
            .expire_stale_fields(request.tenant_id, Some(profile.id))
            .await;

        // Phase 2: JIT migration reconciliation.
        let phase = Instant::now();
        let reconciliation = self
            .reconciler
            .reconcile(session, Some(&profile), &request.message)
            .await
            .map_err(internal)?;
        push_timing_maybe_skipped(
            &mut timings,
            "jit_migration",
            phase,
            reconciliation.is_none(),
        );

        // Phase 3: situation sensor.
        let phase = Instant::now();
        let history = self.load_history(request.tenant_id, session.session_id).await;
        let previous_intent = session
            .variables
            .get("previous_intent")
            .map(|v| v.to_string());
        let mut snapshot = if self.config.pipeline.situation_sensor.llm.enabled {
            self.sensor
                .sense(
                    &request.message,
                    &history,
                    Some(&profile),
                    &field_definitions,
                    &glossary,
                    previous_intent.as_deref(),
                )
                .await
        } else {
            SituationSnapshot::degraded(&request.message, previous_intent.clone())
        };
        push_timing(&mut timings, "situation_sensor", phase, None);

        // Phase 4: retrieval: rules and scenarios concurrently.
        let phase = Instant::now();
        snapshot.embedding = self
            .embedding_provider
            .embed_single(&request.message)
            .await
            .ok();
        let fire_state = RuleFireState {
            fired_counts: session.rule_fires.clone(),
            last_fired_turns: session.rule_last_fire_turn.clone(),
            current_turn: turn_number,
        };
        let active_scenario_ids: Vec<Uuid> = session
            .running_instances()
            .map(|i| i.scenario_id)
            .collect();
        let active_step_ids: Vec<Uuid> = session
            .running_instances()
            .map(|i| i.current_step_id)
            .collect();
        let (retrieval, scenario_candidates) = tokio::join!(
            self.rule_retriever.retrieve(
                request.tenant_id,
                request.agent_id,
                &request.message,
                snapshot.embedding.as_deref(),
                &active_scenario_ids,
                &active_step_ids,
                &fire_state,
            ),
            self.scenario_retriever.retrieve(
                request.tenant_id,
                request.agent_id,
                &request.message,
                snapshot.embedding.as_deref(),
            )
        );
        push_timing(
            &mut timings,
            "retrieval",
            phase,
            retrieval.degraded.then(|| "retrieval degraded".to_string()),
        );

        // Phase 5a: deterministic scope pre-filter.
        let phase = Instant::now();
        let scenario_set: HashSet<Uuid> = active_scenario_ids.iter().copied().collect();
        let step_set: HashSet<Uuid> = active_step_ids.iter().copied().collect();
        let prefiltered =
            self.prefilter
                .filter(retrieval.rules, &scenario_set, &step_set, &fire_state);
        push_timing(&mut timings, "rule_prefilter", phase, None);

        // Phase 5b: LLM ternary filter.
        let phase = Instant::now();
        let filter_result = if self.config.pipeline.rule_filtering.llm.enabled {
            self.rule_filter.filter(&snapshot, prefiltered).await
        } else {
            keel_align::types::RuleFilterResult::default()
        };
        counter!(crate::observe::metric::RULES_MATCHED)
            .increment(filter_result.matched_rules.len() as u64);
        push_timing(&mut timings, "rule_filtering", phase, None);

        // Phase 6: scenario orchestration.
        let phase = Instant::now();
        let scenario_result: ScenarioResult = self
            .orchestrator
            .orchestrate(session, &snapshot, &scenario_candidates, Some(&profile))
            .await
            .map_err(internal)?;
        push_timing(&mut timings, "scenario_orchestration", phase, None);

        // Phase 7: customer-data reconciliation: candidate variable writes,
        // then HARD-requirement evaluation per contributing step.
        let phase = Instant::now();
        self.apply_candidate_variables(request, &snapshot, &profile, &field_definitions)
            .await;
        // Re-read: the writes above change ACTIVE state.
        if let Ok(Some(fresh)) = self
            .customer_store
            .get_by_id(request.tenant_id, profile.id, false)
            .await
        {
            profile = fresh;
        }
        let missing = self
            .evaluate_missing_fields(request, &profile, &scenario_result, &field_definitions)
            .await
            .map_err(internal)?;
        push_timing(&mut timings, "customer_data", phase, None);

        // Phase 8: planning.
        let phase = Instant::now();
        let plan = self
            .planner
            .plan(
                request.tenant_id,
                &snapshot,
                &filter_result.matched_rules,
                &scenario_result,
                reconciliation.as_ref(),
                &missing,
            )
            .await
            .map_err(internal)?;
        push_timing(&mut timings, "planner", phase, None);

        // Phase 9: BEFORE_STEP tools.
        let phase = Instant::now();
        let collector = ToolBindingCollector::new(self.tool_executor.as_ref());
        let tool_results = collector
            .run(&plan.tools_to_execute, ToolTiming::BeforeStep)
            .await;
        push_timing_maybe_skipped(
            &mut timings,
            "tools_before",
            phase,
            plan.tools_to_execute.is_empty(),
        );

        // Phase 10: generation.
        let phase = Instant::now();
        let fallback_templates = self
            .config_store
            .get_templates(request.tenant_id, request.agent_id)
            .await
            .map_err(internal)?
            .into_iter()
            .filter(|t| t.mode == TemplateMode::Fallback)
            .collect::<Vec<_>>();
        let generation = self
            .generator
            .generate(
                &agent,
                &plan,
                &request.message,
                &history,
                &tool_results,
                &session.variables,
                &fallback_templates,
                &resolved,
            )
            .await;
        record_token_metrics(&generation.model, generation.tokens_in, generation.tokens_out);
        push_timing(&mut timings, "generation", phase, None);

        // Phase 11: enforcement (may regenerate once).
        let phase = Instant::now();
        let enforcement = self
            .enforcer
            .enforce(
                request.tenant_id,
                &agent,
                &plan,
                generation,
                &self.generator,
                &request.message,
                &history,
                &tool_results,
                &session.variables,
                &resolved,
            )
            .await;
        push_timing(&mut timings, "enforcement", phase, None);

        // Phase 12: AFTER_STEP tools.
        let phase = Instant::now();
        let after_bindings: Vec<_> = plan
            .contributions
            .iter()
            .flat_map(|c| c.suggested_tools.iter().cloned())
            .filter(|b| b.timing == ToolTiming::AfterStep)
            .collect();
        let after_results = collector.run(&after_bindings, ToolTiming::AfterStep).await;
        push_timing_maybe_skipped(&mut timings, "tools_after", phase, after_bindings.is_empty());

        // Phase 13: persist.
        let phase = Instant::now();
        for matched in &filter_result.matched_rules {
            session.record_rule_fire(matched.rule.id, turn_number);
        }
        if let Some(label) = snapshot
            .new_intent_label
            .as_ref()
            .or(snapshot.previous_intent_label.as_ref())
        {
            session
                .variables
                .insert("previous_intent".to_string(), FieldValue::Str(label.clone()));
        }
        session.turn_count = turn_number;
        session.status = SessionStatus::Active;

        let outcome = resolve_outcome(
            enforcement.blocked,
            &enforcement.generation.categories,
            plan.response_type,
            reconciliation.as_ref(),
        );

        let mut all_tool_results: HashMap<String, ToolResult> = tool_results;
        all_tool_results.extend(after_results);

        let result = AlignmentResult {
            response: enforcement.generation.text.clone(),
            session_id: session.session_id,
            turn_id,
            outcome,
            matched_rules: filter_result
                .matched_rules
                .iter()
                .map(|m| AppliedRule {
                    rule_id: m.rule.id,
                    name: m.rule.name.clone(),
                    relevance_score: m.relevance_score,
                    is_hard_constraint: m.rule.is_hard_constraint,
                })
                .collect(),
            blocking_rule_id: enforcement.blocking_rule_id,
            reconciliation: reconciliation
                .as_ref()
                .map(|r| serde_json::to_value(r).unwrap_or_default()),
            tool_results: serde_json::to_value(&all_tool_results).unwrap_or_default(),
            generation: GenerationSummary {
                model: enforcement.generation.model.clone(),
                tokens_in: enforcement.generation.tokens_in,
                tokens_out: enforcement.generation.tokens_out,
                from_template: enforcement.generation.from_template,
            },
            total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            pipeline_timings: Vec::new(),
            sensor_degraded: snapshot.sensor_degraded,
        };

        let persist_outcome = self
            .persist(request, session, &result, turn_number, &filter_result)
            .await;
        push_timing(
            &mut timings,
            "persist",
            phase,
            persist_outcome.err().map(|e| e.to_string()),
        );

        record_step_latencies(&timings);
        let mut result = result;
        result.pipeline_timings = timings;
        result.total_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        self.audit.record(AuditEvent::new(
            request.tenant_id,
            session.session_id,
            Some(turn_id),
            "turn_completed",
            serde_json::json!({
                "outcome": result.outcome,
                "matched_rules": result.matched_rules.len(),
                "total_time_ms": result.total_time_ms,
            }),
        ));

        Ok(result)
    }

    async fn persist(
        &self,
        request: &TurnRequest,
        session: &Session,
        result: &AlignmentResult,
        turn_number: u32,
        filter_result: &keel_align::types::RuleFilterResult,
    ) -> Result<(), EngineError> {
        // The response goes back to the caller even when persistence fails;
        // a persist_failed audit event flags the turn for the retry worker
        // (idempotency key: the turn id).
        let save = self.session_store.save(session.clone()).await;
        let record = self
            .turn_store
            .save(TurnRecord {
                turn_id: result.turn_id,
                tenant_id: request.tenant_id,
                session_id: session.session_id,
                turn_number,
                user_message: request.message.clone(),
                response: result.response.clone(),
                outcome: result.outcome,
                matched_rule_ids: filter_result
                    .matched_rules
                    .iter()
                    .map(|m| m.rule.id)
                    .collect(),
                created_at: chrono::Utc::now(),
            })
            .await;

        if let Some(memory) = &self.memory {
            let episode = Episode::new(
                request.tenant_id,
                session.session_id,
                Some(result.turn_id),
                &request.message,
                Some(&result.response),
            );
            // Fire-and-forget; the ingestor's own queue applies backpressure.
            let _ = memory.enqueue_episode(episode).await;
        }

        match (save, record) {
            (Ok(()), Ok(())) => Ok(()),
            (save, record) => {
                let reason = save
                    .err()
                    .map(|e| e.to_string())
                    .or(record.err())
                    .unwrap_or_default();
                self.audit.record(AuditEvent::new(
                    request.tenant_id,
                    session.session_id,
                    Some(result.turn_id),
                    "persist_failed",
                    serde_json::json!({ "reason": reason }),
                ));
                Err(EngineError::Internal(format!("persist failed: {reason}")))
            }
        }
    }

    async fn resolve_session(&self, request: &TurnRequest) -> Result<Session, EngineError> {
        if let Some(session_id) = request.session_id {
            let session = self
                .session_store
                .get(session_id)
                .await
                .map_err(session_err)?
                .ok_or(EngineError::SessionNotFound {
                    id: session_id.to_string(),
                })?;
            // A session id from another tenant is indistinguishable from a
            // missing one.
            if session.tenant_id != request.tenant_id {
                return Err(EngineError::SessionNotFound {
                    id: session_id.to_string(),
                });
            }
            return Ok(session);
        }

        if let Some(existing) = self
            .session_store
            .find_by_channel(request.tenant_id, request.channel, &request.user_channel_id)
            .await
            .map_err(session_err)?
        {
            return Ok(existing);
        }

        let agent = self
            .config_store
            .get_agent(request.tenant_id, request.agent_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::AgentNotFound {
                id: request.agent_id.to_string(),
            })?;
        let session = Session::new(
            request.tenant_id,
            request.agent_id,
            request.channel,
            &request.user_channel_id,
            agent.config_version,
        );
        counter!(crate::observe::metric::ACTIVE_SESSIONS).increment(1);
        Ok(session)
    }

    async fn acquire_lease(
        &self,
        request: &TurnRequest,
        session_id: SessionId,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.limits.turn_deadline_ms);
        loop {
            match self
                .session_store
                .acquire_lease(request.tenant_id, session_id)
                .await
            {
                Ok(()) => return Ok(()),
                Err(SessionError::Busy { id }) => match self.config.limits.busy_behavior {
                    BusyBehavior::FailFast => return Err(EngineError::SessionBusy { id }),
                    BusyBehavior::Queue => {
                        if Instant::now() >= deadline {
                            return Err(EngineError::SessionBusy { id });
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Err(e) => return Err(session_err(e)),
            }
        }
    }

    /// Sensor-proposed variable writes, validated against the field schema.
    /// Unknown fields and uncoercible values are logged and dropped.
    async fn apply_candidate_variables(
        &self,
        request: &TurnRequest,
        snapshot: &SituationSnapshot,
        profile: &CustomerProfile,
        field_definitions: &[keel_catalog::types::CustomerDataField],
    ) {
        let defs: HashMap<&str, &keel_catalog::types::CustomerDataField> = field_definitions
            .iter()
            .map(|d| (d.name.as_str(), d))
            .collect();

        for (name, candidate) in &snapshot.candidate_variables {
            let def = match defs.get(name.as_str()) {
                Some(d) => *d,
                None => {
                    warn!(field = %name, "candidate variable has no schema definition, dropping");
                    continue;
                }
            };
            if profile.has_active_field(name) && !candidate.is_update {
                continue;
            }
            let value = match FieldValue::coerce(&candidate.value, def.value_type) {
                Some(v) => v,
                None => {
                    warn!(field = %name, "candidate value does not match declared type, dropping");
                    continue;
                }
            };
            let entry = VariableEntry::new(name, value, EntrySource::Inferred);
            if let Err(e) = self
                .customer_store
                .update_field(request.tenant_id, profile.id, entry)
                .await
            {
                warn!(field = %name, error = %e, "candidate variable write failed");
            }
        }
    }

    /// HARD requirements still missing for each contributing step.
    async fn evaluate_missing_fields(
        &self,
        request: &TurnRequest,
        profile: &CustomerProfile,
        scenario_result: &ScenarioResult,
        field_definitions: &[keel_catalog::types::CustomerDataField],
    ) -> Result<Vec<String>, keel_catalog::CatalogError> {
        let defs: HashMap<String, keel_catalog::types::CustomerDataField> = field_definitions
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();

        let mut out = Vec::new();
        for contribution in &scenario_result.plan.contributions {
            let requirements = self
                .config_store
                .get_scenario_requirements(request.tenant_id, contribution.scenario_id, None)
                .await?;
            let relevant: Vec<_> = requirements
                .into_iter()
                .filter(|r| {
                    r.step_id.is_none() || r.step_id == Some(contribution.current_step_id)
                })
                .collect();
            for requirement in missing_fields(
                profile,
                &relevant,
                &defs,
                Some(RequiredLevel::Hard),
                chrono::Utc::now(),
            ) {
                if !out.contains(&requirement.field_name) {
                    out.push(requirement.field_name);
                }
            }
        }
        Ok(out)
    }

    async fn load_history(&self, tenant_id: TenantId, session_id: SessionId) -> Vec<HistoryTurn> {
        let records = self
            .turn_store
            .list(
                tenant_id,
                session_id,
                self.config.pipeline.situation_sensor.history_turns,
                0,
                TurnSort::Desc,
            )
            .await
            .unwrap_or_default();
        let mut turns = Vec::with_capacity(records.len() * 2);
        for record in records.iter().rev() {
            turns.push(HistoryTurn {
                role: "user".to_string(),
                content: record.user_message.clone(),
            });
            turns.push(HistoryTurn {
                role: "assistant".to_string(),
                content: record.response.clone(),
            });
        }
        turns
    }

    // -- session API ---------------------------------------------------------

    pub async fn get_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<Session, EngineError> {
        let session = self
            .session_store
            .get(session_id)
            .await
            .map_err(session_err)?
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or(EngineError::SessionNotFound {
                id: session_id.to_string(),
            })?;
        Ok(session)
    }

    pub async fn delete_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<(), EngineError> {
        // Ownership check first; delete by id is tenant-blind at store level.
        self.get_session(tenant_id, session_id).await?;
        self.session_store
            .delete(session_id)
            .await
            .map_err(session_err)?;
        Ok(())
    }

    pub async fn list_turns(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        limit: usize,
        offset: usize,
        ascending: bool,
    ) -> Result<Vec<TurnRecord>, EngineError> {
        if limit > 100 {
            return Err(EngineError::InvalidRequest(
                "limit must be <= 100".to_string(),
            ));
        }
        self.turn_store
            .list(
                tenant_id,
                session_id,
                limit,
                offset,
                if ascending { TurnSort::Asc } else { TurnSort::Desc },
            )
            .await
            .map_err(EngineError::Internal)
    }
}

fn internal<E: std::fmt::Display>(e: E) -> EngineError {
    EngineError::Internal(e.to_string())
}

fn session_err(e: SessionError) -> EngineError {
    match e {
        SessionError::NotFound { id } => EngineError::SessionNotFound { id },
        SessionError::Busy { id } => EngineError::SessionBusy { id },
        other => EngineError::Internal(other.to_string()),
    }
}

fn push_timing(
    timings: &mut Vec<PipelineTiming>,
    step: &'static str,
    started: Instant,
    error: Option<String>,
) {
    timings.push(PipelineTiming {
        step,
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        skipped: false,
        error,
    });
}

fn push_timing_maybe_skipped(
    timings: &mut Vec<PipelineTiming>,
    step: &'static str,
    started: Instant,
    skipped: bool,
) {
    timings.push(PipelineTiming {
        step,
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        skipped,
        error: None,
    });
}

fn record_step_latencies(timings: &[PipelineTiming]) {
    for t in timings {
        histogram!(crate::observe::metric::PIPELINE_STEP_LATENCY, "step" => t.step)
            .record(t.duration_ms);
    }
}

fn record_token_metrics(model: &Option<String>, tokens_in: u32, tokens_out: u32) {
    let model = model.clone().unwrap_or_else(|| "none".to_string());
    counter!(crate::observe::metric::LLM_TOKENS, "model" => model.clone(), "direction" => "in")
        .increment(tokens_in as u64);
    counter!(crate::observe::metric::LLM_TOKENS, "model" => model, "direction" => "out")
        .increment(tokens_out as u64);
}
