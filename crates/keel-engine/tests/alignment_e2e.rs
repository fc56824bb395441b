//! End-to-end turn processing against in-memory stores and mock providers.

use std::sync::Arc;

use keel_align::tools::NullToolExecutor;
use keel_catalog::inmemory::InMemoryAgentConfigStore;
use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{
    Agent, Rule, Scenario, ScenarioStep, StepTransition, Template, TemplateMode,
};
use keel_core::config::EngineConfig;
use keel_core::{AgentId, Channel, EngineError, TenantId};
use keel_customer::inmemory::InMemoryCustomerDataStore;
use keel_engine::{AlignmentEngine, EngineDeps, TurnRequest, TurnResolution};
use keel_llm::mock::MockLlmProvider;
use keel_llm::{EmbeddingProvider, MockEmbeddingProvider};
use keel_memory::ingest::MemoryIngestor;
use keel_memory::store::InMemoryMemoryStore;
use keel_migrate::planner::{MigrationDeployer, MigrationPlanner};
use keel_sessions::inmemory::InMemorySessionStore;
use keel_sessions::store::SessionStore;
use uuid::Uuid;

struct World {
    engine: AlignmentEngine,
    llm: Arc<MockLlmProvider>,
    embeddings: Arc<MockEmbeddingProvider>,
    config_store: Arc<InMemoryAgentConfigStore>,
    session_store: Arc<InMemorySessionStore>,
    tenant: TenantId,
    agent_id: AgentId,
}

async fn world() -> World {
    let config_store = Arc::new(InMemoryAgentConfigStore::new());
    let session_store = Arc::new(InMemorySessionStore::new());
    let customer_store = Arc::new(InMemoryCustomerDataStore::new());
    let llm = Arc::new(MockLlmProvider::new("Happy to help."));
    let embeddings = Arc::new(MockEmbeddingProvider::new(64));
    let memory_store = Arc::new(InMemoryMemoryStore::new());

    let tenant = TenantId::new();
    let agent = Agent::new(tenant, "support", "primary", "You are a support agent.");
    let agent_id = agent.id;
    config_store.save_agent(agent).await.unwrap();

    // Mock embeddings carry no semantic signal, so candidate scores hover
    // near zero; drop the score floor so retrieval stays inclusive.
    let mut config = EngineConfig::default();
    config.selection.min_score = 0.0;

    let engine = AlignmentEngine::new(EngineDeps {
        config_store: config_store.clone(),
        session_store: session_store.clone(),
        customer_store,
        turn_store: Arc::new(keel_engine::InMemoryTurnStore::new()),
        llm_provider: llm.clone(),
        embedding_provider: embeddings.clone(),
        tool_executor: Arc::new(NullToolExecutor),
        reranker: None,
        memory: Some(Arc::new(MemoryIngestor::spawn(memory_store, 64))),
        audit: None,
        config,
    })
    .unwrap();

    World {
        engine,
        llm,
        embeddings,
        config_store,
        session_store,
        tenant,
        agent_id,
    }
}

fn request(w: &World, message: &str) -> TurnRequest {
    TurnRequest {
        tenant_id: w.tenant,
        agent_id: w.agent_id,
        session_id: None,
        channel: Channel::Webchat,
        user_channel_id: "user-1".to_string(),
        message: message.to_string(),
        metadata: None,
        idempotency_key: None,
    }
}

const SENSOR_NEUTRAL: &str = r#"{"language": "en", "sentiment": "neutral", "urgency": "normal", "scenario_signal": "UNKNOWN", "intent_changed": false, "topic_changed": false, "tone": "neutral"}"#;

#[tokio::test]
async fn greeting_turn_runs_every_phase() {
    let w = world().await;
    w.llm.push_response(SENSOR_NEUTRAL);
    w.llm.push_response("Hello! How can I help you today?");

    let result = w
        .engine
        .process_turn(request(&w, "Hello! How are you?"), None)
        .await
        .unwrap();

    assert!(!result.response.is_empty());
    assert!(result.total_time_ms >= 0.0);
    assert_eq!(result.outcome, TurnResolution::Answered);

    let steps: Vec<&str> = result.pipeline_timings.iter().map(|t| t.step).collect();
    for expected in [
        "resolve_config",
        "situation_sensor",
        "retrieval",
        "rule_prefilter",
        "rule_filtering",
        "scenario_orchestration",
        "customer_data",
        "planner",
        "generation",
        "enforcement",
        "persist",
    ] {
        assert!(steps.contains(&expected), "missing phase {expected}");
    }
}

#[tokio::test]
async fn multi_turn_conversation_updates_the_session() {
    let w = world().await;

    let mut session_id = None;
    for message in ["Hi there!", "I need help with my order", "It is ORD-12345"] {
        let mut req = request(&w, message);
        req.session_id = session_id;
        let result = w.engine.process_turn(req, None).await.unwrap();
        session_id = Some(result.session_id);
    }

    let session = w
        .engine
        .get_session(w.tenant, session_id.unwrap())
        .await
        .unwrap();
    assert_eq!(session.turn_count, 3);

    let turns = w
        .engine
        .list_turns(w.tenant, session.session_id, 10, 0, true)
        .await
        .unwrap();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].turn_number, 1);
    assert_eq!(turns[2].user_message, "It is ORD-12345");
}

#[tokio::test]
async fn ternary_filter_excludes_not_related_rules() {
    let w = world().await;

    let mut balance = Rule::new(
        w.tenant,
        w.agent_id,
        "balance",
        "User asks about their account balance",
        "Provide the balance",
    );
    balance.condition_embedding = Some(
        w.embeddings
            .embed_single("User asks about their account balance")
            .await
            .unwrap(),
    );
    let balance_id = balance.id;
    let mut transfer = Rule::new(
        w.tenant,
        w.agent_id,
        "transfer",
        "User wants to transfer funds",
        "Walk through a transfer",
    );
    transfer.condition_embedding = Some(
        w.embeddings
            .embed_single("User wants to transfer funds")
            .await
            .unwrap(),
    );
    let transfer_id = transfer.id;
    w.config_store.save_rule(balance).await.unwrap();
    w.config_store.save_rule(transfer).await.unwrap();

    w.llm.push_response(SENSOR_NEUTRAL);
    // The filter sees both rules in one batch; the order inside the batch is
    // retrieval-score order, but matching is by rule_id so order is free.
    w.llm.push_response(format!(
        r#"{{"evaluations": [
            {{"rule_id": "{balance_id}", "applicability": "APPLIES", "confidence": 0.9, "relevance": 0.85, "reasoning": "balance request"}},
            {{"rule_id": "{transfer_id}", "applicability": "NOT_RELATED", "confidence": 0.95, "relevance": 0.05, "reasoning": "no transfer"}}
        ]}}"#
    ));
    w.llm.push_response("Your balance is available in the app.");

    let result = w
        .engine
        .process_turn(request(&w, "check my balance"), None)
        .await
        .unwrap();

    assert_eq!(result.matched_rules.len(), 1);
    assert_eq!(result.matched_rules[0].rule_id, balance_id);
    assert!((result.matched_rules[0].relevance_score - 0.85).abs() < 1e-9);
}

#[tokio::test]
async fn hard_constraint_violation_blocks_with_fallback_template() {
    let w = world().await;

    let fallback = Template::new(
        w.tenant,
        w.agent_id,
        "polite",
        "I'm here to help — could you rephrase?",
        TemplateMode::Fallback,
    );
    let fallback_id = fallback.id;
    w.config_store.save_template(fallback).await.unwrap();

    let mut no_profanity = Rule::new(
        w.tenant,
        w.agent_id,
        "no profanity",
        "Any message",
        "Never use profanity in responses.",
    );
    no_profanity.is_hard_constraint = true;
    no_profanity.enforcement_expression = Some("not (response contains \"damn\")".to_string());
    no_profanity.attached_template_ids = vec![fallback_id];
    no_profanity.condition_embedding =
        Some(w.embeddings.embed_single("Any message").await.unwrap());
    let rule_id = no_profanity.id;
    w.config_store.save_rule(no_profanity).await.unwrap();

    w.llm.push_response(SENSOR_NEUTRAL);
    w.llm.push_response(format!(
        r#"{{"evaluations": [{{"rule_id": "{rule_id}", "applicability": "APPLIES", "confidence": 0.95, "relevance": 0.9, "reasoning": "always applies"}}]}}"#
    ));
    // Generation and the constrained regeneration both violate.
    w.llm.push_response("damn, that is broken");
    w.llm.push_response("still damn broken");

    let result = w
        .engine
        .process_turn(request(&w, "my order is late"), None)
        .await
        .unwrap();

    assert_eq!(result.outcome, TurnResolution::Blocked);
    assert_eq!(result.blocking_rule_id, Some(rule_id));
    assert_eq!(result.response, "I'm here to help — could you rephrase?");
    assert!(result.matched_rules.iter().any(|r| r.rule_id == rule_id));
}

#[tokio::test]
async fn second_turn_on_a_leased_session_fails_fast() {
    let w = world().await;

    // Seed a session, then hold its lease as a concurrent turn would.
    let first = w.engine.process_turn(request(&w, "hello"), None).await.unwrap();
    w.session_store
        .acquire_lease(w.tenant, first.session_id)
        .await
        .unwrap();

    let mut req = request(&w, "second message");
    req.session_id = Some(first.session_id);
    let err = w.engine.process_turn(req, None).await.unwrap_err();
    assert!(matches!(err, EngineError::SessionBusy { .. }));
    assert_eq!(err.http_status(), 409);

    // Session state is untouched by the rejected turn.
    w.session_store
        .release_lease(w.tenant, first.session_id)
        .await
        .unwrap();
    let session = w.engine.get_session(w.tenant, first.session_id).await.unwrap();
    assert_eq!(session.turn_count, 1);
}

#[tokio::test]
async fn idempotency_key_replays_the_same_result() {
    let w = world().await;

    let mut req = request(&w, "what are your hours?");
    req.idempotency_key = Some("idem-123".to_string());

    let first = w.engine.process_turn(req.clone(), None).await.unwrap();
    let second = w.engine.process_turn(req, None).await.unwrap();

    assert_eq!(first.turn_id, second.turn_id);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    // The replay did not process a second turn.
    let session = w.engine.get_session(w.tenant, first.session_id).await.unwrap();
    assert_eq!(session.turn_count, 1);
}

#[tokio::test]
async fn message_length_bounds_are_enforced() {
    let w = world().await;

    let empty = w.engine.process_turn(request(&w, ""), None).await.unwrap_err();
    assert_eq!(empty.code(), "INVALID_REQUEST");

    let oversized = "x".repeat(10_001);
    let too_long = w
        .engine
        .process_turn(request(&w, &oversized), None)
        .await
        .unwrap_err();
    assert_eq!(too_long.http_status(), 400);
}

#[tokio::test]
async fn pending_migration_teleports_on_next_turn() {
    let w = world().await;

    // V1: A -> B with a session standing on A.
    let mut a1 = ScenarioStep::new(Uuid::now_v7(), "Step A");
    let b1 = ScenarioStep::new(Uuid::now_v7(), "Step B");
    a1.transitions.push(StepTransition::new(b1.id, "next"));
    let mut v1 = Scenario::new(w.tenant, w.agent_id, "Flow", vec![a1, b1]).unwrap();
    for st in &mut v1.steps {
        st.scenario_id = v1.id;
    }
    v1.entry_condition_text = Some("user needs the flow".into());
    v1.entry_embedding = Some(w.embeddings.embed_single("user needs the flow").await.unwrap());
    w.config_store.save_scenario(v1.clone()).await.unwrap();

    // First turn: the scenario starts and the session lands on Step A.
    w.llm.push_response(SENSOR_NEUTRAL);
    let first = w
        .engine
        .process_turn(request(&w, "user needs the flow"), None)
        .await
        .unwrap();
    let session = w.engine.get_session(w.tenant, first.session_id).await.unwrap();
    assert_eq!(session.active_scenarios.len(), 1);

    // V2: A -> C. Plan, approve, deploy.
    let mut a2 = ScenarioStep::new(Uuid::now_v7(), "Step A");
    let c2 = ScenarioStep::new(Uuid::now_v7(), "Step C");
    a2.transitions.push(StepTransition::new(c2.id, "next"));
    let a2_id = a2.id;
    let mut v2 = Scenario::new(w.tenant, w.agent_id, "Flow", vec![a2, c2]).unwrap();
    v2.id = v1.id;
    v2.version = 2;
    for st in &mut v2.steps {
        st.scenario_id = v2.id;
    }

    let planner = MigrationPlanner::new(w.config_store.clone(), w.session_store.clone());
    let plan = planner.generate_plan(w.tenant, v1.id, &v2).await.unwrap();
    planner.approve_plan(w.tenant, plan.id).await.unwrap();
    MigrationDeployer::new(w.config_store.clone(), w.session_store.clone())
        .deploy(w.tenant, plan.id, v2)
        .await
        .unwrap();

    let marked = w.engine.get_session(w.tenant, first.session_id).await.unwrap();
    assert!(marked.pending_migration.is_some());

    // Next turn with any message: JIT reconciliation teleports and clears.
    w.llm.push_response(SENSOR_NEUTRAL);
    let mut req = request(&w, "hello again");
    req.session_id = Some(first.session_id);
    let result = w.engine.process_turn(req, None).await.unwrap();
    assert!(result.reconciliation.is_some());

    let migrated = w.engine.get_session(w.tenant, first.session_id).await.unwrap();
    assert!(migrated.pending_migration.is_none());
    let instance = &migrated.active_scenarios[0];
    assert_eq!(instance.scenario_version, 2);
    assert_eq!(instance.current_step_id, a2_id);
}

#[tokio::test]
async fn unknown_agent_is_a_404() {
    let w = world().await;
    let mut req = request(&w, "hi");
    req.agent_id = AgentId::new();
    let err = w.engine.process_turn(req, None).await.unwrap_err();
    assert_eq!(err.code(), "AGENT_NOT_FOUND");
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn streaming_emits_tokens_then_done() {
    use keel_engine::TurnStreamEvent;
    let w = world().await;
    w.llm.push_response(SENSOR_NEUTRAL);
    w.llm
        .push_response("A long enough response to be split into several chunks for streaming.");

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    w.engine
        .process_turn_stream(request(&w, "tell me something"), tx, None)
        .await;

    let mut text = String::new();
    let mut done = false;
    while let Some(event) = rx.recv().await {
        match event {
            TurnStreamEvent::Token { content } => text.push_str(&content),
            TurnStreamEvent::Done { .. } => {
                done = true;
            }
            TurnStreamEvent::Error { code, message } => {
                panic!("unexpected stream error {code}: {message}")
            }
        }
    }
    assert!(done);
    assert_eq!(
        text,
        "A long enough response to be split into several chunks for streaming."
    );
}
