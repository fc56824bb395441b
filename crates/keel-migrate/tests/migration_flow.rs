//! End-to-end migration flows: plan → approve → deploy → JIT reconcile.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use keel_catalog::inmemory::InMemoryAgentConfigStore;
use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{Scenario, ScenarioStep, StepTransition};
use keel_core::{AgentId, Channel, FieldValue, TenantId};
use keel_customer::inmemory::InMemoryCustomerDataStore;
use keel_customer::store::CustomerDataStore;
use keel_customer::types::{EntrySource, VariableEntry};
use keel_llm::MockEmbeddingProvider;
use keel_migrate::hash::node_content_hash;
use keel_migrate::planner::{MigrationDeployer, MigrationPlanner};
use keel_migrate::reconcile::{JitReconciler, ReconciliationAction};
use keel_sessions::inmemory::InMemorySessionStore;
use keel_sessions::store::SessionStore;
use keel_sessions::types::{ScenarioInstance, Session, StepVisit};

fn step(name: &str) -> ScenarioStep {
    ScenarioStep::new(Uuid::now_v7(), name)
}

fn collect_step(name: &str, fields: &[&str]) -> ScenarioStep {
    let mut s = step(name);
    s.collects_profile_fields = fields.iter().map(|f| f.to_string()).collect();
    s
}

fn scenario(tenant: TenantId, agent: AgentId, version: u32, steps: Vec<ScenarioStep>) -> Scenario {
    let mut s = Scenario::new(tenant, agent, "Support Flow", steps).unwrap();
    s.version = version;
    for st in &mut s.steps {
        st.scenario_id = s.id;
    }
    s
}

fn session_on(tenant: TenantId, agent: AgentId, scenario: &Scenario, step: &ScenarioStep) -> Session {
    let mut session = Session::new(tenant, agent, Channel::Webchat, "user-1", 1);
    session
        .active_scenarios
        .push(ScenarioInstance::start(scenario.id, scenario.version, step.id));
    session.step_history.push(StepVisit {
        step_id: step.id,
        step_name: Some(step.name.clone()),
        entered_at: Utc::now(),
        turn_number: 1,
        transition_reason: None,
        confidence: 1.0,
        is_checkpoint: false,
        checkpoint_description: None,
        step_content_hash: Some(node_content_hash(step)),
    });
    session
}

struct Harness {
    config_store: Arc<InMemoryAgentConfigStore>,
    session_store: Arc<InMemorySessionStore>,
    customer_store: Arc<InMemoryCustomerDataStore>,
    reconciler: JitReconciler,
    tenant: TenantId,
    agent: AgentId,
}

fn harness() -> Harness {
    let config_store = Arc::new(InMemoryAgentConfigStore::new());
    let session_store = Arc::new(InMemorySessionStore::new());
    let customer_store = Arc::new(InMemoryCustomerDataStore::new());
    let reconciler = JitReconciler::new(
        config_store.clone(),
        Arc::new(MockEmbeddingProvider::new(64)),
        0.55,
    );
    Harness {
        config_store,
        session_store,
        customer_store,
        reconciler,
        tenant: TenantId::new(),
        agent: AgentId::new(),
    }
}

#[tokio::test]
async fn clean_graft_teleports_and_clears_the_marker() {
    let h = harness();

    // V1: A -> B, session at A.
    let mut a1 = step("Step A");
    let b1 = step("Step B");
    a1.transitions.push(StepTransition::new(b1.id, "next"));
    let v1 = scenario(h.tenant, h.agent, 1, vec![a1, b1]);
    h.config_store.save_scenario(v1.clone()).await.unwrap();

    let session = session_on(h.tenant, h.agent, &v1, &v1.steps[0]);
    let session_id = session.session_id;
    h.session_store.save(session).await.unwrap();

    // V2: A -> C (A unchanged, B removed, C new).
    let mut a2 = step("Step A");
    let c2 = step("Step C");
    a2.transitions.push(StepTransition::new(c2.id, "next"));
    let a2_id = a2.id;
    let mut v2 = scenario(h.tenant, h.agent, 2, vec![a2, c2]);
    v2.id = v1.id;
    for st in &mut v2.steps {
        st.scenario_id = v2.id;
    }

    let planner = MigrationPlanner::new(h.config_store.clone(), h.session_store.clone());
    let plan = planner.generate_plan(h.tenant, v1.id, &v2).await.unwrap();
    assert_eq!(plan.transformation_map.deleted_nodes.len(), 1);
    assert_eq!(plan.transformation_map.new_node_ids.len(), 1);

    planner.approve_plan(h.tenant, plan.id).await.unwrap();
    let deployer = MigrationDeployer::new(h.config_store.clone(), h.session_store.clone());
    deployer.deploy(h.tenant, plan.id, v2).await.unwrap();

    let mut session = h.session_store.get(session_id).await.unwrap().unwrap();
    assert!(session.pending_migration.is_some());

    // Next turn with any message: teleport onto v2's Step A.
    let result = h
        .reconciler
        .reconcile(&mut session, None, "hello")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.action, ReconciliationAction::Teleport);
    assert_eq!(result.to_step, Some(a2_id));
    assert!(session.pending_migration.is_none());
    let instance = &session.active_scenarios[0];
    assert_eq!(instance.current_step_id, a2_id);
    assert_eq!(instance.scenario_version, 2);
    let last_visit = session.step_history.last().unwrap();
    assert_eq!(last_visit.transition_reason.as_deref(), Some("migration"));
}

#[tokio::test]
async fn gap_fill_collects_then_teleports_once_data_lands() {
    let h = harness();

    // V1: lone Step A.
    let v1 = scenario(h.tenant, h.agent, 1, vec![step("Step A")]);
    h.config_store.save_scenario(v1.clone()).await.unwrap();

    let session = session_on(h.tenant, h.agent, &v1, &v1.steps[0]);
    let session_id = session.session_id;
    h.session_store.save(session).await.unwrap();

    // Customer without a phone number.
    let profile = h
        .customer_store
        .get_or_create(h.tenant, Channel::Webchat, "user-1")
        .await
        .unwrap();

    // V2: CollectPhone(collects=[phone_number]) -> A.
    let a2 = step("Step A");
    let a2_id = a2.id;
    let mut collect = collect_step("Collect Phone", &["phone_number"]);
    collect.transitions.push(StepTransition::new(a2_id, "after phone"));
    let mut v2 = scenario(h.tenant, h.agent, 2, vec![collect, a2]);
    v2.id = v1.id;
    for st in &mut v2.steps {
        st.scenario_id = v2.id;
    }

    let planner = MigrationPlanner::new(h.config_store.clone(), h.session_store.clone());
    let plan = planner.generate_plan(h.tenant, v1.id, &v2).await.unwrap();
    planner.approve_plan(h.tenant, plan.id).await.unwrap();
    MigrationDeployer::new(h.config_store.clone(), h.session_store.clone())
        .deploy(h.tenant, plan.id, v2)
        .await
        .unwrap();

    let mut session = h.session_store.get(session_id).await.unwrap().unwrap();

    // First turn: COLLECT, marker kept.
    let result = h
        .reconciler
        .reconcile(&mut session, Some(&profile), "hello")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.action, ReconciliationAction::Collect);
    assert_eq!(result.collect_fields, vec!["phone_number"]);
    assert!(session.pending_migration.is_some());

    // The user supplies a phone number; it is stored ACTIVE.
    h.customer_store
        .update_field(
            h.tenant,
            profile.id,
            VariableEntry::new(
                "phone_number",
                FieldValue::Str("+15550100".into()),
                EntrySource::UserProvided,
            ),
        )
        .await
        .unwrap();
    let profile = h
        .customer_store
        .get_by_id(h.tenant, profile.id, false)
        .await
        .unwrap()
        .unwrap();

    // Subsequent turn: TELEPORT to v2's Step A, marker cleared.
    let result = h
        .reconciler
        .reconcile(&mut session, Some(&profile), "+1 555 0100")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.action, ReconciliationAction::Teleport);
    assert_eq!(result.to_step, Some(a2_id));
    assert!(session.pending_migration.is_none());
    assert_eq!(session.active_scenarios[0].scenario_version, 2);
}

#[tokio::test]
async fn version_drift_without_marker_relocalizes_by_hash() {
    let h = harness();

    let v1 = scenario(h.tenant, h.agent, 1, vec![step("Step A")]);
    h.config_store.save_scenario(v1.clone()).await.unwrap();
    let session = session_on(h.tenant, h.agent, &v1, &v1.steps[0]);
    let session_id = session.session_id;
    h.session_store.save(session).await.unwrap();

    // V2 saved directly, no plan, same Step A content.
    let a2 = step("Step A");
    let a2_id = a2.id;
    let mut v2 = scenario(h.tenant, h.agent, 2, vec![a2]);
    v2.id = v1.id;
    for st in &mut v2.steps {
        st.scenario_id = v2.id;
    }
    h.config_store.save_scenario(v2).await.unwrap();

    let mut session = h.session_store.get(session_id).await.unwrap().unwrap();
    let result = h
        .reconciler
        .reconcile(&mut session, None, "hello")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.action, ReconciliationAction::Relocalize);
    assert_eq!(session.active_scenarios[0].current_step_id, a2_id);
    assert_eq!(session.active_scenarios[0].scenario_version, 2);
    assert_eq!(session.relocalization_count, 1);
}

#[tokio::test]
async fn drift_with_no_matching_step_escalates() {
    let h = harness();

    let v1 = scenario(h.tenant, h.agent, 1, vec![step("Step A")]);
    h.config_store.save_scenario(v1.clone()).await.unwrap();
    let session = session_on(h.tenant, h.agent, &v1, &v1.steps[0]);
    let session_id = session.session_id;
    h.session_store.save(session).await.unwrap();

    // V2 replaces everything.
    let mut v2 = scenario(h.tenant, h.agent, 2, vec![step("Completely Different")]);
    v2.id = v1.id;
    h.config_store.save_scenario(v2).await.unwrap();

    let mut session = h.session_store.get(session_id).await.unwrap().unwrap();
    let result = h
        .reconciler
        .reconcile(&mut session, None, "hello")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.action, ReconciliationAction::Escalate);
    // Session stays where it was.
    assert_eq!(session.active_scenarios[0].scenario_version, 1);
}
