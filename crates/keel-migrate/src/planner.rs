//! Migration plan lifecycle: generate → approve/reject → deploy.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{MigrationPlan, MigrationPlanStatus, Scenario, ScopeFilter};
use keel_core::TenantId;
use keel_sessions::store::{SessionStore, StepHashQuery};
use keel_sessions::types::PendingMigration;

use crate::diff::compute_transformation_map;
use crate::error::{MigrationError, Result};
use crate::hash::scenario_checksum;

/// Plan-time impact estimate, one row per anchor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationSummary {
    pub plan_id: Uuid,
    pub anchor_count: usize,
    pub deleted_count: usize,
    pub new_count: usize,
    /// anchor hash -> affected session estimate at plan time.
    pub affected_sessions: BTreeMap<String, usize>,
}

pub struct MigrationPlanner {
    config_store: Arc<dyn AgentConfigStore>,
    session_store: Arc<dyn SessionStore>,
}

impl MigrationPlanner {
    pub fn new(config_store: Arc<dyn AgentConfigStore>, session_store: Arc<dyn SessionStore>) -> Self {
        Self {
            config_store,
            session_store,
        }
    }

    /// Diff the live scenario against the proposed new version and persist a
    /// PENDING plan.
    #[instrument(skip(self, v_new), fields(tenant = %tenant_id, scenario = %scenario_id))]
    pub async fn generate_plan(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        v_new: &Scenario,
    ) -> Result<MigrationPlan> {
        let v_old = self
            .config_store
            .get_scenario(tenant_id, scenario_id)
            .await?
            .ok_or(MigrationError::ScenarioNotFound {
                id: scenario_id.to_string(),
            })?;

        let transformation_map = compute_transformation_map(&v_old, v_new);
        let plan = MigrationPlan {
            id: Uuid::now_v7(),
            tenant_id,
            agent_id: v_old.agent_id,
            scenario_id,
            from_version: v_old.version,
            to_version: v_new.version,
            scenario_checksum_v1: scenario_checksum(&v_old),
            scenario_checksum_v2: scenario_checksum(v_new),
            status: MigrationPlanStatus::Pending,
            transformation_map,
            anchor_policies: BTreeMap::new(),
            scope_filter: None,
            created_at: Utc::now(),
            approved_at: None,
            deployed_at: None,
        };
        self.config_store.save_migration_plan(plan.clone()).await?;
        info!(
            plan_id = %plan.id,
            anchors = plan.transformation_map.anchors.len(),
            "migration plan generated"
        );
        Ok(plan)
    }

    /// Anchor-by-anchor impact estimate for plan review.
    pub async fn summarize(&self, plan: &MigrationPlan) -> Result<MigrationSummary> {
        let mut affected_sessions = BTreeMap::new();
        for anchor in &plan.transformation_map.anchors {
            let sessions = self
                .session_store
                .find_by_step_hash(&StepHashQuery {
                    tenant_id: plan.tenant_id,
                    scenario_id: plan.scenario_id,
                    scenario_version: plan.from_version,
                    step_content_hash: anchor.anchor_hash.clone(),
                    channels: plan
                        .scope_filter
                        .as_ref()
                        .map(|f| f.channels.clone())
                        .unwrap_or_default(),
                })
                .await?;
            affected_sessions.insert(anchor.anchor_hash.clone(), sessions.len());
        }
        Ok(MigrationSummary {
            plan_id: plan.id,
            anchor_count: plan.transformation_map.anchors.len(),
            deleted_count: plan.transformation_map.deleted_nodes.len(),
            new_count: plan.transformation_map.new_node_ids.len(),
            affected_sessions,
        })
    }

    pub async fn approve_plan(&self, tenant_id: TenantId, plan_id: Uuid) -> Result<MigrationPlan> {
        self.transition(tenant_id, plan_id, MigrationPlanStatus::Approved)
            .await
    }

    /// REJECTED is terminal and never touches sessions.
    pub async fn reject_plan(&self, tenant_id: TenantId, plan_id: Uuid) -> Result<MigrationPlan> {
        self.transition(tenant_id, plan_id, MigrationPlanStatus::Rejected)
            .await
    }

    async fn transition(
        &self,
        tenant_id: TenantId,
        plan_id: Uuid,
        to: MigrationPlanStatus,
    ) -> Result<MigrationPlan> {
        let mut plan = self
            .config_store
            .get_migration_plan(tenant_id, plan_id)
            .await?
            .ok_or(MigrationError::PlanNotFound {
                id: plan_id.to_string(),
            })?;
        if plan.status != MigrationPlanStatus::Pending {
            return Err(MigrationError::InvalidTransition {
                from: format!("{:?}", plan.status),
                to: format!("{:?}", to),
            });
        }
        plan.status = to;
        if to == MigrationPlanStatus::Approved {
            plan.approved_at = Some(Utc::now());
        }
        self.config_store.save_migration_plan(plan.clone()).await?;
        Ok(plan)
    }
}

pub struct MigrationDeployer {
    config_store: Arc<dyn AgentConfigStore>,
    session_store: Arc<dyn SessionStore>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeployResult {
    pub plan_id: Uuid,
    pub sessions_marked: usize,
}

impl MigrationDeployer {
    pub fn new(config_store: Arc<dyn AgentConfigStore>, session_store: Arc<dyn SessionStore>) -> Self {
        Self {
            config_store,
            session_store,
        }
    }

    /// Deploy an APPROVED plan: mark every session standing on an anchor,
    /// then save the new scenario version (the old one lands in the archive).
    ///
    /// Sessions are marked before the new version goes live so that no
    /// affected session can take a turn against v2 without a marker.
    #[instrument(skip(self, v_new), fields(tenant = %tenant_id, plan = %plan_id))]
    pub async fn deploy(
        &self,
        tenant_id: TenantId,
        plan_id: Uuid,
        v_new: Scenario,
    ) -> Result<DeployResult> {
        let mut plan = self
            .config_store
            .get_migration_plan(tenant_id, plan_id)
            .await?
            .ok_or(MigrationError::PlanNotFound {
                id: plan_id.to_string(),
            })?;
        if plan.status != MigrationPlanStatus::Approved {
            return Err(MigrationError::InvalidTransition {
                from: format!("{:?}", plan.status),
                to: "DEPLOYED".to_string(),
            });
        }
        let actual = scenario_checksum(&v_new);
        if actual != plan.scenario_checksum_v2 {
            return Err(MigrationError::ChecksumMismatch {
                expected: plan.scenario_checksum_v2.clone(),
                actual,
            });
        }

        let scope_filter = plan.scope_filter.clone().unwrap_or_else(ScopeFilter::default);
        let mut marked = 0usize;
        for anchor in &plan.transformation_map.anchors {
            let sessions = self
                .session_store
                .find_by_step_hash(&StepHashQuery {
                    tenant_id,
                    scenario_id: plan.scenario_id,
                    scenario_version: plan.from_version,
                    step_content_hash: anchor.anchor_hash.clone(),
                    channels: scope_filter.channels.clone(),
                })
                .await?;
            for mut session in sessions {
                session.pending_migration = Some(PendingMigration {
                    target_version: plan.to_version,
                    anchor_content_hash: anchor.anchor_hash.clone(),
                    migration_plan_id: plan.id,
                    marked_at: Utc::now(),
                });
                self.session_store.save(session).await?;
                marked += 1;
            }
        }

        // All affected sessions carry markers; now the new version may go live.
        self.config_store.save_scenario(v_new).await?;

        plan.status = MigrationPlanStatus::Deployed;
        plan.deployed_at = Some(Utc::now());
        self.config_store.save_migration_plan(plan).await?;

        info!(sessions_marked = marked, "migration plan deployed");
        Ok(DeployResult {
            plan_id,
            sessions_marked: marked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_catalog::inmemory::InMemoryAgentConfigStore;
    use keel_catalog::types::{ScenarioStep, StepTransition};
    use keel_core::{AgentId, Channel};
    use keel_sessions::inmemory::InMemorySessionStore;
    use keel_sessions::types::{ScenarioInstance, Session, StepVisit};

    use crate::hash::node_content_hash;

    fn step(name: &str) -> ScenarioStep {
        ScenarioStep::new(Uuid::now_v7(), name)
    }

    fn scenario(tenant: TenantId, agent: AgentId, version: u32, steps: Vec<ScenarioStep>) -> Scenario {
        let mut s = Scenario::new(tenant, agent, "Flow", steps).unwrap();
        s.version = version;
        for st in &mut s.steps {
            st.scenario_id = s.id;
        }
        s
    }

    fn session_at(
        tenant: TenantId,
        agent: AgentId,
        scenario: &Scenario,
        step: &ScenarioStep,
    ) -> Session {
        let mut session = Session::new(tenant, agent, Channel::Webchat, "u1", 1);
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

    #[tokio::test]
    async fn full_plan_lifecycle_marks_sessions() {
        let config_store = Arc::new(InMemoryAgentConfigStore::new());
        let session_store = Arc::new(InMemorySessionStore::new());
        let tenant = TenantId::new();
        let agent = AgentId::new();

        // V1: A -> B, session standing on A.
        let mut a1 = step("Step A");
        let b1 = step("Step B");
        a1.transitions.push(StepTransition::new(b1.id, "next"));
        let v1 = scenario(tenant, agent, 1, vec![a1, b1]);
        config_store.save_scenario(v1.clone()).await.unwrap();

        let session = session_at(tenant, agent, &v1, &v1.steps[0]);
        let session_id = session.session_id;
        session_store.save(session).await.unwrap();

        // V2: A -> C.
        let mut a2 = step("Step A");
        let c2 = step("Step C");
        a2.transitions.push(StepTransition::new(c2.id, "next"));
        let mut v2 = scenario(tenant, agent, 2, vec![a2, c2]);
        v2.id = v1.id;
        for st in &mut v2.steps {
            st.scenario_id = v2.id;
        }

        let planner = MigrationPlanner::new(config_store.clone(), session_store.clone());
        let plan = planner.generate_plan(tenant, v1.id, &v2).await.unwrap();
        assert_eq!(plan.status, MigrationPlanStatus::Pending);
        assert_eq!(plan.transformation_map.anchors.len(), 1);

        let summary = planner.summarize(&plan).await.unwrap();
        assert_eq!(summary.anchor_count, 1);
        let anchor_hash = &plan.transformation_map.anchors[0].anchor_hash;
        assert_eq!(summary.affected_sessions[anchor_hash], 1);

        planner.approve_plan(tenant, plan.id).await.unwrap();

        let deployer = MigrationDeployer::new(config_store.clone(), session_store.clone());
        let result = deployer.deploy(tenant, plan.id, v2).await.unwrap();
        assert_eq!(result.sessions_marked, 1);

        let marked = session_store.get(session_id).await.unwrap().unwrap();
        let marker = marked.pending_migration.unwrap();
        assert_eq!(marker.target_version, 2);
        assert_eq!(&marker.anchor_content_hash, anchor_hash);

        // Live scenario is v2, v1 retrievable from the archive.
        let live = config_store.get_scenario(tenant, v1.id).await.unwrap().unwrap();
        assert_eq!(live.version, 2);
        let archived = config_store
            .get_archived_scenario(tenant, v1.id, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived.version, 1);

        let deployed = config_store
            .get_migration_plan(tenant, result.plan_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deployed.status, MigrationPlanStatus::Deployed);
    }

    #[tokio::test]
    async fn rejected_plan_is_terminal_and_touches_nothing() {
        let config_store = Arc::new(InMemoryAgentConfigStore::new());
        let session_store = Arc::new(InMemorySessionStore::new());
        let tenant = TenantId::new();
        let agent = AgentId::new();

        let v1 = scenario(tenant, agent, 1, vec![step("Step A")]);
        config_store.save_scenario(v1.clone()).await.unwrap();
        let mut v2 = scenario(tenant, agent, 2, vec![step("Step A")]);
        v2.id = v1.id;

        let planner = MigrationPlanner::new(config_store.clone(), session_store.clone());
        let plan = planner.generate_plan(tenant, v1.id, &v2).await.unwrap();
        planner.reject_plan(tenant, plan.id).await.unwrap();

        // Neither approval nor deploy are possible afterwards.
        assert!(planner.approve_plan(tenant, plan.id).await.is_err());
        let deployer = MigrationDeployer::new(config_store, session_store);
        assert!(deployer.deploy(tenant, plan.id, v2).await.is_err());
    }

    #[tokio::test]
    async fn deploy_verifies_the_checksum() {
        let config_store = Arc::new(InMemoryAgentConfigStore::new());
        let session_store = Arc::new(InMemorySessionStore::new());
        let tenant = TenantId::new();
        let agent = AgentId::new();

        let v1 = scenario(tenant, agent, 1, vec![step("Step A")]);
        config_store.save_scenario(v1.clone()).await.unwrap();
        let mut v2 = scenario(tenant, agent, 2, vec![step("Step A")]);
        v2.id = v1.id;

        let planner = MigrationPlanner::new(config_store.clone(), session_store.clone());
        let plan = planner.generate_plan(tenant, v1.id, &v2).await.unwrap();
        planner.approve_plan(tenant, plan.id).await.unwrap();

        // Tampered content no longer matches the plan's checksum.
        let mut tampered = v2.clone();
        tampered.steps[0].name = "Different".into();
        let deployer = MigrationDeployer::new(config_store, session_store);
        assert!(matches!(
            deployer.deploy(tenant, plan.id, tampered).await,
            Err(MigrationError::ChecksumMismatch { .. })
        ));
    }
}
