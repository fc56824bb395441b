//! Just-in-time migration reconciliation.
//!
//! Runs at the head of every turn when the session carries a pending
//! migration marker, and also when an active instance's scenario version has
//! fallen behind the published version without a marker (direct save without
//! a plan). Everything here mutates the session in memory only; the pipeline
//! persists at the end of the turn.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use keel_catalog::store::AgentConfigStore;
use keel_catalog::types::{
    AnchorMigrationPolicy, AnchorTransformation, MigrationScenario, Scenario,
};
use keel_customer::types::CustomerProfile;
use keel_llm::EmbeddingProvider;
use keel_retrieval::vector::clamped_similarity;
use keel_sessions::types::{ScenarioInstance, Session, StepVisit};

use crate::error::Result;
use crate::hash::node_content_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationAction {
    Teleport,
    Collect,
    ReRoute,
    Relocalize,
    Escalate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub action: ReconciliationAction,
    pub reason: String,
    pub from_step: Uuid,
    pub to_step: Option<Uuid>,
    pub collect_fields: Vec<String>,
    pub branch_question: Option<String>,
    pub scope_filter_matched: bool,
}

pub struct JitReconciler {
    config_store: Arc<dyn AgentConfigStore>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    /// Fork-resolution similarity threshold (shares the transition default).
    branch_threshold: f64,
}

impl JitReconciler {
    pub fn new(
        config_store: Arc<dyn AgentConfigStore>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        branch_threshold: f64,
    ) -> Self {
        Self {
            config_store,
            embedding_provider,
            branch_threshold,
        }
    }

    /// Reconcile the session against pending migrations or version drift.
    /// Returns `None` when nothing needed doing.
    pub async fn reconcile(
        &self,
        session: &mut Session,
        profile: Option<&CustomerProfile>,
        message: &str,
    ) -> Result<Option<ReconciliationResult>> {
        if session.pending_migration.is_some() {
            return self.reconcile_marked(session, profile, message).await;
        }
        self.reconcile_version_drift(session).await
    }

    async fn reconcile_marked(
        &self,
        session: &mut Session,
        profile: Option<&CustomerProfile>,
        message: &str,
    ) -> Result<Option<ReconciliationResult>> {
        let marker = session.pending_migration.clone().expect("marker checked");

        let plan = self
            .config_store
            .get_migration_plan(session.tenant_id, marker.migration_plan_id)
            .await?;
        let plan = match plan {
            Some(p) => p,
            None => {
                warn!(plan_id = %marker.migration_plan_id, "migration plan missing, relocalizing");
                return self.relocalize_all(session).await.map(Some);
            }
        };

        let v2 = self
            .load_version(session, plan.scenario_id, marker.target_version)
            .await?;
        let v2 = match v2 {
            Some(s) => s,
            None => {
                warn!(scenario_id = %plan.scenario_id, version = marker.target_version,
                      "target scenario version missing, relocalizing");
                return self.relocalize_all(session).await.map(Some);
            }
        };

        let instance_idx = match session
            .active_scenarios
            .iter()
            .position(|i| i.scenario_id == plan.scenario_id)
        {
            Some(i) => i,
            None => {
                // Nothing to migrate: the instance completed or was cancelled
                // after marking. Clear and move on.
                session.pending_migration = None;
                return Ok(None);
            }
        };
        let from_step = session.active_scenarios[instance_idx].current_step_id;

        let anchor = match plan
            .transformation_map
            .anchor_by_hash(&marker.anchor_content_hash)
        {
            Some(a) => a.clone(),
            None => {
                return Ok(Some(self.relocalize_instance(session, instance_idx, &v2)));
            }
        };

        match plan
            .anchor_policies
            .get(&anchor.anchor_hash)
            .copied()
            .unwrap_or_default()
        {
            AnchorMigrationPolicy::Auto => {}
            AnchorMigrationPolicy::Hold => {
                // Operator hold: the session keeps running on the old version
                // with the marker intact.
                return Ok(None);
            }
            AnchorMigrationPolicy::Escalate => {
                return Ok(Some(ReconciliationResult {
                    action: ReconciliationAction::Escalate,
                    reason: "anchor policy requires human handling".into(),
                    from_step,
                    to_step: None,
                    collect_fields: Vec::new(),
                    branch_question: None,
                    scope_filter_matched: true,
                }));
            }
        }

        let result = match anchor.migration_scenario {
            MigrationScenario::CleanGraft => {
                self.teleport(session, instance_idx, &v2, anchor.target_step_id_v2, "migration");
                session.pending_migration = None;
                ReconciliationResult {
                    action: ReconciliationAction::Teleport,
                    reason: "clean graft onto unchanged anchor".into(),
                    from_step,
                    to_step: Some(anchor.target_step_id_v2),
                    collect_fields: Vec::new(),
                    branch_question: None,
                    scope_filter_matched: true,
                }
            }
            MigrationScenario::GapFill => {
                let missing = missing_upstream_fields(&anchor, profile);
                if missing.is_empty() {
                    self.teleport(session, instance_idx, &v2, anchor.target_step_id_v2, "migration");
                    session.pending_migration = None;
                    ReconciliationResult {
                        action: ReconciliationAction::Teleport,
                        reason: "gap fill satisfied, grafting".into(),
                        from_step,
                        to_step: Some(anchor.target_step_id_v2),
                        collect_fields: Vec::new(),
                        branch_question: None,
                        scope_filter_matched: true,
                    }
                } else {
                    // Marker stays until the data lands.
                    ReconciliationResult {
                        action: ReconciliationAction::Collect,
                        reason: "new flow expects data this session is missing".into(),
                        from_step,
                        to_step: None,
                        collect_fields: missing,
                        branch_question: None,
                        scope_filter_matched: true,
                    }
                }
            }
            MigrationScenario::ReRoute => {
                self.re_route(session, instance_idx, &v2, &anchor, from_step, message)
                    .await
            }
        };

        info!(action = ?result.action, "jit reconciliation applied");
        Ok(Some(result))
    }

    /// Resolve a re-route: match the user's answer against the new fork's
    /// branch conditions; an unresolved fork keeps asking.
    async fn re_route(
        &self,
        session: &mut Session,
        instance_idx: usize,
        v2: &Scenario,
        anchor: &AnchorTransformation,
        from_step: Uuid,
        message: &str,
    ) -> ReconciliationResult {
        let fork = anchor.upstream_changes.new_forks.first();
        let branch_question = fork.map(|f| {
            let options: Vec<&str> = f
                .branches
                .iter()
                .map(|b| b.condition_text.as_str())
                .collect();
            format!(
                "To pick up where we left off, which applies to you: {}?",
                options.join(", or ")
            )
        });

        if let Some(fork) = fork {
            if let Ok(msg_embedding) = self.embedding_provider.embed_single(message).await {
                let mut best: Option<(f64, Uuid)> = None;
                for branch in &fork.branches {
                    if let Ok(cond) = self.embedding_provider.embed_single(&branch.condition_text).await
                    {
                        if let Ok(score) = clamped_similarity(&msg_embedding, &cond) {
                            if best.map_or(true, |(b, _)| score > b) {
                                best = Some((score, branch.to_step_id));
                            }
                        }
                    }
                }
                if let Some((score, _)) = best {
                    if score >= self.branch_threshold {
                        // The answer resolved the fork: graft onto the
                        // anchor's v2 position and clear the marker.
                        self.teleport(session, instance_idx, v2, anchor.target_step_id_v2, "migration");
                        session.pending_migration = None;
                        return ReconciliationResult {
                            action: ReconciliationAction::Teleport,
                            reason: "fork resolved by user answer".into(),
                            from_step,
                            to_step: Some(anchor.target_step_id_v2),
                            collect_fields: Vec::new(),
                            branch_question: None,
                            scope_filter_matched: true,
                        };
                    }
                }
            }
        }

        ReconciliationResult {
            action: ReconciliationAction::ReRoute,
            reason: "new flow branches before the anchor".into(),
            from_step,
            to_step: None,
            collect_fields: Vec::new(),
            branch_question,
            scope_filter_matched: true,
        }
    }

    /// Marker-less drift: an active instance references an older version than
    /// the published scenario.
    async fn reconcile_version_drift(
        &self,
        session: &mut Session,
    ) -> Result<Option<ReconciliationResult>> {
        for idx in 0..session.active_scenarios.len() {
            let (scenario_id, instance_version) = {
                let instance = &session.active_scenarios[idx];
                (instance.scenario_id, instance.scenario_version)
            };
            let live = match self
                .config_store
                .get_scenario(session.tenant_id, scenario_id)
                .await?
            {
                Some(s) => s,
                None => continue,
            };
            if live.version > instance_version {
                return Ok(Some(self.relocalize_instance(session, idx, &live)));
            }
        }
        Ok(None)
    }

    async fn relocalize_all(&self, session: &mut Session) -> Result<ReconciliationResult> {
        session.pending_migration = None;
        if let Some(result) = self.reconcile_version_drift(session).await? {
            return Ok(result);
        }
        let from_step = session
            .active_scenarios
            .first()
            .map(|i| i.current_step_id)
            .unwrap_or_default();
        Ok(ReconciliationResult {
            action: ReconciliationAction::Escalate,
            reason: "no migration plan and no version drift to recover from".into(),
            from_step,
            to_step: None,
            collect_fields: Vec::new(),
            branch_question: None,
            scope_filter_matched: false,
        })
    }

    /// Find a step in the target version whose content hash matches the
    /// session's current position; teleport there or escalate.
    fn relocalize_instance(
        &self,
        session: &mut Session,
        instance_idx: usize,
        target: &Scenario,
    ) -> ReconciliationResult {
        let from_step = session.active_scenarios[instance_idx].current_step_id;
        let current_hash = session.last_visit_hash(from_step).map(|h| h.to_string());

        let matching = current_hash.as_deref().and_then(|hash| {
            target
                .steps
                .iter()
                .find(|s| node_content_hash(s) == hash)
                .map(|s| s.id)
        });

        match matching {
            Some(step_id) => {
                self.teleport(session, instance_idx, target, step_id, "relocalization");
                session.relocalization_count += 1;
                session.pending_migration = None;
                ReconciliationResult {
                    action: ReconciliationAction::Relocalize,
                    reason: "matched current step by content hash".into(),
                    from_step,
                    to_step: Some(step_id),
                    collect_fields: Vec::new(),
                    branch_question: None,
                    scope_filter_matched: false,
                }
            }
            None => ReconciliationResult {
                action: ReconciliationAction::Escalate,
                reason: "current step has no counterpart in the new version".into(),
                from_step,
                to_step: None,
                collect_fields: Vec::new(),
                branch_question: None,
                scope_filter_matched: false,
            },
        }
    }

    /// Move the instance to `step_id` in `target` by plan authority, without
    /// evaluating transitions.
    fn teleport(
        &self,
        session: &mut Session,
        instance_idx: usize,
        target: &Scenario,
        step_id: Uuid,
        reason: &str,
    ) {
        let turn_number = session.turn_count + 1;
        let step = target.step(step_id);
        let instance: &mut ScenarioInstance = &mut session.active_scenarios[instance_idx];
        instance.scenario_version = target.version;
        instance.current_step_id = step_id;
        instance.record_visit(step_id);

        session.step_history.push(StepVisit {
            step_id,
            step_name: step.map(|s| s.name.clone()),
            entered_at: Utc::now(),
            turn_number,
            transition_reason: Some(reason.to_string()),
            confidence: 1.0,
            is_checkpoint: step.map(|s| s.is_checkpoint).unwrap_or(false),
            checkpoint_description: step.and_then(|s| s.checkpoint_description.clone()),
            step_content_hash: step.map(node_content_hash),
        });
    }

    async fn load_version(
        &self,
        session: &Session,
        scenario_id: Uuid,
        version: u32,
    ) -> Result<Option<Scenario>> {
        if let Some(live) = self
            .config_store
            .get_scenario(session.tenant_id, scenario_id)
            .await?
        {
            if live.version == version {
                return Ok(Some(live));
            }
        }
        Ok(self
            .config_store
            .get_archived_scenario(session.tenant_id, scenario_id, version)
            .await?)
    }
}

/// Fields collected by upstream insertions that the customer does not hold as
/// ACTIVE, in insertion order, deduplicated.
fn missing_upstream_fields(
    anchor: &AnchorTransformation,
    profile: Option<&CustomerProfile>,
) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut missing = Vec::new();
    for node in &anchor.upstream_changes.inserted_nodes {
        for field in &node.collects_fields {
            if !seen.insert(field.clone()) {
                continue;
            }
            let have = profile.map_or(false, |p| p.has_active_field(field));
            if !have {
                missing.push(field.clone());
            }
        }
    }
    missing
}
