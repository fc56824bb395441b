//! Transformation-map computation between two scenario versions.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use keel_catalog::types::{
    AnchorTransformation, DeletedNode, DownstreamChanges, ForkBranch, InsertedNode,
    MigrationScenario, NewFork, Scenario, ScenarioStep, TransformationMap, UpstreamChanges,
};

use crate::hash::node_content_hash;

/// Steps present in both versions with identical content hashes.
///
/// Cartesian product over hash equality: a hash shared by several steps on
/// either side yields every pairing.
fn hash_index(scenario: &Scenario) -> HashMap<String, Vec<&ScenarioStep>> {
    let mut index: HashMap<String, Vec<&ScenarioStep>> = HashMap::new();
    for step in &scenario.steps {
        index
            .entry(node_content_hash(step))
            .or_default()
            .push(step);
    }
    index
}

pub fn find_anchor_nodes<'a>(
    v_old: &'a Scenario,
    v_new: &'a Scenario,
) -> Vec<(&'a ScenarioStep, &'a ScenarioStep)> {
    let new_by_hash = hash_index(v_new);
    let mut anchors = Vec::new();
    for old_step in &v_old.steps {
        let hash = node_content_hash(old_step);
        if let Some(new_steps) = new_by_hash.get(&hash) {
            for new_step in new_steps {
                anchors.push((old_step, *new_step));
            }
        }
    }
    anchors
}

/// Pick the migration scenario for one anchor.
///
/// GAP_FILL wins when any upstream insertion collects data the session may be
/// missing; otherwise RE_ROUTE when the new flow branches before the anchor;
/// otherwise the session can be grafted cleanly.
pub fn determine_migration_scenario(
    upstream: &UpstreamChanges,
    _downstream: &DownstreamChanges,
) -> MigrationScenario {
    if upstream
        .inserted_nodes
        .iter()
        .any(|n| !n.collects_fields.is_empty())
    {
        return MigrationScenario::GapFill;
    }
    if !upstream.new_forks.is_empty() {
        return MigrationScenario::ReRoute;
    }
    MigrationScenario::CleanGraft
}

/// Full diff of `v_old` against `v_new`.
pub fn compute_transformation_map(v_old: &Scenario, v_new: &Scenario) -> TransformationMap {
    let old_hashes: HashSet<String> = v_old.steps.iter().map(node_content_hash).collect();
    let new_hashes: HashSet<String> = v_new.steps.iter().map(node_content_hash).collect();

    let mut anchors = Vec::new();
    for (old_step, new_step) in find_anchor_nodes(v_old, v_new) {
        let upstream = upstream_changes(v_old, v_new, new_step.id, &old_hashes);
        let downstream = downstream_changes(v_old, v_new, old_step.id, new_step.id, &old_hashes, &new_hashes);
        let migration_scenario = determine_migration_scenario(&upstream, &downstream);
        anchors.push(AnchorTransformation {
            anchor_name: old_step.name.clone(),
            anchor_hash: node_content_hash(old_step),
            source_step_id_v1: old_step.id,
            target_step_id_v2: new_step.id,
            migration_scenario,
            upstream_changes: upstream,
            downstream_changes: downstream,
        });
    }

    let deleted_nodes = v_old
        .steps
        .iter()
        .filter(|s| !new_hashes.contains(&node_content_hash(s)))
        .map(|s| DeletedNode {
            node_id: s.id,
            node_name: s.name.clone(),
        })
        .collect();

    let new_node_ids = v_new
        .steps
        .iter()
        .filter(|s| !old_hashes.contains(&node_content_hash(s)))
        .map(|s| s.id)
        .collect();

    TransformationMap {
        anchors,
        deleted_nodes,
        new_node_ids,
    }
}

/// Changes on the entry→anchor paths of the new version: steps whose content
/// did not exist in v_old, and new branching points.
fn upstream_changes(
    _v_old: &Scenario,
    v_new: &Scenario,
    anchor_id_v2: Uuid,
    old_hashes: &HashSet<String>,
) -> UpstreamChanges {
    let ancestors = ancestors_of(v_new, anchor_id_v2);
    let mut changes = UpstreamChanges::default();

    for step in &v_new.steps {
        if !ancestors.contains(&step.id) {
            continue;
        }
        if old_hashes.contains(&node_content_hash(step)) {
            continue;
        }
        changes.inserted_nodes.push(InsertedNode {
            node_id: step.id,
            node_name: step.name.clone(),
            collects_fields: step.collects_profile_fields.clone(),
        });
        if step.transitions.len() > 1 {
            changes.new_forks.push(NewFork {
                fork_node_id: step.id,
                fork_node_name: step.name.clone(),
                branches: step
                    .transitions
                    .iter()
                    .map(|t| ForkBranch {
                        to_step_id: t.to_step_id,
                        condition_text: t.condition_text.clone(),
                    })
                    .collect(),
            });
        }
    }
    changes
}

/// Changes after the anchor: v_old descendants that were deleted and v_new
/// descendants that were added.
fn downstream_changes(
    v_old: &Scenario,
    v_new: &Scenario,
    anchor_id_v1: Uuid,
    anchor_id_v2: Uuid,
    old_hashes: &HashSet<String>,
    new_hashes: &HashSet<String>,
) -> DownstreamChanges {
    let old_descendants = descendants_of(v_old, anchor_id_v1);
    let new_descendants = descendants_of(v_new, anchor_id_v2);

    DownstreamChanges {
        deleted_nodes: v_old
            .steps
            .iter()
            .filter(|s| old_descendants.contains(&s.id))
            .filter(|s| !new_hashes.contains(&node_content_hash(s)))
            .map(|s| s.id)
            .collect(),
        added_nodes: v_new
            .steps
            .iter()
            .filter(|s| new_descendants.contains(&s.id))
            .filter(|s| !old_hashes.contains(&node_content_hash(s)))
            .map(|s| s.id)
            .collect(),
    }
}

/// Steps on some path entry → target, excluding the target itself.
fn ancestors_of(scenario: &Scenario, target: Uuid) -> HashSet<Uuid> {
    let reachable_from_entry = reachable(scenario, scenario.entry_step_id);
    let mut reaches_target = HashSet::new();
    for step in &scenario.steps {
        if step.id != target && reachable(scenario, step.id).contains(&target) {
            reaches_target.insert(step.id);
        }
    }
    reachable_from_entry
        .intersection(&reaches_target)
        .copied()
        .collect()
}

/// Steps strictly after `from` (excluding `from`).
fn descendants_of(scenario: &Scenario, from: Uuid) -> HashSet<Uuid> {
    let mut set = reachable(scenario, from);
    set.remove(&from);
    set
}

fn reachable(scenario: &Scenario, from: Uuid) -> HashSet<Uuid> {
    let by_id: HashMap<Uuid, &ScenarioStep> = scenario.steps.iter().map(|s| (s.id, s)).collect();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(step) = by_id.get(&id) {
            for t in &step.transitions {
                queue.push_back(t.to_step_id);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_catalog::types::StepTransition;
    use keel_core::{AgentId, TenantId};

    fn step(name: &str, collects: &[&str]) -> ScenarioStep {
        let mut s = ScenarioStep::new(Uuid::now_v7(), name);
        s.collects_profile_fields = collects.iter().map(|f| f.to_string()).collect();
        s
    }

    fn link(from: &mut ScenarioStep, to: &ScenarioStep, condition: &str) {
        from.transitions.push(StepTransition::new(to.id, condition));
    }

    fn scenario(version: u32, steps: Vec<ScenarioStep>) -> Scenario {
        let mut s = Scenario::new(TenantId::new(), AgentId::new(), "Flow", steps).unwrap();
        s.version = version;
        for st in &mut s.steps {
            st.scenario_id = s.id;
        }
        s
    }

    #[test]
    fn anchors_found_by_content_not_identity() {
        let v1 = scenario(1, vec![step("Collect Name", &[]), step("Verify", &[])]);
        let v2 = scenario(
            2,
            vec![step("Collect Name", &[]), step("Verify", &[]), step("New Step", &[])],
        );
        let anchors = find_anchor_nodes(&v1, &v2);
        assert_eq!(anchors.len(), 2);
        let names: HashSet<&str> = anchors.iter().map(|(a, _)| a.name.as_str()).collect();
        assert!(names.contains("Collect Name") && names.contains("Verify"));
    }

    #[test]
    fn no_anchors_when_everything_changed() {
        let v1 = scenario(1, vec![step("Old Step", &[])]);
        let v2 = scenario(2, vec![step("New Step", &[])]);
        assert!(find_anchor_nodes(&v1, &v2).is_empty());
    }

    #[test]
    fn scenario_determination_table() {
        assert_eq!(
            determine_migration_scenario(&UpstreamChanges::default(), &DownstreamChanges::default()),
            MigrationScenario::CleanGraft
        );

        let gap = UpstreamChanges {
            inserted_nodes: vec![InsertedNode {
                node_id: Uuid::now_v7(),
                node_name: "Collect Email".into(),
                collects_fields: vec!["email".into()],
            }],
            new_forks: vec![],
        };
        assert_eq!(
            determine_migration_scenario(&gap, &DownstreamChanges::default()),
            MigrationScenario::GapFill
        );

        let reroute = UpstreamChanges {
            inserted_nodes: vec![],
            new_forks: vec![NewFork {
                fork_node_id: Uuid::now_v7(),
                fork_node_name: "Decision".into(),
                branches: vec![],
            }],
        };
        assert_eq!(
            determine_migration_scenario(&reroute, &DownstreamChanges::default()),
            MigrationScenario::ReRoute
        );
    }

    #[test]
    fn clean_graft_map_for_repointed_edge() {
        // V1: A -> B.   V2: A -> C (B removed, C new, A unchanged).
        let mut a1 = step("Step A", &[]);
        let b1 = step("Step B", &[]);
        link(&mut a1, &b1, "next");
        let v1 = scenario(1, vec![a1, b1]);

        let mut a2 = step("Step A", &[]);
        let c2 = step("Step C", &[]);
        link(&mut a2, &c2, "next");
        let v2 = scenario(2, vec![a2, c2]);

        let map = compute_transformation_map(&v1, &v2);
        assert_eq!(map.anchors.len(), 1);
        let anchor = &map.anchors[0];
        assert_eq!(anchor.anchor_name, "Step A");
        assert_eq!(anchor.migration_scenario, MigrationScenario::CleanGraft);
        assert_eq!(map.deleted_nodes.len(), 1);
        assert_eq!(map.deleted_nodes[0].node_name, "Step B");
        assert_eq!(map.new_node_ids.len(), 1);
    }

    #[test]
    fn gap_fill_when_upstream_insert_collects_data() {
        // V1: A.   V2: CollectPhone(collects=[phone_number]) -> A.
        let a1 = step("Step A", &[]);
        let v1 = scenario(1, vec![a1]);

        let a2 = step("Step A", &[]);
        let mut collect = step("Collect Phone", &["phone_number"]);
        link(&mut collect, &a2, "after phone");
        let v2 = scenario(2, vec![collect, a2]);

        let map = compute_transformation_map(&v1, &v2);
        let anchor_hash = node_content_hash(&v1.steps[0]);
        let anchor = map.anchor_by_hash(&anchor_hash).unwrap();
        assert_eq!(anchor.migration_scenario, MigrationScenario::GapFill);
        assert_eq!(
            anchor.upstream_changes.inserted_nodes[0].collects_fields,
            vec!["phone_number"]
        );
    }

    #[test]
    fn re_route_when_upstream_forks() {
        // V1: A.   V2: Decision -> (A | Alt).
        let a1 = step("Step A", &[]);
        let v1 = scenario(1, vec![a1]);

        let a2 = step("Step A", &[]);
        let alt = step("Alt Path", &[]);
        let mut decision = step("Decision", &[]);
        link(&mut decision, &a2, "existing customer");
        link(&mut decision, &alt, "new customer");
        let v2 = scenario(2, vec![decision, a2, alt]);

        let map = compute_transformation_map(&v1, &v2);
        let anchor_hash = node_content_hash(&v1.steps[0]);
        let anchor = map.anchor_by_hash(&anchor_hash).unwrap();
        assert_eq!(anchor.migration_scenario, MigrationScenario::ReRoute);
        assert_eq!(anchor.upstream_changes.new_forks.len(), 1);
        assert_eq!(anchor.upstream_changes.new_forks[0].branches.len(), 2);
    }

    #[test]
    fn downstream_changes_track_deletions_and_additions() {
        // V1: A -> B.   V2: A -> C.  From A's perspective B deleted, C added.
        let mut a1 = step("Step A", &[]);
        let b1 = step("Step B", &[]);
        link(&mut a1, &b1, "next");
        let b1_id = b1.id;
        let v1 = scenario(1, vec![a1, b1]);

        let mut a2 = step("Step A", &[]);
        let c2 = step("Step C", &[]);
        link(&mut a2, &c2, "next");
        let c2_id = c2.id;
        let v2 = scenario(2, vec![a2, c2]);

        let map = compute_transformation_map(&v1, &v2);
        let anchor = &map.anchors[0];
        assert_eq!(anchor.downstream_changes.deleted_nodes, vec![b1_id]);
        assert_eq!(anchor.downstream_changes.added_nodes, vec![c2_id]);
    }
}
