//! Content-address hashing for scenario steps and whole scenarios.
//!
//! Hashes cover semantic content only: a step keeps its hash when its
//! identifiers change or an outgoing edge is re-pointed at a renamed target,
//! as long as the step's own name, collected fields, checkpoint flag and
//! transition conditions are unchanged. Canonical JSON sorts keys lexically,
//! emits no insignificant whitespace, and rejects floats.

use sha2::{Digest, Sha256};

use keel_catalog::types::{Scenario, ScenarioStep};

use crate::error::{MigrationError, Result};

/// Canonical serialisation: lexically sorted keys, no whitespace, no floats.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, out: &mut String) -> Result<()> {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => {
            if n.is_f64() {
                return Err(MigrationError::FloatInHashPayload);
            }
            out.push_str(&n.to_string());
        }
        serde_json::Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Semantic content hash of a step: truncated SHA-256 (16 hex chars) over
/// name, sorted collected fields, checkpoint flag, and sorted transition
/// condition texts.
pub fn node_content_hash(step: &ScenarioStep) -> String {
    let mut collects = step.collects_profile_fields.clone();
    collects.sort();
    let mut conditions: Vec<&str> = step
        .transitions
        .iter()
        .map(|t| t.condition_text.as_str())
        .collect();
    conditions.sort();

    let payload = serde_json::json!({
        "name": step.name,
        "collects_profile_fields": collects,
        "is_checkpoint": step.is_checkpoint,
        "transitions": conditions,
    });
    let canonical = canonical_json(&payload).expect("step hash payload carries no floats");

    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Checksum of a whole scenario: SHA-256 over the version and the step hashes
/// in entry-traversal order (breadth-first from the entry step, unreachable
/// steps appended in name order).
pub fn scenario_checksum(scenario: &Scenario) -> String {
    let ordered = entry_traversal(scenario);
    let step_hashes: Vec<String> = ordered.iter().map(|s| node_content_hash(s)).collect();

    let payload = serde_json::json!({
        "version": scenario.version,
        "steps": step_hashes,
    });
    let canonical = canonical_json(&payload).expect("checksum payload carries no floats");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Steps in deterministic traversal order from the entry step.
fn entry_traversal(scenario: &Scenario) -> Vec<&ScenarioStep> {
    let mut ordered = Vec::with_capacity(scenario.steps.len());
    let mut seen = std::collections::HashSet::new();
    let mut queue = std::collections::VecDeque::new();

    if scenario.step(scenario.entry_step_id).is_some() {
        queue.push_back(scenario.entry_step_id);
    }
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(step) = scenario.step(id) {
            ordered.push(step);
            for t in &step.transitions {
                queue.push_back(t.to_step_id);
            }
        }
    }

    let mut rest: Vec<&ScenarioStep> = scenario
        .steps
        .iter()
        .filter(|s| !seen.contains(&s.id))
        .collect();
    rest.sort_by(|a, b| a.name.cmp(&b.name));
    ordered.extend(rest);
    ordered
}
