//! Scenario field-requirement evaluation.
//!
//! Answers "which fields does this scenario/step still need from this
//! customer?". A requirement is unsatisfied when the profile has no ACTIVE
//! entry, the ACTIVE entry is older than the schema's freshness window, or
//! the schema demands verification and the entry is unverified.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use keel_catalog::types::{CustomerDataField, RequiredLevel, ScenarioFieldRequirement};

use crate::types::CustomerProfile;

/// Requirements not satisfied by the profile, in collection order.
///
/// `required_level` narrows evaluation; `None` evaluates every requirement.
pub fn missing_fields(
    profile: &CustomerProfile,
    requirements: &[ScenarioFieldRequirement],
    definitions: &HashMap<String, CustomerDataField>,
    required_level: Option<RequiredLevel>,
    now: DateTime<Utc>,
) -> Vec<ScenarioFieldRequirement> {
    let mut missing: Vec<ScenarioFieldRequirement> = requirements
        .iter()
        .filter(|req| required_level.map_or(true, |level| req.required_level == level))
        .filter(|req| !satisfied(profile, req, definitions.get(&req.field_name), now))
        .cloned()
        .collect();
    missing.sort_by_key(|r| r.collection_order);
    missing
}

fn satisfied(
    profile: &CustomerProfile,
    req: &ScenarioFieldRequirement,
    definition: Option<&CustomerDataField>,
    now: DateTime<Utc>,
) -> bool {
    let field = match profile.active_field(&req.field_name) {
        Some(f) => f,
        None => return false,
    };

    if let Some(def) = definition {
        if let Some(freshness) = def.freshness_seconds {
            let age = (now - field.collected_at).num_seconds();
            if age > freshness as i64 {
                return false;
            }
        }
        if def.required_verification && !field.verified {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelIdentity, EntrySource, VariableEntry};
    use keel_core::{AgentId, Channel, FieldValue, TenantId, ValueType};
    use uuid::Uuid;

    fn profile() -> CustomerProfile {
        CustomerProfile::new(
            TenantId::new(),
            ChannelIdentity {
                channel: Channel::Webchat,
                channel_user_id: "u".into(),
                primary: true,
            },
        )
    }

    fn requirement(scenario_id: Uuid, field: &str, level: RequiredLevel, order: u32) -> ScenarioFieldRequirement {
        let mut r = ScenarioFieldRequirement::new(TenantId::new(), scenario_id, field, level);
        r.collection_order = order;
        r
    }

    fn definition(field: &str) -> CustomerDataField {
        CustomerDataField::new(
            TenantId::new(),
            AgentId::new(),
            field,
            field,
            ValueType::String,
        )
        .unwrap()
    }

    #[test]
    fn absent_field_is_missing_in_collection_order() {
        let p = profile();
        let scenario = Uuid::now_v7();
        let reqs = vec![
            requirement(scenario, "email", RequiredLevel::Hard, 2),
            requirement(scenario, "phone_number", RequiredLevel::Hard, 1),
        ];
        let missing = missing_fields(&p, &reqs, &HashMap::new(), Some(RequiredLevel::Hard), Utc::now());
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].field_name, "phone_number");
        assert_eq!(missing[1].field_name, "email");
    }

    #[test]
    fn soft_requirements_are_skipped_when_filtering_hard() {
        let p = profile();
        let scenario = Uuid::now_v7();
        let reqs = vec![requirement(scenario, "nickname", RequiredLevel::Soft, 0)];
        let missing = missing_fields(&p, &reqs, &HashMap::new(), Some(RequiredLevel::Hard), Utc::now());
        assert!(missing.is_empty());
    }

    #[test]
    fn stale_field_is_missing() {
        let mut p = profile();
        let mut field = VariableEntry::new(
            "phone_number",
            FieldValue::Str("111".into()),
            EntrySource::UserProvided,
        );
        field.collected_at = Utc::now() - chrono::Duration::hours(2);
        p.fields.insert("phone_number".into(), field);

        let mut def = definition("phone_number");
        def.freshness_seconds = Some(3600);
        let defs = HashMap::from([("phone_number".to_string(), def)]);

        let scenario = Uuid::now_v7();
        let reqs = vec![requirement(scenario, "phone_number", RequiredLevel::Hard, 0)];
        let missing = missing_fields(&p, &reqs, &defs, Some(RequiredLevel::Hard), Utc::now());
        assert_eq!(missing.len(), 1);
    }

    #[test]
    fn unverified_field_is_missing_when_verification_required() {
        let mut p = profile();
        p.fields.insert(
            "email".into(),
            VariableEntry::new(
                "email",
                FieldValue::Str("a@b.c".into()),
                EntrySource::UserProvided,
            ),
        );

        let mut def = definition("email");
        def.required_verification = true;
        let defs = HashMap::from([("email".to_string(), def)]);

        let scenario = Uuid::now_v7();
        let reqs = vec![requirement(scenario, "email", RequiredLevel::Hard, 0)];
        assert_eq!(
            missing_fields(&p, &reqs, &defs, Some(RequiredLevel::Hard), Utc::now()).len(),
            1
        );

        // Verified entry satisfies it.
        p.fields.get_mut("email").unwrap().verified = true;
        assert!(missing_fields(&p, &reqs, &defs, Some(RequiredLevel::Hard), Utc::now()).is_empty());
    }
}
