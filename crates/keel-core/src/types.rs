use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// UUIDv7 includes a timestamp: sortable and traceable in logs.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_type!(
    /// Identifies the tenant that owns every scoped record.
    TenantId
);
id_type!(
    /// Identifies an agent configuration root within a tenant.
    AgentId
);
id_type!(
    /// Identifies one live conversation.
    SessionId
);
id_type!(
    /// Identifies one processed turn (also the idempotency unit for retries).
    TurnId
);
id_type!(
    /// Identifies a customer profile within a tenant.
    CustomerId
);

/// Communication channel the turn arrived on.
///
/// Channel adapters live outside the core; the engine only keys sessions and
/// customer identities by the channel label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Webchat,
    Whatsapp,
    Slack,
    Email,
    Api,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Webchat => "webchat",
            Channel::Whatsapp => "whatsapp",
            Channel::Slack => "slack",
            Channel::Email => "email",
            Channel::Api => "api",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "webchat" => Ok(Channel::Webchat),
            "whatsapp" => Ok(Channel::Whatsapp),
            "slack" => Ok(Channel::Slack),
            "email" => Ok(Channel::Email),
            "api" => Ok(Channel::Api),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_serialize_as_canonical_hyphenated_lowercase() {
        let id = TenantId::new();
        let json = serde_json::to_string(&id).unwrap();
        let s = json.trim_matches('"');
        assert_eq!(s, s.to_lowercase());
        assert_eq!(s.len(), 36);
    }

    #[test]
    fn channel_parses_both_ways() {
        for c in [
            Channel::Webchat,
            Channel::Whatsapp,
            Channel::Slack,
            Channel::Email,
            Channel::Api,
        ] {
            let parsed: Channel = c.to_string().parse().unwrap();
            assert_eq!(c, parsed);
        }
    }
}
