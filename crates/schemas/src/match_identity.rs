// Match store rows
//
// A match identity aggregates every visit that carried the same normalized
// candidate key within one tenant/campaign, and records the identity the
// reference dataset resolved it to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of candidate identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Email,
    Phone,
}

impl MatchType {
    pub const ALL: [MatchType; 2] = [MatchType::Email, MatchType::Phone];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown match type: {0}")]
pub struct ParseMatchTypeError(pub String);

impl std::str::FromStr for MatchType {
    type Err = ParseMatchTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "phone" => Ok(Self::Phone),
            other => Err(ParseMatchTypeError(other.to_string())),
        }
    }
}

/// Resolved (or not yet resolved) identity for one candidate key
///
/// Unique on `(tenant_id, campaign_id, match_type, match_key)`. Once
/// `resolved_identity_key` is set it is never cleared or replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchIdentity {
    pub match_id: i64,
    pub tenant_id: String,
    pub campaign_id: String,
    pub match_type: MatchType,
    /// Normalized candidate key
    pub match_key: String,
    pub resolved_identity_key: Option<String>,
    pub resolved_group_key: Option<String>,
    pub device_id: Option<i64>,
    pub endpoint_id: Option<i64>,
    pub first_visit_id: i64,
    pub latest_visit_id: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hit_count: i64,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_type_round_trips_through_str() {
        for match_type in MatchType::ALL {
            assert_eq!(match_type.as_str().parse::<MatchType>(), Ok(match_type));
        }
        assert!("fax".parse::<MatchType>().is_err());
    }

    #[test]
    fn test_match_type_serializes_snake_case() {
        let json = serde_json::to_string(&MatchType::Email).unwrap();
        assert_eq!(json, "\"email\"");
    }
}
