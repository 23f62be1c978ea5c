// Visit fact rows

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MatchType;

/// One row per processed raw event
///
/// `visit_id` is the raw event's sequence id, not a new surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub visit_id: i64,
    pub tenant_id: String,
    pub campaign_id: String,
    /// `None` when every fingerprint input was absent
    pub device_id: Option<i64>,
    /// `None` when the event carried no source address
    pub endpoint_id: Option<i64>,
    pub received_at: DateTime<Utc>,
    /// Tenant-defined parameters, keys without the client-parameter prefix
    pub client_parameters: BTreeMap<String, String>,
    /// Candidate identity key derived once at write time
    pub match_candidate: Option<String>,
    pub match_type: Option<MatchType>,
    /// Typed extracted attributes keyed by field name
    pub attributes: serde_json::Value,
}

/// Projection of a visit read by the match loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidateVisit {
    pub visit_id: i64,
    pub tenant_id: String,
    pub campaign_id: String,
    pub device_id: Option<i64>,
    pub endpoint_id: Option<i64>,
    pub received_at: DateTime<Utc>,
    pub match_type: MatchType,
    pub match_candidate: String,
}
