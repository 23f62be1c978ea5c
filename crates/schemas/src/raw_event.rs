// Raw beacon events
//
// Written by the capture endpoint, read-only for the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A captured tracking-beacon hit
///
/// `sequence_id` is assigned by the writer and strictly increasing. Gaps are
/// allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub sequence_id: i64,
    pub received_at: DateTime<Utc>,
    pub tenant_id: String,
    pub campaign_id: String,
    pub source_address: String,
    /// URL-encoded key/value payload as received
    pub raw_payload: String,
}
