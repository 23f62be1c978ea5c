//! PipelineStore and StoreTransaction trait definitions

use std::collections::HashMap;

use async_trait::async_trait;
use beacon_schemas::{
    EndpointScope, MatchCandidateVisit, MatchType, RawEvent, SequenceRange, Visit, Watermark,
};
use chrono::{DateTime, Utc};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Serialization failure, deadlock or lock timeout; safe to retry
    #[error("transient conflict: {0}")]
    Conflict(String),

    /// The store schema does not match what the pipeline expects
    #[error("contract violation: {0}")]
    Contract(String),

    /// Connection or pool failure
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the operation may succeed if simply re-run
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Aggregated sightings of one device hash within a batch
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceObservation {
    pub device_hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Raw event ids contributing to this observation
    pub event_ids: Vec<i64>,
}

/// Aggregated sightings of one normalized address within a batch
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointObservation {
    pub address: String,
    pub ip_version: Option<i16>,
    pub scope: EndpointScope,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_ids: Vec<i64>,
}

/// One visit's contribution to a match identity
#[derive(Debug, Clone, PartialEq)]
pub struct MatchObservation {
    pub tenant_id: String,
    pub campaign_id: String,
    pub match_type: MatchType,
    /// Normalized candidate key
    pub match_key: String,
    pub resolved_identity_key: Option<String>,
    pub resolved_group_key: Option<String>,
    pub device_id: Option<i64>,
    pub endpoint_id: Option<i64>,
    pub visit_id: i64,
    pub seen_at: DateTime<Utc>,
    /// Timestamp recorded when this merge first resolves the identity
    pub resolved_at: DateTime<Utc>,
}

/// Result of merging one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchMerge {
    pub match_id: i64,
    /// A new match identity row was created
    pub inserted: bool,
    /// Identity key stored after the merge
    pub resolved_identity_key: Option<String>,
}

/// Watermark update applied inside a batch transaction
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkAdvance {
    pub process_name: String,
    pub to: i64,
    pub rows_processed: i64,
    pub rows_matched: i64,
    pub at: DateTime<Utc>,
}

/// Read side of the pipeline store and the entry point to batch transactions
///
/// Implementations must be thread-safe. Reads never see uncommitted
/// transaction state.
#[async_trait]
pub trait PipelineStore: Send + Sync + 'static {
    // =========================================================================
    // Raw events
    // =========================================================================

    /// Highest raw event sequence id, 0 when empty
    async fn max_raw_event_id(&self) -> Result<i64, StoreError>;

    /// Raw events with sequence ids in `range`, ascending
    async fn load_raw_events(&self, range: SequenceRange) -> Result<Vec<RawEvent>, StoreError>;

    // =========================================================================
    // Watermarks
    // =========================================================================

    /// Current watermark, or the initial watermark if the loop never ran
    async fn load_watermark(&self, process_name: &str) -> Result<Watermark, StoreError>;

    /// Move a watermark to an explicit position, backwards included
    ///
    /// Operator action for replaying a range. The pipeline itself only ever
    /// advances watermarks through [`StoreTransaction::advance_watermark`].
    async fn rewind_watermark(&self, process_name: &str, to: i64) -> Result<Watermark, StoreError>;

    // =========================================================================
    // Visits
    // =========================================================================

    /// Highest visit id received at or before `cutoff`, 0 when none
    async fn max_visit_id_received_before(&self, cutoff: DateTime<Utc>)
        -> Result<i64, StoreError>;

    /// Visits in `range` that carry a match candidate, ascending
    async fn load_match_candidates(
        &self,
        range: SequenceRange,
    ) -> Result<Vec<MatchCandidateVisit>, StoreError>;

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a unit of work. Dropping it without commit discards every write.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Write side of one batch
///
/// Everything written through a transaction, the watermark included, becomes
/// visible atomically on [`StoreTransaction::commit`].
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert or update devices; returns device hash -> device id
    ///
    /// Only event ids above a row's `last_event_id` add to its hit count, so
    /// re-applying an observation is a no-op for counting.
    async fn upsert_devices(
        &mut self,
        observations: &[DeviceObservation],
    ) -> Result<HashMap<String, i64>, StoreError>;

    /// Insert or update endpoints; returns address -> endpoint id
    async fn upsert_endpoints(
        &mut self,
        observations: &[EndpointObservation],
    ) -> Result<HashMap<String, i64>, StoreError>;

    /// Insert visits, skipping ids that already exist. Returns rows written.
    async fn insert_visits(&mut self, visits: &[Visit]) -> Result<u64, StoreError>;

    /// Merge one observation into its match identity
    async fn merge_match(&mut self, observation: &MatchObservation)
        -> Result<MatchMerge, StoreError>;

    /// Advance a watermark. The stored position never decreases.
    async fn advance_watermark(
        &mut self,
        advance: &WatermarkAdvance,
    ) -> Result<Watermark, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
