//! PostgreSQL implementation of PipelineStore
//!
//! Production persistence using PostgreSQL with:
//! - One database transaction per batch, watermark included
//! - `INSERT .. ON CONFLICT` upserts so concurrent writers never read-then-write
//! - SQLSTATE classification into transient, contract and connectivity errors

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use beacon_schemas::{MatchCandidateVisit, RawEvent, SequenceRange, Visit, Watermark};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tracing::{debug, error, instrument, warn};

use super::store::*;

/// Serialization failure, deadlock detected, lock not available
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

/// Undefined table/column, missing conflict target, not-null and datatype mismatches
const CONTRACT_SQLSTATES: &[&str] = &["42P01", "42703", "42P10", "23502", "42804"];

/// Map a SQLSTATE to the store error taxonomy
pub fn classify_sqlstate(code: Option<&str>, message: String) -> StoreError {
    match code {
        Some(code) if TRANSIENT_SQLSTATES.contains(&code) => StoreError::Conflict(message),
        Some(code) if CONTRACT_SQLSTATES.contains(&code) => StoreError::Contract(message),
        // class 08: connection exception
        Some(code) if code.starts_with("08") => StoreError::Unavailable(message),
        _ => StoreError::Database(message),
    }
}

fn classify(e: &sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Database(db) => {
            let code = db.code();
            classify_sqlstate(code.as_deref(), e.to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => StoreError::Contract(e.to_string()),
        _ => StoreError::Database(e.to_string()),
    }
}

fn store_error(operation: &'static str, e: sqlx::Error) -> StoreError {
    let classified = classify(&e);
    if classified.is_transient() {
        warn!(operation, error = %e, "transient store conflict");
    } else {
        error!(operation, error = %e, "store operation failed");
    }
    classified
}

#[derive(Debug, FromRow)]
struct DbRawEvent {
    sequence_id: i64,
    received_at: DateTime<Utc>,
    tenant_id: String,
    campaign_id: String,
    source_address: String,
    raw_payload: String,
}

impl From<DbRawEvent> for RawEvent {
    fn from(row: DbRawEvent) -> Self {
        Self {
            sequence_id: row.sequence_id,
            received_at: row.received_at,
            tenant_id: row.tenant_id,
            campaign_id: row.campaign_id,
            source_address: row.source_address,
            raw_payload: row.raw_payload,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbWatermark {
    process_name: String,
    last_processed_id: i64,
    last_run_at: Option<DateTime<Utc>>,
    rows_processed: i64,
    rows_matched: i64,
}

impl From<DbWatermark> for Watermark {
    fn from(row: DbWatermark) -> Self {
        Self {
            process_name: row.process_name,
            last_processed_id: row.last_processed_id,
            last_run_at: row.last_run_at,
            rows_processed: row.rows_processed,
            rows_matched: row.rows_matched,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbMatchCandidate {
    visit_id: i64,
    tenant_id: String,
    campaign_id: String,
    device_id: Option<i64>,
    endpoint_id: Option<i64>,
    received_at: DateTime<Utc>,
    match_type: String,
    match_candidate: String,
}

impl TryFrom<DbMatchCandidate> for MatchCandidateVisit {
    type Error = StoreError;

    fn try_from(row: DbMatchCandidate) -> Result<Self, Self::Error> {
        let match_type = row
            .match_type
            .parse()
            .map_err(|e: beacon_schemas::ParseMatchTypeError| StoreError::Contract(e.to_string()))?;
        Ok(Self {
            visit_id: row.visit_id,
            tenant_id: row.tenant_id,
            campaign_id: row.campaign_id,
            device_id: row.device_id,
            endpoint_id: row.endpoint_id,
            received_at: row.received_at,
            match_type,
            match_candidate: row.match_candidate,
        })
    }
}

const WATERMARK_COLUMNS: &str =
    "process_name, last_processed_id, last_run_at, rows_processed, rows_matched";

/// PostgreSQL implementation of PipelineStore
///
/// # Example
///
/// ```ignore
/// use beacon_durable::PostgresPipelineStore;
///
/// let store = PostgresPipelineStore::connect("postgres://localhost/beacon", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresPipelineStore {
    pool: PgPool,
}

impl PostgresPipelineStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| store_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "migration failed");
                StoreError::Contract(e.to_string())
            })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append a raw event the way the capture collaborator does
    #[instrument(skip(self, raw_payload))]
    pub async fn append_raw_event(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        source_address: &str,
        raw_payload: &str,
        received_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO raw_events (tenant_id, campaign_id, source_address, raw_payload, received_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING sequence_id
            "#,
        )
        .bind(tenant_id)
        .bind(campaign_id)
        .bind(source_address)
        .bind(raw_payload)
        .bind(received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("append_raw_event", e))?;

        row.try_get("sequence_id")
            .map_err(|e| store_error("append_raw_event", e))
    }
}

#[async_trait]
impl PipelineStore for PostgresPipelineStore {
    #[instrument(skip(self))]
    async fn max_raw_event_id(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence_id), 0) AS max_id FROM raw_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_error("max_raw_event_id", e))?;
        row.try_get("max_id")
            .map_err(|e| store_error("max_raw_event_id", e))
    }

    #[instrument(skip(self), fields(start = range.start, end = range.end))]
    async fn load_raw_events(&self, range: SequenceRange) -> Result<Vec<RawEvent>, StoreError> {
        let rows = sqlx::query_as::<_, DbRawEvent>(
            r#"
            SELECT sequence_id, received_at, tenant_id, campaign_id, source_address, raw_payload
            FROM raw_events
            WHERE sequence_id BETWEEN $1 AND $2
            ORDER BY sequence_id
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("load_raw_events", e))?;

        debug!(rows = rows.len(), "loaded raw events");
        Ok(rows.into_iter().map(RawEvent::from).collect())
    }

    #[instrument(skip(self))]
    async fn load_watermark(&self, process_name: &str) -> Result<Watermark, StoreError> {
        let row = sqlx::query_as::<_, DbWatermark>(&format!(
            "SELECT {WATERMARK_COLUMNS} FROM pipeline_watermarks WHERE process_name = $1"
        ))
        .bind(process_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("load_watermark", e))?;

        Ok(row
            .map(Watermark::from)
            .unwrap_or_else(|| Watermark::initial(process_name)))
    }

    #[instrument(skip(self))]
    async fn rewind_watermark(&self, process_name: &str, to: i64) -> Result<Watermark, StoreError> {
        let row = sqlx::query_as::<_, DbWatermark>(&format!(
            r#"
            INSERT INTO pipeline_watermarks (process_name, last_processed_id)
            VALUES ($1, $2)
            ON CONFLICT (process_name) DO UPDATE
                SET last_processed_id = EXCLUDED.last_processed_id
            RETURNING {WATERMARK_COLUMNS}
            "#
        ))
        .bind(process_name)
        .bind(to.max(0))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("rewind_watermark", e))?;

        warn!(process_name, to, "watermark rewound");
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn max_visit_id_received_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(visit_id), 0) AS max_id FROM visits WHERE received_at <= $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("max_visit_id_received_before", e))?;
        row.try_get("max_id")
            .map_err(|e| store_error("max_visit_id_received_before", e))
    }

    #[instrument(skip(self), fields(start = range.start, end = range.end))]
    async fn load_match_candidates(
        &self,
        range: SequenceRange,
    ) -> Result<Vec<MatchCandidateVisit>, StoreError> {
        let rows = sqlx::query_as::<_, DbMatchCandidate>(
            r#"
            SELECT visit_id, tenant_id, campaign_id, device_id, endpoint_id, received_at,
                   match_type, match_candidate
            FROM visits
            WHERE visit_id BETWEEN $1 AND $2
              AND match_candidate IS NOT NULL
              AND match_type IS NOT NULL
            ORDER BY visit_id
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("load_match_candidates", e))?;

        rows.into_iter().map(MatchCandidateVisit::try_from).collect()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("begin", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(skip_all, fields(count = observations.len()))]
    async fn upsert_devices(
        &mut self,
        observations: &[DeviceObservation],
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut ids = HashMap::with_capacity(observations.len());
        for obs in observations {
            let row = sqlx::query(
                r#"
                INSERT INTO devices (device_hash, first_seen, last_seen, hit_count, last_event_id)
                VALUES ($1, $2, $3, cardinality($4::bigint[]),
                        COALESCE((SELECT max(x) FROM unnest($4::bigint[]) AS x), 0))
                ON CONFLICT (device_hash) DO UPDATE SET
                    first_seen = LEAST(devices.first_seen, EXCLUDED.first_seen),
                    last_seen = GREATEST(devices.last_seen, EXCLUDED.last_seen),
                    hit_count = devices.hit_count
                        + (SELECT count(*) FROM unnest($4::bigint[]) AS x
                           WHERE x > devices.last_event_id),
                    last_event_id = GREATEST(devices.last_event_id, EXCLUDED.last_event_id)
                RETURNING device_id
                "#,
            )
            .bind(&obs.device_hash)
            .bind(obs.first_seen)
            .bind(obs.last_seen)
            .bind(obs.event_ids.as_slice())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| store_error("upsert_devices", e))?;

            let device_id: i64 = row
                .try_get("device_id")
                .map_err(|e| store_error("upsert_devices", e))?;
            ids.insert(obs.device_hash.clone(), device_id);
        }
        Ok(ids)
    }

    #[instrument(skip_all, fields(count = observations.len()))]
    async fn upsert_endpoints(
        &mut self,
        observations: &[EndpointObservation],
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut ids = HashMap::with_capacity(observations.len());
        for obs in observations {
            let row = sqlx::query(
                r#"
                INSERT INTO network_endpoints
                    (address, ip_version, scope, first_seen, last_seen, hit_count, last_event_id)
                VALUES ($1, $2, $3, $4, $5, cardinality($6::bigint[]),
                        COALESCE((SELECT max(x) FROM unnest($6::bigint[]) AS x), 0))
                ON CONFLICT (address) DO UPDATE SET
                    first_seen = LEAST(network_endpoints.first_seen, EXCLUDED.first_seen),
                    last_seen = GREATEST(network_endpoints.last_seen, EXCLUDED.last_seen),
                    hit_count = network_endpoints.hit_count
                        + (SELECT count(*) FROM unnest($6::bigint[]) AS x
                           WHERE x > network_endpoints.last_event_id),
                    last_event_id = GREATEST(network_endpoints.last_event_id, EXCLUDED.last_event_id)
                RETURNING endpoint_id
                "#,
            )
            .bind(&obs.address)
            .bind(obs.ip_version)
            .bind(obs.scope.as_str())
            .bind(obs.first_seen)
            .bind(obs.last_seen)
            .bind(obs.event_ids.as_slice())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| store_error("upsert_endpoints", e))?;

            let endpoint_id: i64 = row
                .try_get("endpoint_id")
                .map_err(|e| store_error("upsert_endpoints", e))?;
            ids.insert(obs.address.clone(), endpoint_id);
        }
        Ok(ids)
    }

    #[instrument(skip_all, fields(count = visits.len()))]
    async fn insert_visits(&mut self, visits: &[Visit]) -> Result<u64, StoreError> {
        let mut written = 0;
        for visit in visits {
            let client_parameters = serde_json::to_value(&visit.client_parameters)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let result = sqlx::query(
                r#"
                INSERT INTO visits (visit_id, tenant_id, campaign_id, device_id, endpoint_id,
                                    received_at, client_parameters, match_candidate, match_type,
                                    attributes)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (visit_id) DO NOTHING
                "#,
            )
            .bind(visit.visit_id)
            .bind(&visit.tenant_id)
            .bind(&visit.campaign_id)
            .bind(visit.device_id)
            .bind(visit.endpoint_id)
            .bind(visit.received_at)
            .bind(&client_parameters)
            .bind(visit.match_candidate.as_deref())
            .bind(visit.match_type.map(|t| t.as_str()))
            .bind(&visit.attributes)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| store_error("insert_visits", e))?;

            written += result.rows_affected();
        }
        Ok(written)
    }

    #[instrument(skip_all, fields(visit_id = obs.visit_id, match_type = %obs.match_type))]
    async fn merge_match(&mut self, obs: &MatchObservation) -> Result<MatchMerge, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO match_identities
                (tenant_id, campaign_id, match_type, match_key,
                 resolved_identity_key, resolved_group_key, device_id, endpoint_id,
                 first_visit_id, latest_visit_id, first_seen, last_seen, hit_count, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, $10, $10, 1,
                    CASE WHEN $5::text IS NULL THEN NULL ELSE $11::timestamptz END)
            ON CONFLICT (tenant_id, campaign_id, match_type, match_key) DO UPDATE SET
                resolved_identity_key = COALESCE(match_identities.resolved_identity_key,
                                                 EXCLUDED.resolved_identity_key),
                resolved_group_key = COALESCE(match_identities.resolved_group_key,
                                              EXCLUDED.resolved_group_key),
                resolved_at = COALESCE(match_identities.resolved_at, EXCLUDED.resolved_at),
                device_id = CASE WHEN EXCLUDED.latest_visit_id > match_identities.latest_visit_id
                                 THEN COALESCE(EXCLUDED.device_id, match_identities.device_id)
                                 ELSE match_identities.device_id END,
                endpoint_id = CASE WHEN EXCLUDED.latest_visit_id > match_identities.latest_visit_id
                                   THEN COALESCE(EXCLUDED.endpoint_id, match_identities.endpoint_id)
                                   ELSE match_identities.endpoint_id END,
                hit_count = match_identities.hit_count
                    + CASE WHEN EXCLUDED.latest_visit_id > match_identities.latest_visit_id
                           THEN 1 ELSE 0 END,
                first_visit_id = LEAST(match_identities.first_visit_id, EXCLUDED.first_visit_id),
                latest_visit_id = GREATEST(match_identities.latest_visit_id,
                                           EXCLUDED.latest_visit_id),
                first_seen = LEAST(match_identities.first_seen, EXCLUDED.first_seen),
                last_seen = GREATEST(match_identities.last_seen, EXCLUDED.last_seen)
            RETURNING match_id, (xmax = 0) AS inserted, resolved_identity_key
            "#,
        )
        .bind(&obs.tenant_id)
        .bind(&obs.campaign_id)
        .bind(obs.match_type.as_str())
        .bind(&obs.match_key)
        .bind(obs.resolved_identity_key.as_deref())
        .bind(obs.resolved_group_key.as_deref())
        .bind(obs.device_id)
        .bind(obs.endpoint_id)
        .bind(obs.visit_id)
        .bind(obs.seen_at)
        .bind(obs.resolved_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| store_error("merge_match", e))?;

        Ok(MatchMerge {
            match_id: row
                .try_get("match_id")
                .map_err(|e| store_error("merge_match", e))?,
            inserted: row
                .try_get("inserted")
                .map_err(|e| store_error("merge_match", e))?,
            resolved_identity_key: row
                .try_get("resolved_identity_key")
                .map_err(|e| store_error("merge_match", e))?,
        })
    }

    #[instrument(skip_all, fields(process = %advance.process_name, to = advance.to))]
    async fn advance_watermark(
        &mut self,
        advance: &WatermarkAdvance,
    ) -> Result<Watermark, StoreError> {
        let row = sqlx::query_as::<_, DbWatermark>(&format!(
            r#"
            INSERT INTO pipeline_watermarks
                (process_name, last_processed_id, last_run_at, rows_processed, rows_matched)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (process_name) DO UPDATE SET
                last_processed_id = GREATEST(pipeline_watermarks.last_processed_id,
                                             EXCLUDED.last_processed_id),
                last_run_at = EXCLUDED.last_run_at,
                rows_processed = pipeline_watermarks.rows_processed + EXCLUDED.rows_processed,
                rows_matched = pipeline_watermarks.rows_matched + EXCLUDED.rows_matched
            RETURNING {WATERMARK_COLUMNS}
            "#
        ))
        .bind(&advance.process_name)
        .bind(advance.to)
        .bind(advance.at)
        .bind(advance.rows_processed)
        .bind(advance.rows_matched)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| store_error("advance_watermark", e))?;

        Ok(row.into())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| store_error("commit", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_sqlstates() {
        for code in ["40001", "40P01", "55P03"] {
            let err = classify_sqlstate(Some(code), code.to_string());
            assert!(err.is_transient(), "{code}");
        }
    }

    #[test]
    fn test_contract_sqlstates() {
        for code in ["42P01", "42703", "42P10", "23502", "42804"] {
            assert!(matches!(
                classify_sqlstate(Some(code), String::new()),
                StoreError::Contract(_)
            ));
        }
    }

    #[test]
    fn test_other_sqlstates() {
        assert!(matches!(
            classify_sqlstate(Some("08006"), String::new()),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("23505"), String::new()),
            StoreError::Database(_)
        ));
        assert!(matches!(
            classify_sqlstate(None, String::new()),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(matches!(
            classify(&sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            classify(&sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }
}
