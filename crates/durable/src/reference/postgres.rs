//! PostgreSQL reference dataset

use std::time::Duration;

use async_trait::async_trait;
use beacon_schemas::{MatchType, ReferenceRow, ReliabilityFlags};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, instrument};

use super::{ReferenceDataset, ReferenceError};

#[derive(Debug, FromRow)]
struct DbReferenceRow {
    individual_key: Option<String>,
    group_key: Option<String>,
    reliability_flags: i32,
    recency_ordinal: i64,
}

impl From<DbReferenceRow> for ReferenceRow {
    fn from(row: DbReferenceRow) -> Self {
        Self {
            individual_key: row.individual_key,
            group_key: row.group_key,
            reliability_flags: ReliabilityFlags::from(row.reliability_flags),
            recency_ordinal: row.recency_ordinal,
        }
    }
}

fn reference_error(e: sqlx::Error) -> ReferenceError {
    error!(error = %e, "reference lookup failed");
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ReferenceError::Unavailable(e.to_string()),
        _ => ReferenceError::Query(e.to_string()),
    }
}

/// Reference dataset stored in a `reference_identities` table
///
/// Uses its own pool so a slow or unreachable dataset never holds pipeline
/// store connections.
#[derive(Clone)]
pub struct PostgresReferenceDataset {
    pool: PgPool,
}

impl PostgresReferenceDataset {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool without connecting eagerly
    ///
    /// An unreachable dataset surfaces as [`ReferenceError::Unavailable`] on
    /// lookup instead of failing startup.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, ReferenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .map_err(|e| ReferenceError::Query(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReferenceDataset for PostgresReferenceDataset {
    #[instrument(skip(self, normalized_key))]
    async fn lookup(
        &self,
        match_type: MatchType,
        normalized_key: &str,
    ) -> Result<Vec<ReferenceRow>, ReferenceError> {
        let rows = sqlx::query_as::<_, DbReferenceRow>(
            r#"
            SELECT individual_key, group_key, reliability_flags, recency_ordinal
            FROM reference_identities
            WHERE match_type = $1 AND match_key = $2
            "#,
        )
        .bind(match_type.as_str())
        .bind(normalized_key)
        .fetch_all(&self.pool)
        .await
        .map_err(reference_error)?;

        debug!(rows = rows.len(), "reference lookup");
        Ok(rows.into_iter().map(ReferenceRow::from).collect())
    }
}
