//! Read-only reference dataset
//!
//! The reference dataset maps normalized candidate keys to individual and
//! household identities. It is never part of a pipeline transaction.

mod memory;
mod postgres;

use async_trait::async_trait;
use beacon_schemas::{MatchType, ReferenceRow};

pub use memory::InMemoryReferenceDataset;
pub use postgres::PostgresReferenceDataset;

/// Error type for reference lookups
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// The dataset could not be reached
    #[error("reference dataset unavailable: {0}")]
    Unavailable(String),

    /// The lookup reached the dataset but failed
    #[error("reference lookup failed: {0}")]
    Query(String),
}

/// Lookup interface over the reference dataset
#[async_trait]
pub trait ReferenceDataset: Send + Sync + 'static {
    /// All rows recorded for a normalized key, in no particular order
    async fn lookup(
        &self,
        match_type: MatchType,
        normalized_key: &str,
    ) -> Result<Vec<ReferenceRow>, ReferenceError>;

    async fn lookup_by_normalized_email(
        &self,
        normalized_email: &str,
    ) -> Result<Vec<ReferenceRow>, ReferenceError> {
        self.lookup(MatchType::Email, normalized_email).await
    }
}
