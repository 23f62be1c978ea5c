//! In-memory reference dataset for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use beacon_schemas::{MatchType, ReferenceRow};
use parking_lot::RwLock;

use super::{ReferenceDataset, ReferenceError};

/// In-memory reference dataset
///
/// Can be switched offline to simulate an unreachable dataset, and counts
/// lookups so callers can assert which keys reached it.
pub struct InMemoryReferenceDataset {
    rows: RwLock<HashMap<(MatchType, String), Vec<ReferenceRow>>>,
    available: AtomicBool,
    lookups: AtomicUsize,
}

impl Default for InMemoryReferenceDataset {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            lookups: AtomicUsize::new(0),
        }
    }
}

impl InMemoryReferenceDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row under a normalized key
    pub fn insert(&self, match_type: MatchType, normalized_key: &str, row: ReferenceRow) {
        self.rows
            .write()
            .entry((match_type, normalized_key.to_string()))
            .or_default()
            .push(row);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of lookups that reached the dataset
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceDataset for InMemoryReferenceDataset {
    async fn lookup(
        &self,
        match_type: MatchType,
        normalized_key: &str,
    ) -> Result<Vec<ReferenceRow>, ReferenceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ReferenceError::Unavailable("dataset offline".to_string()));
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .read()
            .get(&(match_type, normalized_key.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use beacon_schemas::ReliabilityFlags;

    use super::*;

    fn row(key: &str) -> ReferenceRow {
        ReferenceRow {
            individual_key: Some(key.to_string()),
            group_key: None,
            reliability_flags: ReliabilityFlags::NONE,
            recency_ordinal: 1,
        }
    }

    #[tokio::test]
    async fn test_lookup_by_type_and_key() {
        let dataset = InMemoryReferenceDataset::new();
        dataset.insert(MatchType::Email, "foo@example.com", row("ind-1"));
        dataset.insert(MatchType::Phone, "15551234567", row("ind-2"));

        let rows = dataset.lookup_by_normalized_email("foo@example.com").await.unwrap();
        assert_eq!(rows, vec![row("ind-1")]);
        assert!(dataset
            .lookup(MatchType::Email, "15551234567")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(dataset.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_offline_dataset() {
        let dataset = InMemoryReferenceDataset::new();
        dataset.set_available(false);

        let err = dataset.lookup(MatchType::Email, "foo@example.com").await;
        assert!(matches!(err, Err(ReferenceError::Unavailable(_))));
        assert_eq!(dataset.lookup_count(), 0);
    }
}
