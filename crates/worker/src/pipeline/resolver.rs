// Identity resolver
//
// Resolution is split in two so the reference dataset is never coupled to a
// store transaction: `resolve_batch` performs every lookup up front, and
// `merge_batch` writes the results inside the batch transaction.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::{normalize_candidate, select_resolution, Resolution};
use beacon_durable::persistence::MatchObservation;
use beacon_durable::{ReferenceDataset, ReferenceError, StoreError, StoreTransaction};
use beacon_schemas::{MatchCandidateVisit, MatchType};
use chrono::{DateTime, Utc};
use tracing::debug;

/// A visit whose candidate normalized and was looked up
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCandidate {
    pub visit: MatchCandidateVisit,
    /// Normalized candidate key
    pub match_key: String,
    pub resolution: Resolution,
}

impl ResolvedCandidate {
    pub fn observation(&self, resolved_at: DateTime<Utc>) -> MatchObservation {
        MatchObservation {
            tenant_id: self.visit.tenant_id.clone(),
            campaign_id: self.visit.campaign_id.clone(),
            match_type: self.visit.match_type,
            match_key: self.match_key.clone(),
            resolved_identity_key: self.resolution.individual_key.clone(),
            resolved_group_key: self.resolution.group_key.clone(),
            device_id: self.visit.device_id,
            endpoint_id: self.visit.endpoint_id,
            visit_id: self.visit.visit_id,
            seen_at: self.visit.received_at,
            resolved_at,
        }
    }
}

/// Lookup results for one match batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionBatch {
    /// In visit order
    pub resolved: Vec<ResolvedCandidate>,
    /// Candidates rejected by normalization, never looked up
    pub rejected: usize,
    /// Distinct keys sent to the reference dataset
    pub lookups: usize,
}

/// Normalizes candidates and resolves them against the reference dataset
#[derive(Clone)]
pub struct IdentityResolver {
    reference: Arc<dyn ReferenceDataset>,
}

impl IdentityResolver {
    pub fn new(reference: Arc<dyn ReferenceDataset>) -> Self {
        Self { reference }
    }

    /// Resolve every visit in the batch
    ///
    /// Each distinct normalized key is looked up once. Any lookup failure
    /// aborts the whole batch.
    pub async fn resolve_batch(
        &self,
        visits: &[MatchCandidateVisit],
    ) -> Result<ResolutionBatch, ReferenceError> {
        let mut batch = ResolutionBatch::default();
        let mut cache: HashMap<(MatchType, String), Resolution> = HashMap::new();

        for visit in visits {
            let match_key = match normalize_candidate(visit.match_type, &visit.match_candidate) {
                Ok(key) => key,
                Err(reason) => {
                    debug!(visit_id = visit.visit_id, %reason, "candidate rejected");
                    batch.rejected += 1;
                    continue;
                }
            };

            let cache_key = (visit.match_type, match_key.clone());
            let resolution = match cache.get(&cache_key) {
                Some(resolution) => resolution.clone(),
                None => {
                    let rows = self.reference.lookup(visit.match_type, &match_key).await?;
                    batch.lookups += 1;
                    let resolution = select_resolution(&rows);
                    cache.insert(cache_key, resolution.clone());
                    resolution
                }
            };

            batch.resolved.push(ResolvedCandidate {
                visit: visit.clone(),
                match_key,
                resolution,
            });
        }

        Ok(batch)
    }
}

/// Merge resolved candidates into match identities, in visit order
///
/// Returns how many merges left the identity resolved.
pub async fn merge_batch(
    tx: &mut dyn StoreTransaction,
    resolved: &[ResolvedCandidate],
    resolved_at: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let mut matched = 0;
    for candidate in resolved {
        let merge = tx.merge_match(&candidate.observation(resolved_at)).await?;
        if merge.resolved_identity_key.is_some() {
            matched += 1;
        }
    }
    Ok(matched)
}
