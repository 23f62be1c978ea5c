//! In-memory implementation of PipelineStore for testing

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use beacon_schemas::{
    Device, MatchCandidateVisit, MatchIdentity, MatchType, NetworkEndpoint, RawEvent,
    SequenceRange, Visit, Watermark,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::store::*;

type MatchKey = (String, String, MatchType, String);

#[derive(Debug, Clone, Default)]
struct State {
    raw_events: BTreeMap<i64, RawEvent>,
    watermarks: HashMap<String, Watermark>,
    devices: HashMap<String, Device>,
    endpoints: HashMap<String, NetworkEndpoint>,
    visits: BTreeMap<i64, Visit>,
    matches: HashMap<MatchKey, MatchIdentity>,
    next_device_id: i64,
    next_endpoint_id: i64,
    next_match_id: i64,
}

/// In-memory implementation of PipelineStore
///
/// Transactions are serialized: `begin` holds the store lock until the
/// transaction commits or is dropped, and writes are applied to a staged copy
/// that replaces the live state only on commit.
///
/// # Example
///
/// ```
/// use beacon_durable::InMemoryPipelineStore;
///
/// let store = InMemoryPipelineStore::new();
/// ```
#[derive(Clone, Default)]
pub struct InMemoryPipelineStore {
    state: Arc<tokio::sync::Mutex<State>>,
    commit_failures: Arc<Mutex<VecDeque<StoreError>>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw event the way the capture collaborator would
    pub async fn append_raw_event(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        source_address: &str,
        raw_payload: &str,
        received_at: DateTime<Utc>,
    ) -> i64 {
        let mut state = self.state.lock().await;
        let sequence_id = state.raw_events.keys().next_back().copied().unwrap_or(0) + 1;
        state.raw_events.insert(
            sequence_id,
            RawEvent {
                sequence_id,
                received_at,
                tenant_id: tenant_id.to_string(),
                campaign_id: campaign_id.to_string(),
                source_address: source_address.to_string(),
                raw_payload: raw_payload.to_string(),
            },
        );
        sequence_id
    }

    /// Make the next commit fail with `error` (queued, one per commit)
    pub fn fail_next_commit(&self, error: StoreError) {
        self.commit_failures.lock().push_back(error);
    }

    pub async fn devices(&self) -> Vec<Device> {
        let state = self.state.lock().await;
        let mut devices: Vec<_> = state.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.device_id);
        devices
    }

    pub async fn endpoints(&self) -> Vec<NetworkEndpoint> {
        let state = self.state.lock().await;
        let mut endpoints: Vec<_> = state.endpoints.values().cloned().collect();
        endpoints.sort_by_key(|e| e.endpoint_id);
        endpoints
    }

    pub async fn visits(&self) -> Vec<Visit> {
        self.state.lock().await.visits.values().cloned().collect()
    }

    pub async fn match_identities(&self) -> Vec<MatchIdentity> {
        let state = self.state.lock().await;
        let mut matches: Vec<_> = state.matches.values().cloned().collect();
        matches.sort_by_key(|m| m.match_id);
        matches
    }

    pub async fn match_identity(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        match_type: MatchType,
        match_key: &str,
    ) -> Option<MatchIdentity> {
        let key = (
            tenant_id.to_string(),
            campaign_id.to_string(),
            match_type,
            match_key.to_string(),
        );
        self.state.lock().await.matches.get(&key).cloned()
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn max_raw_event_id(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.raw_events.keys().next_back().copied().unwrap_or(0))
    }

    async fn load_raw_events(&self, range: SequenceRange) -> Result<Vec<RawEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .raw_events
            .range(range.start..=range.end)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn load_watermark(&self, process_name: &str) -> Result<Watermark, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .watermarks
            .get(process_name)
            .cloned()
            .unwrap_or_else(|| Watermark::initial(process_name)))
    }

    async fn rewind_watermark(&self, process_name: &str, to: i64) -> Result<Watermark, StoreError> {
        let mut state = self.state.lock().await;
        let watermark = state
            .watermarks
            .entry(process_name.to_string())
            .or_insert_with(|| Watermark::initial(process_name));
        watermark.last_processed_id = to.max(0);
        Ok(watermark.clone())
    }

    async fn max_visit_id_received_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .visits
            .values()
            .filter(|v| v.received_at <= cutoff)
            .map(|v| v.visit_id)
            .max()
            .unwrap_or(0))
    }

    async fn load_match_candidates(
        &self,
        range: SequenceRange,
    ) -> Result<Vec<MatchCandidateVisit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .visits
            .range(range.start..=range.end)
            .filter_map(|(_, v)| {
                let candidate = v.match_candidate.clone()?;
                let match_type = v.match_type?;
                Some(MatchCandidateVisit {
                    visit_id: v.visit_id,
                    tenant_id: v.tenant_id.clone(),
                    campaign_id: v.campaign_id.clone(),
                    device_id: v.device_id,
                    endpoint_id: v.endpoint_id,
                    received_at: v.received_at,
                    match_type,
                    match_candidate: candidate,
                })
            })
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            staged,
            commit_failures: self.commit_failures.clone(),
        }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    staged: State,
    commit_failures: Arc<Mutex<VecDeque<StoreError>>>,
}

fn fresh_hits(event_ids: &[i64], last_event_id: i64) -> i64 {
    event_ids.iter().filter(|id| **id > last_event_id).count() as i64
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn upsert_devices(
        &mut self,
        observations: &[DeviceObservation],
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut ids = HashMap::with_capacity(observations.len());
        for obs in observations {
            let max_event = obs.event_ids.iter().copied().max().unwrap_or(0);
            let device_id = match self.staged.devices.get_mut(&obs.device_hash) {
                Some(device) => {
                    device.first_seen = device.first_seen.min(obs.first_seen);
                    device.last_seen = device.last_seen.max(obs.last_seen);
                    device.hit_count += fresh_hits(&obs.event_ids, device.last_event_id);
                    device.last_event_id = device.last_event_id.max(max_event);
                    device.device_id
                }
                None => {
                    self.staged.next_device_id += 1;
                    let device_id = self.staged.next_device_id;
                    self.staged.devices.insert(
                        obs.device_hash.clone(),
                        Device {
                            device_id,
                            device_hash: obs.device_hash.clone(),
                            first_seen: obs.first_seen,
                            last_seen: obs.last_seen,
                            hit_count: obs.event_ids.len() as i64,
                            last_event_id: max_event,
                        },
                    );
                    device_id
                }
            };
            ids.insert(obs.device_hash.clone(), device_id);
        }
        Ok(ids)
    }

    async fn upsert_endpoints(
        &mut self,
        observations: &[EndpointObservation],
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut ids = HashMap::with_capacity(observations.len());
        for obs in observations {
            let max_event = obs.event_ids.iter().copied().max().unwrap_or(0);
            let endpoint_id = match self.staged.endpoints.get_mut(&obs.address) {
                Some(endpoint) => {
                    endpoint.first_seen = endpoint.first_seen.min(obs.first_seen);
                    endpoint.last_seen = endpoint.last_seen.max(obs.last_seen);
                    endpoint.hit_count += fresh_hits(&obs.event_ids, endpoint.last_event_id);
                    endpoint.last_event_id = endpoint.last_event_id.max(max_event);
                    endpoint.endpoint_id
                }
                None => {
                    self.staged.next_endpoint_id += 1;
                    let endpoint_id = self.staged.next_endpoint_id;
                    self.staged.endpoints.insert(
                        obs.address.clone(),
                        NetworkEndpoint {
                            endpoint_id,
                            address: obs.address.clone(),
                            ip_version: obs.ip_version,
                            scope: obs.scope,
                            first_seen: obs.first_seen,
                            last_seen: obs.last_seen,
                            hit_count: obs.event_ids.len() as i64,
                            last_event_id: max_event,
                        },
                    );
                    endpoint_id
                }
            };
            ids.insert(obs.address.clone(), endpoint_id);
        }
        Ok(ids)
    }

    async fn insert_visits(&mut self, visits: &[Visit]) -> Result<u64, StoreError> {
        let mut written = 0;
        for visit in visits {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                self.staged.visits.entry(visit.visit_id)
            {
                slot.insert(visit.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn merge_match(
        &mut self,
        obs: &MatchObservation,
    ) -> Result<MatchMerge, StoreError> {
        let key = (
            obs.tenant_id.clone(),
            obs.campaign_id.clone(),
            obs.match_type,
            obs.match_key.clone(),
        );

        if let Some(identity) = self.staged.matches.get_mut(&key) {
            if identity.resolved_identity_key.is_none() && obs.resolved_identity_key.is_some() {
                identity.resolved_identity_key = obs.resolved_identity_key.clone();
                identity.resolved_at = Some(obs.resolved_at);
            }
            if identity.resolved_group_key.is_none() {
                identity.resolved_group_key = obs.resolved_group_key.clone();
            }
            if obs.visit_id > identity.latest_visit_id {
                identity.latest_visit_id = obs.visit_id;
                identity.hit_count += 1;
                identity.device_id = obs.device_id.or(identity.device_id);
                identity.endpoint_id = obs.endpoint_id.or(identity.endpoint_id);
            }
            identity.first_visit_id = identity.first_visit_id.min(obs.visit_id);
            identity.first_seen = identity.first_seen.min(obs.seen_at);
            identity.last_seen = identity.last_seen.max(obs.seen_at);

            return Ok(MatchMerge {
                match_id: identity.match_id,
                inserted: false,
                resolved_identity_key: identity.resolved_identity_key.clone(),
            });
        }

        self.staged.next_match_id += 1;
        let match_id = self.staged.next_match_id;
        self.staged.matches.insert(
            key,
            MatchIdentity {
                match_id,
                tenant_id: obs.tenant_id.clone(),
                campaign_id: obs.campaign_id.clone(),
                match_type: obs.match_type,
                match_key: obs.match_key.clone(),
                resolved_identity_key: obs.resolved_identity_key.clone(),
                resolved_group_key: obs.resolved_group_key.clone(),
                device_id: obs.device_id,
                endpoint_id: obs.endpoint_id,
                first_visit_id: obs.visit_id,
                latest_visit_id: obs.visit_id,
                first_seen: obs.seen_at,
                last_seen: obs.seen_at,
                hit_count: 1,
                resolved_at: obs.resolved_identity_key.as_ref().map(|_| obs.resolved_at),
            },
        );

        Ok(MatchMerge {
            match_id,
            inserted: true,
            resolved_identity_key: obs.resolved_identity_key.clone(),
        })
    }

    async fn advance_watermark(
        &mut self,
        advance: &WatermarkAdvance,
    ) -> Result<Watermark, StoreError> {
        let current = self
            .staged
            .watermarks
            .get(&advance.process_name)
            .cloned()
            .unwrap_or_else(|| Watermark::initial(advance.process_name.clone()));
        let next = current.advanced(
            advance.to,
            advance.rows_processed,
            advance.rows_matched,
            advance.at,
        );
        self.staged
            .watermarks
            .insert(advance.process_name.clone(), next.clone());
        Ok(next)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction {
            mut guard,
            staged,
            commit_failures,
        } = *self;

        if let Some(error) = commit_failures.lock().pop_front() {
            return Err(error);
        }
        *guard = staged;
        Ok(())
    }
}
