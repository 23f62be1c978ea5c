// Visit fact writer

use beacon_durable::{StoreError, StoreTransaction};
use beacon_schemas::Visit;

use super::dimensions::DimensionIds;
use super::ParsedRecord;

/// Build one visit per record, keyed by the raw event sequence id
///
/// The match candidate is derived here, once, from the client parameters.
pub fn build_visits(records: &[ParsedRecord], ids: &DimensionIds) -> Vec<Visit> {
    records
        .iter()
        .map(|record| {
            let candidate = record.payload.match_candidate();
            Visit {
                visit_id: record.event.sequence_id,
                tenant_id: record.event.tenant_id.clone(),
                campaign_id: record.event.campaign_id.clone(),
                device_id: ids.device_id(record),
                endpoint_id: ids.endpoint_id(record),
                received_at: record.event.received_at,
                client_parameters: record.payload.client_parameters.clone(),
                match_type: candidate.as_ref().map(|(match_type, _)| *match_type),
                match_candidate: candidate.map(|(_, value)| value),
                attributes: record.payload.attributes_json(),
            }
        })
        .collect()
}

/// Write visits; ids already present are left untouched
pub async fn write_visits(
    tx: &mut dyn StoreTransaction,
    visits: &[Visit],
) -> Result<u64, StoreError> {
    tx.insert_visits(visits).await
}
