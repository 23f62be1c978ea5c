// Dimension upserter
//
// A batch is reduced to one observation per natural key before anything is
// written. Observations come out sorted by key so concurrent writers always
// take row locks in the same order.

use std::collections::{BTreeMap, HashMap};

use beacon_durable::persistence::{DeviceObservation, EndpointObservation, StoreTransaction};
use beacon_durable::StoreError;

use super::ParsedRecord;

/// Surrogate ids assigned to the batch's natural keys
#[derive(Debug, Clone, Default)]
pub struct DimensionIds {
    /// device hash -> device id
    pub devices: HashMap<String, i64>,
    /// normalized address -> endpoint id
    pub endpoints: HashMap<String, i64>,
}

impl DimensionIds {
    pub fn device_id(&self, record: &ParsedRecord) -> Option<i64> {
        record
            .device_hash
            .as_ref()
            .and_then(|hash| self.devices.get(hash).copied())
    }

    pub fn endpoint_id(&self, record: &ParsedRecord) -> Option<i64> {
        record
            .endpoint
            .as_ref()
            .and_then(|endpoint| self.endpoints.get(&endpoint.address).copied())
    }
}

/// One observation per distinct device hash
pub fn aggregate_devices(records: &[ParsedRecord]) -> Vec<DeviceObservation> {
    let mut by_hash: BTreeMap<&str, DeviceObservation> = BTreeMap::new();
    for record in records {
        let Some(hash) = record.device_hash.as_deref() else {
            continue;
        };
        let seen = record.event.received_at;
        by_hash
            .entry(hash)
            .and_modify(|obs| {
                obs.first_seen = obs.first_seen.min(seen);
                obs.last_seen = obs.last_seen.max(seen);
                obs.event_ids.push(record.event.sequence_id);
            })
            .or_insert_with(|| DeviceObservation {
                device_hash: hash.to_string(),
                first_seen: seen,
                last_seen: seen,
                event_ids: vec![record.event.sequence_id],
            });
    }
    by_hash.into_values().collect()
}

/// One observation per distinct normalized address
pub fn aggregate_endpoints(records: &[ParsedRecord]) -> Vec<EndpointObservation> {
    let mut by_address: BTreeMap<&str, EndpointObservation> = BTreeMap::new();
    for record in records {
        let Some(endpoint) = record.endpoint.as_ref() else {
            continue;
        };
        let seen = record.event.received_at;
        by_address
            .entry(endpoint.address.as_str())
            .and_modify(|obs| {
                obs.first_seen = obs.first_seen.min(seen);
                obs.last_seen = obs.last_seen.max(seen);
                obs.event_ids.push(record.event.sequence_id);
            })
            .or_insert_with(|| EndpointObservation {
                address: endpoint.address.clone(),
                ip_version: endpoint.ip_version,
                scope: endpoint.scope,
                first_seen: seen,
                last_seen: seen,
                event_ids: vec![record.event.sequence_id],
            });
    }
    by_address.into_values().collect()
}

/// Upsert the batch's devices and endpoints inside `tx`
pub async fn upsert_dimensions(
    tx: &mut dyn StoreTransaction,
    devices: &[DeviceObservation],
    endpoints: &[EndpointObservation],
) -> Result<DimensionIds, StoreError> {
    Ok(DimensionIds {
        devices: tx.upsert_devices(devices).await?,
        endpoints: tx.upsert_endpoints(endpoints).await?,
    })
}

#[cfg(test)]
mod tests {
    use beacon_core::Extractor;

    use super::*;
    use crate::pipeline::parse_event;
    use crate::pipeline::test_support::{at, raw};

    const FINGERPRINT: &str = "canvas_hash=c1&audio_hash=a1";

    fn records() -> Vec<ParsedRecord> {
        let extractor = Extractor::default();
        vec![
            raw(1, "203.0.113.9", FINGERPRINT, 30),
            raw(2, "198.51.100.7", "canvas_hash=other", 10),
            raw(3, "203.0.113.9:8080", FINGERPRINT, 20),
            raw(4, "", "", 40),
        ]
        .into_iter()
        .map(|event| parse_event(&extractor, event))
        .collect()
    }

    #[test]
    fn test_devices_deduplicated_by_hash() {
        let devices = aggregate_devices(&records());
        assert_eq!(devices.len(), 2);

        let shared = devices
            .iter()
            .find(|d| d.event_ids.len() == 2)
            .unwrap();
        assert_eq!(shared.event_ids, vec![1, 3]);
        assert_eq!(shared.first_seen, at(20));
        assert_eq!(shared.last_seen, at(30));
    }

    #[test]
    fn test_observations_sorted_by_key() {
        let devices = aggregate_devices(&records());
        assert!(devices.windows(2).all(|w| w[0].device_hash < w[1].device_hash));

        let endpoints = aggregate_endpoints(&records());
        let addresses: Vec<_> = endpoints.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addresses, vec!["198.51.100.7", "203.0.113.9"]);
    }

    #[test]
    fn test_endpoints_merge_ports() {
        let endpoints = aggregate_endpoints(&records());
        let public = endpoints
            .iter()
            .find(|e| e.address == "203.0.113.9")
            .unwrap();
        assert_eq!(public.event_ids, vec![1, 3]);
        assert_eq!(public.ip_version, Some(4));
    }

    #[test]
    fn test_records_without_keys_are_skipped() {
        let only_blank = vec![parse_event(&Extractor::default(), raw(9, " ", "", 0))];
        assert!(aggregate_devices(&only_blank).is_empty());
        assert!(aggregate_endpoints(&only_blank).is_empty());
    }
}
