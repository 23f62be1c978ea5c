// Per-phase pipeline functions
//
// Each phase is a plain function over a batch so it can be unit tested
// without a scheduler:
// - parse: raw event -> parsed record (extract + fingerprint + endpoint)
// - dimensions: parsed records -> deduplicated device/endpoint upserts
// - visits: parsed records + dimension ids -> visit rows
// - resolver: visit candidates -> normalized keys + reference resolution

pub mod dimensions;
pub mod resolver;
pub mod visits;

use beacon_core::{device_hash, normalize_address, EndpointKey, ExtractedPayload, Extractor};
use beacon_schemas::RawEvent;

/// Transient typed projection of one raw event
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub event: RawEvent,
    pub payload: ExtractedPayload,
    /// `None` when every fingerprint input was blank
    pub device_hash: Option<String>,
    /// `None` when the event carried no source address
    pub endpoint: Option<EndpointKey>,
}

/// Parse one raw event. Never fails: bad fields degrade to defaults.
pub fn parse_event(extractor: &Extractor, event: RawEvent) -> ParsedRecord {
    let payload = extractor.extract(&event.raw_payload);
    let device_hash = device_hash(&payload);
    let endpoint = normalize_address(&event.source_address);
    ParsedRecord {
        event,
        payload,
        device_hash,
        endpoint,
    }
}
