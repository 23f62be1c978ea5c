// Beacon pipeline core
//
// Pure transformation logic shared by the pipeline loops:
// - Payload field extraction against a fixed field catalog
// - Composite device fingerprint hashing
// - Source address normalization and classification
// - Candidate identity normalization and reference-row selection
//
// Key design decisions:
// - No I/O here; storage and the reference dataset live in beacon-durable
// - Malformed input degrades to defaults or diagnostics, never to an error
// - Telemetry initialization is shared so every binary logs the same way

pub mod endpoint;
pub mod extract;
pub mod fingerprint;
pub mod identity;
pub mod telemetry;

pub use endpoint::{normalize_address, EndpointKey};
pub use extract::{ExtractedPayload, Extractor, ExtractorConfig};
pub use fingerprint::device_hash;
pub use identity::{
    normalize_candidate, normalize_email, normalize_phone, select_resolution, CandidateError,
    Resolution,
};
