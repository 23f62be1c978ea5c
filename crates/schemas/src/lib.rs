// Beacon Schemas
//
// Decision: This crate is the source of truth for all shared data structures
// Decision: Minimal dependencies - only serde, chrono, thiserror
// Decision: No runtime logic - only type definitions, serialization and
// the small invariants that belong to the types (range math, enum parsing)

pub mod dimension;
pub mod field;
pub mod match_identity;
pub mod raw_event;
pub mod reference;
pub mod visit;
pub mod watermark;

// Dimension types
pub use dimension::{Device, EndpointScope, NetworkEndpoint};

// Extracted field values
pub use field::{FieldKind, FieldValue};

// Match store types
pub use match_identity::{MatchIdentity, MatchType, ParseMatchTypeError};

// Raw events
pub use raw_event::RawEvent;

// Reference dataset rows
pub use reference::{ReferenceRow, ReliabilityFlags};

// Fact rows
pub use visit::{MatchCandidateVisit, Visit};

// Watermarks
pub use watermark::{SequenceRange, Watermark, EXTRACT_PROCESS, MATCH_PROCESS};
