// Reference dataset rows
//
// The reference dataset is an external, read-only system of record. It is
// denormalized: one person can appear under many rows.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags marking a reference row as unreliable
    ///
    /// Bits unknown to this build are retained, so a row carrying a flag
    /// added upstream still counts as unreliable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(from = "i32", into = "i32")]
    pub struct ReliabilityFlags: i32 {
        /// Observed behind a VPN exit
        const VPN = 1;
        /// Observed from an anonymizing proxy or relay
        const ANONYMIZED = 1 << 1;
        /// Address attributed to a hosting provider
        const HOSTING = 1 << 2;
    }
}

impl ReliabilityFlags {
    pub const NONE: Self = Self::empty();

    /// Any flag set means the row is excluded from resolution
    pub fn is_reliable(&self) -> bool {
        self.is_empty()
    }
}

impl From<i32> for ReliabilityFlags {
    fn from(bits: i32) -> Self {
        Self::from_bits_retain(bits)
    }
}

impl From<ReliabilityFlags> for i32 {
    fn from(flags: ReliabilityFlags) -> Self {
        flags.bits()
    }
}

/// One candidate row returned by a reference lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub individual_key: Option<String>,
    pub group_key: Option<String>,
    pub reliability_flags: ReliabilityFlags,
    /// Internal record ordinal; higher means more recently refreshed
    pub recency_ordinal: i64,
}
