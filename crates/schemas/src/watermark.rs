// Watermarks and sequence ranges
//
// A watermark is the durable cursor of one pipeline loop. Each loop owns
// exactly one watermark, identified by its process name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process name of the raw event -> dimensions + visits loop
pub const EXTRACT_PROCESS: &str = "extract";

/// Process name of the visits -> match identities loop
pub const MATCH_PROCESS: &str = "match";

/// Durable cursor for one pipeline loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub process_name: String,
    /// Last sequence id whose effects are fully committed. Never decreases.
    pub last_processed_id: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Cumulative rows processed by this loop
    pub rows_processed: i64,
    /// Cumulative rows that produced a resolved identity (match loop only)
    pub rows_matched: i64,
}

impl Watermark {
    /// Watermark for a loop that has never run
    pub fn initial(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            last_processed_id: 0,
            last_run_at: None,
            rows_processed: 0,
            rows_matched: 0,
        }
    }

    /// Apply a committed batch to this watermark.
    ///
    /// The cursor only moves forward; a batch ending at or below the current
    /// position still updates the run stats.
    pub fn advanced(
        &self,
        to: i64,
        processed: i64,
        matched: i64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            process_name: self.process_name.clone(),
            last_processed_id: self.last_processed_id.max(to),
            last_run_at: Some(at),
            rows_processed: self.rows_processed + processed,
            rows_matched: self.rows_matched + matched,
        }
    }

    /// Gap between the newest available id and this watermark
    pub fn lag(&self, max_available_id: i64) -> i64 {
        (max_available_id - self.last_processed_id).max(0)
    }

    /// Next batch to process, or `None` when the loop has caught up
    pub fn next_range(&self, batch_size: i64, max_available_id: i64) -> Option<SequenceRange> {
        SequenceRange::next(self.last_processed_id, batch_size, max_available_id)
    }
}

/// Inclusive range of sequence ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: i64,
    pub end: i64,
}

impl SequenceRange {
    /// `[last + 1, min(last + batch_size, max_available)]`, or `None` if empty
    pub fn next(last_processed_id: i64, batch_size: i64, max_available_id: i64) -> Option<Self> {
        let start = last_processed_id.saturating_add(1);
        let end = last_processed_id
            .saturating_add(batch_size.max(1))
            .min(max_available_id);
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, id: i64) -> bool {
        (self.start..=self.end).contains(&id)
    }

    /// Number of ids covered by the range (not the number of rows in it)
    pub fn width(&self) -> i64 {
        self.end - self.start + 1
    }
}

impl std::fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
