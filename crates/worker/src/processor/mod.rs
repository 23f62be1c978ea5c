// Batch processors
//
// A processor owns one pipeline loop's work: how far its input reaches and
// how a single batch is turned into committed writes plus a watermark
// advance. Scheduling lives in `crate::scheduler`.

mod extract;
mod matching;

use async_trait::async_trait;
use beacon_core::telemetry::attrs;
use beacon_schemas::{SequenceRange, Watermark};
use tracing::{debug_span, field, Span};

use crate::error::PipelineError;

pub use extract::ExtractProcessor;
pub use matching::MatchProcessor;

/// Result of one committed batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub range: SequenceRange,
    /// Input rows read for the range
    pub rows_processed: i64,
    /// Rows that produced a resolved identity
    pub rows_matched: i64,
    /// Rows written to the loop's output table
    pub rows_written: i64,
    /// Watermark as committed with the batch
    pub watermark: Watermark,
}

/// Span around one write attempt of a batch
fn attempt_span(process: &'static str, attempt: u32) -> Span {
    let span = debug_span!("write_batch", process, "pipeline.attempt" = field::Empty);
    span.record(attrs::ATTEMPT, attempt);
    span
}

#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    /// Name of the watermark this processor advances
    fn process_name(&self) -> &'static str;

    /// Highest input id currently eligible for processing
    async fn max_available_id(&self) -> Result<i64, PipelineError>;

    /// Process `range` and advance the watermark to `range.end` in the same
    /// unit of work. On error nothing is committed.
    async fn process(&self, range: SequenceRange) -> Result<BatchOutcome, PipelineError>;
}
