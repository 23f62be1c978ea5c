// Extract loop: raw events -> devices, endpoints, visits

use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::Extractor;
use beacon_durable::persistence::WatermarkAdvance;
use beacon_durable::{retry_transient, PipelineStore, RetryPolicy};
use beacon_schemas::{SequenceRange, EXTRACT_PROCESS};
use chrono::Utc;
use tracing::{debug, instrument, warn, Instrument};

use super::{attempt_span, BatchOutcome, BatchProcessor};
use crate::error::PipelineError;
use crate::pipeline::dimensions::{aggregate_devices, aggregate_endpoints, upsert_dimensions};
use crate::pipeline::visits::{build_visits, write_visits};
use crate::pipeline::{parse_event, ParsedRecord};

pub struct ExtractProcessor {
    store: Arc<dyn PipelineStore>,
    extractor: Extractor,
    retry: RetryPolicy,
}

impl ExtractProcessor {
    pub fn new(store: Arc<dyn PipelineStore>, extractor: Extractor, retry: RetryPolicy) -> Self {
        Self {
            store,
            extractor,
            retry,
        }
    }
}

fn log_diagnostics(records: &[ParsedRecord]) {
    let truncated = records.iter().filter(|r| r.payload.truncated).count();
    let with_invalid = records
        .iter()
        .filter(|r| !r.payload.invalid_fields.is_empty())
        .count();
    for record in records.iter().filter(|r| !r.payload.invalid_fields.is_empty()) {
        debug!(
            sequence_id = record.event.sequence_id,
            fields = ?record.payload.invalid_fields,
            "fields failed coercion"
        );
    }
    if truncated > 0 || with_invalid > 0 {
        warn!(truncated, with_invalid, "payload diagnostics");
    }
}

#[async_trait]
impl BatchProcessor for ExtractProcessor {
    fn process_name(&self) -> &'static str {
        EXTRACT_PROCESS
    }

    async fn max_available_id(&self) -> Result<i64, PipelineError> {
        Ok(self.store.max_raw_event_id().await?)
    }

    #[instrument(skip(self), fields(range = %range))]
    async fn process(&self, range: SequenceRange) -> Result<BatchOutcome, PipelineError> {
        let events = self.store.load_raw_events(range).await?;
        let records: Vec<ParsedRecord> = events
            .into_iter()
            .map(|event| parse_event(&self.extractor, event))
            .collect();
        log_diagnostics(&records);

        let devices = aggregate_devices(&records);
        let endpoints = aggregate_endpoints(&records);
        let rows_processed = records.len() as i64;

        let store = &self.store;
        let (records, devices, endpoints) = (&records, &devices, &endpoints);

        let (rows_written, watermark) =
            retry_transient(&self.retry, EXTRACT_PROCESS, move |attempt| {
                async move {
                    debug!("writing extract batch");
                    let mut tx = store.begin().await?;
                    let ids = upsert_dimensions(tx.as_mut(), devices, endpoints).await?;
                    let visits = build_visits(records, &ids);
                    let written = write_visits(tx.as_mut(), &visits).await?;
                    let watermark = tx
                        .advance_watermark(&WatermarkAdvance {
                            process_name: EXTRACT_PROCESS.to_string(),
                            to: range.end,
                            rows_processed,
                            rows_matched: 0,
                            at: Utc::now(),
                        })
                        .await?;
                    tx.commit().await?;
                    Ok::<_, PipelineError>((written as i64, watermark))
                }
                .instrument(attempt_span(EXTRACT_PROCESS, attempt))
            })
            .await?;

        Ok(BatchOutcome {
            range,
            rows_processed,
            rows_matched: 0,
            rows_written,
            watermark,
        })
    }
}
