//! End-to-end pipeline tests
//!
//! Both loops run against the in-memory store and reference dataset, one
//! tick at a time, so every assertion sees committed state only.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::Extractor;
use beacon_durable::{
    InMemoryPipelineStore, InMemoryReferenceDataset, PipelineStore, ReferenceDataset, RetryPolicy,
    StoreError,
};
use beacon_schemas::{
    MatchType, ReferenceRow, ReliabilityFlags, SequenceRange, EXTRACT_PROCESS, MATCH_PROCESS,
};
use beacon_worker::pipeline::resolver::IdentityResolver;
use beacon_worker::{
    ExtractProcessor, LoopConfig, MatchProcessor, PipelineError, PipelineLoop,
};
use chrono::{DateTime, TimeZone, Utc};

const FINGERPRINT: &str = "canvas_hash=c1&font_list=Arial&webgl_renderer=ANGLE&audio_hash=a1";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn loop_config(batch_size: i64) -> LoopConfig {
    LoopConfig {
        interval: Duration::from_secs(1),
        batch_size,
        stagger: Duration::ZERO,
    }
}

struct Pipeline {
    store: InMemoryPipelineStore,
    reference: Arc<InMemoryReferenceDataset>,
    extract: PipelineLoop,
    matching: PipelineLoop,
}

impl Pipeline {
    fn new() -> Self {
        Self::build(100, Duration::ZERO)
    }

    fn build(batch_size: i64, lookback: Duration) -> Self {
        let store = InMemoryPipelineStore::new();
        let reference = Arc::new(InMemoryReferenceDataset::new());
        reference.insert(
            MatchType::Email,
            "foo@example.com",
            ReferenceRow {
                individual_key: Some("ind-foo".into()),
                group_key: Some("hh-foo".into()),
                reliability_flags: ReliabilityFlags::NONE,
                recency_ordinal: 10,
            },
        );
        let extract = PipelineLoop::new(
            Arc::new(ExtractProcessor::new(
                Arc::new(store.clone()),
                Extractor::default(),
                RetryPolicy::transient_conflicts(),
            )),
            Arc::new(store.clone()),
            loop_config(batch_size),
        );
        let matching = match_loop(&store, reference.clone(), lookback);
        Self {
            store,
            reference,
            extract,
            matching,
        }
    }

    async fn append(&self, address: &str, payload: &str, received_at: DateTime<Utc>) -> i64 {
        self.store
            .append_raw_event("tenant-1", "campaign-1", address, payload, received_at)
            .await
    }

    async fn watermark(&self, process: &str) -> i64 {
        self.store
            .load_watermark(process)
            .await
            .unwrap()
            .last_processed_id
    }
}

fn match_loop(
    store: &InMemoryPipelineStore,
    reference: Arc<dyn ReferenceDataset>,
    lookback: Duration,
) -> PipelineLoop {
    PipelineLoop::new(
        Arc::new(MatchProcessor::new(
            Arc::new(store.clone()),
            IdentityResolver::new(reference),
            RetryPolicy::transient_conflicts(),
            lookback,
        )),
        Arc::new(store.clone()),
        loop_config(50),
    )
}

#[tokio::test]
async fn test_identical_fingerprints_collapse_to_one_device() {
    let pipeline = Pipeline::new();
    pipeline.append("203.0.113.9", FINGERPRINT, at(1)).await;
    pipeline.append("203.0.113.9", FINGERPRINT, at(2)).await;
    pipeline.append("203.0.113.9", FINGERPRINT, at(3)).await;

    let report = pipeline.extract.tick().await.unwrap();
    assert_eq!(report.range, Some(SequenceRange { start: 1, end: 3 }));
    assert_eq!(report.rows_processed, 3);

    let devices = pipeline.store.devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].hit_count, 3);
    assert_eq!(devices[0].first_seen, at(1));
    assert_eq!(devices[0].last_seen, at(3));

    let visits = pipeline.store.visits().await;
    assert_eq!(visits.len(), 3);
    assert!(visits
        .iter()
        .all(|v| v.device_id == Some(devices[0].device_id)));
}

#[tokio::test]
async fn test_blank_fingerprint_has_no_device() {
    let pipeline = Pipeline::new();
    pipeline.append("", "cp_plan=free&screen_width=800", at(1)).await;

    pipeline.extract.tick().await.unwrap();

    assert!(pipeline.store.devices().await.is_empty());
    assert!(pipeline.store.endpoints().await.is_empty());
    let visits = pipeline.store.visits().await;
    assert_eq!(visits.len(), 1);
    assert_eq!(visits[0].device_id, None);
    assert_eq!(visits[0].endpoint_id, None);
}

#[tokio::test]
async fn test_device_hash_is_stable_across_batches() {
    let pipeline = Pipeline::build(1, Duration::ZERO);
    pipeline
        .append("203.0.113.9", &format!("{FINGERPRINT}&language=en"), at(1))
        .await;
    pipeline
        .append("198.51.100.7", &format!("screen_width=1024&{FINGERPRINT}"), at(2))
        .await;

    pipeline.extract.tick().await.unwrap();
    pipeline.extract.tick().await.unwrap();

    let devices = pipeline.store.devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].hit_count, 2);
    assert_eq!(pipeline.store.endpoints().await.len(), 2);
}

#[tokio::test]
async fn test_extract_rerun_after_rewind_is_idempotent() {
    let pipeline = Pipeline::new();
    for secs in 1..=3 {
        pipeline.append("203.0.113.9:443", FINGERPRINT, at(secs)).await;
    }
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", at(4))
        .await;

    pipeline.extract.tick().await.unwrap();
    let devices = pipeline.store.devices().await;
    let endpoints = pipeline.store.endpoints().await;
    let visits = pipeline.store.visits().await;

    pipeline
        .store
        .rewind_watermark(EXTRACT_PROCESS, 0)
        .await
        .unwrap();
    let report = pipeline.extract.tick().await.unwrap();
    assert_eq!(report.range, Some(SequenceRange { start: 1, end: 4 }));

    assert_eq!(pipeline.store.devices().await, devices);
    assert_eq!(pipeline.store.endpoints().await, endpoints);
    assert_eq!(pipeline.store.visits().await, visits);
    assert_eq!(endpoints[0].hit_count, 4);
}

#[tokio::test]
async fn test_watermark_advances_in_batches_and_never_regresses() {
    let pipeline = Pipeline::build(2, Duration::ZERO);
    for secs in 1..=5 {
        pipeline.append("203.0.113.9", FINGERPRINT, at(secs)).await;
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        let report = pipeline.extract.tick().await.unwrap();
        seen.push((report.range, report.watermark, report.lag));
    }

    assert_eq!(
        seen,
        vec![
            (Some(SequenceRange { start: 1, end: 2 }), 2, 3),
            (Some(SequenceRange { start: 3, end: 4 }), 4, 1),
            (Some(SequenceRange { start: 5, end: 5 }), 5, 0),
            (None, 5, 0),
        ]
    );

    let watermark = pipeline.store.load_watermark(EXTRACT_PROCESS).await.unwrap();
    assert_eq!(watermark.rows_processed, 5);
    assert!(watermark.last_run_at.is_some());
}

#[tokio::test]
async fn test_tagged_and_plain_email_share_one_identity() {
    let pipeline = Pipeline::new();
    pipeline
        .append("203.0.113.9", "cp_email=Foo%2Btag%40Example.com", at(1))
        .await;
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", at(2))
        .await;

    pipeline.extract.tick().await.unwrap();
    let report = pipeline.matching.tick().await.unwrap();
    assert_eq!(report.rows_processed, 2);
    assert_eq!(report.rows_matched, 2);

    let identities = pipeline.store.match_identities().await;
    assert_eq!(identities.len(), 1);
    let identity = &identities[0];
    assert_eq!(identity.match_key, "foo@example.com");
    assert_eq!(identity.hit_count, 2);
    assert_eq!(identity.first_visit_id, 1);
    assert_eq!(identity.latest_visit_id, 2);
    assert_eq!(identity.resolved_identity_key.as_deref(), Some("ind-foo"));
    assert_eq!(identity.resolved_group_key.as_deref(), Some("hh-foo"));
    assert_eq!(pipeline.reference.lookup_count(), 1);
}

#[tokio::test]
async fn test_unescaped_plus_tag_email_shares_one_identity() {
    let pipeline = Pipeline::new();
    pipeline
        .append("203.0.113.9", "cp_email=Foo+tag@Example.com", at(1))
        .await;
    pipeline
        .append("203.0.113.9", "cp_email=foo@example.com", at(2))
        .await;

    pipeline.extract.tick().await.unwrap();
    let report = pipeline.matching.tick().await.unwrap();
    assert_eq!(report.rows_matched, 2);

    let identities = pipeline.store.match_identities().await;
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].match_key, "foo@example.com");
    assert_eq!(identities[0].hit_count, 2);
    assert_eq!(identities[0].resolved_identity_key.as_deref(), Some("ind-foo"));
}

#[tokio::test]
async fn test_long_font_lists_stay_distinct_devices() {
    let pipeline = Pipeline::new();
    let fonts = (0..400).map(|i| format!("Font{i}")).collect::<Vec<_>>().join(",");
    pipeline
        .append("203.0.113.9", &format!("canvas_hash=c&font_list={fonts},Arial"), at(1))
        .await;
    pipeline
        .append("203.0.113.9", &format!("canvas_hash=c&font_list={fonts},Verdana"), at(2))
        .await;

    pipeline.extract.tick().await.unwrap();

    let devices = pipeline.store.devices().await;
    assert_eq!(devices.len(), 2);
    assert_ne!(devices[0].device_hash, devices[1].device_hash);
}

#[tokio::test]
async fn test_phone_candidates_resolve_by_normalized_digits() {
    let pipeline = Pipeline::new();
    pipeline.reference.insert(
        MatchType::Phone,
        "15551234567",
        ReferenceRow {
            individual_key: Some("ind-phone".into()),
            group_key: None,
            reliability_flags: ReliabilityFlags::NONE,
            recency_ordinal: 1,
        },
    );
    pipeline
        .append("", "cp_phone=%28555%29%20123-4567", at(1))
        .await;
    pipeline
        .append("", "cp_ph=%2B1%20555%20123%204567", at(2))
        .await;

    pipeline.extract.tick().await.unwrap();
    pipeline.matching.tick().await.unwrap();

    let identity = pipeline
        .store
        .match_identity("tenant-1", "campaign-1", MatchType::Phone, "15551234567")
        .await
        .unwrap();
    assert_eq!(identity.hit_count, 2);
    assert_eq!(identity.resolved_identity_key.as_deref(), Some("ind-phone"));
}

#[tokio::test]
async fn test_resolved_identity_never_regresses() {
    let pipeline = Pipeline::new();
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", at(1))
        .await;
    pipeline.extract.tick().await.unwrap();
    pipeline.matching.tick().await.unwrap();

    // a later tick against a dataset that no longer knows the key
    let forgetful = match_loop(
        &pipeline.store,
        Arc::new(InMemoryReferenceDataset::new()),
        Duration::ZERO,
    );
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", at(2))
        .await;
    pipeline.extract.tick().await.unwrap();
    let report = forgetful.tick().await.unwrap();
    assert_eq!(report.range, Some(SequenceRange { start: 2, end: 2 }));

    let identity = pipeline
        .store
        .match_identity("tenant-1", "campaign-1", MatchType::Email, "foo@example.com")
        .await
        .unwrap();
    assert_eq!(identity.resolved_identity_key.as_deref(), Some("ind-foo"));
    assert_eq!(identity.hit_count, 2);
    assert_eq!(identity.latest_visit_id, 2);
}

#[tokio::test]
async fn test_match_rerun_after_rewind_does_not_recount() {
    let pipeline = Pipeline::new();
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", at(1))
        .await;
    pipeline
        .append("203.0.113.9", "cp_email=bar%40example.com", at(2))
        .await;
    pipeline.extract.tick().await.unwrap();
    pipeline.matching.tick().await.unwrap();
    let before = pipeline.store.match_identities().await;

    pipeline.store.rewind_watermark(MATCH_PROCESS, 0).await.unwrap();
    pipeline.matching.tick().await.unwrap();

    let after = pipeline.store.match_identities().await;
    assert_eq!(after.len(), 2);
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.hit_count, b.hit_count);
        assert_eq!(a.resolved_identity_key, b.resolved_identity_key);
    }
}

#[tokio::test]
async fn test_reference_outage_holds_match_watermark() {
    let pipeline = Pipeline::new();
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", at(1))
        .await;
    pipeline.extract.tick().await.unwrap();

    pipeline.reference.set_available(false);
    let result = pipeline.matching.tick().await;
    assert!(matches!(result, Err(PipelineError::Reference(_))));
    assert_eq!(pipeline.watermark(MATCH_PROCESS).await, 0);
    assert!(pipeline.store.match_identities().await.is_empty());

    let status = pipeline.matching.status();
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_error.is_some());

    pipeline.reference.set_available(true);
    pipeline.matching.tick().await.unwrap();
    assert_eq!(pipeline.watermark(MATCH_PROCESS).await, 1);
    assert_eq!(pipeline.store.match_identities().await.len(), 1);
    assert_eq!(pipeline.matching.status().consecutive_failures, 0);
}

#[tokio::test]
async fn test_match_loop_waits_for_extract_watermark() {
    let pipeline = Pipeline::new();
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", at(1))
        .await;

    let report = pipeline.matching.tick().await.unwrap();
    assert_eq!(report.range, None);

    pipeline.extract.tick().await.unwrap();
    let report = pipeline.matching.tick().await.unwrap();
    assert_eq!(report.range, Some(SequenceRange { start: 1, end: 1 }));
}

#[tokio::test]
async fn test_lookback_defers_recent_visits() {
    let pipeline = Pipeline::build(100, Duration::from_secs(3600));
    let now = Utc::now();
    pipeline
        .append(
            "203.0.113.9",
            "cp_email=foo%40example.com",
            now - chrono::Duration::hours(2),
        )
        .await;
    pipeline
        .append("203.0.113.9", "cp_email=foo%40example.com", now)
        .await;
    pipeline.extract.tick().await.unwrap();

    let report = pipeline.matching.tick().await.unwrap();
    assert_eq!(report.range, Some(SequenceRange { start: 1, end: 1 }));
    assert_eq!(report.rows_processed, 1);

    let report = pipeline.matching.tick().await.unwrap();
    assert_eq!(report.range, None);
}

#[tokio::test]
async fn test_visits_without_candidates_still_advance_match_watermark() {
    let pipeline = Pipeline::new();
    pipeline.append("203.0.113.9", FINGERPRINT, at(1)).await;
    pipeline
        .append("203.0.113.9", "cp_email=not-an-email", at(2))
        .await;
    pipeline.extract.tick().await.unwrap();

    let report = pipeline.matching.tick().await.unwrap();
    assert_eq!(report.rows_matched, 0);
    assert_eq!(report.watermark, 2);
    assert!(pipeline.store.match_identities().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_conflict_is_retried_within_tick() {
    let pipeline = Pipeline::new();
    pipeline.append("203.0.113.9", FINGERPRINT, at(1)).await;
    pipeline
        .store
        .fail_next_commit(StoreError::Conflict("40001".into()));
    pipeline
        .store
        .fail_next_commit(StoreError::Conflict("40P01".into()));

    let report = pipeline.extract.tick().await.unwrap();
    assert_eq!(report.watermark, 1);

    let devices = pipeline.store.devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].hit_count, 1);
    assert_eq!(pipeline.store.visits().await.len(), 1);
}

#[tokio::test]
async fn test_contract_error_fails_tick_and_next_tick_recovers() {
    let pipeline = Pipeline::new();
    pipeline.append("203.0.113.9", FINGERPRINT, at(1)).await;
    pipeline
        .store
        .fail_next_commit(StoreError::Contract("42P01".into()));

    let result = pipeline.extract.tick().await;
    assert!(matches!(
        result,
        Err(PipelineError::Store(StoreError::Contract(_)))
    ));
    assert_eq!(pipeline.watermark(EXTRACT_PROCESS).await, 0);
    assert!(pipeline.store.devices().await.is_empty());

    pipeline.extract.tick().await.unwrap();
    assert_eq!(pipeline.watermark(EXTRACT_PROCESS).await, 1);
    assert_eq!(pipeline.store.devices().await[0].hit_count, 1);
}
