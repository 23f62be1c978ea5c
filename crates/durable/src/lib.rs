//! # Pipeline Persistence
//!
//! Storage for the beacon pipeline: the pipeline store that both loops read
//! from and write to, and the read-only reference dataset used for identity
//! resolution.
//!
//! ## Features
//!
//! - **Batch transactions**: a batch's writes and its watermark advance commit together
//! - **Conflict-tolerant upserts**: natural-key upserts that never read-then-write
//! - **Replay-safe counting**: hit counts only move for events not yet counted
//! - **Automatic retries**: exponential backoff with jitter for transient conflicts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PipelineStore                          │
//! │  (raw event scans, watermarks, visit candidates)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ begin()
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StoreTransaction                         │
//! │  (devices, endpoints, visits, match identities, watermark)  │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ReferenceDataset                         │
//! │  (read-only, never part of a transaction)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use beacon_durable::prelude::*;
//!
//! let store = PostgresPipelineStore::connect(&database_url, 10).await?;
//! store.migrate().await?;
//!
//! let mut tx = store.begin().await?;
//! let ids = tx.upsert_devices(&observations).await?;
//! tx.advance_watermark(&advance).await?;
//! tx.commit().await?;
//! ```

pub mod persistence;
pub mod reference;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use crate::persistence::{
        DeviceObservation, EndpointObservation, InMemoryPipelineStore, MatchMerge,
        MatchObservation, PipelineStore, PostgresPipelineStore, StoreError, StoreTransaction,
        WatermarkAdvance,
    };
    pub use crate::reference::{
        InMemoryReferenceDataset, PostgresReferenceDataset, ReferenceDataset, ReferenceError,
    };
    pub use crate::reliability::{retry_transient, RetryPolicy, Transient};
}

// Re-export key types at crate root
pub use persistence::{
    InMemoryPipelineStore, PipelineStore, PostgresPipelineStore, StoreError, StoreTransaction,
};
pub use reference::{
    InMemoryReferenceDataset, PostgresReferenceDataset, ReferenceDataset, ReferenceError,
};
pub use reliability::{retry_transient, RetryPolicy, Transient};
