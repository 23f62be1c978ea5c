//! Persistence layer for the pipeline
//!
//! This module provides:
//! - [`PipelineStore`] / [`StoreTransaction`] traits for batch reads and writes
//! - [`InMemoryPipelineStore`] for testing
//! - [`PostgresPipelineStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryPipelineStore;
pub use postgres::{classify_sqlstate, PostgresPipelineStore};
pub use store::{
    DeviceObservation, EndpointObservation, MatchMerge, MatchObservation, PipelineStore,
    StoreError, StoreTransaction, WatermarkAdvance,
};
