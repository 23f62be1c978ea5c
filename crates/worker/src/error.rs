// Pipeline error types

use beacon_durable::{ReferenceError, StoreError, Transient};

/// Error surfaced by a loop tick
///
/// Nothing here terminates the process: the scheduler logs the error and the
/// loop runs again after its interval.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lookup failure; the match batch is aborted before any write
    #[error(transparent)]
    Reference(#[from] ReferenceError),
}

impl Transient for PipelineError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Reference(_) => false,
        }
    }
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for {name}: {value:?} ({reason})")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}
