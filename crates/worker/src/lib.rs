pub mod config;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod scheduler;

pub use config::{DatabaseConfig, LoopConfig, PipelineConfig};
pub use error::{ConfigError, PipelineError};
pub use processor::{BatchOutcome, BatchProcessor, ExtractProcessor, MatchProcessor};
pub use scheduler::{LoopState, LoopStatus, PipelineLoop, Scheduler, TickReport};
