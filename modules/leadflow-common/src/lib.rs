pub mod config;
pub mod error;
pub mod scoring;
pub mod types;

pub use config::{load_config, EngineConfig, SignalTypeConfig, StageConfig, TierBoundaries};
pub use error::LeadFlowError;
pub use scoring::*;
pub use types::*;
