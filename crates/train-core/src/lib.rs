//! Train Core - Foundation for training-state management
//!
//! Provides core types, error handling, configuration and the
//! module/optimizer traits that train-state containers delegate to.

pub mod config;
pub mod distributed;
pub mod error;
pub mod module;
pub mod telemetry;
pub mod types;

pub use config::{CheckpointConfig, EmaConfig, LoggingConfig, TrainConfig};
pub use distributed::{EnvRankSource, FixedRank, ProcessInfo, RankSource};
pub use error::{Error, Result};
pub use module::{Module, Optimizer, ParamStore, Sgd};
pub use types::*;
