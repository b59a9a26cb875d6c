//! Train states for gradient-descent mini-batch training
//!
//! Train states are data containers holding model variables, optimizer
//! state and everything else that makes up a complete snapshot of training.
//! Saving and loading a train state saves and restores training progress.

pub mod codec;
pub mod ema;
pub mod manager;
pub mod train_state;

pub use codec::{CheckpointHeader, CheckpointKind};
pub use ema::AveragedModel;
pub use manager::{CheckpointManager, CheckpointManagerConfig, CheckpointMetadata};
pub use train_state::{
    BasicTrainState, DenoisingModelTrainState, Snapshot, TrainState, DEFAULT_EMA_DECAY,
};
