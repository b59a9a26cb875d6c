//! Step-indexed checkpoint directory
//!
//! Keeps `ckpt-{step}.ckpt` files in one directory, retains the newest
//! `keep_count` of them and restores the latest into a reference state.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use train_core::{CheckpointConfig, Error, Result, Step};

use crate::codec::{self, CheckpointKind};
use crate::train_state::Snapshot;

const CHECKPOINT_PREFIX: &str = "ckpt-";
const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Checkpoint manager configuration
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    /// Directory holding the checkpoints
    pub directory: PathBuf,

    /// Number of checkpoints to keep
    pub keep_count: usize,

    /// Save every N steps
    pub save_interval_steps: u64,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        CheckpointConfig::default().into()
    }
}

impl From<CheckpointConfig> for CheckpointManagerConfig {
    fn from(config: CheckpointConfig) -> Self {
        Self {
            directory: config.directory,
            keep_count: config.keep_count,
            save_interval_steps: config.save_interval_steps,
        }
    }
}

/// Metadata of a checkpoint on disk
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMetadata {
    /// Training step at checkpoint
    pub step: Step,

    /// File path
    pub path: PathBuf,

    /// File size in bytes
    pub size_bytes: u64,

    /// Container kind that wrote it
    pub kind: CheckpointKind,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Manages a directory of step-indexed checkpoints
pub struct CheckpointManager {
    config: CheckpointManagerConfig,

    /// Checkpoint metadata indexed by step
    checkpoints: Arc<RwLock<BTreeMap<Step, CheckpointMetadata>>>,
}

impl CheckpointManager {
    /// Open (creating if needed) a checkpoint directory and index its files
    pub async fn open(config: CheckpointManagerConfig) -> Result<Self> {
        if config.keep_count == 0 || config.save_interval_steps == 0 {
            return Err(Error::InvalidConfig {
                message: "keep_count and save_interval_steps must be at least 1".to_string(),
            });
        }

        tokio::fs::create_dir_all(&config.directory).await?;

        let directory = config.directory.clone();
        let index = tokio::task::spawn_blocking(move || scan_directory(&directory)).await??;

        info!(
            directory = %config.directory.display(),
            existing = index.len(),
            keep_count = config.keep_count,
            "Checkpoint manager opened"
        );

        Ok(Self {
            config,
            checkpoints: Arc::new(RwLock::new(index)),
        })
    }

    pub fn config(&self) -> &CheckpointManagerConfig {
        &self.config
    }

    /// Path of the checkpoint file for `step`
    pub fn checkpoint_path(&self, step: Step) -> PathBuf {
        self.config.directory.join(checkpoint_file_name(step))
    }

    /// Whether `step` falls on the save interval
    pub fn should_save(&self, step: Step) -> bool {
        step % self.config.save_interval_steps == 0
    }

    /// Save `state` under its current step and prune old checkpoints
    pub async fn save<S: Snapshot>(&self, state: &S) -> Result<CheckpointMetadata> {
        let step = state.step();
        let kind = state.kind();
        let path = self.checkpoint_path(step);

        let state_dict = state.state_dict()?;
        let write_path = path.clone();
        let size_bytes = tokio::task::spawn_blocking(move || {
            codec::write_checkpoint_file(&write_path, kind, &state_dict)
        })
        .await??;

        let metadata = CheckpointMetadata {
            step,
            path,
            size_bytes,
            kind,
            created_at: Utc::now(),
        };

        {
            let mut checkpoints = self.checkpoints.write();
            if checkpoints.contains_key(&step) {
                warn!(step, "Overwriting existing checkpoint at step");
            }
            if let Some((&latest, _)) = checkpoints.last_key_value() {
                if step < latest {
                    warn!(step, latest, "Saving checkpoint behind the latest retained step");
                }
            }
            checkpoints.insert(step, metadata.clone());
        }

        info!(step, size_bytes, "Checkpoint committed");
        self.cleanup_old_checkpoints(step).await;
        Ok(metadata)
    }

    /// Latest checkpoint step, if any
    pub fn latest_step(&self) -> Option<Step> {
        self.checkpoints.read().keys().next_back().copied()
    }

    /// All retained steps in ascending order
    pub fn all_steps(&self) -> Vec<Step> {
        self.checkpoints.read().keys().copied().collect()
    }

    /// Metadata for a step
    pub fn get(&self, step: Step) -> Option<CheckpointMetadata> {
        self.checkpoints.read().get(&step).cloned()
    }

    /// Restore the checkpoint at `step` into `state`
    pub async fn restore_step_into<S: Snapshot>(&self, step: Step, state: &mut S) -> Result<()> {
        let meta = self.get(step).ok_or_else(|| Error::CheckpointNotFound {
            path: self.checkpoint_path(step).display().to_string(),
        })?;

        let path = meta.path.clone();
        let (header, checkpoint) =
            tokio::task::spawn_blocking(move || codec::read_checkpoint_file(&path)).await??;

        if header.kind != state.kind() {
            warn!(step, checkpoint_kind = ?header.kind, state_kind = ?state.kind(), "Checkpoint kind differs from target state");
        }
        state.restore_from_state(&checkpoint)?;
        info!(step, "Restored checkpoint");
        Ok(())
    }

    /// Restore the latest checkpoint into `state`, returning its step
    pub async fn restore_latest_into<S: Snapshot>(&self, state: &mut S) -> Result<Step> {
        let step = self
            .latest_step()
            .ok_or_else(|| Error::NoCheckpointForRecovery {
                directory: self.config.directory.display().to_string(),
            })?;
        self.restore_step_into(step, state).await?;
        Ok(step)
    }

    /// Delete checkpoints beyond keep_count, oldest first. The checkpoint
    /// just committed at `committed` is never evicted.
    async fn cleanup_old_checkpoints(&self, committed: Step) {
        let evicted: Vec<CheckpointMetadata> = {
            let mut checkpoints = self.checkpoints.write();
            let excess = checkpoints.len().saturating_sub(self.config.keep_count);
            let steps: Vec<Step> = checkpoints
                .keys()
                .copied()
                .filter(|step| *step != committed)
                .take(excess)
                .collect();
            steps
                .into_iter()
                .filter_map(|step| checkpoints.remove(&step))
                .collect()
        };

        for meta in evicted {
            match tokio::fs::remove_file(&meta.path).await {
                Ok(()) => debug!(path = %meta.path.display(), step = meta.step, "Deleted old checkpoint"),
                Err(e) => warn!(path = %meta.path.display(), error = %e, "Failed to delete old checkpoint"),
            }
        }
    }
}

fn checkpoint_file_name(step: Step) -> String {
    format!("{}{:010}.{}", CHECKPOINT_PREFIX, step, CHECKPOINT_EXTENSION)
}

/// Parse the step out of a checkpoint file name
fn parse_step(file_name: &str) -> Option<Step> {
    file_name
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Index checkpoint files already present in `directory`
fn scan_directory(directory: &Path) -> Result<BTreeMap<Step, CheckpointMetadata>> {
    let mut index = BTreeMap::new();

    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(step) = parse_step(&name) else {
            continue;
        };

        let path = entry.path();
        match codec::read_header(&path) {
            Ok(header) => {
                let size_bytes = entry.metadata()?.len();
                index.insert(
                    step,
                    CheckpointMetadata {
                        step,
                        path,
                        size_bytes,
                        kind: header.kind,
                        created_at: header.metadata.created_at,
                    },
                );
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
        }
    }

    Ok(index)
}
