//! Process rank discovery for multi-process runs

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Position of this process in a multi-process run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Global rank in the process group
    pub rank: u32,

    /// Total number of processes
    pub world_size: u32,

    /// Rank on the local host
    pub local_rank: u32,
}

impl Default for ProcessInfo {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }
}

impl ProcessInfo {
    /// Read `RANK`, `WORLD_SIZE` and `LOCAL_RANK` from the environment.
    ///
    /// Unset variables describe a single-process run.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str, default: u32| -> Result<u32> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw.trim().parse().map_err(|_| Error::InvalidConfig {
                    message: format!("{} must be a non-negative integer, got {:?}", key, raw),
                }),
            }
        };

        let rank = read("RANK", 0)?;
        let world_size = read("WORLD_SIZE", 1)?;
        let local_rank = read("LOCAL_RANK", rank)?;

        if world_size == 0 || rank >= world_size {
            return Err(Error::InvalidConfig {
                message: format!("rank {} is outside world size {}", rank, world_size),
            });
        }

        Ok(Self {
            rank,
            world_size,
            local_rank,
        })
    }

    /// Returns true for the coordinating process
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

/// Source of the runtime-assigned rank, queried on each call
pub trait RankSource: Send + Sync {
    fn rank(&self) -> Result<u32>;
}

/// Reads the rank from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvRankSource;

impl RankSource for EnvRankSource {
    fn rank(&self) -> Result<u32> {
        ProcessInfo::from_env().map(|info| info.rank)
    }
}

/// Fixed rank, for tests and launchers that assign ranks explicitly
#[derive(Debug, Clone, Copy)]
pub struct FixedRank(pub u32);

impl RankSource for FixedRank {
    fn rank(&self) -> Result<u32> {
        Ok(self.0)
    }
}
