//! Primary-process gating
//!
//! Wraps a value so that work on it only happens on rank 0. The rank is
//! queried on every call; nothing is synchronized across processes.

use tracing::trace;
use train_core::{EnvRankSource, RankSource, Result};

/// Runs closures over the wrapped value on the primary process only
#[derive(Debug, Clone)]
pub struct PrimaryOnly<T, R = EnvRankSource> {
    inner: T,
    ranks: R,
}

impl<T> PrimaryOnly<T, EnvRankSource> {
    /// Gate on the rank found in the process environment
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            ranks: EnvRankSource,
        }
    }
}

impl<T, R: RankSource> PrimaryOnly<T, R> {
    pub fn with_rank_source(inner: T, ranks: R) -> Self {
        Self { inner, ranks }
    }

    /// Whether this process currently has rank 0
    pub fn is_primary(&self) -> Result<bool> {
        Ok(self.ranks.rank()? == 0)
    }

    /// Run `f` on rank 0; other ranks get `None`
    pub fn run<F, Out>(&mut self, f: F) -> Result<Option<Out>>
    where
        F: FnOnce(&mut T) -> Out,
    {
        if !self.is_primary()? {
            trace!("Skipping call on non-primary process");
            return Ok(None);
        }
        Ok(Some(f(&mut self.inner)))
    }

    /// Shared-reference variant of [`run`](Self::run)
    pub fn run_ref<F, Out>(&self, f: F) -> Result<Option<Out>>
    where
        F: FnOnce(&T) -> Out,
    {
        if !self.is_primary()? {
            trace!("Skipping call on non-primary process");
            return Ok(None);
        }
        Ok(Some(f(&self.inner)))
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
