// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MomentumContrast — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use thiserror::Error;

/// Errors produced by collective-communication implementations.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CollectiveError {
    #[error("world size must be positive, got {0}")]
    EmptyWorldSize(usize),
    #[error("rank {rank} is out of bounds for world size {world_size}")]
    RankOutOfBounds { rank: usize, world_size: usize },
    #[error("rendezvous group expects world size {expected}, got {got}")]
    WorldSizeMismatch { expected: usize, got: usize },
    #[error("rank {rank} already joined rendezvous group")]
    DuplicateRank { rank: usize },
    #[error("rank {rank} has not joined the rendezvous group")]
    UnknownRank { rank: usize },
    #[error("buffer length mismatch: expected {expected}, got {got}")]
    BufferLengthMismatch { expected: usize, got: usize },
    #[error("broadcast source {source_rank} is out of bounds for world size {world_size}")]
    InvalidSource { source_rank: usize, world_size: usize },
    #[error("collective op mismatch: peers disagree on the operation in flight")]
    OpMismatch,
}

/// Blocking synchronous collectives shared by every worker of a training job.
///
/// `all_gather` concatenates per-worker buffers in ascending rank order;
/// `broadcast` replicates the source worker's buffer to every peer. Workers
/// block at each call until all peers arrive, and every worker must issue the
/// same sequence of collective calls.
pub trait Collective: Send + Sync {
    /// Identifier of the current worker inside the distributed world.
    fn rank(&self) -> usize;
    /// Total number of workers participating in the job.
    fn world_size(&self) -> usize;
    /// Gathers equally-sized buffers from all workers, rank-ascending.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CollectiveError>;
    /// Copies `source`'s buffer into `buffer` on every worker.
    fn broadcast(&self, buffer: &mut [f32], source: usize) -> Result<(), CollectiveError>;
}

/// Single-worker collective where every operation degrades to the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCollective;

impl LocalCollective {
    pub fn new() -> Self {
        Self
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        Ok(local.to_vec())
    }

    fn broadcast(&self, _buffer: &mut [f32], source: usize) -> Result<(), CollectiveError> {
        if source != 0 {
            return Err(CollectiveError::InvalidSource {
                source_rank: source,
                world_size: 1,
            });
        }
        Ok(())
    }
}
