// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MomentumContrast — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! In-memory rendezvous collective used by multi-thread tests and the
//! distributed example. Workers living in one process join a named group and
//! synchronise through a condvar-guarded exchange buffer.

use crate::collective::{Collective, CollectiveError};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};

static GROUPS: Lazy<Mutex<HashMap<String, Weak<GroupState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct GroupState {
    inner: Mutex<GroupInner>,
    condvar: Condvar,
}

impl GroupState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(GroupInner::default()),
            condvar: Condvar::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Gather,
    Broadcast { source: usize },
}

#[derive(Debug, Default)]
struct GroupInner {
    expected: usize,
    arrived: usize,
    generation: u64,
    op: Option<PendingOp>,
    part_len: usize,
    parts: Vec<Option<Vec<f32>>>,
    result: Vec<f32>,
    ready_generation: u64,
    connected: HashSet<usize>,
    error: Option<CollectiveError>,
}

/// Collective backed by an in-process rendezvous group.
#[derive(Debug)]
pub struct RendezvousCollective {
    group: Arc<GroupState>,
    group_id: String,
    rank: usize,
    world_size: usize,
}

impl RendezvousCollective {
    /// Connects a worker to a rendezvous group.
    pub fn connect(
        group: impl Into<String>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, CollectiveError> {
        let group = group.into();
        if world_size == 0 {
            return Err(CollectiveError::EmptyWorldSize(world_size));
        }
        if rank >= world_size {
            return Err(CollectiveError::RankOutOfBounds { rank, world_size });
        }

        let shared_group = {
            let mut guard = GROUPS.lock().unwrap();
            let entry = guard.entry(group.clone()).or_insert_with(Weak::new);
            if let Some(existing) = entry.upgrade() {
                existing
            } else {
                let created = Arc::new(GroupState::new());
                *entry = Arc::downgrade(&created);
                created
            }
        };

        {
            let mut state = shared_group.inner.lock().unwrap();
            if state.expected == 0 {
                state.expected = world_size;
            } else if state.expected != world_size {
                return Err(CollectiveError::WorldSizeMismatch {
                    expected: state.expected,
                    got: world_size,
                });
            }
            if !state.connected.insert(rank) {
                return Err(CollectiveError::DuplicateRank { rank });
            }
        }

        Ok(Self {
            group: shared_group,
            group_id: group,
            rank,
            world_size,
        })
    }

    fn exchange(
        &self,
        op: PendingOp,
        payload: Option<Vec<f32>>,
        payload_len: usize,
    ) -> Result<Vec<f32>, CollectiveError> {
        let group = &self.group;
        let mut state = group.inner.lock().unwrap();

        if !state.connected.contains(&self.rank) {
            return Err(CollectiveError::UnknownRank { rank: self.rank });
        }

        let fail = |state: &mut GroupInner, error: CollectiveError| {
            state.arrived = 0;
            state.ready_generation = state.generation;
            state.error = Some(error.clone());
            group.condvar.notify_all();
            error
        };

        if state.arrived == 0 {
            state.generation = state.generation.wrapping_add(1);
            state.op = Some(op);
            state.part_len = payload_len;
            state.parts = (0..state.expected).map(|_| None).collect();
            state.error = None;
        } else {
            if state.op != Some(op) {
                return Err(fail(&mut state, CollectiveError::OpMismatch));
            }
            if state.part_len != payload_len {
                let error = CollectiveError::BufferLengthMismatch {
                    expected: state.part_len,
                    got: payload_len,
                };
                return Err(fail(&mut state, error));
            }
        }

        if let Some(data) = payload {
            state.parts[self.rank] = Some(data);
        }

        state.arrived += 1;
        let current_generation = state.generation;

        if state.arrived == state.expected {
            let assembled = match op {
                PendingOp::Gather => {
                    let mut out = Vec::with_capacity(state.part_len * state.expected);
                    let mut missing = None;
                    for (rank, part) in state.parts.iter_mut().enumerate() {
                        match part.take() {
                            Some(data) => out.extend_from_slice(&data),
                            None => {
                                missing = Some(rank);
                                break;
                            }
                        }
                    }
                    match missing {
                        Some(rank) => Err(CollectiveError::UnknownRank { rank }),
                        None => Ok(out),
                    }
                }
                PendingOp::Broadcast { source } => match state.parts[source].take() {
                    Some(data) => Ok(data),
                    None => Err(CollectiveError::InvalidSource {
                        source_rank: source,
                        world_size: state.expected,
                    }),
                },
            };
            match assembled {
                Ok(result) => {
                    state.result = result;
                    state.arrived = 0;
                    state.ready_generation = current_generation;
                    group.condvar.notify_all();
                }
                Err(error) => return Err(fail(&mut state, error)),
            }
        } else {
            while state.ready_generation != current_generation {
                state = group.condvar.wait(state).unwrap();
            }
        }

        if let Some(error) = state.error.clone() {
            return Err(error);
        }

        Ok(state.result.clone())
    }
}

impl Drop for RendezvousCollective {
    fn drop(&mut self) {
        {
            let mut state = self.group.inner.lock().unwrap();
            state.connected.remove(&self.rank);
            if state.connected.is_empty() {
                *state = GroupInner::default();
            }
        }

        let mut groups = GROUPS.lock().unwrap();
        let remove = groups
            .get(&self.group_id)
            .map(|weak| weak.upgrade().is_none())
            .unwrap_or(false);
        if remove {
            groups.remove(&self.group_id);
        }
    }
}

impl Collective for RendezvousCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        self.exchange(PendingOp::Gather, Some(local.to_vec()), local.len())
    }

    fn broadcast(&self, buffer: &mut [f32], source: usize) -> Result<(), CollectiveError> {
        if source >= self.world_size {
            return Err(CollectiveError::InvalidSource {
                source_rank: source,
                world_size: self.world_size,
            });
        }
        let payload = (self.rank == source).then(|| buffer.to_vec());
        let result = self.exchange(PendingOp::Broadcast { source }, payload, buffer.len())?;
        if result.len() != buffer.len() {
            return Err(CollectiveError::BufferLengthMismatch {
                expected: buffer.len(),
                got: result.len(),
            });
        }
        buffer.copy_from_slice(&result);
        Ok(())
    }
}
