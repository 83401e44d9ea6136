//! The compute, i/o and union groups of an i/o system.
//!
//! There are two layouts. In the *intracomm* layout every rank computes and
//! a subset of them additionally performs i/o. In the *disjoint* layout the
//! i/o tasks do not compute: they sit in [`IoSystem::serve`] and execute the
//! calls forwarded to them by the compute leader.
//!
//! [`IoSystem::serve`]: crate::iosystem::IoSystem::serve

use std::sync::Arc;

use ahash::HashSet;

use crate::{
    group::ProcessGroup,
    transport::{group_id, Rank, Transport},
};

/// Indicates an error in the requested group layout.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("At least one i/o task is required")]
    NoIoTasks,

    #[error("At least one compute task is required")]
    NoComputeTasks,

    #[error("{num_io_tasks} i/o tasks with stride {stride} do not fit into {size} ranks")]
    TooManyIoTasks {
        num_io_tasks: usize,
        stride: usize,
        size: usize,
    },

    #[error("Rank {0} is listed more than once")]
    DuplicateRank(Rank),

    #[error("Rank {0} is not part of the fabric")]
    UnknownRank(Rank),

    #[error("Rank {0} belongs to neither the compute nor the i/o group")]
    UnassignedRank(Rank),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Compute,
    Io,
    Both,
}

#[derive(Debug, Clone)]
pub struct Topology {
    union: ProcessGroup,
    compute: ProcessGroup,
    io: ProcessGroup,
    disjoint: bool,
}

impl Topology {
    /// Every rank computes; `num_io_tasks` of them also do i/o.
    ///
    /// The i-th i/o task is rank `(base + i * stride) % size`.
    pub fn intracomm(
        transport: Arc<dyn Transport>,
        num_io_tasks: usize,
        stride: usize,
        base: usize,
    ) -> Result<Self, TopologyError> {
        let size = transport.size();
        if num_io_tasks == 0 {
            return Err(TopologyError::NoIoTasks);
        }
        if num_io_tasks.saturating_mul(stride) > size {
            return Err(TopologyError::TooManyIoTasks {
                num_io_tasks,
                stride,
                size,
            });
        }

        let io_ranks: Vec<Rank> = (0..num_io_tasks)
            .map(|i| (base + i * stride) % size)
            .collect();
        check_distinct(&io_ranks)?;

        let all: Vec<Rank> = (0..size).collect();
        tracing::debug!(
            rank = transport.rank(),
            ?io_ranks,
            "created intracomm topology"
        );

        Ok(Self {
            union: ProcessGroup::new(group_id::UNION, all.clone(), transport.clone()),
            compute: ProcessGroup::new(group_id::COMPUTE, all, transport.clone()),
            io: ProcessGroup::new(group_id::IO, io_ranks, transport),
            disjoint: false,
        })
    }

    /// The compute and i/o tasks are separate ranks.
    ///
    /// Every rank of the fabric must belong to exactly one of the groups.
    pub fn disjoint(
        transport: Arc<dyn Transport>,
        compute_ranks: Vec<Rank>,
        io_ranks: Vec<Rank>,
    ) -> Result<Self, TopologyError> {
        let size = transport.size();
        if compute_ranks.is_empty() {
            return Err(TopologyError::NoComputeTasks);
        }
        if io_ranks.is_empty() {
            return Err(TopologyError::NoIoTasks);
        }

        let all: Vec<Rank> = compute_ranks.iter().chain(&io_ranks).copied().collect();
        if let Some(&rank) = all.iter().find(|&&rank| rank >= size) {
            return Err(TopologyError::UnknownRank(rank));
        }
        check_distinct(&all)?;
        if all.len() != size {
            let assigned: HashSet<Rank> = all.iter().copied().collect();
            if let Some(rank) = (0..size).find(|rank| !assigned.contains(rank)) {
                return Err(TopologyError::UnassignedRank(rank));
            }
        }

        tracing::debug!(
            rank = transport.rank(),
            ?compute_ranks,
            ?io_ranks,
            "created disjoint topology"
        );

        Ok(Self {
            union: ProcessGroup::new(group_id::UNION, (0..size).collect(), transport.clone()),
            compute: ProcessGroup::new(group_id::COMPUTE, compute_ranks, transport.clone()),
            io: ProcessGroup::new(group_id::IO, io_ranks, transport),
            disjoint: true,
        })
    }

    pub fn rank(&self) -> Rank {
        // Union members are ordered by rank.
        self.union.index().unwrap_or_default()
    }

    pub fn role(&self) -> Role {
        match (self.compute.is_member(), self.io.is_member()) {
            (true, true) => Role::Both,
            (false, true) => Role::Io,
            _ => Role::Compute,
        }
    }

    pub fn is_disjoint(&self) -> bool {
        self.disjoint
    }

    pub fn is_io(&self) -> bool {
        self.io.is_member()
    }

    pub fn is_compute(&self) -> bool {
        self.compute.is_member()
    }

    pub fn union(&self) -> &ProcessGroup {
        &self.union
    }

    pub fn compute(&self) -> &ProcessGroup {
        &self.compute
    }

    pub fn io(&self) -> &ProcessGroup {
        &self.io
    }

    /// The index of this rank within the i/o group.
    pub fn io_index(&self) -> Option<usize> {
        self.io.index()
    }

    pub fn num_io_tasks(&self) -> usize {
        self.io.len()
    }

    pub fn compute_leader(&self) -> Rank {
        self.compute.leader()
    }

    pub fn io_leader(&self) -> Rank {
        self.io.leader()
    }

    pub fn is_compute_leader(&self) -> bool {
        self.compute.is_leader()
    }
}

fn check_distinct(ranks: &[Rank]) -> Result<(), TopologyError> {
    let mut seen = HashSet::default();
    for &rank in ranks {
        if !seen.insert(rank) {
            return Err(TopologyError::DuplicateRank(rank));
        }
    }
    Ok(())
}
