//! Rank arithmetic for the three communicator tiers.
//!
//! Ranks are laid out node-major: node `n` owns global ranks
//! `n * local_size .. (n + 1) * local_size`.

use crate::error::{Result, TierCommError};
use crate::types::Rank;

/// `global_rank mod local_size`.
pub fn intra_rank(global_rank: Rank, local_size: u32) -> u32 {
    global_rank % local_size
}

/// `global_rank div local_size`.
pub fn node_index(global_rank: Rank, local_size: u32) -> u32 {
    global_rank / local_size
}

/// Number of nodes, i.e. the size of the inter-node communicator.
pub fn inter_world_size(world_size: u32, local_size: u32) -> u32 {
    world_size / local_size
}

/// True if `global_rank` represents its node in the inter-node communicator.
pub fn is_inter_member(global_rank: Rank, local_size: u32, leader_offset: u32) -> bool {
    intra_rank(global_rank, local_size) == leader_offset
}

/// Global rank of intra rank 0 on `global_rank`'s node.
pub fn intra_leader(global_rank: Rank, local_size: u32) -> Rank {
    node_index(global_rank, local_size) * local_size
}

/// Validated view of the topology from one rank's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTopology {
    rank: Rank,
    world_size: u32,
    local_size: u32,
    leader_offset: u32,
}

impl TierTopology {
    /// Validate the launch parameters.
    ///
    /// Fails when the node grouping is ill-defined: zero sizes, a world size
    /// not divisible by the local size, an out-of-range rank, or a leader
    /// offset that does not exist on every node.
    pub fn new(rank: Rank, world_size: u32, local_size: u32, leader_offset: u32) -> Result<Self> {
        if world_size == 0 || local_size == 0 {
            return Err(TierCommError::Topology {
                reason: format!(
                    "world size ({world_size}) and local size ({local_size}) must be positive"
                ),
            });
        }
        if world_size % local_size != 0 {
            return Err(TierCommError::Topology {
                reason: format!(
                    "world size {world_size} is not divisible by local size {local_size}"
                ),
            });
        }
        if rank >= world_size {
            return Err(TierCommError::Topology {
                reason: format!("rank {rank} is out of range for world size {world_size}"),
            });
        }
        if leader_offset >= local_size {
            return Err(TierCommError::Topology {
                reason: format!(
                    "inter-node leader offset {leader_offset} must be below local size {local_size}"
                ),
            });
        }
        Ok(Self {
            rank,
            world_size,
            local_size,
            leader_offset,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn local_size(&self) -> u32 {
        self.local_size
    }

    pub fn leader_offset(&self) -> u32 {
        self.leader_offset
    }

    /// This rank's index within its node.
    pub fn intra_rank(&self) -> u32 {
        intra_rank(self.rank, self.local_size)
    }

    /// This rank's node.
    pub fn node_index(&self) -> u32 {
        node_index(self.rank, self.local_size)
    }

    /// Total number of nodes.
    pub fn num_nodes(&self) -> u32 {
        inter_world_size(self.world_size, self.local_size)
    }

    /// Global rank that generates the intra-node unique id for this node.
    pub fn intra_leader(&self) -> Rank {
        intra_leader(self.rank, self.local_size)
    }

    /// Global rank that generates the inter-node unique id.
    pub fn inter_leader(&self) -> Rank {
        self.leader_offset
    }

    /// True if this rank belongs to the inter-node communicator.
    pub fn is_inter_member(&self) -> bool {
        is_inter_member(self.rank, self.local_size, self.leader_offset)
    }

    /// Rank within the inter-node communicator, `None` for non-members.
    pub fn inter_rank(&self) -> Option<u32> {
        self.is_inter_member().then(|| self.node_index())
    }

    /// All global ranks on `node`, ascending.
    pub fn node_ranks(&self, node: u32) -> Vec<Rank> {
        let start = node * self.local_size;
        (start..start + self.local_size).collect()
    }

    /// Global ranks of the inter-node communicator, ordered by node index.
    pub fn inter_members(&self) -> Vec<Rank> {
        (0..self.num_nodes())
            .map(|node| node * self.local_size + self.leader_offset)
            .collect()
    }
}
