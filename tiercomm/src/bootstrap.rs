use std::sync::Arc;
use std::time::Duration;

use crate::comm::Communicator;
use crate::device::DeviceStream;
use crate::error::{Result, TierCommError};
use crate::store::{exchange_unique_id, RendezvousStore};
use crate::topology::TierTopology;
use crate::transport::Backend;
use crate::types::{CommPurpose, DeviceId, Rank};

/// The three communicators of one rank.
pub struct CommunicatorSet {
    pub global: Communicator,
    pub intra: Communicator,
    /// `None` unless this rank is its node's inter-node member.
    pub inter: Option<Communicator>,
}

/// Builds communicators for one rank. All ranks must drive it collectively.
pub struct CommunicatorFactory<'a> {
    backend: &'a dyn Backend,
    store: &'a dyn RendezvousStore,
    topology: &'a TierTopology,
    stream: Arc<dyn DeviceStream>,
    device_id: DeviceId,
    store_timeout: Option<Duration>,
}

impl<'a> CommunicatorFactory<'a> {
    /// Every communicator built by this factory shares `stream`.
    pub fn new(
        backend: &'a dyn Backend,
        store: &'a dyn RendezvousStore,
        topology: &'a TierTopology,
        stream: Arc<dyn DeviceStream>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            backend,
            store,
            topology,
            stream,
            device_id,
            store_timeout: None,
        }
    }

    /// Bound how long followers wait for the leader's unique id.
    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Tier rank, tier size and leader global rank for `purpose`, or `None`
    /// if this rank takes no part in that tier.
    fn placement(&self, purpose: CommPurpose) -> Option<(Rank, u32, Rank)> {
        let topo = self.topology;
        match purpose {
            CommPurpose::Global => Some((topo.rank(), topo.world_size(), 0)),
            CommPurpose::IntraNode => {
                Some((topo.intra_rank(), topo.local_size(), topo.intra_leader()))
            }
            CommPurpose::InterNode => topo
                .inter_rank()
                .map(|r| (r, topo.num_nodes(), topo.inter_leader())),
        }
    }

    /// Form the communicator for `purpose`.
    ///
    /// Steps:
    /// 1. Work out this rank's place in the tier (non-members stop here).
    /// 2. The tier leader generates a unique id and publishes it; the other
    ///    members fetch it from the store.
    /// 3. Join the transport group with that id.
    pub async fn build(&self, purpose: CommPurpose) -> Result<Option<Communicator>> {
        let Some((rank, size, leader)) = self.placement(purpose) else {
            tracing::debug!(
                global_rank = self.topology.rank(),
                %purpose,
                "not a member, skipping"
            );
            return Ok(None);
        };

        let unique_id = exchange_unique_id(
            self.store,
            purpose,
            leader,
            self.topology.rank(),
            self.store_timeout,
            || self.backend.generate_unique_id(),
        )
        .await?;

        let inner = self
            .backend
            .create_communicator(
                rank,
                size,
                self.device_id,
                Arc::clone(&self.stream),
                &unique_id,
            )
            .await?;

        tracing::debug!(
            global_rank = self.topology.rank(),
            %purpose,
            rank,
            size,
            device = self.device_id,
            "communicator formed"
        );

        Ok(Some(Communicator::new(
            purpose,
            rank,
            size,
            self.device_id,
            Arc::clone(&self.stream),
            unique_id,
            inner,
        )))
    }

    /// Build global, intra and inter communicators, in that order on every
    /// rank. Any failure aborts the whole bootstrap.
    pub async fn build_all(&self) -> Result<CommunicatorSet> {
        let global = self.require(CommPurpose::Global).await?;
        let intra = self.require(CommPurpose::IntraNode).await?;
        let inter = self.build(CommPurpose::InterNode).await?;
        Ok(CommunicatorSet {
            global,
            intra,
            inter,
        })
    }

    async fn require(&self, purpose: CommPurpose) -> Result<Communicator> {
        self.build(purpose)
            .await?
            .ok_or_else(|| TierCommError::Topology {
                reason: format!("rank {} has no {purpose} membership", self.topology.rank()),
            })
    }
}
