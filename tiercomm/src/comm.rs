use std::fmt;
use std::sync::Arc;

use crate::device::DeviceStream;
use crate::transport::{TransportComm, UniqueId};
use crate::types::{CommPurpose, DeviceId, Rank};

/// A formed communicator for one tier.
///
/// Built once during bootstrap and never mutated. `rank` and `size` are
/// relative to the tier: on the intra-node communicator `rank` is the local
/// rank, on the inter-node communicator it is the node index.
pub struct Communicator {
    purpose: CommPurpose,
    rank: Rank,
    size: u32,
    device_id: DeviceId,
    stream: Arc<dyn DeviceStream>,
    unique_id: UniqueId,
    inner: Box<dyn TransportComm>,
}

impl Communicator {
    pub fn new(
        purpose: CommPurpose,
        rank: Rank,
        size: u32,
        device_id: DeviceId,
        stream: Arc<dyn DeviceStream>,
        unique_id: UniqueId,
        inner: Box<dyn TransportComm>,
    ) -> Self {
        Self {
            purpose,
            rank,
            size,
            device_id,
            stream,
            unique_id,
            inner,
        }
    }

    pub fn purpose(&self) -> CommPurpose {
        self.purpose
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// The communication stream all of this communicator's work runs on.
    pub fn stream(&self) -> &Arc<dyn DeviceStream> {
        &self.stream
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub(crate) fn transport(&self) -> &dyn TransportComm {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("purpose", &self.purpose)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("device_id", &self.device_id)
            .field("stream", &self.stream.raw_handle())
            .field("unique_id", &self.unique_id)
            .finish()
    }
}
