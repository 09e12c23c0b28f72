use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cudarc::driver::CudaContext;
use cudarc::nccl::safe::Id;
use futures::future::BoxFuture;
use tiercomm::{
    Backend, DeviceId, DeviceStream, Rank, TierCommError, TransportComm, UniqueId,
};

use crate::error::NcclBackendError;
use crate::group::{id_to_bytes, NcclComm};
use crate::stream::CudaStreamHandle;

struct DeviceEntry {
    ctx: Arc<CudaContext>,
    compute: Arc<CudaStreamHandle>,
}

/// CUDA devices plus NCCL communicators.
///
/// The compute stream of each device is its default stream; communication
/// streams are fresh non-default streams.
#[derive(Default)]
pub struct NcclBackend {
    devices: Mutex<HashMap<DeviceId, DeviceEntry>>,
}

impl NcclBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The primary context of `device_id`, created on first use.
    pub fn context(&self, device_id: DeviceId) -> tiercomm::Result<Arc<CudaContext>> {
        Ok(Arc::clone(&self.entry(device_id)?.0))
    }

    fn entry(
        &self,
        device_id: DeviceId,
    ) -> tiercomm::Result<(Arc<CudaContext>, Arc<CudaStreamHandle>)> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("nccl backend"))?;
        if let Some(e) = devices.get(&device_id) {
            return Ok((Arc::clone(&e.ctx), Arc::clone(&e.compute)));
        }
        let ctx = CudaContext::new(device_id).map_err(NcclBackendError::from)?;
        let compute = Arc::new(CudaStreamHandle::new(
            Arc::clone(&ctx),
            ctx.default_stream(),
            device_id,
        ));
        tracing::debug!(device = device_id, "opened CUDA context");
        devices.insert(
            device_id,
            DeviceEntry {
                ctx: Arc::clone(&ctx),
                compute: Arc::clone(&compute),
            },
        );
        Ok((ctx, compute))
    }
}

impl Backend for NcclBackend {
    fn name(&self) -> &'static str {
        "nccl"
    }

    fn compute_stream(&self, device_id: DeviceId) -> tiercomm::Result<Arc<dyn DeviceStream>> {
        let (_, compute) = self.entry(device_id)?;
        Ok(compute)
    }

    fn create_comm_stream(&self, device_id: DeviceId) -> tiercomm::Result<Arc<dyn DeviceStream>> {
        let ctx = self.context(device_id)?;
        let stream = ctx.new_stream().map_err(NcclBackendError::from)?;
        Ok(Arc::new(CudaStreamHandle::new(ctx, stream, device_id)))
    }

    fn generate_unique_id(&self) -> tiercomm::Result<UniqueId> {
        let id = Id::new().map_err(NcclBackendError::from)?;
        Ok(UniqueId::from_bytes(id_to_bytes(&id)))
    }

    fn create_communicator<'a>(
        &'a self,
        rank: Rank,
        size: u32,
        device_id: DeviceId,
        stream: Arc<dyn DeviceStream>,
        id: &'a UniqueId,
    ) -> BoxFuture<'a, tiercomm::Result<Box<dyn TransportComm>>> {
        Box::pin(async move {
            let ctx = self.context(device_id)?;
            // ncclCommInitRank blocks until every rank has joined.
            let comm = NcclComm::init(ctx, stream, rank, size, id)?;
            tracing::debug!(rank, size, device = device_id, "NCCL communicator ready");
            Ok(Box::new(comm) as Box<dyn TransportComm>)
        })
    }
}
