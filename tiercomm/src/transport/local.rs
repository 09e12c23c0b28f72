//! In-process transport: every rank is a tokio task in one process.
//!
//! Ranks that present the same [`UniqueId`] to one [`LocalFabric`] form a
//! group. Each collective is two barrier phases: publish, then read. Paired
//! with the simulated device, this lets a whole multi-node job run inside a
//! test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::RngCore;
use tokio::sync::Barrier;

use crate::config::TierCommConfig;
use crate::device::sim::{SimDevice, SimStream, StreamOp};
use crate::device::DeviceStream;
use crate::error::{Result, TierCommError};
use crate::reduce;
use crate::transport::{Backend, BufferDescriptor, TransportComm, UniqueId};
use crate::types::{DeviceId, Rank};

/// Length of simulated unique ids; matches `NCCL_UNIQUE_ID_BYTES`.
const UNIQUE_ID_BYTES: usize = 128;

/// Registry of groups still forming, keyed by unique id.
pub struct LocalFabric {
    forming: Mutex<HashMap<UniqueId, Arc<LocalGroup>>>,
    formation_timeout: Duration,
}

impl LocalFabric {
    /// `formation_timeout` bounds how long a rank waits for its peers.
    /// Ranks holding a different id never arrive, so a mismatch shows up
    /// as [`TierCommError::FormationTimeout`].
    pub fn new(formation_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            forming: Mutex::new(HashMap::new()),
            formation_timeout,
        })
    }

    pub fn from_config(config: &TierCommConfig) -> Arc<Self> {
        Self::new(config.formation_timeout)
    }

    async fn join(&self, id: &UniqueId, rank: Rank, size: u32) -> Result<Arc<LocalGroup>> {
        let group = {
            let mut forming = self
                .forming
                .lock()
                .map_err(|_| TierCommError::LockPoisoned("local fabric"))?;
            let group = forming
                .entry(id.clone())
                .or_insert_with(|| Arc::new(LocalGroup::new(size)));
            if group.size != size {
                return Err(TierCommError::UniqueIdMismatch {
                    rank,
                    expected: group.size,
                    actual: size,
                });
            }
            if rank >= size {
                return Err(TierCommError::transport(format!(
                    "rank {rank} out of range for group of {size}"
                )));
            }
            group.mark_joined(rank)?;
            Arc::clone(group)
        };

        match tokio::time::timeout(self.formation_timeout, group.barrier.wait()).await {
            Ok(res) => {
                if res.is_leader() {
                    self.forget(id, &group);
                }
                tracing::trace!(rank, size, ?id, "local group formed");
                Ok(group)
            }
            Err(_) => {
                // A partially joined barrier cannot be reused.
                self.forget(id, &group);
                Err(TierCommError::FormationTimeout {
                    joined: group.joined_count(),
                    expected: size,
                })
            }
        }
    }

    fn forget(&self, id: &UniqueId, group: &Arc<LocalGroup>) {
        if let Ok(mut forming) = self.forming.lock() {
            if forming.get(id).is_some_and(|g| Arc::ptr_eq(g, group)) {
                forming.remove(id);
            }
        }
    }
}

struct LocalGroup {
    size: u32,
    barrier: Barrier,
    joined: Mutex<Vec<bool>>,
    slots: Mutex<Vec<Vec<u8>>>,
}

impl LocalGroup {
    fn new(size: u32) -> Self {
        Self {
            size,
            barrier: Barrier::new(size as usize),
            joined: Mutex::new(vec![false; size as usize]),
            slots: Mutex::new(vec![Vec::new(); size as usize]),
        }
    }

    fn mark_joined(&self, rank: Rank) -> Result<()> {
        let mut joined = self
            .joined
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("local group"))?;
        if std::mem::replace(&mut joined[rank as usize], true) {
            return Err(TierCommError::transport(format!(
                "rank {rank} joined the same group twice"
            )));
        }
        Ok(())
    }

    fn joined_count(&self) -> u32 {
        self.joined
            .lock()
            .map(|j| j.iter().filter(|&&b| b).count() as u32)
            .unwrap_or(0)
    }

    fn publish(&self, rank: Rank, data: &[u8]) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("local group"))?;
        slots[rank as usize].clear();
        slots[rank as usize].extend_from_slice(data);
        Ok(())
    }

    fn sum_all(&self, buf: &BufferDescriptor) -> Result<Vec<u8>> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("local group"))?;
        // Same order on every rank, so float results are bit-identical.
        let mut acc = slots[0].clone();
        for slot in &slots[1..] {
            reduce::sum_into(&mut acc, slot, buf.dtype)?;
        }
        Ok(acc)
    }

    fn read_slot(&self, rank: Rank, expected_len: usize) -> Result<Vec<u8>> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("local group"))?;
        let data = &slots[rank as usize];
        if data.len() != expected_len {
            return Err(TierCommError::transport(format!(
                "broadcast size mismatch: root sent {} bytes, expected {expected_len}",
                data.len()
            )));
        }
        Ok(data.clone())
    }

    async fn allreduce(&self, rank: Rank, buf: &BufferDescriptor) -> Result<()> {
        let local = unsafe { host_view(buf) };
        let published = self.publish(rank, local);
        self.barrier.wait().await;
        let summed = published.and_then(|_| self.sum_all(buf));
        // Nobody may overwrite a slot until every rank has read them all.
        self.barrier.wait().await;
        local.copy_from_slice(&summed?);
        Ok(())
    }

    async fn broadcast(&self, rank: Rank, root: Rank, buf: &BufferDescriptor) -> Result<()> {
        let local = unsafe { host_view(buf) };
        let published = if rank == root {
            self.publish(rank, local)
        } else {
            Ok(())
        };
        self.barrier.wait().await;
        let received = match published {
            Ok(()) if rank != root => self.read_slot(root, local.len()).map(Some),
            Ok(()) => Ok(None),
            Err(e) => Err(e),
        };
        self.barrier.wait().await;
        if let Some(data) = received? {
            local.copy_from_slice(&data);
        }
        Ok(())
    }
}

/// # Safety
/// `buf` must address host-accessible memory (the simulated device) that
/// nothing else touches during the collective.
unsafe fn host_view<'a>(buf: &BufferDescriptor) -> &'a mut [u8] {
    let len = buf.len_bytes();
    if len == 0 {
        return &mut [];
    }
    unsafe { std::slice::from_raw_parts_mut(buf.ptr as *mut u8, len) }
}

/// One rank's membership in a [`LocalGroup`].
struct LocalComm {
    group: Arc<LocalGroup>,
    rank: Rank,
    device: Arc<SimDevice>,
    stream_handle: u64,
}

impl TransportComm for LocalComm {
    fn broadcast<'a>(&'a self, buf: &'a BufferDescriptor, root: Rank) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if root >= self.group.size {
                return Err(TierCommError::InvalidRoot {
                    root,
                    size: self.group.size,
                });
            }
            self.device
                .log(self.stream_handle, StreamOp::Collective("broadcast"));
            self.group.broadcast(self.rank, root, buf).await
        })
    }

    fn allreduce<'a>(&'a self, buf: &'a BufferDescriptor) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.device
                .log(self.stream_handle, StreamOp::Collective("allreduce"));
            self.group.allreduce(self.rank, buf).await
        })
    }
}

struct DeviceSlot {
    device: Arc<SimDevice>,
    compute: Arc<SimStream>,
}

/// Simulated devices on top of a shared [`LocalFabric`].
///
/// Use one backend per simulated rank and one fabric per simulated job.
pub struct LocalBackend {
    fabric: Arc<LocalFabric>,
    devices: Mutex<HashMap<DeviceId, DeviceSlot>>,
}

impl LocalBackend {
    pub fn new(fabric: Arc<LocalFabric>) -> Self {
        Self {
            fabric,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The simulated device `device_id`, created on first use.
    pub fn device(&self, device_id: DeviceId) -> Result<Arc<SimDevice>> {
        Ok(Arc::clone(&self.slot(device_id)?.0))
    }

    fn slot(&self, device_id: DeviceId) -> Result<(Arc<SimDevice>, Arc<SimStream>)> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("local backend"))?;
        let slot = devices.entry(device_id).or_insert_with(|| {
            let device = SimDevice::new(device_id);
            let compute = device.new_stream();
            DeviceSlot { device, compute }
        });
        Ok((Arc::clone(&slot.device), Arc::clone(&slot.compute)))
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn compute_stream(&self, device_id: DeviceId) -> Result<Arc<dyn DeviceStream>> {
        let (_, compute) = self.slot(device_id)?;
        Ok(compute)
    }

    fn create_comm_stream(&self, device_id: DeviceId) -> Result<Arc<dyn DeviceStream>> {
        Ok(self.device(device_id)?.new_stream())
    }

    fn generate_unique_id(&self) -> Result<UniqueId> {
        let mut bytes = vec![0u8; UNIQUE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Ok(UniqueId::from_bytes(bytes))
    }

    fn create_communicator<'a>(
        &'a self,
        rank: Rank,
        size: u32,
        device_id: DeviceId,
        stream: Arc<dyn DeviceStream>,
        id: &'a UniqueId,
    ) -> BoxFuture<'a, Result<Box<dyn TransportComm>>> {
        Box::pin(async move {
            if stream.device_id() != device_id {
                return Err(TierCommError::transport(format!(
                    "stream is on device {}, communicator requested on {device_id}",
                    stream.device_id()
                )));
            }
            let device = self.device(device_id)?;
            let group = self.fabric.join(id, rank, size).await?;
            Ok(Box::new(LocalComm {
                group,
                rank,
                device,
                stream_handle: stream.raw_handle(),
            }) as Box<dyn TransportComm>)
        })
    }
}
