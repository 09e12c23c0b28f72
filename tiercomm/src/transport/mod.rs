//! The seam between the collectives and a concrete communication library.
//!
//! A [`Backend`] hands out streams and forms communicators from a shared
//! [`UniqueId`]; a [`TransportComm`] runs the collectives on raw buffers.

pub mod local;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::device::{DeviceStream, TensorRef};
use crate::error::Result;
use crate::types::{DataType, DeviceId, Rank};

pub use local::{LocalBackend, LocalFabric};

/// Opaque identifier every member of one communicator must present.
///
/// Generated by the group leader and distributed through the rendezvous
/// store. Backends define the byte layout (128 bytes for NCCL).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UniqueId(Vec<u8>);

impl UniqueId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId(")?;
        for b in self.0.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// A buffer as the transport sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub ptr: u64,
    /// Elements taking part in the collective.
    pub count: usize,
    /// Elements the allocation can hold (`>= count`).
    pub count_allocated: usize,
    pub dtype: DataType,
    pub device_id: DeviceId,
}

impl BufferDescriptor {
    pub fn new(ptr: u64, count: usize, dtype: DataType, device_id: DeviceId) -> Self {
        Self {
            ptr,
            count,
            count_allocated: count,
            dtype,
            device_id,
        }
    }

    /// Descriptor for a whole tensor living on `device_id`.
    pub fn for_tensor(tensor: &TensorRef, device_id: DeviceId) -> Self {
        Self::new(tensor.ptr(), tensor.numel(), tensor.dtype(), device_id)
    }

    pub fn len_bytes(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }
}

/// A formed communicator. Collectives are in place and enqueued on the
/// stream the communicator was created with.
///
/// Callers guarantee that every `BufferDescriptor` addresses valid device
/// memory for the duration of the call.
pub trait TransportComm: Send + Sync {
    /// Copy `root`'s buffer into every other member's buffer.
    fn broadcast<'a>(&'a self, buf: &'a BufferDescriptor, root: Rank) -> BoxFuture<'a, Result<()>>;

    /// Element-wise sum across all members, result on every member.
    fn allreduce<'a>(&'a self, buf: &'a BufferDescriptor) -> BoxFuture<'a, Result<()>>;
}

/// A device + communication library pairing.
pub trait Backend: Send + Sync {
    /// Short name for logs (`"nccl"`, `"local"`).
    fn name(&self) -> &'static str;

    /// The stream application compute runs on for `device_id`.
    fn compute_stream(&self, device_id: DeviceId) -> Result<Arc<dyn DeviceStream>>;

    /// A fresh stream reserved for communication.
    fn create_comm_stream(&self, device_id: DeviceId) -> Result<Arc<dyn DeviceStream>>;

    /// Generate a fresh id. Called only on the leader of each communicator.
    fn generate_unique_id(&self) -> Result<UniqueId>;

    /// Join the communicator identified by `id` as `rank` of `size`.
    ///
    /// Resolves once every member has joined.
    fn create_communicator<'a>(
        &'a self,
        rank: Rank,
        size: u32,
        device_id: DeviceId,
        stream: Arc<dyn DeviceStream>,
        id: &'a UniqueId,
    ) -> BoxFuture<'a, Result<Box<dyn TransportComm>>>;
}
