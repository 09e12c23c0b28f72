use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::CudaContext;
use cudarc::nccl::{result as nccl, safe::Id, sys};
use futures::future::BoxFuture;
use tiercomm::{BufferDescriptor, DeviceStream, Rank, TransportComm, UniqueId};

use crate::error::{NcclBackendError, Result};
use crate::types::to_nccl_dtype;

/// `NCCL_UNIQUE_ID_BYTES`.
pub const NCCL_ID_SIZE: usize = 128;

/// Wrapper around a raw `ncclComm_t` handle.
///
/// Uses cudarc's `result` layer directly (raw pointers) rather than the `safe`
/// layer, because buffers arrive as `u64` device pointers.
pub struct NcclComm {
    comm: sys::ncclComm_t,
    ctx: Arc<CudaContext>,
    /// Keeps the communication stream alive; all work is enqueued on it.
    stream: Arc<dyn DeviceStream>,
    rank: Rank,
    size: u32,
}

// SAFETY: ncclComm_t is thread-safe per NCCL documentation when used with
// proper stream synchronization. Callers never issue on one communicator
// from two threads at once.
unsafe impl Send for NcclComm {}
unsafe impl Sync for NcclComm {}

impl NcclComm {
    /// Join the NCCL communicator identified by `id`.
    ///
    /// Blocks the calling thread until all `size` ranks have joined.
    pub fn init(
        ctx: Arc<CudaContext>,
        stream: Arc<dyn DeviceStream>,
        rank: Rank,
        size: u32,
        id: &UniqueId,
    ) -> Result<Self> {
        if rank >= size {
            return Err(NcclBackendError::InvalidRank { rank, size });
        }
        let id = id_from_bytes(id.as_bytes())?;
        ctx.bind_to_thread()?;

        let mut comm = MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(
                comm.as_mut_ptr(),
                size as i32,
                *id_to_sys(&id),
                rank as i32,
            )?;
        }
        Ok(Self {
            comm: unsafe { comm.assume_init() },
            ctx,
            stream,
            rank,
            size,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// In-place broadcast from `root`.
    ///
    /// # Safety
    /// `buf` must describe valid device memory on this communicator's device.
    pub unsafe fn broadcast_inplace(&self, buf: &BufferDescriptor, root: Rank) -> Result<()> {
        if root >= self.size {
            return Err(NcclBackendError::InvalidRank {
                rank: root,
                size: self.size,
            });
        }
        self.ctx.bind_to_thread()?;
        let p = buf.ptr as *mut c_void;
        unsafe {
            nccl::broadcast(
                p as *const c_void,
                p,
                buf.count,
                to_nccl_dtype(buf.dtype),
                root as i32,
                self.comm,
                self.cu_stream(),
            )?;
        }
        Ok(())
    }

    /// In-place sum allreduce.
    ///
    /// # Safety
    /// `buf` must describe valid device memory on this communicator's device.
    pub unsafe fn allreduce_inplace(&self, buf: &BufferDescriptor) -> Result<()> {
        self.ctx.bind_to_thread()?;
        let p = buf.ptr as *mut c_void;
        unsafe {
            nccl::all_reduce(
                p as *const c_void,
                p,
                buf.count,
                to_nccl_dtype(buf.dtype),
                sys::ncclRedOp_t::ncclSum,
                self.comm,
                self.cu_stream(),
            )?;
        }
        Ok(())
    }

    fn cu_stream(&self) -> sys::cudaStream_t {
        self.stream.raw_handle() as sys::cudaStream_t
    }
}

impl TransportComm for NcclComm {
    fn broadcast<'a>(
        &'a self,
        buf: &'a BufferDescriptor,
        root: Rank,
    ) -> BoxFuture<'a, tiercomm::Result<()>> {
        Box::pin(async move { Ok(unsafe { self.broadcast_inplace(buf, root) }?) })
    }

    fn allreduce<'a>(&'a self, buf: &'a BufferDescriptor) -> BoxFuture<'a, tiercomm::Result<()>> {
        Box::pin(async move { Ok(unsafe { self.allreduce_inplace(buf) }?) })
    }
}

impl Drop for NcclComm {
    fn drop(&mut self) {
        unsafe {
            // Abort rather than destroy: no stream sync needed.
            let _ = nccl::comm_abort(self.comm);
        }
    }
}

/// Convert our `Id` to the sys-level `ncclUniqueId`.
///
/// `ncclUniqueId` is `#[repr(C)]` with a single field: `internal: [c_char; 128]`.
/// `Id::internal()` returns `&[c_char; 128]`, the same layout as the whole
/// struct, so the pointer cast is valid.
fn id_to_sys(id: &Id) -> &sys::ncclUniqueId {
    let internal = id.internal();
    unsafe { &*(internal as *const [std::ffi::c_char; NCCL_ID_SIZE] as *const sys::ncclUniqueId) }
}

/// Serialize an NCCL unique ID for the rendezvous store.
pub fn id_to_bytes(id: &Id) -> Vec<u8> {
    id.internal().iter().map(|&c| c as u8).collect()
}

/// Rebuild an NCCL unique ID fetched from the rendezvous store.
pub fn id_from_bytes(bytes: &[u8]) -> Result<Id> {
    if bytes.len() != NCCL_ID_SIZE {
        return Err(NcclBackendError::InvalidUniqueId {
            expected: NCCL_ID_SIZE,
            actual: bytes.len(),
        });
    }
    let mut internal = [0 as std::ffi::c_char; NCCL_ID_SIZE];
    for (dst, &b) in internal.iter_mut().zip(bytes) {
        *dst = b as std::ffi::c_char;
    }
    Ok(Id::uninit(internal))
}
