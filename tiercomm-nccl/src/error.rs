use cudarc::nccl::result::NcclError;
use tiercomm::TierCommError;

pub type Result<T> = std::result::Result<T, NcclBackendError>;

#[derive(Debug, thiserror::Error)]
pub enum NcclBackendError {
    #[error("NCCL error: {0:?}")]
    Nccl(NcclError),

    #[error("CUDA driver error: {0}")]
    CudaDriver(#[from] cudarc::driver::result::DriverError),

    #[error("NCCL unique id must be {expected} bytes, got {actual}")]
    InvalidUniqueId { expected: usize, actual: usize },

    #[error("invalid rank {rank}: communicator size is {size}")]
    InvalidRank { rank: u32, size: u32 },
}

impl From<NcclError> for NcclBackendError {
    fn from(e: NcclError) -> Self {
        NcclBackendError::Nccl(e)
    }
}

impl From<NcclBackendError> for TierCommError {
    fn from(e: NcclBackendError) -> Self {
        match e {
            NcclBackendError::CudaDriver(_) => {
                TierCommError::device_with_source("CUDA driver call failed", e)
            }
            _ => TierCommError::transport_with_source("NCCL call failed", e),
        }
    }
}
