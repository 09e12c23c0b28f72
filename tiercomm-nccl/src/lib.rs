//! CUDA + NCCL backend for `tiercomm`.
//!
//! [`NcclBackend`] plugs into [`tiercomm::TierComm::bootstrap`] or
//! [`tiercomm::initialize`]; tiercomm handles the rendezvous and passes the
//! resulting 128-byte NCCL unique id to [`NcclComm::init`].

pub mod backend;
pub mod error;
pub mod group;
pub mod stream;
pub mod types;

pub use backend::NcclBackend;
pub use error::{NcclBackendError, Result};
pub use group::{id_from_bytes, id_to_bytes, NcclComm, NCCL_ID_SIZE};
pub use stream::CudaStreamHandle;
pub use types::to_nccl_dtype;
