mod allreduce;
mod broadcast;

pub use allreduce::{allreduce, allreduce_coalesced};
pub use broadcast::{broadcast, broadcast_coalesced};

use crate::comm::Communicator;
use crate::coalesce::check_uniform_dtype;
use crate::device::{Location, TensorRef};
use crate::error::{Result, TierCommError};
use crate::types::{DataType, Rank};

/// Every tensor must be device-resident, on the communicator's device, and
/// share one element type. Returns that element type.
pub(crate) fn check_tensors(
    operation: &'static str,
    comm: &Communicator,
    tensors: &[TensorRef],
) -> Result<DataType> {
    if tensors.is_empty() {
        return Err(TierCommError::EmptyTensorList { operation });
    }
    for (index, t) in tensors.iter().enumerate() {
        match t.location() {
            Location::Host => {
                return Err(TierCommError::HostResidentTensor { operation, index });
            }
            Location::Device(actual) if actual != comm.device_id() => {
                return Err(TierCommError::DeviceMismatch {
                    operation,
                    index,
                    expected: comm.device_id(),
                    actual,
                });
            }
            Location::Device(_) => {}
        }
    }
    check_uniform_dtype(tensors)
}

pub(crate) fn check_root(root: Rank, comm: &Communicator) -> Result<()> {
    if root >= comm.size() {
        return Err(TierCommError::InvalidRoot {
            root,
            size: comm.size(),
        });
    }
    Ok(())
}

pub(crate) fn check_average(average: bool, dtype: DataType) -> Result<()> {
    if average && !dtype.is_float() {
        return Err(TierCommError::UnsupportedAverage(dtype));
    }
    Ok(())
}
