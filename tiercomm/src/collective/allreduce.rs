use std::slice;

use crate::coalesce::flatten;
use crate::collective::{check_average, check_tensors};
use crate::comm::Communicator;
use crate::device::{DeviceStream, TensorRef};
use crate::error::Result;
use crate::sync::stream_ordered;
use crate::transport::BufferDescriptor;

/// Sum `tensor` across every member of `comm`, in place.
///
/// With `average`, each member then divides its result by the communicator
/// size on the communication stream. Only floating-point tensors can be
/// averaged.
pub async fn allreduce(
    ambient: &dyn DeviceStream,
    comm: &Communicator,
    tensor: &TensorRef,
    average: bool,
) -> Result<()> {
    let dtype = check_tensors("allreduce", comm, slice::from_ref(tensor))?;
    check_average(average, dtype)?;

    let desc = BufferDescriptor::for_tensor(tensor, comm.device_id());
    let stream = comm.stream().as_ref();
    stream_ordered(ambient, stream, async {
        reduce_in_place(comm, stream, &desc, average).await
    })
    .await
}

/// [`allreduce`] over a list of tensors with one collective call. An empty
/// list is rejected with `EmptyTensorList`.
pub async fn allreduce_coalesced(
    ambient: &dyn DeviceStream,
    comm: &Communicator,
    tensors: &[TensorRef],
    average: bool,
) -> Result<()> {
    let dtype = check_tensors("allreduce_coalesced", comm, tensors)?;
    check_average(average, dtype)?;

    let stream = comm.stream().as_ref();
    let _flat = stream_ordered(ambient, stream, async {
        let flat = flatten(stream, tensors)?;
        reduce_in_place(comm, stream, &flat.descriptor(), average).await?;
        flat.scatter(stream, tensors)?;
        Ok(flat)
    })
    .await?;
    Ok(())
}

async fn reduce_in_place(
    comm: &Communicator,
    stream: &dyn DeviceStream,
    desc: &BufferDescriptor,
    average: bool,
) -> Result<()> {
    comm.transport().allreduce(desc).await?;
    if average {
        // SAFETY: `desc` covers a validated device buffer on this stream's
        // device.
        unsafe { stream.div_scalar_async(desc.ptr, desc.count, desc.dtype, comm.size())? };
    }
    Ok(())
}
