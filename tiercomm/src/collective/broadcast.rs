use std::slice;

use crate::coalesce::flatten;
use crate::collective::{check_root, check_tensors};
use crate::comm::Communicator;
use crate::device::{DeviceStream, TensorRef};
use crate::error::Result;
use crate::sync::stream_ordered;
use crate::transport::BufferDescriptor;
use crate::types::Rank;

/// Overwrite `tensor` on every member with the contents on `root`.
///
/// `root` is a rank of `comm`, not a global rank. Ordered after all work
/// already queued on `ambient`; returns once the device is idle.
pub async fn broadcast(
    ambient: &dyn DeviceStream,
    comm: &Communicator,
    tensor: &TensorRef,
    root: Rank,
) -> Result<()> {
    check_tensors("broadcast", comm, slice::from_ref(tensor))?;
    check_root(root, comm)?;

    let desc = BufferDescriptor::for_tensor(tensor, comm.device_id());
    stream_ordered(ambient, comm.stream().as_ref(), async {
        comm.transport().broadcast(&desc, root).await
    })
    .await
}

/// [`broadcast`] over a list of tensors with one collective call.
///
/// The tensors are packed into one buffer, broadcast, and copied back.
pub async fn broadcast_coalesced(
    ambient: &dyn DeviceStream,
    comm: &Communicator,
    tensors: &[TensorRef],
    root: Rank,
) -> Result<()> {
    check_tensors("broadcast_coalesced", comm, tensors)?;
    check_root(root, comm)?;

    let stream = comm.stream().as_ref();
    let _flat = stream_ordered(ambient, stream, async {
        let flat = flatten(stream, tensors)?;
        comm.transport().broadcast(&flat.descriptor(), root).await?;
        flat.scatter(stream, tensors)?;
        Ok(flat)
    })
    .await?;
    Ok(())
}
