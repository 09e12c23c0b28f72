use std::future::Future;

use crate::device::DeviceStream;
use crate::error::Result;

/// Run `issue` on `comm_stream`, ordered after everything already queued on
/// `ambient`, and return once the device is idle.
///
/// 1. Record a marker on `ambient`.
/// 2. Make `comm_stream` wait on it, then release the marker.
/// 3. Drive `issue`; it enqueues its work on `comm_stream`.
/// 4. Synchronize the whole device.
///
/// `issue` is lazy, so nothing it enqueues can overtake step 2. Whatever it
/// returns is held until after step 4, which keeps scratch buffers alive
/// until the device is done with them.
pub async fn stream_ordered<F, T>(
    ambient: &dyn DeviceStream,
    comm_stream: &dyn DeviceStream,
    issue: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let marker = ambient.record_marker()?;
    let waited = comm_stream.wait_marker(&marker);
    ambient.release_marker(marker)?;
    waited?;

    let issued = issue.await;
    let synced = comm_stream.synchronize_device();
    let out = issued?;
    synced?;
    Ok(out)
}
