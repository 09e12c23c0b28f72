//! Device-side abstractions the collectives are written against.
//!
//! Backends provide streams and device memory; the collectives only ever
//! see raw `u64` device pointers plus these traits.

pub mod sim;

use crate::error::Result;
use crate::types::{DataType, DeviceId};

/// A point in a stream's issue order (a CUDA event on GPU backends).
///
/// Created by [`DeviceStream::record_marker`]; must be handed back to
/// [`DeviceStream::release_marker`] on the stream that recorded it.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamMarker {
    raw: u64,
}

impl StreamMarker {
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }
}

/// An in-order queue of device work.
///
/// Work enqueued on one stream executes in issue order. Cross-stream order
/// is only established through markers.
pub trait DeviceStream: Send + Sync {
    /// Device this stream belongs to.
    fn device_id(&self) -> DeviceId;

    /// Opaque native handle (`CUstream` on CUDA). Used for logging and for
    /// handing the stream to a transport.
    fn raw_handle(&self) -> u64;

    /// Record a marker at the current tail of this stream.
    fn record_marker(&self) -> Result<StreamMarker>;

    /// Make all later work on this stream wait until `marker` completes.
    fn wait_marker(&self, marker: &StreamMarker) -> Result<()>;

    /// Destroy a marker. Safe once every wait on it has been enqueued.
    fn release_marker(&self, marker: StreamMarker) -> Result<()>;

    /// Allocate `len_bytes` of device memory, ordered on this stream.
    fn alloc(&self, len_bytes: usize) -> Result<Box<dyn DeviceMemory>>;

    /// Enqueue a device-to-device copy.
    ///
    /// # Safety
    /// `src` and `dst` must be valid device pointers on this stream's device
    /// for `len_bytes` bytes until the copy completes.
    unsafe fn copy_async(&self, dst: u64, src: u64, len_bytes: usize) -> Result<()>;

    /// Enqueue an in-place `buf[i] /= divisor` over `count` elements.
    ///
    /// # Safety
    /// `ptr` must be a valid device pointer to `count` elements of `dtype`.
    unsafe fn div_scalar_async(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        divisor: u32,
    ) -> Result<()>;

    /// Block until all work on this stream has completed.
    fn synchronize(&self) -> Result<()>;

    /// Block until all work on every stream of this device has completed.
    fn synchronize_device(&self) -> Result<()>;
}

/// Device memory owned by a backend. Freed on drop.
pub trait DeviceMemory: Send + Sync {
    fn ptr(&self) -> u64;
    fn len_bytes(&self) -> usize;
    fn device_id(&self) -> DeviceId;
}

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Host,
    Device(DeviceId),
}

/// Non-owning description of a dense, contiguous tensor.
///
/// Holds a raw address, so building one is `unsafe`; everything that
/// consumes it afterwards is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRef {
    ptr: u64,
    shape: Vec<usize>,
    dtype: DataType,
    location: Location,
}

impl TensorRef {
    /// Describe the tensor at `ptr`.
    ///
    /// # Safety
    /// `ptr` must address `shape.iter().product()` contiguous elements of
    /// `dtype` in `location`, and stay valid for as long as the reference
    /// is used by a collective.
    pub unsafe fn from_raw_parts(
        ptr: u64,
        shape: Vec<usize>,
        dtype: DataType,
        location: Location,
    ) -> Self {
        Self {
            ptr,
            shape,
            dtype,
            location,
        }
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Device ordinal, or `None` for host tensors.
    pub fn device_id(&self) -> Option<DeviceId> {
        match self.location {
            Location::Host => None,
            Location::Device(id) => Some(id),
        }
    }

    /// Number of elements. A rank-0 shape is a scalar.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn len_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }
}
