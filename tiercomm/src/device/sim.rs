//! Host-memory stand-in for a GPU.
//!
//! Streams execute eagerly on the calling thread and append every operation
//! to a per-device trace, so tests can assert on issue order without
//! hardware.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{DeviceMemory, DeviceStream, Location, StreamMarker, TensorRef};
use crate::error::{Result, TierCommError};
use crate::reduce;
use crate::types::{DataType, DeviceId};

/// One stream operation as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    RecordMarker(u64),
    WaitMarker(u64),
    ReleaseMarker(u64),
    Alloc { bytes: usize },
    Copy { bytes: usize },
    DivScalar { count: usize, divisor: u32 },
    Collective(&'static str),
    Synchronize,
    SynchronizeDevice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Raw handle of the stream the op was issued on.
    pub stream: u64,
    pub op: StreamOp,
}

/// A simulated device: owns the trace and the live marker set.
pub struct SimDevice {
    id: DeviceId,
    trace: Mutex<Vec<TraceEvent>>,
    live_markers: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
}

impl SimDevice {
    pub fn new(id: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            trace: Mutex::new(Vec::new()),
            live_markers: Mutex::new(HashSet::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn new_stream(self: &Arc<Self>) -> Arc<SimStream> {
        Arc::new(SimStream {
            handle: self.next_handle(),
            device: Arc::clone(self),
        })
    }

    /// Snapshot of everything issued so far, in issue order.
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.trace.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn clear_trace(&self) {
        if let Ok(mut t) = self.trace.lock() {
            t.clear();
        }
    }

    /// Number of markers recorded but not yet released.
    pub fn live_markers(&self) -> usize {
        self.live_markers.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Copy `data` into fresh device memory.
    pub fn upload<T: SimElement>(&self, data: &[T]) -> SimBuffer {
        let buf = SimBuffer {
            memory: SimMemory::zeroed(self.id, std::mem::size_of_val(data)),
            dtype: T::DTYPE,
        };
        buf.write(data);
        buf
    }

    /// Zero-filled device memory holding `count` elements of `T`.
    pub fn zeros<T: SimElement>(&self, count: usize) -> SimBuffer {
        SimBuffer {
            memory: SimMemory::zeroed(self.id, count * std::mem::size_of::<T>()),
            dtype: T::DTYPE,
        }
    }

    pub(crate) fn log(&self, stream: u64, op: StreamOp) {
        if let Ok(mut t) = self.trace.lock() {
            t.push(TraceEvent { stream, op });
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

/// Eager stream on a [`SimDevice`].
pub struct SimStream {
    handle: u64,
    device: Arc<SimDevice>,
}

impl SimStream {
    pub fn device(&self) -> &Arc<SimDevice> {
        &self.device
    }
}

impl DeviceStream for SimStream {
    fn device_id(&self) -> DeviceId {
        self.device.id
    }

    fn raw_handle(&self) -> u64 {
        self.handle
    }

    fn record_marker(&self) -> Result<StreamMarker> {
        let raw = self.device.next_handle();
        self.device
            .live_markers
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("sim markers"))?
            .insert(raw);
        self.device.log(self.handle, StreamOp::RecordMarker(raw));
        Ok(StreamMarker::from_raw(raw))
    }

    fn wait_marker(&self, marker: &StreamMarker) -> Result<()> {
        let live = self
            .device
            .live_markers
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("sim markers"))?
            .contains(&marker.raw());
        if !live {
            return Err(TierCommError::device(format!(
                "wait on unknown marker {}",
                marker.raw()
            )));
        }
        self.device.log(self.handle, StreamOp::WaitMarker(marker.raw()));
        Ok(())
    }

    fn release_marker(&self, marker: StreamMarker) -> Result<()> {
        let removed = self
            .device
            .live_markers
            .lock()
            .map_err(|_| TierCommError::LockPoisoned("sim markers"))?
            .remove(&marker.raw());
        if !removed {
            return Err(TierCommError::device(format!(
                "release of unknown marker {}",
                marker.raw()
            )));
        }
        self.device.log(self.handle, StreamOp::ReleaseMarker(marker.raw()));
        Ok(())
    }

    fn alloc(&self, len_bytes: usize) -> Result<Box<dyn DeviceMemory>> {
        self.device
            .log(self.handle, StreamOp::Alloc { bytes: len_bytes });
        Ok(Box::new(SimMemory::zeroed(self.device.id, len_bytes)))
    }

    unsafe fn copy_async(&self, dst: u64, src: u64, len_bytes: usize) -> Result<()> {
        self.device.log(self.handle, StreamOp::Copy { bytes: len_bytes });
        if len_bytes > 0 {
            unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len_bytes) };
        }
        Ok(())
    }

    unsafe fn div_scalar_async(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        divisor: u32,
    ) -> Result<()> {
        self.device
            .log(self.handle, StreamOp::DivScalar { count, divisor });
        if count == 0 {
            return Ok(());
        }
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(ptr as *mut u8, count * dtype.size_in_bytes())
        };
        reduce::div_scalar(bytes, dtype, divisor)
    }

    fn synchronize(&self) -> Result<()> {
        self.device.log(self.handle, StreamOp::Synchronize);
        Ok(())
    }

    fn synchronize_device(&self) -> Result<()> {
        self.device.log(self.handle, StreamOp::SynchronizeDevice);
        Ok(())
    }
}

/// Heap allocation standing in for device memory. 8-byte aligned so any
/// element type can be read in place.
pub struct SimMemory {
    ptr: u64,
    words: usize,
    len_bytes: usize,
    device_id: DeviceId,
}

impl SimMemory {
    fn zeroed(device_id: DeviceId, len_bytes: usize) -> Self {
        let words = len_bytes.div_ceil(8);
        let storage: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let ptr = Box::into_raw(storage) as *mut u64 as u64;
        Self {
            ptr,
            words,
            len_bytes,
            device_id,
        }
    }
}

impl DeviceMemory for SimMemory {
    fn ptr(&self) -> u64 {
        self.ptr
    }

    fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    fn device_id(&self) -> DeviceId {
        self.device_id
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`words` came from `Box::into_raw` in `zeroed`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr as *mut u64,
                self.words,
            )));
        }
    }
}

/// Element types that tests can upload to a simulated device.
pub trait SimElement: Copy + Send + Sync + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_sim_element {
    ($($ty:ty => $dtype:ident),*) => {
        $(impl SimElement for $ty { const DTYPE: DataType = DataType::$dtype; })*
    };
}

impl_sim_element!(
    f32 => F32, f64 => F64, half::f16 => F16, half::bf16 => BF16,
    i8 => I8, i32 => I32, i64 => I64, u8 => U8, u32 => U32, u64 => U64
);

/// Typed device buffer on a [`SimDevice`].
pub struct SimBuffer {
    memory: SimMemory,
    dtype: DataType,
}

impl SimBuffer {
    pub fn ptr(&self) -> u64 {
        self.memory.ptr
    }

    pub fn len(&self) -> usize {
        self.memory.len_bytes / self.dtype.size_in_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The whole buffer viewed as one tensor of `shape`.
    pub fn tensor(&self, shape: Vec<usize>) -> TensorRef {
        self.tensor_at(0, shape)
    }

    /// A tensor of `shape` starting `offset` elements into the buffer.
    ///
    /// # Panics
    /// If the view does not fit in the buffer.
    pub fn tensor_at(&self, offset: usize, shape: Vec<usize>) -> TensorRef {
        let numel: usize = shape.iter().product();
        assert!(offset + numel <= self.len(), "view out of bounds");
        let ptr = self.memory.ptr + (offset * self.dtype.size_in_bytes()) as u64;
        // SAFETY: bounds checked above; the buffer outlives test-local views.
        unsafe {
            TensorRef::from_raw_parts(
                ptr,
                shape,
                self.dtype,
                Location::Device(self.memory.device_id),
            )
        }
    }

    /// Copy the contents out to the host.
    ///
    /// # Panics
    /// If `T` is not the buffer's element type.
    pub fn read<T: SimElement>(&self) -> Vec<T> {
        assert_eq!(T::DTYPE, self.dtype, "element type mismatch");
        let slice =
            unsafe { std::slice::from_raw_parts(self.memory.ptr as *const T, self.len()) };
        slice.to_vec()
    }

    /// Overwrite the buffer from `data`.
    ///
    /// # Panics
    /// If `T` is not the buffer's element type or `data` is too long.
    pub fn write<T: SimElement>(&self, data: &[T]) {
        assert_eq!(T::DTYPE, self.dtype, "element type mismatch");
        assert!(data.len() <= self.len(), "write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.memory.ptr as *mut T, data.len());
        }
    }
}
