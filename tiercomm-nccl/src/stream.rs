use std::sync::Arc;

use cudarc::driver::result as cuda_result;
use cudarc::driver::sys::{CUevent, CUevent_flags, CUevent_wait_flags};
use cudarc::driver::{CudaContext, CudaStream};
use tiercomm::{DataType, DeviceId, DeviceMemory, DeviceStream, StreamMarker, TierCommError};

use crate::error::NcclBackendError;

fn driver(e: cudarc::driver::result::DriverError) -> TierCommError {
    NcclBackendError::CudaDriver(e).into()
}

/// A CUDA stream exposed as a [`DeviceStream`]. Markers are CUDA events.
pub struct CudaStreamHandle {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    device_id: DeviceId,
}

impl CudaStreamHandle {
    pub fn new(ctx: Arc<CudaContext>, stream: Arc<CudaStream>, device_id: DeviceId) -> Self {
        Self {
            ctx,
            stream,
            device_id,
        }
    }

    fn bind(&self) -> tiercomm::Result<()> {
        self.ctx.bind_to_thread().map_err(driver)
    }
}

impl DeviceStream for CudaStreamHandle {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn raw_handle(&self) -> u64 {
        self.stream.cu_stream() as u64
    }

    fn record_marker(&self) -> tiercomm::Result<StreamMarker> {
        self.bind()?;
        // Timing disabled for lower overhead.
        let event = cuda_result::event::create(CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(driver)?;
        if let Err(e) = unsafe { cuda_result::event::record(event, self.stream.cu_stream()) } {
            let _ = unsafe { cuda_result::event::destroy(event) };
            return Err(driver(e));
        }
        Ok(StreamMarker::from_raw(event as u64))
    }

    fn wait_marker(&self, marker: &StreamMarker) -> tiercomm::Result<()> {
        self.bind()?;
        unsafe {
            cuda_result::stream::wait_event(
                self.stream.cu_stream(),
                marker.raw() as CUevent,
                CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
            .map_err(driver)
        }
    }

    fn release_marker(&self, marker: StreamMarker) -> tiercomm::Result<()> {
        self.bind()?;
        unsafe { cuda_result::event::destroy(marker.raw() as CUevent).map_err(driver) }
    }

    fn alloc(&self, len_bytes: usize) -> tiercomm::Result<Box<dyn DeviceMemory>> {
        self.bind()?;
        let ptr = unsafe { cuda_result::malloc_async(self.stream.cu_stream(), len_bytes) }
            .map_err(driver)?;
        Ok(Box::new(CudaMemory {
            ptr,
            len_bytes,
            device_id: self.device_id,
            stream: Arc::clone(&self.stream),
        }))
    }

    unsafe fn copy_async(&self, dst: u64, src: u64, len_bytes: usize) -> tiercomm::Result<()> {
        if len_bytes == 0 {
            return Ok(());
        }
        self.bind()?;
        unsafe {
            cuda_result::memcpy_dtod_async(dst, src, len_bytes, self.stream.cu_stream())
                .map_err(driver)
        }
    }

    /// Scales on the host: the buffer is copied out, divided and copied
    /// back, with a stream sync after each copy. The call therefore
    /// returns only once the stream has drained.
    unsafe fn div_scalar_async(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        divisor: u32,
    ) -> tiercomm::Result<()> {
        if !dtype.is_float() {
            return Err(TierCommError::UnsupportedAverage(dtype));
        }
        if count == 0 {
            return Ok(());
        }
        self.bind()?;
        let mut host = vec![0u8; count * dtype.size_in_bytes()];
        unsafe {
            cuda_result::memcpy_dtoh_async(&mut host, ptr, self.stream.cu_stream())
                .map_err(driver)?;
            cuda_result::stream::synchronize(self.stream.cu_stream()).map_err(driver)?;
        }
        tiercomm::reduce::div_scalar(&mut host, dtype, divisor)?;
        unsafe {
            cuda_result::memcpy_htod_async(ptr, &host, self.stream.cu_stream())
                .map_err(driver)?;
            // `host` must outlive the copy.
            cuda_result::stream::synchronize(self.stream.cu_stream()).map_err(driver)
        }
    }

    fn synchronize(&self) -> tiercomm::Result<()> {
        self.bind()?;
        self.stream.synchronize().map_err(driver)
    }

    fn synchronize_device(&self) -> tiercomm::Result<()> {
        self.ctx.synchronize().map_err(driver)
    }
}

/// Stream-ordered device allocation, freed on the stream that made it.
struct CudaMemory {
    ptr: u64,
    len_bytes: usize,
    device_id: DeviceId,
    stream: Arc<CudaStream>,
}

impl DeviceMemory for CudaMemory {
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

impl Drop for CudaMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = cuda_result::free_async(self.ptr, self.stream.cu_stream());
        }
    }
}
