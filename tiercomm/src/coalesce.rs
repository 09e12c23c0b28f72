//! Pack many same-typed tensors into one contiguous region and back, so a
//! list of tensors costs one collective instead of one per tensor.

use crate::device::{DeviceMemory, DeviceStream, Location, TensorRef};
use crate::error::{Result, TierCommError};
use crate::transport::BufferDescriptor;
use crate::types::{DataType, DeviceId};

enum Storage {
    /// Scratch region owned by the buffer.
    Owned(Box<dyn DeviceMemory>),
    /// The inputs already sat back to back; this is their first address.
    Aliased(u64),
}

/// One contiguous region holding N tensors back to back.
pub struct CoalescedBuffer {
    storage: Storage,
    dtype: DataType,
    device_id: DeviceId,
    /// Element offset of each tensor, plus the total as the last entry.
    offsets: Vec<usize>,
}

impl CoalescedBuffer {
    pub fn ptr(&self) -> u64 {
        match &self.storage {
            Storage::Owned(mem) => mem.ptr(),
            Storage::Aliased(ptr) => *ptr,
        }
    }

    pub fn numel(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Whether the buffer is a view over the inputs rather than a copy.
    pub fn is_aliased(&self) -> bool {
        matches!(self.storage, Storage::Aliased(_))
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor::new(self.ptr(), self.numel(), self.dtype, self.device_id)
    }

    /// Copy every slice of the buffer back over the tensor it came from.
    /// Nothing to do for an aliasing buffer.
    pub fn scatter(&self, stream: &dyn DeviceStream, tensors: &[TensorRef]) -> Result<()> {
        let views = unflatten(self, tensors)?;
        if self.is_aliased() {
            return Ok(());
        }
        for (view, tensor) in views.iter().zip(tensors) {
            // SAFETY: both sides were validated against the buffer layout and
            // live on the stream's device.
            unsafe { stream.copy_async(tensor.ptr(), view.ptr(), view.len_bytes())? };
        }
        Ok(())
    }
}

/// The single element type shared by `tensors`.
pub fn check_uniform_dtype(tensors: &[TensorRef]) -> Result<DataType> {
    let first = tensors
        .first()
        .ok_or(TierCommError::EmptyTensorList { operation: "flatten" })?
        .dtype();
    for (index, t) in tensors.iter().enumerate().skip(1) {
        if t.dtype() != first {
            return Err(TierCommError::MixedDataTypes {
                index,
                expected: first,
                actual: t.dtype(),
            });
        }
    }
    Ok(first)
}

/// Pack `tensors` into one region on `stream`'s device.
///
/// Tensors that are already adjacent in memory, in order, are returned as
/// an aliasing view and nothing is copied. Otherwise a scratch region is
/// allocated and one copy per tensor is enqueued on `stream`.
pub fn flatten(stream: &dyn DeviceStream, tensors: &[TensorRef]) -> Result<CoalescedBuffer> {
    let dtype = check_uniform_dtype(tensors)?;
    let device_id = stream.device_id();
    for (index, t) in tensors.iter().enumerate() {
        match t.location() {
            Location::Host => {
                return Err(TierCommError::HostResidentTensor {
                    operation: "flatten",
                    index,
                });
            }
            Location::Device(actual) if actual != device_id => {
                return Err(TierCommError::DeviceMismatch {
                    operation: "flatten",
                    index,
                    expected: device_id,
                    actual,
                });
            }
            Location::Device(_) => {}
        }
    }

    let offsets = prefix_offsets(tensors);
    let adjacent = tensors
        .windows(2)
        .all(|w| w[0].ptr() + w[0].len_bytes() as u64 == w[1].ptr());
    if adjacent {
        return Ok(CoalescedBuffer {
            storage: Storage::Aliased(tensors[0].ptr()),
            dtype,
            device_id,
            offsets,
        });
    }

    let elem = dtype.size_in_bytes();
    let total = offsets.last().copied().unwrap_or(0);
    let mem = stream.alloc(total * elem)?;
    for (t, &offset) in tensors.iter().zip(&offsets) {
        // SAFETY: the scratch region holds `total` elements and each tensor
        // was checked to be on this device.
        unsafe {
            stream.copy_async(mem.ptr() + (offset * elem) as u64, t.ptr(), t.len_bytes())?
        };
    }
    Ok(CoalescedBuffer {
        storage: Storage::Owned(mem),
        dtype,
        device_id,
        offsets,
    })
}

/// Views into `flat` shaped like `tensors`, at the same offsets `flatten`
/// used. Valid while `flat` is alive.
pub fn unflatten(flat: &CoalescedBuffer, tensors: &[TensorRef]) -> Result<Vec<TensorRef>> {
    let offsets = prefix_offsets(tensors);
    let total = offsets.last().copied().unwrap_or(0);
    if total != flat.numel() {
        return Err(TierCommError::CoalesceMismatch {
            buffer: flat.numel(),
            tensors: total,
        });
    }
    let elem = flat.dtype.size_in_bytes();
    Ok(tensors
        .iter()
        .zip(&offsets)
        .map(|(t, &offset)| {
            // SAFETY: the view lies within `flat`, whose size was just checked.
            unsafe {
                TensorRef::from_raw_parts(
                    flat.ptr() + (offset * elem) as u64,
                    t.shape().to_vec(),
                    flat.dtype,
                    Location::Device(flat.device_id),
                )
            }
        })
        .collect())
}

fn prefix_offsets(tensors: &[TensorRef]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(tensors.len() + 1);
    let mut acc = 0;
    offsets.push(0);
    for t in tensors {
        acc += t.numel();
        offsets.push(acc);
    }
    offsets
}
