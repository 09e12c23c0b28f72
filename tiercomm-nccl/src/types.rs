use cudarc::nccl::sys;
use tiercomm::DataType;

/// NCCL type code for a tiercomm element type.
pub fn to_nccl_dtype(dt: DataType) -> sys::ncclDataType_t {
    match dt {
        DataType::F32 => sys::ncclDataType_t::ncclFloat32,
        DataType::F64 => sys::ncclDataType_t::ncclFloat64,
        DataType::F16 => sys::ncclDataType_t::ncclFloat16,
        DataType::BF16 => sys::ncclDataType_t::ncclBfloat16,
        DataType::I8 => sys::ncclDataType_t::ncclInt8,
        DataType::I32 => sys::ncclDataType_t::ncclInt32,
        DataType::I64 => sys::ncclDataType_t::ncclInt64,
        DataType::U8 => sys::ncclDataType_t::ncclUint8,
        DataType::U32 => sys::ncclDataType_t::ncclUint32,
        DataType::U64 => sys::ncclDataType_t::ncclUint64,
    }
}
