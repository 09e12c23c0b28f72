//! Element-wise primitives on byte slices interpreted as `dtype` elements.
//!
//! Used by the in-process transport for sum reduction and by backends that
//! apply the post-reduction average on the host.

use half::{bf16, f16};

use crate::error::{Result, TierCommError};
use crate::types::DataType;

// ── Element traits ─────────────────────────────────────────────────────

/// Read/write a value from/to a little-endian byte slice (alignment-safe).
pub(crate) trait LeBytes: Sized + Copy {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes.try_into().expect("slice length matches type size"),
                    )
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64, f16, bf16);

/// Element-wise addition. Integers wrap, matching device transports.
trait Summable: LeBytes {
    fn add(a: Self, b: Self) -> Self;
}

macro_rules! impl_summable {
    (int: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn add(a: Self, b: Self) -> Self {
                    a.wrapping_add(b)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn add(a: Self, b: Self) -> Self {
                    a + b
                }
            }
        )*
    };
}

impl_summable!(int: i8, i32, i64, u8, u32, u64);
// Half-precision sums are rounded once, after an f32 add.
impl_summable!(float: f32, f64, f16, bf16);


// ── Byte-slice dispatch ────────────────────────────────────────────────

fn check_len(buf: &[u8], dtype: DataType) -> Result<usize> {
    let size = dtype.size_in_bytes();
    if buf.len() % size != 0 {
        return Err(TierCommError::device(format!(
            "{} bytes is not a whole number of {dtype} elements",
            buf.len()
        )));
    }
    Ok(buf.len() / size)
}

/// `dst[i] += src[i]` for every element.
pub fn sum_into(dst: &mut [u8], src: &[u8], dtype: DataType) -> Result<()> {
    if dst.len() != src.len() {
        return Err(TierCommError::transport(format!(
            "buffer size mismatch: {} vs {} bytes",
            dst.len(),
            src.len()
        )));
    }
    let count = check_len(dst, dtype)?;
    match dtype {
        DataType::F32 => sum_typed::<f32>(dst, src, count),
        DataType::F64 => sum_typed::<f64>(dst, src, count),
        DataType::F16 => sum_typed::<f16>(dst, src, count),
        DataType::BF16 => sum_typed::<bf16>(dst, src, count),
        DataType::I8 => sum_typed::<i8>(dst, src, count),
        DataType::I32 => sum_typed::<i32>(dst, src, count),
        DataType::I64 => sum_typed::<i64>(dst, src, count),
        DataType::U8 => sum_typed::<u8>(dst, src, count),
        DataType::U32 => sum_typed::<u32>(dst, src, count),
        DataType::U64 => sum_typed::<u64>(dst, src, count),
    }
    Ok(())
}

fn sum_typed<T: Summable>(dst: &mut [u8], src: &[u8], count: usize) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&dst[off..off + t_size]);
        let b = T::read_le(&src[off..off + t_size]);
        T::add(a, b).write_le(&mut dst[off..off + t_size]);
    }
}

/// `buf[i] /= divisor` for every element of a floating-point buffer.
pub fn div_scalar(buf: &mut [u8], dtype: DataType, divisor: u32) -> Result<()> {
    let count = check_len(buf, dtype)?;
    let d = divisor as f64;
    match dtype {
        DataType::F32 => map_typed::<f32>(buf, count, |v| (v as f64 / d) as f32),
        DataType::F64 => map_typed::<f64>(buf, count, |v| v / d),
        DataType::F16 => map_typed::<f16>(buf, count, |v| f16::from_f64(v.to_f64() / d)),
        DataType::BF16 => map_typed::<bf16>(buf, count, |v| bf16::from_f64(v.to_f64() / d)),
        other => return Err(TierCommError::UnsupportedAverage(other)),
    }
    Ok(())
}

fn map_typed<T: LeBytes>(buf: &mut [u8], count: usize, f: impl Fn(T) -> T) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let v = T::read_le(&buf[off..off + t_size]);
        f(v).write_le(&mut buf[off..off + t_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_bytes_f32(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn from_bytes_f32(b: &[u8]) -> Vec<f32> {
        b.chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_sum_f32() {
        let mut dst = to_bytes_f32(&[1.0, 2.0, 3.0]);
        let src = to_bytes_f32(&[0.5, 0.5, -3.0]);
        sum_into(&mut dst, &src, DataType::F32).unwrap();
        assert_eq!(from_bytes_f32(&dst), vec![1.5, 2.5, 0.0]);
    }

    #[test]
    fn test_sum_u8_wraps() {
        let mut dst = vec![250u8, 1];
        sum_into(&mut dst, &[10, 1], DataType::U8).unwrap();
        assert_eq!(dst, vec![4, 2]);
    }

    #[test]
    fn test_sum_bf16() {
        let mut dst = bf16::from_f32(1.0).to_le_bytes().to_vec();
        let src = bf16::from_f32(2.0).to_le_bytes();
        sum_into(&mut dst, &src, DataType::BF16).unwrap();
        assert_eq!(bf16::from_le_bytes([dst[0], dst[1]]).to_f32(), 3.0);
    }

    #[test]
    fn test_sum_f16_subnormal() {
        let tiny = f16::from_f32(2f32.powi(-16));
        let mut dst = tiny.to_le_bytes().to_vec();
        sum_into(&mut dst, &tiny.to_le_bytes(), DataType::F16).unwrap();
        assert_eq!(f16::from_le_bytes([dst[0], dst[1]]).to_f32(), 2f32.powi(-15));
    }

    #[test]
    fn test_sum_length_mismatch() {
        let mut dst = vec![0u8; 8];
        assert!(sum_into(&mut dst, &[0u8; 4], DataType::F32).is_err());
        let mut odd = vec![0u8; 6];
        assert!(sum_into(&mut odd, &[0u8; 6], DataType::F32).is_err());
    }

    #[test]
    fn test_div_scalar_f32() {
        let mut buf = to_bytes_f32(&[6.0, 3.0]);
        div_scalar(&mut buf, DataType::F32, 4).unwrap();
        assert_eq!(from_bytes_f32(&buf), vec![1.5, 0.75]);
    }

    #[test]
    fn test_div_scalar_f16() {
        let mut buf = f16::from_f32(6.0).to_le_bytes().to_vec();
        div_scalar(&mut buf, DataType::F16, 4).unwrap();
        assert_eq!(f16::from_le_bytes([buf[0], buf[1]]).to_f32(), 1.5);
    }

    #[test]
    fn test_div_scalar_f16_into_subnormal_range() {
        let mut buf = f16::from_f32(2f32.powi(-13)).to_le_bytes().to_vec();
        div_scalar(&mut buf, DataType::F16, 4).unwrap();
        let out = f16::from_le_bytes([buf[0], buf[1]]);
        assert_eq!(out.to_f32(), 2f32.powi(-15));
    }

    #[test]
    fn test_div_scalar_rejects_integers() {
        let mut buf = vec![0u8; 8];
        let err = div_scalar(&mut buf, DataType::I32, 2).unwrap_err();
        assert!(matches!(err, TierCommError::UnsupportedAverage(DataType::I32)));
    }
}
