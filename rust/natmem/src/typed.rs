//! Typed reads and writes over a buffer's bytes.
//!
//! Values travel in native byte order and need no particular alignment.
//! Nothing in this module allocates, except [`NativeBuffer::copy_from_slice`]
//! which sizes the buffer to fit.

use std::mem::size_of;

use bytemuck::{NoUninit, Pod, Zeroable};
use natmem_common::{Error, Result};

use crate::buffer::NativeBuffer;
use crate::values::{Decimal128, Guid, Timestamp};

#[inline]
fn element_offset<T>(index: usize) -> Result<usize> {
    index
        .checked_mul(size_of::<T>())
        .ok_or_else(|| Error::out_of_range(index as u64, size_of::<T>() as u64, u64::MAX))
}

impl NativeBuffer {
    /// Reads the `index`-th element of type `T`.
    pub fn read<T: Pod>(&self, index: usize) -> Result<T> {
        self.read_at(element_offset::<T>(index)?)
    }

    /// Writes `value` as the `index`-th element of type `T`.
    pub fn write<T: NoUninit>(&mut self, index: usize, value: T) -> Result<()> {
        self.write_at(element_offset::<T>(index)?, value)
    }

    /// Reads a `T` at byte `offset`.
    pub fn read_at<T: Pod>(&self, offset: usize) -> Result<T> {
        let bytes = self.read_bytes(offset, size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Writes `value` at byte `offset`.
    pub fn write_at<T: NoUninit>(&mut self, offset: usize, value: T) -> Result<()> {
        self.write_bytes(offset, bytemuck::bytes_of(&value))
    }

    /// Copies the whole buffer into a vector of `T`. Trailing bytes that do not
    /// form a whole element are ignored. Zero-sized `T` yields an empty vector.
    pub fn to_vec<T: Pod>(&self) -> Vec<T> {
        if size_of::<T>() == 0 {
            return Vec::new();
        }
        self.as_bytes()
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Copies `count` elements of `T` starting at byte `offset`.
    pub fn to_vec_range<T: Pod>(&self, offset: usize, count: usize) -> Result<Vec<T>> {
        let len = count
            .checked_mul(size_of::<T>())
            .ok_or_else(|| Error::out_of_range(offset as u64, u64::MAX, self.size()))?;
        let bytes = self.read_bytes(offset, len)?;
        if size_of::<T>() == 0 {
            return Ok(vec![T::zeroed(); count]);
        }
        Ok(bytes
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Replaces the buffer contents with `values`, resizing to fit exactly.
    ///
    /// An empty slice frees the buffer.
    pub fn copy_from_slice<T: NoUninit>(&mut self, values: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.reallocate(bytes.len())?;
        if !bytes.is_empty() {
            self.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Writes `values` contiguously starting at byte `offset`.
    pub fn write_slice_at<T: NoUninit>(&mut self, offset: usize, values: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(values))
    }
}

macro_rules! typed_accessors {
    ($($ty:ty => $get:ident, $set:ident, $get_at:ident, $set_at:ident;)*) => {
        impl NativeBuffer {
            $(
                #[doc = concat!("Reads the `index`-th `", stringify!($ty), "`.")]
                #[inline]
                pub fn $get(&self, index: usize) -> Result<$ty> {
                    self.read::<$ty>(index)
                }

                #[doc = concat!("Writes the `index`-th `", stringify!($ty), "`.")]
                #[inline]
                pub fn $set(&mut self, index: usize, value: $ty) -> Result<()> {
                    self.write::<$ty>(index, value)
                }

                #[doc = concat!("Reads a `", stringify!($ty), "` at byte `offset`.")]
                #[inline]
                pub fn $get_at(&self, offset: usize) -> Result<$ty> {
                    self.read_at::<$ty>(offset)
                }

                #[doc = concat!("Writes a `", stringify!($ty), "` at byte `offset`.")]
                #[inline]
                pub fn $set_at(&mut self, offset: usize, value: $ty) -> Result<()> {
                    self.write_at::<$ty>(offset, value)
                }
            )*
        }
    };
}

typed_accessors! {
    u8 => get_u8, set_u8, get_u8_at, set_u8_at;
    i8 => get_i8, set_i8, get_i8_at, set_i8_at;
    u16 => get_u16, set_u16, get_u16_at, set_u16_at;
    i16 => get_i16, set_i16, get_i16_at, set_i16_at;
    u32 => get_u32, set_u32, get_u32_at, set_u32_at;
    i32 => get_i32, set_i32, get_i32_at, set_i32_at;
    u64 => get_u64, set_u64, get_u64_at, set_u64_at;
    i64 => get_i64, set_i64, get_i64_at, set_i64_at;
    f32 => get_f32, set_f32, get_f32_at, set_f32_at;
    f64 => get_f64, set_f64, get_f64_at, set_f64_at;
    Guid => get_guid, set_guid, get_guid_at, set_guid_at;
    Timestamp => get_timestamp, set_timestamp, get_timestamp_at, set_timestamp_at;
    Decimal128 => get_decimal, set_decimal, get_decimal_at, set_decimal_at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BufferOptions;

    #[test]
    fn test_element_and_offset_addressing() {
        let mut buffer = NativeBuffer::with_size(BufferOptions::heap(), 16).unwrap();
        buffer.set_i32(1, -7).unwrap();
        assert_eq!(buffer.get_i32_at(4).unwrap(), -7);
        buffer.set_u16_at(1, 0xBEEF).unwrap();
        assert_eq!(buffer.get_u16_at(1).unwrap(), 0xBEEF);
        buffer.set_f64(1, 2.5).unwrap();
        assert_eq!(buffer.get_f64_at(8).unwrap(), 2.5);
    }

    #[test]
    fn test_bounds() {
        let mut buffer = NativeBuffer::with_size(BufferOptions::heap(), 8).unwrap();
        assert!(buffer.get_u64(0).is_ok());
        assert!(buffer.get_u64(1).unwrap_err().is_out_of_range());
        assert!(buffer.get_u32_at(5).unwrap_err().is_out_of_range());
        assert!(buffer.set_u8(8, 1).is_err());
        assert!(buffer.get_u64(usize::MAX).is_err());
        assert_eq!(buffer.as_bytes(), &[0; 8]);

        let empty = NativeBuffer::new(BufferOptions::heap()).unwrap();
        assert!(empty.get_u8(0).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_value_types() {
        let mut buffer = NativeBuffer::with_size(BufferOptions::aligned(16), 64).unwrap();
        let guid = Guid::new_v4();
        let ts = Timestamp::from_unix_micros(1_234_567);
        let dec = Decimal128::new(-31415, 4).unwrap();
        buffer.set_guid(0, guid).unwrap();
        buffer.set_timestamp_at(16, ts).unwrap();
        buffer.set_decimal(2, dec).unwrap();
        assert_eq!(buffer.get_guid(0).unwrap(), guid);
        assert_eq!(buffer.get_timestamp(2).unwrap(), ts);
        assert_eq!(buffer.get_decimal_at(32).unwrap(), dec);
        assert!(buffer.get_decimal(4).is_err());
    }

    #[test]
    fn test_bulk_conversion() {
        let mut buffer = NativeBuffer::new(BufferOptions::com_task()).unwrap();
        buffer.copy_from_slice(&[1u32, 2, 3, 4]).unwrap();
        assert_eq!(buffer.size(), 16);
        assert_eq!(buffer.to_vec::<u32>(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.to_vec_range::<u32>(4, 2).unwrap(), vec![2, 3]);
        assert!(buffer.to_vec_range::<u32>(4, 4).is_err());
        assert_eq!(buffer.to_vec::<u64>().len(), 2);

        buffer.write_slice_at(2, &[0xFFFFu16]).unwrap();
        assert_eq!(buffer.get_u32(0).unwrap(), u32::from_ne_bytes({
            let mut b = 1u32.to_ne_bytes();
            b[2] = 0xFF;
            b[3] = 0xFF;
            b
        }));
        assert!(buffer.write_slice_at(12, &[1u32, 2]).is_err());

        buffer.copy_from_slice::<u8>(&[]).unwrap();
        assert!(!buffer.is_allocated());
    }

    #[test]
    fn test_zero_sized_elements() {
        let buffer = NativeBuffer::with_size(BufferOptions::heap(), 8).unwrap();
        assert!(buffer.to_vec::<()>().is_empty());
        assert_eq!(buffer.to_vec_range::<()>(8, 3).unwrap().len(), 3);
        assert!(buffer.to_vec_range::<()>(9, 1).is_err());
    }
}
