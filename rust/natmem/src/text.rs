//! NUL-terminated UTF-8 and UTF-16 strings stored in buffers.

use std::mem::size_of;

use natmem_common::{Error, Result, result::verify_range};

use crate::buffer::NativeBuffer;

const WCHAR: usize = size_of::<u16>();

impl NativeBuffer {
    /// Reads a UTF-16 string starting at byte `offset`, up to the first NUL
    /// unit or the end of the buffer.
    pub fn read_utf16(&self, offset: usize) -> Result<String> {
        let bytes = self.tail(offset)?;
        let units = bytes
            .chunks_exact(WCHAR)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .take_while(|&unit| unit != 0);
        char::decode_utf16(units)
            .collect::<std::result::Result<String, _>>()
            .map_err(|_| Error::invalid_string("UTF-16"))
    }

    /// Reads a UTF-8 string starting at byte `offset`, up to the first NUL
    /// byte or the end of the buffer.
    pub fn read_utf8(&self, offset: usize) -> Result<String> {
        let bytes = self.tail(offset)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end])
            .map(str::to_owned)
            .map_err(|_| Error::invalid_string("UTF-8"))
    }

    /// Writes `s` as UTF-16 followed by a NUL unit at byte `offset`.
    pub fn write_utf16(&mut self, offset: usize, s: &str) -> Result<()> {
        let encoded = encode_utf16z(s);
        self.write_bytes(offset, &encoded)
    }

    /// Writes `s` followed by a NUL byte at byte `offset`.
    pub fn write_utf8(&mut self, offset: usize, s: &str) -> Result<()> {
        let len = s.len() + 1;
        let dst = self.bytes_mut(offset, len)?;
        dst[..s.len()].copy_from_slice(s.as_bytes());
        dst[s.len()] = 0;
        Ok(())
    }

    /// Replaces the whole buffer with `s` as NUL-terminated UTF-16.
    pub fn set_utf16(&mut self, s: &str) -> Result<()> {
        let encoded = encode_utf16z(s);
        self.reallocate(encoded.len())?;
        self.write_bytes(0, &encoded)
    }

    /// Replaces the whole buffer with `s` as NUL-terminated UTF-8.
    pub fn set_utf8(&mut self, s: &str) -> Result<()> {
        self.reallocate(s.len() + 1)?;
        self.write_utf8(0, s)
    }

    /// Reads a pointer-sized address stored at byte `offset`.
    pub fn read_ptr_at(&self, offset: usize) -> Result<*mut u8> {
        Ok(self.read_at::<usize>(offset)? as *mut u8)
    }

    /// Stores `ptr` as a pointer-sized address at byte `offset`.
    pub fn write_ptr_at(&mut self, offset: usize, ptr: *const u8) -> Result<()> {
        self.write_at::<usize>(offset, ptr as usize)
    }

    /// Follows the address stored at byte `offset` and reads the NUL-terminated
    /// UTF-16 string it points at. A null address reads as an empty string.
    ///
    /// # Safety
    ///
    /// The stored address must be null or point at readable memory holding a
    /// NUL-terminated sequence of UTF-16 units.
    pub unsafe fn read_utf16_indirect(&self, offset: usize) -> Result<String> {
        let ptr = self.read_ptr_at(offset)? as *const u16;
        if ptr.is_null() {
            return Ok(String::new());
        }
        let mut len = 0;
        while unsafe { ptr.add(len).read_unaligned() } != 0 {
            len += 1;
        }
        let units = (0..len).map(|i| unsafe { ptr.add(i).read_unaligned() });
        char::decode_utf16(units)
            .collect::<std::result::Result<String, _>>()
            .map_err(|_| Error::invalid_string("UTF-16"))
    }

    /// Follows the address stored at byte `offset` and reads the NUL-terminated
    /// UTF-8 string it points at. A null address reads as an empty string.
    ///
    /// # Safety
    ///
    /// The stored address must be null or point at a readable NUL-terminated
    /// byte sequence.
    pub unsafe fn read_utf8_indirect(&self, offset: usize) -> Result<String> {
        let ptr = self.read_ptr_at(offset)?;
        if ptr.is_null() {
            return Ok(String::new());
        }
        let s = unsafe { std::ffi::CStr::from_ptr(ptr as *const std::ffi::c_char) };
        s.to_str()
            .map(str::to_owned)
            .map_err(|_| Error::invalid_string("UTF-8"))
    }

    fn tail(&self, offset: usize) -> Result<&[u8]> {
        let bytes = self.as_bytes();
        verify_range(offset as u64, 0, bytes.len() as u64)?;
        Ok(&bytes[offset..])
    }
}

fn encode_utf16z(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_ne_bytes)
        .collect()
}
