//! Positional editing of buffer contents.
//!
//! Every operation validates its range up front and either completes or
//! leaves the buffer as it was. Sizes and indices are in bytes; the `_chars`
//! variants count UTF-16 units.

use std::mem::size_of;

use natmem_common::{Error, Result, result::verify_range};

use crate::buffer::NativeBuffer;

const WCHAR: usize = size_of::<u16>();

fn chars_to_bytes(n: usize) -> Result<usize> {
    n.checked_mul(WCHAR)
        .ok_or_else(|| Error::out_of_range(n as u64, 0, u64::MAX / WCHAR as u64))
}

fn hole(amount: usize) -> Result<usize> {
    amount
        .checked_mul(2)
        .ok_or_else(|| Error::out_of_range(0, amount as u64, u64::MAX / 2))
}

impl NativeBuffer {
    /// Reverses the byte order of the whole buffer in place.
    pub fn reverse(&mut self) {
        self.as_bytes_mut().reverse();
    }

    /// Moves the `length`-byte block at `index` by `offset` bytes. The bytes
    /// it passes over shift the other way to fill the vacated space.
    pub fn slide(&mut self, index: usize, length: usize, offset: i64) -> Result<()> {
        let size = self.len() as u64;
        verify_range(index as u64, length as u64, size)?;
        let target = i64::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(offset))
            .and_then(|t| u64::try_from(t).ok())
            .ok_or_else(|| Error::out_of_range(index as u64, length as u64, size))?;
        verify_range(target, length as u64, size)?;
        if length == 0 || offset == 0 {
            return Ok(());
        }

        let target = target as usize;
        let bytes = self.as_bytes_mut();
        let block = bytes[index..index + length].to_vec();
        if target > index {
            let displaced = bytes[index + length..target + length].to_vec();
            bytes[index..target].copy_from_slice(&displaced);
        } else {
            let displaced = bytes[target..index].to_vec();
            bytes[target + length..index + length].copy_from_slice(&displaced);
        }
        bytes[target..target + length].copy_from_slice(&block);
        Ok(())
    }

    /// Removes `amount` bytes at `index`, shifting the tail left and shrinking
    /// the buffer.
    pub fn pull_in(&mut self, index: usize, amount: usize) -> Result<()> {
        let size = self.len();
        verify_range(index as u64, amount as u64, size as u64)?;
        if amount == 0 {
            return Ok(());
        }
        let tail = size - index - amount;
        if tail > 0 {
            self.slide(index + amount, tail, -(amount as i64))?;
        }
        if let Err(e) = self.reallocate(size - amount) {
            if tail > 0 {
                self.slide(index, tail, amount as i64)?;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Opens `amount` bytes at `index`, growing the buffer and shifting the
    /// tail right.
    ///
    /// The gap is filled from `fill`, truncated or zero-padded to `amount`;
    /// without `fill` it is zeroed.
    pub fn push_out(&mut self, index: usize, amount: usize, fill: Option<&[u8]>) -> Result<()> {
        let size = self.len();
        verify_range(index as u64, 0, size as u64)?;
        if amount == 0 {
            return Ok(());
        }
        let new_size = size
            .checked_add(amount)
            .ok_or_else(|| Error::out_of_range(index as u64, amount as u64, size as u64))?;
        self.reallocate(new_size)?;

        let tail = size - index;
        if tail > 0 {
            self.slide(index, tail, amount as i64)?;
        }
        let gap = &mut self.as_bytes_mut()[index..index + amount];
        match fill {
            Some(fill) => {
                let n = fill.len().min(amount);
                gap[..n].copy_from_slice(&fill[..n]);
                gap[n..].fill(0);
            }
            None => gap.fill(0),
        }
        Ok(())
    }

    /// Inserts `data` at `index`.
    pub fn insert(&mut self, index: usize, data: &[u8]) -> Result<()> {
        self.push_out(index, data.len(), Some(data))
    }

    /// Deletes `count` bytes at `index`.
    pub fn delete(&mut self, index: usize, count: usize) -> Result<()> {
        self.pull_in(index, count)
    }

    /// Opens a zeroed hole of `2 × amount` bytes at `index`. Bytes before
    /// `index` keep their offsets; the rest move right.
    pub fn part(&mut self, index: usize, amount: usize) -> Result<()> {
        self.push_out(index, hole(amount)?, None)
    }

    /// Removes `[index, index + 2 × amount)`, the inverse of [`part`].
    ///
    /// [`part`]: NativeBuffer::part
    pub fn consume(&mut self, index: usize, amount: usize) -> Result<()> {
        self.pull_in(index, hole(amount)?)
    }

    pub fn slide_chars(
        &mut self,
        char_index: usize,
        char_len: usize,
        char_offset: i64,
    ) -> Result<()> {
        let offset = char_offset
            .checked_mul(WCHAR as i64)
            .ok_or_else(|| Error::out_of_range(char_index as u64, char_len as u64, self.size()))?;
        self.slide(chars_to_bytes(char_index)?, chars_to_bytes(char_len)?, offset)
    }

    /// Inserts UTF-16 units at `char_index`.
    pub fn insert_chars(&mut self, char_index: usize, chars: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = chars.iter().flat_map(|c| c.to_ne_bytes()).collect();
        self.push_out(chars_to_bytes(char_index)?, bytes.len(), Some(&bytes))
    }

    /// Inserts `s` as UTF-16, without a terminator, at `char_index`.
    pub fn insert_str(&mut self, char_index: usize, s: &str) -> Result<()> {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.insert_chars(char_index, &units)
    }

    pub fn delete_chars(&mut self, char_index: usize, count: usize) -> Result<()> {
        self.pull_in(chars_to_bytes(char_index)?, chars_to_bytes(count)?)
    }

    pub fn part_chars(&mut self, char_index: usize, amount: usize) -> Result<()> {
        self.part(chars_to_bytes(char_index)?, chars_to_bytes(amount)?)
    }

    pub fn consume_chars(&mut self, char_index: usize, amount: usize) -> Result<()> {
        self.consume(chars_to_bytes(char_index)?, chars_to_bytes(amount)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BufferOptions;

    fn buffer(bytes: &[u8]) -> NativeBuffer {
        NativeBuffer::from_bytes(BufferOptions::heap(), bytes).unwrap()
    }

    #[test]
    fn test_slide_both_directions() {
        let mut b = buffer(b"abcdefgh");
        b.slide(1, 2, 3).unwrap();
        assert_eq!(b.as_bytes(), b"adefbcgh");
        b.slide(4, 2, -3).unwrap();
        assert_eq!(b.as_bytes(), b"abcdefgh");

        b.slide(0, 8, 0).unwrap();
        b.slide(3, 0, 5).unwrap();
        assert_eq!(b.as_bytes(), b"abcdefgh");
    }

    #[test]
    fn test_slide_bounds() {
        let mut b = buffer(b"abcdefgh");
        assert!(b.slide(6, 3, 0).unwrap_err().is_out_of_range());
        assert!(b.slide(1, 2, -2).unwrap_err().is_out_of_range());
        assert!(b.slide(5, 2, 2).unwrap_err().is_out_of_range());
        assert!(b.slide(0, 1, i64::MAX).is_err());
        assert_eq!(b.as_bytes(), b"abcdefgh");
    }

    #[test]
    fn test_insert_scenario() {
        let mut b = NativeBuffer::with_size(BufferOptions::heap(), 8).unwrap();
        b.insert(2, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        assert_eq!(b.size(), 12);
        assert_eq!(
            b.as_bytes(),
            &[0, 0, 0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 0, 0, 0]
        );
        b.delete(2, 4).unwrap();
        assert_eq!(b.as_bytes(), &[0; 8]);
    }

    #[test]
    fn test_push_out_fill() {
        let mut b = buffer(b"xy");
        b.push_out(1, 4, Some(b"123456")).unwrap();
        assert_eq!(b.as_bytes(), b"x1234y");
        b.push_out(6, 3, Some(b"z")).unwrap();
        assert_eq!(b.as_bytes(), b"x1234yz\0\0");
        assert!(b.push_out(10, 1, None).unwrap_err().is_out_of_range());
        assert_eq!(b.size(), 9);
    }

    #[test]
    fn test_push_out_unallocated() {
        let mut b = NativeBuffer::new(BufferOptions::heap()).unwrap();
        assert!(b.push_out(1, 4, None).is_err());
        b.push_out(0, 3, Some(b"abc")).unwrap();
        assert_eq!(b.as_bytes(), b"abc");
    }

    #[test]
    fn test_pull_in_everything() {
        let mut b = buffer(b"abcd");
        assert!(b.pull_in(2, 3).unwrap_err().is_out_of_range());
        b.pull_in(0, 4).unwrap();
        assert!(!b.is_allocated());
    }

    #[test]
    fn test_part_and_consume() {
        let mut b = buffer(b"abcdef");
        b.part(2, 2).unwrap();
        assert_eq!(b.as_bytes(), b"ab\0\0\0\0cdef");
        b.consume(2, 2).unwrap();
        assert_eq!(b.as_bytes(), b"abcdef");
        assert!(b.consume(4, 2).is_err());
    }

    #[test]
    fn test_char_editing() {
        let mut b = NativeBuffer::new(BufferOptions::heap()).unwrap();
        b.set_utf16("held").unwrap();
        b.insert_str(2, "llo wor").unwrap();
        assert_eq!(b.read_utf16(0).unwrap(), "hello world");
        b.delete_chars(5, 6).unwrap();
        assert_eq!(b.read_utf16(0).unwrap(), "hello");

        b.part_chars(1, 1).unwrap();
        assert_eq!(b.read_utf16(0).unwrap(), "h");
        b.consume_chars(1, 1).unwrap();
        assert_eq!(b.read_utf16(0).unwrap(), "hello");

        b.slide_chars(0, 1, 4).unwrap();
        assert_eq!(b.read_utf16(0).unwrap(), "elloh");
        b.insert_chars(5, &[u16::from(b'!')]).unwrap();
        assert_eq!(b.read_utf16(0).unwrap(), "elloh!");
    }

    #[test]
    fn test_reverse() {
        let mut b = buffer(b"abcde");
        b.reverse();
        assert_eq!(b.as_bytes(), b"edcba");
        let mut empty = NativeBuffer::new(BufferOptions::heap()).unwrap();
        empty.reverse();
        assert!(empty.is_empty());
    }
}
