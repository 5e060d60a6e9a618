//! Fixed-width value types that can be marshaled in and out of native buffers
//! alongside the primitive integers and floats.
//!
//! Each type is `bytemuck::Pod` and uses the binary layout native code on
//! Windows expects (`GUID`, `DECIMAL`, 100ns `FILETIME`-style ticks).

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};

/// 16-byte GUID, little-endian layout compatible with the Win32 `GUID` struct.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Guid([u8; 16]);

impl Guid {
    /// Returns the NIL (all zero) GUID.
    pub const fn nil() -> Guid {
        Guid([0; 16])
    }

    /// Generates a new random (v4) GUID.
    pub fn new_v4() -> Guid {
        uuid::Uuid::new_v4().into()
    }

    /// Wraps 16 bytes already in GUID (mixed-endian) layout.
    pub const fn from_bytes(bytes: [u8; 16]) -> Guid {
        Guid(bytes)
    }

    /// Returns the raw bytes in GUID layout.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the canonical hyphenated form, with or without braces.
    pub fn parse_str(input: &str) -> Result<Guid, std::io::Error> {
        let trimmed = input.trim_start_matches('{').trim_end_matches('}');
        uuid::Uuid::parse_str(trimmed)
            .map(Guid::from)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl From<uuid::Uuid> for Guid {
    fn from(u: uuid::Uuid) -> Self {
        Guid(u.to_bytes_le())
    }
}

impl From<Guid> for uuid::Uuid {
    fn from(g: Guid) -> Self {
        uuid::Uuid::from_bytes_le(g.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&uuid::Uuid::from(*self).hyphenated(), f)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

pub const TICKS_PER_MICROSECOND: i64 = 10;
pub const TICKS_PER_SECOND: i64 = 10_000_000;
/// Ticks between 0001-01-01T00:00:00 and the Unix epoch.
pub const TICKS_TILL_UNIX_TIME: i64 = 621_355_968_000_000_000;

/// A point in time as a count of 100-nanosecond ticks since
/// 0001-01-01T00:00:00 UTC.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Timestamp {
    ticks: i64,
}

impl Timestamp {
    pub const fn from_ticks(ticks: i64) -> Timestamp {
        Timestamp { ticks }
    }

    pub const fn ticks(&self) -> i64 {
        self.ticks
    }

    /// Saturates at the ends of the tick range.
    pub const fn from_unix_micros(micros: i64) -> Timestamp {
        let delta = micros.saturating_mul(TICKS_PER_MICROSECOND);
        Timestamp {
            ticks: TICKS_TILL_UNIX_TIME.saturating_add(delta),
        }
    }

    pub const fn to_unix_micros(&self) -> i64 {
        self.ticks.saturating_sub(TICKS_TILL_UNIX_TIME) / TICKS_PER_MICROSECOND
    }

    /// Saturates at the ends of the tick range.
    pub fn from_system_time(time: SystemTime) -> Timestamp {
        let ticks = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => TICKS_TILL_UNIX_TIME.saturating_add(duration_ticks(after)),
            Err(before) => TICKS_TILL_UNIX_TIME.saturating_sub(duration_ticks(before.duration())),
        };
        Timestamp { ticks }
    }

    /// Converts to `SystemTime`. Returns `None` when the instant is not
    /// representable on this platform.
    pub fn to_system_time(&self) -> Option<SystemTime> {
        let delta = i128::from(self.ticks) - i128::from(TICKS_TILL_UNIX_TIME);
        let abs = delta.unsigned_abs();
        let per_second = TICKS_PER_SECOND as u128;
        let secs = u64::try_from(abs / per_second).ok()?;
        let nanos = ((abs % per_second) * 100) as u32;
        let magnitude = Duration::new(secs, nanos);
        if delta >= 0 {
            UNIX_EPOCH.checked_add(magnitude)
        } else {
            UNIX_EPOCH.checked_sub(magnitude)
        }
    }

    pub fn now() -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }
}

fn duration_ticks(d: Duration) -> i64 {
    i64::try_from(d.as_secs())
        .unwrap_or(i64::MAX)
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add((d.subsec_nanos() / 100) as i64)
}

const DECIMAL_SCALE_SHIFT: u32 = 16;
const DECIMAL_SIGN_MASK: u32 = 0x8000_0000;
const DECIMAL_MAX_SCALE: u8 = 28;
const DECIMAL_MAX_MANTISSA: u128 = (1u128 << 96) - 1;

/// 128-bit decimal in the Win32 `DECIMAL` layout: a 96-bit unsigned mantissa
/// split over `hi`/`mid`/`lo`, with scale and sign packed into `flags`.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Decimal128 {
    flags: u32,
    hi: u32,
    lo: u32,
    mid: u32,
}

impl Decimal128 {
    pub const ZERO: Decimal128 = Decimal128 {
        flags: 0,
        hi: 0,
        lo: 0,
        mid: 0,
    };

    /// Builds `mantissa × 10^-scale`. Returns `None` if the scale exceeds 28
    /// or the mantissa does not fit in 96 bits.
    pub fn new(mantissa: i128, scale: u8) -> Option<Decimal128> {
        let magnitude = mantissa.unsigned_abs();
        if scale > DECIMAL_MAX_SCALE || magnitude > DECIMAL_MAX_MANTISSA {
            return None;
        }
        let mut flags = (scale as u32) << DECIMAL_SCALE_SHIFT;
        if mantissa < 0 {
            flags |= DECIMAL_SIGN_MASK;
        }
        Some(Decimal128 {
            flags,
            hi: (magnitude >> 64) as u32,
            mid: (magnitude >> 32) as u32,
            lo: magnitude as u32,
        })
    }

    pub fn from_i64(value: i64) -> Decimal128 {
        Decimal128::new(value as i128, 0).unwrap_or(Decimal128::ZERO)
    }

    /// Signed mantissa.
    pub fn mantissa(&self) -> i128 {
        let magnitude =
            ((self.hi as i128) << 64) | ((self.mid as i128) << 32) | (self.lo as i128);
        if self.is_negative() {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn scale(&self) -> u8 {
        ((self.flags >> DECIMAL_SCALE_SHIFT) & 0xFF) as u8
    }

    pub fn is_negative(&self) -> bool {
        self.flags & DECIMAL_SIGN_MASK != 0
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa() as f64 / 10f64.powi(self.scale() as i32)
    }
}

impl fmt::Display for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.mantissa().unsigned_abs().to_string();
        let scale = self.scale() as usize;
        let sign = if self.is_negative() { "-" } else { "" };
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int, frac) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int}.{frac}")
    }
}

impl fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal128({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_layout() {
        let g = Guid::parse_str("{00112233-4455-6677-8899-aabbccddeeff}").unwrap();
        assert_eq!(
            g.as_bytes(),
            &[
                0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
                0xdd, 0xee, 0xff
            ]
        );
        assert_eq!(g.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
        assert!(Guid::nil().is_nil());
        assert!(!Guid::new_v4().is_nil());
    }

    #[test]
    fn test_timestamp_unix() {
        let t = Timestamp::from_unix_micros(0);
        assert_eq!(t.ticks(), TICKS_TILL_UNIX_TIME);
        assert_eq!(t.to_system_time(), Some(UNIX_EPOCH));

        let t = Timestamp::from_unix_micros(1_700_000_000_123_456);
        assert_eq!(t.to_unix_micros(), 1_700_000_000_123_456);
        let back = Timestamp::from_system_time(t.to_system_time().unwrap());
        assert_eq!(back, t);
    }

    #[test]
    fn test_timestamp_extremes() {
        for ticks in [i64::MIN, -1, 0, i64::MAX] {
            let t = Timestamp::from_ticks(ticks);
            // Either representable or None, never a panic.
            if let Some(time) = t.to_system_time() {
                assert_eq!(Timestamp::from_system_time(time), t);
            }
            let _ = t.to_unix_micros();
        }
        assert_eq!(Timestamp::from_unix_micros(i64::MAX).ticks(), i64::MAX);
        assert_eq!(Timestamp::from_unix_micros(i64::MIN).ticks(), i64::MIN);
        assert_eq!(
            Timestamp::from_ticks(i64::MIN).to_unix_micros(),
            i64::MIN / TICKS_PER_MICROSECOND
        );

        let beyond = Duration::from_secs(u64::from(u32::MAX) * 1000);
        if let Some(far) = UNIX_EPOCH.checked_add(beyond) {
            assert_eq!(Timestamp::from_system_time(far).ticks(), i64::MAX);
        }
    }

    #[test]
    fn test_decimal_parts() {
        let d = Decimal128::new(-123456, 3).unwrap();
        assert_eq!(d.mantissa(), -123456);
        assert_eq!(d.scale(), 3);
        assert!(d.is_negative());
        assert_eq!(d.to_string(), "-123.456");
        assert_eq!(Decimal128::new(5, 2).unwrap().to_string(), "0.05");
        assert_eq!(Decimal128::from_i64(42).to_string(), "42");

        assert!(Decimal128::new(1, 29).is_none());
        assert!(Decimal128::new(1i128 << 96, 0).is_none());
        let max = Decimal128::new(DECIMAL_MAX_MANTISSA as i128, 0).unwrap();
        assert_eq!(max.mantissa(), DECIMAL_MAX_MANTISSA as i128);
    }

    #[test]
    fn test_decimal_binary_layout() {
        let d = Decimal128::new(1, 2).unwrap();
        let bytes = bytemuck::bytes_of(&d);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &(2u32 << 16).to_ne_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_ne_bytes());
    }
}
