//! Positioned, cursor-less I/O over a contiguous storage region.
//!
//! An [`Endpoint`] is a handle to a contiguous region of a backing
//! [`Storage`](crate::storage::Storage) — typically one page — that exposes
//! positioned reads and writes of primitive types and raw byte ranges.
//! Every multi-byte primitive is big-endian on the wire, matching the
//! on-disk contract described by the data model.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;

/// A positioned read/write handle over one contiguous storage region.
///
/// All methods take absolute byte offsets; implementations translate them
/// to region-local indices. Read methods never mutate any position visible
/// to other callers — there is no shared cursor.
pub trait Endpoint: Send {
    /// The absolute offset this endpoint's region begins at.
    fn base_offset(&self) -> u64;

    /// The length in bytes of this endpoint's region.
    fn region_len(&self) -> usize;

    /// Read `buf.len()` bytes starting at the absolute offset `pos`.
    fn read_bytes(&self, pos: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at the absolute offset `pos`.
    fn write_bytes(&self, pos: u64, data: &[u8]) -> Result<()>;

    fn read_u8(&self, pos: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(pos, &mut buf)?;
        Ok(buf[0])
    }

    fn write_u8(&self, pos: u64, value: u8) -> Result<()> {
        self.write_bytes(pos, &[value])
    }

    /// Read a `char`, encoded as a big-endian `u16`.
    fn read_char(&self, pos: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_u16(&buf))
    }

    fn write_char(&self, pos: u64, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write_bytes(pos, &buf)
    }

    fn read_i16(&self, pos: u64) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_i16(&buf))
    }

    fn write_i16(&self, pos: u64, value: i16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_i16(&mut buf, value);
        self.write_bytes(pos, &buf)
    }

    fn read_i32(&self, pos: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_i32(&buf))
    }

    fn write_i32(&self, pos: u64, value: i32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, value);
        self.write_bytes(pos, &buf)
    }

    fn read_u32(&self, pos: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    fn write_u32(&self, pos: u64, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write_bytes(pos, &buf)
    }

    fn read_i64(&self, pos: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_i64(&buf))
    }

    fn write_i64(&self, pos: u64, value: i64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_i64(&mut buf, value);
        self.write_bytes(pos, &buf)
    }

    fn read_u64(&self, pos: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_u64(&buf))
    }

    fn write_u64(&self, pos: u64, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        self.write_bytes(pos, &buf)
    }

    fn read_f32(&self, pos: u64) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_f32(&buf))
    }

    fn write_f32(&self, pos: u64, value: f32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_f32(&mut buf, value);
        self.write_bytes(pos, &buf)
    }

    fn read_f64(&self, pos: u64) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_bytes(pos, &mut buf)?;
        Ok(BigEndian::read_f64(&buf))
    }

    fn write_f64(&self, pos: u64, value: f64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_f64(&mut buf, value);
        self.write_bytes(pos, &buf)
    }
}

/// Checks that `[pos, pos+len)` lies within `[base, base+region_len)` and
/// returns the region-local start index.
pub(crate) fn bounds_check(
    base: u64,
    region_len: usize,
    pos: u64,
    len: usize,
) -> Result<usize> {
    use crate::error::PagewalError;

    if pos < base {
        return Err(PagewalError::OutOfBounds {
            offset: pos,
            len: len as u64,
            size: region_len as u64,
        });
    }
    let local = (pos - base) as usize;
    let end = local
        .checked_add(len)
        .ok_or(PagewalError::OutOfBounds {
            offset: pos,
            len: len as u64,
            size: region_len as u64,
        })?;
    if end > region_len {
        return Err(PagewalError::OutOfBounds {
            offset: pos,
            len: len as u64,
            size: region_len as u64,
        });
    }
    Ok(local)
}
