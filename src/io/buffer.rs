//! [`Buffer`] - a half-open, bounds-checked byte read window.

use bytemuck::Pod;

use crate::error::{Error, Result};

/// A half-open byte window `[lo, hi)` into a shared backing slice.
///
/// Sub-windows are cheap: [`Buffer::sub`] returns a new `Buffer` borrowing
/// the same backing slice with a narrower `[lo, hi)`, and every read after
/// that point is checked against the narrower window.
#[derive(Clone, Copy)]
pub struct Buffer<'a> {
    data: &'a [u8],
    lo: usize,
    hi: usize,
}

impl<'a> Buffer<'a> {
    /// Wrap an entire byte slice as a buffer spanning `[0, data.len())`.
    pub fn new(data: &'a [u8]) -> Self {
        let hi = data.len();
        Buffer { data, lo: 0, hi }
    }

    /// Number of bytes remaining in the window.
    pub fn len(&self) -> usize {
        self.hi - self.lo
    }

    pub fn is_empty(&self) -> bool {
        self.lo == self.hi
    }

    /// Lower bound of the window (absolute offset into the backing slice).
    pub fn lo(&self) -> usize {
        self.lo
    }

    /// Upper bound of the window (absolute offset into the backing slice).
    pub fn hi(&self) -> usize {
        self.hi
    }

    /// Return a sub-window `[self.lo + offset, self.lo + offset + len)`.
    ///
    /// Fails with [`Error::OutOfBounds`] if the requested range exceeds the
    /// current window.
    pub fn sub(&self, offset: usize, len: usize) -> Result<Buffer<'a>> {
        let lo = self.lo.checked_add(offset).ok_or(Error::OutOfBounds)?;
        let hi = lo.checked_add(len).ok_or(Error::OutOfBounds)?;
        if hi > self.hi {
            return Err(Error::OutOfBounds);
        }
        Ok(Buffer {
            data: self.data,
            lo,
            hi,
        })
    }

    /// Borrow the raw bytes of the current window.
    pub fn as_slice(&self) -> &'a [u8] {
        &self.data[self.lo..self.hi]
    }

    fn slice_at(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let start = self.lo.checked_add(offset).ok_or(Error::OutOfBounds)?;
        let end = start.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > self.hi {
            return Err(Error::OutOfBounds);
        }
        Ok(&self.data[start..end])
    }

    /// Read one `T` at byte `offset` within the window.
    ///
    /// `T` must have the exact on-disk layout (no implicit padding); types
    /// used here are `#[repr(C)]` packed structs deriving [`bytemuck::Pod`].
    pub fn read<T: Pod>(&self, offset: usize) -> Result<T> {
        let bytes = self.slice_at(offset, std::mem::size_of::<T>())?;
        Ok(*bytemuck::from_bytes(bytes))
    }

    /// Read `count` contiguous `T`s starting at byte `offset`.
    pub fn read_many<T: Pod>(&self, offset: usize, count: usize) -> Result<Vec<T>> {
        let size = std::mem::size_of::<T>();
        let total = size.checked_mul(count).ok_or(Error::OutOfBounds)?;
        let bytes = self.slice_at(offset, total)?;
        Ok(bytemuck::cast_slice::<u8, T>(bytes).to_vec())
    }

    /// Read a raw byte slice of `len` bytes at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.slice_at(offset, len)
    }

    /// Read a null-terminated string starting at byte `offset`.
    ///
    /// Decoding is lossy UTF-8: a byte sequence that isn't valid UTF-8 is
    /// decoded with replacement characters rather than failing outright.
    /// This mirrors a documented quirk in the format family's original
    /// string reader, which was never fully correct for non-Latin code
    /// pages; callers that need exact round-tripping of non-UTF-8 names
    /// should read the raw bytes instead.
    pub fn read_string(&self, offset: usize) -> Result<String> {
        let start = self.lo.checked_add(offset).ok_or(Error::OutOfBounds)?;
        if start > self.hi {
            return Err(Error::OutOfBounds);
        }
        let region = &self.data[start..self.hi];
        let end = region
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::UnterminatedName)?;
        Ok(String::from_utf8_lossy(&region[..end]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[repr(C, packed)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Header {
        magic: u32,
        count: u16,
        flags: u16,
    }

    #[test]
    fn read_respects_packed_layout() {
        assert_eq!(std::mem::size_of::<Header>(), 8);
        let bytes = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x03, 0x00];
        let buf = Buffer::new(&bytes);
        let h: Header = buf.read(0).unwrap();
        assert_eq!(h.magic, 1);
        assert_eq!(h.count, 2);
        assert_eq!(h.flags, 3);
    }

    #[test]
    fn sub_window_is_checked() {
        let bytes = [0u8; 16];
        let buf = Buffer::new(&bytes);
        let sub = buf.sub(4, 8).unwrap();
        assert_eq!(sub.len(), 8);
        assert!(buf.sub(4, 20).is_err());
        assert!(sub.sub(0, 9).is_err());
    }

    #[test]
    fn read_many_out_of_bounds_errors() {
        let bytes = [0u8; 8];
        let buf = Buffer::new(&bytes);
        let v: Vec<u16> = buf.read_many(0, 4).unwrap();
        assert_eq!(v.len(), 4);
        assert!(buf.read_many::<u16>(0, 5).is_err());
    }

    #[test]
    fn read_string_stops_at_nul() {
        let bytes = b"hello\0world";
        let buf = Buffer::new(bytes);
        assert_eq!(buf.read_string(0).unwrap(), "hello");
        assert!(Buffer::new(b"noterm").read_string(0).is_err());
    }
}
