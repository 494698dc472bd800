//! LZ codec interface.
//!
//! The core treats compression as an opaque `compress`/`decompress` pair
//! over byte vectors - an external codec that the core merely calls.
//! What *is* part of the tested contract is the 16-byte envelope every
//! compressed blob in a level-core file is wrapped in: magic `b"WAD\0"`,
//! then a little-endian `compressed_size` covering the bytes that follow,
//! then 8 reserved bytes. The algorithm behind that envelope is
//! [`lz4_flex`]'s block format, standing in for the original's bespoke LZ
//! scheme - see DESIGN.md.
//!
//! Gated behind the `compression` feature so the asset-bank framework and
//! geometry codecs can be exercised without pulling in a compression
//! dependency at all (most tests construct levels in already-decompressed
//! form).

#![cfg(feature = "compression")]

use crate::error::{Error, Result};

/// Magic bytes at the start of every WAD-compressed blob.
pub const WAD_MAGIC: [u8; 4] = *b"WAD\0";

/// Size of the envelope header: 4-byte magic + 4-byte little-endian
/// `compressed_size` + 8 reserved bytes.
pub const HEADER_SIZE: usize = 16;

/// Compress `data`, wrapping the result in the 16-byte WAD envelope.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let body = lz4_flex::compress_prepend_size(data);
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&WAD_MAGIC);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&body);
    out
}

/// Decompress a WAD-enveloped blob produced by [`compress`].
///
/// Fails with [`Error::BadMagic`] if the magic doesn't match, or
/// [`Error::FileFormatError`] if the declared `compressed_size` runs past
/// the end of `data`.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < HEADER_SIZE {
        return Err(Error::UnexpectedEof);
    }
    if data[0..4] != WAD_MAGIC {
        return Err(Error::BadMagic);
    }
    let compressed_size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let body = data
        .get(HEADER_SIZE..HEADER_SIZE + compressed_size)
        .ok_or_else(|| {
            Error::FileFormatError("WAD compressed_size exceeds buffer length".into())
        })?;
    lz4_flex::decompress_size_prepended(body)
        .map_err(|e| Error::FileFormatError(format!("LZ4 decompress failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_decompress_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let packed = compress(&data);
        assert_eq!(&packed[0..4], &WAD_MAGIC);
        let unpacked = decompress(&packed).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut packed = compress(b"hello");
        packed[0] = b'X';
        assert!(matches!(decompress(&packed), Err(Error::BadMagic)));
    }

    #[test]
    fn truncated_body_is_file_format_error() {
        let mut packed = compress(&vec![7u8; 256]);
        packed.truncate(packed.len() - 10);
        assert!(matches!(decompress(&packed), Err(Error::FileFormatError(_))));
    }
}
