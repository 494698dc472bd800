//! Texture codec - palette/mipmap swizzling, alpha convention, format
//! conversions, and dedupe equality.

use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Pixel storage format of a [`Texture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PixelFormat {
    Rgba8888,
    Paletted8,
    Paletted4,
    Gray8,
}

/// A decoded texture: dimensions, pixel format, raw pixel bytes, and an
/// optional palette.
///
/// Invariants (checked by [`Texture::new`]):
/// - `pixels.len()` matches `format`/`width`/`height`.
/// - a palette is present iff `format` is paletted, and has exactly 256
///   entries for [`PixelFormat::Paletted8`] or 16 for
///   [`PixelFormat::Paletted4`].
#[derive(Debug, Clone)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
    pub palette: Option<Vec<[u8; 4]>>,
}

impl Texture {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
        palette: Option<Vec<[u8; 4]>>,
    ) -> Result<Self> {
        let pixel_count = (width as usize) * (height as usize);
        let expected_len = match format {
            PixelFormat::Rgba8888 => pixel_count * 4,
            PixelFormat::Paletted8 | PixelFormat::Gray8 => pixel_count,
            PixelFormat::Paletted4 => pixel_count.div_ceil(2),
        };
        if pixels.len() != expected_len {
            return Err(Error::FileFormatError(format!(
                "texture pixel buffer is {} bytes, expected {expected_len}",
                pixels.len()
            )));
        }
        match format {
            PixelFormat::Paletted8 => {
                if palette.as_ref().map(Vec::len) != Some(256) {
                    return Err(Error::FileFormatError(
                        "8-bit paletted texture requires a 256-entry palette".into(),
                    ));
                }
            }
            PixelFormat::Paletted4 => {
                if palette.as_ref().map(Vec::len) != Some(16) {
                    return Err(Error::FileFormatError(
                        "4-bit paletted texture requires a 16-entry palette".into(),
                    ));
                }
            }
            PixelFormat::Rgba8888 | PixelFormat::Gray8 => {
                if palette.is_some() {
                    return Err(Error::FileFormatError(
                        "non-paletted texture must not carry a palette".into(),
                    ));
                }
            }
        }
        Ok(Texture {
            width,
            height,
            format,
            pixels,
            palette,
        })
    }

    fn sort_key(&self) -> (u32, u32, PixelFormat, &[u8], Option<&[[u8; 4]]>) {
        (
            self.width,
            self.height,
            self.format,
            &self.pixels,
            self.palette.as_deref(),
        )
    }

    /// 4-bit paletted -> 8-bit paletted: expand nibbles high-nibble-first
    /// within each byte.
    pub fn expand_4bit_to_8bit(&self) -> Result<Texture> {
        if self.format != PixelFormat::Paletted4 {
            return Err(Error::FileFormatError(
                "expand_4bit_to_8bit requires a 4-bit paletted texture".into(),
            ));
        }
        let pixel_count = (self.width as usize) * (self.height as usize);
        let mut out = Vec::with_capacity(pixel_count);
        for byte in &self.pixels {
            out.push(byte >> 4);
            out.push(byte & 0xF);
        }
        out.truncate(pixel_count);
        let mut palette = self.palette.clone().unwrap();
        palette.resize(256, [0, 0, 0, 0]);
        Texture::new(
            self.width,
            self.height,
            PixelFormat::Paletted8,
            out,
            Some(palette),
        )
    }

    /// Convert to RGBA-8888. Paletted formats go through the palette table;
    /// 4-bit paletted is expanded first.
    pub fn to_rgba(&self) -> Result<Texture> {
        match self.format {
            PixelFormat::Rgba8888 => Ok(self.clone()),
            PixelFormat::Paletted4 => self.expand_4bit_to_8bit()?.to_rgba(),
            PixelFormat::Paletted8 => {
                let palette = self.palette.as_ref().expect("invariant: palette present");
                let mut out = Vec::with_capacity(self.pixels.len() * 4);
                for &idx in &self.pixels {
                    out.extend_from_slice(&palette[idx as usize]);
                }
                Texture::new(self.width, self.height, PixelFormat::Rgba8888, out, None)
            }
            PixelFormat::Gray8 => {
                let mut out = Vec::with_capacity(self.pixels.len() * 4);
                for &g in &self.pixels {
                    out.extend_from_slice(&[g, g, g, 0xFF]);
                }
                Texture::new(self.width, self.height, PixelFormat::Rgba8888, out, None)
            }
        }
    }

    /// Convert any format to single-channel grayscale: `(r+g+b)/3` per
    /// pixel, one byte out.
    pub fn to_grayscale(&self) -> Result<Texture> {
        let rgba = self.to_rgba()?;
        let mut out = Vec::with_capacity(rgba.pixels.len() / 4);
        for px in rgba.pixels.chunks_exact(4) {
            let avg = (px[0] as u32 + px[1] as u32 + px[2] as u32) / 3;
            out.push(avg as u8);
        }
        Texture::new(self.width, self.height, PixelFormat::Gray8, out, None)
    }

    /// Quantize an RGBA texture down to 8-bit paletted form, building a
    /// palette of its distinct colors.
    ///
    /// Fails with [`Error::Unimplemented`] if the image has more than 256
    /// distinct colors - callers should fall back to the pixel-equal
    /// (palette-free) round-trip law in that case.
    pub fn to_8bit_paletted(&self) -> Result<Texture> {
        let rgba = self.to_rgba()?;
        let mut palette: Vec<[u8; 4]> = Vec::new();
        let mut indices = Vec::with_capacity(rgba.pixels.len() / 4);
        for px in rgba.pixels.chunks_exact(4) {
            let color = [px[0], px[1], px[2], px[3]];
            let idx = match palette.iter().position(|&c| c == color) {
                Some(i) => i,
                None => {
                    if palette.len() >= 256 {
                        return Err(Error::Unimplemented(
                            "source image has more than 256 distinct colors",
                        ));
                    }
                    palette.push(color);
                    palette.len() - 1
                }
            };
            indices.push(idx as u8);
        }
        palette.resize(256, [0, 0, 0, 0]);
        Texture::new(
            self.width,
            self.height,
            PixelFormat::Paletted8,
            indices,
            Some(palette),
        )
    }

    /// Decode half-scale alpha (`0x80` == opaque) to full-scale.
    ///
    /// Only meaningful on RGBA textures.
    pub fn multiply_alphas(&self) -> Result<Texture> {
        if self.format != PixelFormat::Rgba8888 {
            return Err(Error::FileFormatError(
                "multiply_alphas requires an RGBA texture".into(),
            ));
        }
        let mut out = self.pixels.clone();
        for px in out.chunks_exact_mut(4) {
            px[3] = if px[3] < 0x80 { px[3] * 2 } else { 0xFF };
        }
        Texture::new(self.width, self.height, self.format, out, None)
    }

    /// Encode full-scale alpha down to half-scale (`0xff` -> `0x80`).
    pub fn divide_alphas(&self) -> Result<Texture> {
        if self.format != PixelFormat::Rgba8888 {
            return Err(Error::FileFormatError(
                "divide_alphas requires an RGBA texture".into(),
            ));
        }
        let mut out = self.pixels.clone();
        for px in out.chunks_exact_mut(4) {
            px[3] = if px[3] == 0xFF { 0x80 } else { px[3] / 2 };
        }
        Texture::new(self.width, self.height, self.format, out, None)
    }

    /// Generate a chain of mipmaps by keeping the top-left pixel of every
    /// 4x4 block, stopping once width would drop below 8 or `max_levels`
    /// is reached.
    pub fn mipmap_chain(&self, max_levels: u32) -> Vec<Texture> {
        let mut levels = Vec::new();
        let mut current = self.clone();
        for _ in 0..max_levels {
            if current.width < 32 {
                break;
            }
            let next_w = current.width / 4;
            let next_h = (current.height / 4).max(1);
            if next_w < 8 {
                break;
            }
            let bpp = match current.format {
                PixelFormat::Rgba8888 => 4,
                PixelFormat::Paletted8 | PixelFormat::Gray8 => 1,
                PixelFormat::Paletted4 => {
                    // Operate on the expanded form; 4-bit mip chains are not
                    // produced directly by the packer.
                    break;
                }
            };
            let mut pixels = Vec::with_capacity((next_w * next_h) as usize * bpp);
            for y in 0..next_h {
                for x in 0..next_w {
                    let src_x = x * 4;
                    let src_y = y * 4;
                    let src_idx = ((src_y * current.width + src_x) as usize) * bpp;
                    pixels.extend_from_slice(&current.pixels[src_idx..src_idx + bpp]);
                }
            }
            let next = Texture {
                width: next_w,
                height: next_h,
                format: current.format,
                pixels,
                palette: current.palette.clone(),
            };
            levels.push(next.clone());
            current = next;
        }
        levels
    }
}

/// PNG import/export at the asset-bank boundary (§4.6.1): the only place
/// this crate's texture pipeline touches [`image`] rather than its own
/// raw paletted/RGBA representation.
impl Texture {
    /// Convert to an [`image::RgbaImage`], going through [`Texture::to_rgba`]
    /// first if this texture isn't already RGBA-8888.
    pub fn to_rgba_image(&self) -> Result<image::RgbaImage> {
        let rgba = self.to_rgba()?;
        image::RgbaImage::from_raw(rgba.width, rgba.height, rgba.pixels)
            .ok_or_else(|| Error::FileFormatError("texture dimensions do not match pixel buffer".into()))
    }

    /// Encode as a PNG file, one per texture slot per §4.6's "emit one PNG
    /// per slot" requirement. Callers apply [`Texture::multiply_alphas`]
    /// beforehand if the source alpha is in the GPU's half-scale
    /// convention; this function only bridges pixel representations.
    pub fn to_png_bytes(&self) -> Result<Vec<u8>> {
        let image = self.to_rgba_image()?;
        let mut out = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .map_err(|e| Error::FileFormatError(format!("PNG encode failed: {e}")))?;
        Ok(out)
    }

    /// Decode a PNG file into an RGBA-8888 [`Texture`]. Callers apply
    /// [`Texture::divide_alphas`] afterwards if the destination format
    /// needs the GPU's half-scale alpha convention.
    pub fn from_png_bytes(bytes: &[u8]) -> Result<Texture> {
        let decoded = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
            .map_err(|e| Error::FileFormatError(format!("PNG decode failed: {e}")))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        Texture::new(width, height, PixelFormat::Rgba8888, decoded.into_raw(), None)
    }
}

impl PartialEq for Texture {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for Texture {}

impl PartialOrd for Texture {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Texture {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Swap index for the fixed palette-index bit permutation: flips bits 3 and
/// 4 together whenever they differ. Its own inverse.
fn palette_swap_index(i: usize) -> usize {
    let bit3 = (i >> 3) & 1;
    let bit4 = (i >> 4) & 1;
    if bit3 != bit4 { i ^ 0x18 } else { i }
}

/// Apply the fixed 8-bit-palette-index swizzle. Involutive:
/// `swizzle_palette(swizzle_palette(p)) == p`.
pub fn swizzle_palette(palette: &[[u8; 4]]) -> Vec<[u8; 4]> {
    let mut out = palette.to_vec();
    for i in 0..out.len() {
        let j = palette_swap_index(i);
        if j > i && j < out.len() {
            out.swap(i, j);
        }
    }
    out
}

/// Block-tiled swizzle for 8-bit paletted pixel data, used by one game
/// variant's hardware texture layout. `width`/`height` must both be
/// multiples of 16.
pub fn swizzle_texture_8bit(pixels: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    remap_8bit(pixels, width, height, true)
}

/// Inverse of [`swizzle_texture_8bit`].
pub fn unswizzle_texture_8bit(pixels: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    remap_8bit(pixels, width, height, false)
}

fn remap_8bit(pixels: &[u8], width: usize, height: usize, forward: bool) -> Result<Vec<u8>> {
    if pixels.len() != width * height {
        return Err(Error::FileFormatError(
            "swizzle input size does not match width*height".into(),
        ));
    }
    let mut out = vec![0u8; pixels.len()];
    for y in 0..height {
        for x in 0..width {
            let block_location = (y & !0xF) * width + (x & !0xF) * 2;
            let swap_selector = (((y + 2) >> 2) & 0x1) * 4;
            let pos_y = (((y & !3) >> 1) + (y & 1)) & 0x7;
            let column_location = pos_y * width * 2 + ((x + swap_selector) & 0x7) * 4;
            let byte_num = ((y >> 1) & 1) + ((x >> 2) & 2);
            let swizzled_index = block_location + column_location + byte_num;
            let linear_index = y * width + x;
            if forward {
                out[swizzled_index] = pixels[linear_index];
            } else {
                out[linear_index] = pixels[swizzled_index];
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker_palette() -> Vec<[u8; 4]> {
        (0..256)
            .map(|i| [i as u8, i as u8, i as u8, 0xFF])
            .collect()
    }

    #[test]
    fn expand_4bit_is_high_nibble_first() {
        let tex = Texture::new(
            2,
            1,
            PixelFormat::Paletted4,
            vec![0x1A],
            Some(vec![[0, 0, 0, 0]; 16]),
        )
        .unwrap();
        let expanded = tex.expand_4bit_to_8bit().unwrap();
        assert_eq!(expanded.pixels, vec![0x1, 0xA]);
    }

    #[test]
    fn paletted_to_rgba_is_table_lookup() {
        let mut palette = vec![[0, 0, 0, 0]; 256];
        palette[5] = [10, 20, 30, 255];
        let tex = Texture::new(1, 1, PixelFormat::Paletted8, vec![5], Some(palette)).unwrap();
        let rgba = tex.to_rgba().unwrap();
        assert_eq!(rgba.pixels, vec![10, 20, 30, 255]);
    }

    #[test]
    fn grayscale_is_channel_average() {
        let tex = Texture::new(
            1,
            1,
            PixelFormat::Rgba8888,
            vec![30, 60, 90, 255],
            None,
        )
        .unwrap();
        let gray = tex.to_grayscale().unwrap();
        assert_eq!(gray.pixels, vec![60]);
    }

    #[test]
    fn alpha_multiply_divide_roundtrip_for_valid_range() {
        for encoded in [0u8, 1, 0x40, 0x7F, 0x80, 0xFF] {
            let tex = Texture::new(1, 1, PixelFormat::Rgba8888, vec![0, 0, 0, encoded], None)
                .unwrap();
            let decoded = tex.multiply_alphas().unwrap();
            let back = decoded.divide_alphas().unwrap();
            assert_eq!(back.pixels[3], encoded, "failed for encoded alpha {encoded:#x}");
        }
    }

    #[test]
    fn palette_swizzle_is_involutive() {
        let palette = checker_palette();
        let once = swizzle_palette(&palette);
        assert_ne!(once, palette);
        let twice = swizzle_palette(&once);
        assert_eq!(twice, palette);
    }

    #[test]
    fn texture_swizzle_is_invertible() {
        let width = 32;
        let height = 32;
        let pixels: Vec<u8> = (0..width * height).map(|i| (i % 256) as u8).collect();
        let swizzled = swizzle_texture_8bit(&pixels, width, height).unwrap();
        let back = unswizzle_texture_8bit(&swizzled, width, height).unwrap();
        assert_eq!(back, pixels);
    }

    #[test]
    fn mipmap_chain_keeps_top_left_of_each_4x4_block() {
        let width = 32u32;
        let height = 32u32;
        let pixels: Vec<u8> = (0..width * height).map(|i| (i % 256) as u8).collect();
        let tex = Texture::new(width, height, PixelFormat::Gray8, pixels, None).unwrap();
        let chain = tex.mipmap_chain(2);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].width, 8);
        assert_eq!(chain[0].height, 8);
        assert_eq!(chain[0].pixels[0], tex.pixels[0]);
        assert_eq!(chain[0].pixels[1], tex.pixels[4]);
    }

    #[test]
    fn equality_is_full_bytewise_tuple() {
        let a = Texture::new(1, 1, PixelFormat::Gray8, vec![1], None).unwrap();
        let b = Texture::new(1, 1, PixelFormat::Gray8, vec![1], None).unwrap();
        let c = Texture::new(1, 1, PixelFormat::Gray8, vec![2], None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn png_roundtrip_preserves_rgba_pixels() {
        let mut palette = vec![[0, 0, 0, 0]; 256];
        palette[1] = [200, 100, 50, 255];
        let tex = Texture::new(2, 1, PixelFormat::Paletted8, vec![0, 1], Some(palette)).unwrap();
        let rgba = tex.to_rgba().unwrap();

        let png = tex.to_png_bytes().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = Texture::from_png_bytes(&png).unwrap();
        assert_eq!(decoded.format, PixelFormat::Rgba8888);
        assert_eq!(decoded.width, 2);
        assert_eq!(decoded.height, 1);
        assert_eq!(decoded.pixels, rgba.pixels);
    }
}
