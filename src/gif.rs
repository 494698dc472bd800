//! GIF AD data - GPU register upload records embedded in unpacks (C4).
//!
//! These are short GS ("Graphics Synthesizer") register uploads: a 64-bit
//! data payload plus a 64-bit address word whose low byte names the target
//! register. The codecs copy most of these verbatim; only the handful named
//! below are ever interpreted, and only far enough to read/write the fields
//! the allocator and codecs need (texture base pointer, dimensions, clamp
//! mode, mip chain pointers). Everything else about the register stays
//! opaque - tests diff the raw 16-byte record byte-for-byte.

use bytemuck::{Pod, Zeroable};

/// GS register addresses this crate names (low byte of the `AdData` address
/// word; upper bits are reserved/zero in practice).
pub mod reg {
    pub const TEX0_1: u8 = 0x06;
    pub const TEX0_2: u8 = 0x07;
    pub const CLAMP_1: u8 = 0x08;
    pub const CLAMP_2: u8 = 0x09;
    pub const TEX1_1: u8 = 0x14;
    pub const TEX1_2: u8 = 0x15;
    pub const MIPTBP1_1: u8 = 0x34;
    pub const MIPTBP1_2: u8 = 0x35;
    pub const MIPTBP2_1: u8 = 0x36;
    pub const MIPTBP2_2: u8 = 0x37;
}

/// A single 16-byte "A+D" (address + data) GS register upload.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct AdData {
    pub data: u64,
    /// Low byte is the register number (see [`reg`]); the rest is reserved.
    pub addr: u64,
}

impl AdData {
    pub fn register(&self) -> u8 {
        (self.addr & 0xFF) as u8
    }
}

/// TEX0 register: texture base pointer, buffer width, pixel format,
/// dimensions, and CLUT (palette) placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tex0 {
    /// Texture base pointer, in GS words / 64.
    pub tbp: u32,
    /// Texture buffer width, in units of 64 texels.
    pub tbw: u32,
    /// GS pixel storage format (PSM).
    pub psm: u8,
    /// log2 texture width.
    pub tw: u8,
    /// log2 texture height.
    pub th: u8,
    /// CLUT (palette) base pointer.
    pub cbp: u32,
    /// CLUT storage format.
    pub cpsm: u8,
}

impl Tex0 {
    pub fn from_bits(data: u64) -> Self {
        Tex0 {
            tbp: (data & 0x3FFF) as u32,
            tbw: ((data >> 14) & 0x3F) as u32,
            psm: ((data >> 20) & 0x3F) as u8,
            tw: ((data >> 26) & 0xF) as u8,
            th: ((data >> 30) & 0xF) as u8,
            cbp: ((data >> 37) & 0x3FFF) as u32,
            cpsm: ((data >> 51) & 0xF) as u8,
        }
    }

    pub fn to_bits(self) -> u64 {
        (self.tbp as u64 & 0x3FFF)
            | ((self.tbw as u64 & 0x3F) << 14)
            | ((self.psm as u64 & 0x3F) << 20)
            | ((self.tw as u64 & 0xF) << 26)
            | ((self.th as u64 & 0xF) << 30)
            | ((self.cbp as u64 & 0x3FFF) << 37)
            | ((self.cpsm as u64 & 0xF) << 51)
    }

    pub fn width(&self) -> u32 {
        1 << self.tw
    }

    pub fn height(&self) -> u32 {
        1 << self.th
    }
}

/// TEX1 register: mipmap LOD parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tex1 {
    /// Maximum mip level.
    pub mxl: u8,
    /// LOD calculation constant `K`, an 11.3 fixed-point value in the real
    /// register; stored here as the raw signed integer.
    pub k: i16,
    /// LOD calculation method (0 = use K, 1 = fixed).
    pub lcm: u8,
}

impl Tex1 {
    pub fn from_bits(data: u64) -> Self {
        Tex1 {
            mxl: ((data >> 2) & 0x7) as u8,
            lcm: (data & 0x1) as u8,
            k: ((data >> 32) & 0xFFF) as i16,
        }
    }

    pub fn to_bits(self) -> u64 {
        (self.lcm as u64 & 0x1) | ((self.mxl as u64 & 0x7) << 2) | ((self.k as u64 & 0xFFF) << 32)
    }
}

/// CLAMP register: wrap/clamp behavior per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamp {
    pub wms: u8,
    pub wmt: u8,
}

impl Clamp {
    pub fn from_bits(data: u64) -> Self {
        Clamp {
            wms: (data & 0x3) as u8,
            wmt: ((data >> 2) & 0x3) as u8,
        }
    }

    pub fn to_bits(self) -> u64 {
        (self.wms as u64 & 0x3) | ((self.wmt as u64 & 0x3) << 2)
    }
}

/// MIPTBP1/MIPTBP2: base pointers and buffer widths for mip levels 1-6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Miptbp {
    pub tbp: [u32; 3],
    pub tbw: [u32; 3],
}

impl Miptbp {
    pub fn from_bits(data: u64) -> Self {
        let mut tbp = [0u32; 3];
        let mut tbw = [0u32; 3];
        for i in 0..3 {
            let shift = i * 18;
            tbp[i] = ((data >> shift) & 0x3FFF) as u32;
            tbw[i] = ((data >> (shift + 14)) & 0xF) as u32;
        }
        Miptbp { tbp, tbw }
    }

    pub fn to_bits(self) -> u64 {
        let mut data = 0u64;
        for i in 0..3 {
            let shift = i * 18;
            data |= (self.tbp[i] as u64 & 0x3FFF) << shift;
            data |= (self.tbw[i] as u64 & 0xF) << (shift + 14);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tex0_bit_roundtrip() {
        let t = Tex0 {
            tbp: 0x1234,
            tbw: 8,
            psm: 0x13,
            tw: 7,
            th: 6,
            cbp: 0x200,
            cpsm: 0x14,
        };
        let back = Tex0::from_bits(t.to_bits());
        assert_eq!(t, back);
        assert_eq!(back.width(), 128);
        assert_eq!(back.height(), 64);
    }

    #[test]
    fn ad_data_register_is_low_byte() {
        let ad = AdData {
            data: 0xdead_beef,
            addr: reg::TEX0_1 as u64,
        };
        assert_eq!(ad.register(), reg::TEX0_1);
    }

    #[test]
    fn miptbp_roundtrip() {
        let m = Miptbp {
            tbp: [1, 2, 3],
            tbw: [4, 5, 6],
        };
        assert_eq!(Miptbp::from_bits(m.to_bits()), m);
    }

    #[test]
    fn ad_data_is_16_bytes_packed() {
        assert_eq!(std::mem::size_of::<AdData>(), 16);
    }
}
