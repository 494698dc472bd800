//! VIF (Vector-unit Interface) command stream.
//!
//! A VIF command list is a sequence of 32-bit command words, some
//! introducing variable-length payloads. This module recognizes the five
//! commands the geometry codecs need: `STROW`, `STMOD`, `STCYCL`, `UNPACK`,
//! and `NOP`/padding.

use crate::error::{Error, Result};
use crate::io::Buffer;

/// VU unpack element formats used by the geometry codecs.
///
/// Named after the real VIF `UNPACK` format encoding (`VN_VL`: number of
/// components, bits per component).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackFormat {
    V2_16,
    V3_16,
    V4_8,
    V4_16,
    V4_32,
}

impl UnpackFormat {
    /// Number of vector components.
    pub fn components(self) -> usize {
        match self {
            UnpackFormat::V2_16 => 2,
            UnpackFormat::V3_16 => 3,
            UnpackFormat::V4_8 | UnpackFormat::V4_16 | UnpackFormat::V4_32 => 4,
        }
    }

    /// Size in bytes of a single component.
    pub fn component_size(self) -> usize {
        match self {
            UnpackFormat::V4_8 => 1,
            UnpackFormat::V2_16 | UnpackFormat::V3_16 | UnpackFormat::V4_16 => 2,
            UnpackFormat::V4_32 => 4,
        }
    }

    /// Byte size of one packed element (all components).
    pub fn element_size(self) -> usize {
        self.components() * self.component_size()
    }

    fn code(self) -> u8 {
        match self {
            UnpackFormat::V2_16 => 0x5,
            UnpackFormat::V3_16 => 0x9,
            UnpackFormat::V4_8 => 0xE,
            UnpackFormat::V4_16 => 0xD,
            UnpackFormat::V4_32 => 0xC,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0x5 => Ok(UnpackFormat::V2_16),
            0x9 => Ok(UnpackFormat::V3_16),
            0xE => Ok(UnpackFormat::V4_8),
            0xD => Ok(UnpackFormat::V4_16),
            0xC => Ok(UnpackFormat::V4_32),
            _ => Err(Error::FileFormatError(format!(
                "unrecognized VIF unpack format code 0x{code:x}"
            ))),
        }
    }
}

/// Decoded `UNPACK` header.
#[derive(Debug, Clone, Copy)]
pub struct UnpackHeader {
    pub format: UnpackFormat,
    /// Whether source components are sign-extended (the `U` bit, inverted:
    /// `unsigned == false` means the unpacker sign-extends).
    pub unsigned: bool,
    /// Whether the STROW register is added per unpacked element (the `M`
    /// mask-mode bit).
    pub add_row: bool,
    /// Number of elements in the payload.
    pub num: u16,
    /// Target VU memory address in quadwords.
    pub addr: u16,
}

/// One decoded VIF command.
#[derive(Debug, Clone)]
pub enum VifPacket {
    Nop,
    /// Sets write-cycle interleave: `cl` source elements written every `wl`
    /// destination cycles.
    StCycl { cl: u8, wl: u8 },
    /// Selects addition mode: `0` = direct, `1` = add row.
    StMod { mode: u8 },
    /// Sets the 4-word additive row register.
    StRow { row: [u32; 4] },
    /// Copies `data` into VU memory per `header`.
    Unpack { header: UnpackHeader, data: Vec<u8> },
}

/// Parse a full VIF command list from `buf`.
///
/// Stops at the end of the buffer; a truncated payload (an `UNPACK` whose
/// declared size runs past the buffer) fails with [`Error::OutOfBounds`].
pub fn parse(buf: Buffer<'_>) -> Result<Vec<VifPacket>> {
    let mut packets = Vec::new();
    let mut pos = 0usize;
    let len = buf.len();

    while pos + 4 <= len {
        let word: u32 = buf.read(pos)?;
        pos += 4;

        let immediate = (word & 0xFFFF) as u16;
        let num = ((word >> 16) & 0xFF) as u16;
        let cmd = ((word >> 24) & 0x7F) as u8;

        if cmd == 0x00 {
            packets.push(VifPacket::Nop);
        } else if cmd == 0x01 {
            packets.push(VifPacket::StCycl {
                cl: (immediate & 0xFF) as u8,
                wl: (immediate >> 8) as u8,
            });
        } else if cmd == 0x05 {
            packets.push(VifPacket::StMod {
                mode: (immediate & 0x3) as u8,
            });
        } else if cmd == 0x30 {
            let row: [u32; 4] = [
                buf.read(pos)?,
                buf.read(pos + 4)?,
                buf.read(pos + 8)?,
                buf.read(pos + 12)?,
            ];
            pos += 16;
            packets.push(VifPacket::StRow { row });
        } else if cmd & 0x60 == 0x60 {
            let format_code = cmd & 0xF;
            let format = UnpackFormat::from_code(format_code)?;
            let unsigned = cmd & 0x10 != 0;
            let add_row = immediate & 0x8000 != 0;
            let addr = immediate & 0x3FF;
            let header = UnpackHeader {
                format,
                unsigned,
                add_row,
                num,
                addr,
            };

            let payload_size = header.format.element_size() * header.num as usize;
            let padded = payload_size.div_ceil(4) * 4;
            let data = buf.read_bytes(pos, payload_size)?.to_vec();
            pos += padded;

            packets.push(VifPacket::Unpack { header, data });
        } else {
            return Err(Error::FileFormatError(format!(
                "unrecognized VIF command 0x{cmd:x}"
            )));
        }
    }

    Ok(packets)
}

/// Return only the `UNPACK` packets, in stream order.
pub fn filter_vif_unpacks(packets: &[VifPacket]) -> Vec<(&UnpackHeader, &[u8])> {
    packets
        .iter()
        .filter_map(|p| match p {
            VifPacket::Unpack { header, data } => Some((header, data.as_slice())),
            _ => None,
        })
        .collect()
}

/// Emit a single VIF command word plus (for `UNPACK`) its payload.
pub fn encode(packets: &[VifPacket], out: &mut Vec<u8>) {
    for p in packets {
        match p {
            VifPacket::Nop => out.extend_from_slice(&0u32.to_le_bytes()),
            VifPacket::StCycl { cl, wl } => {
                let imm = (*cl as u32) | ((*wl as u32) << 8);
                let word = imm | (0x01 << 24);
                out.extend_from_slice(&word.to_le_bytes());
            }
            VifPacket::StMod { mode } => {
                let word = (*mode as u32 & 0x3) | (0x05 << 24);
                out.extend_from_slice(&word.to_le_bytes());
            }
            VifPacket::StRow { row } => {
                let word = 0x30u32 << 24;
                out.extend_from_slice(&word.to_le_bytes());
                for w in row {
                    out.extend_from_slice(&w.to_le_bytes());
                }
            }
            VifPacket::Unpack { header, data } => {
                let element_size = header.format.element_size();
                debug_assert_eq!(
                    data.len(),
                    element_size * header.num as usize,
                    "UNPACK payload size must equal element_size * count"
                );
                let mut immediate = (header.addr & 0x3FF) as u32;
                if header.add_row {
                    immediate |= 0x8000;
                }
                let mut cmd = 0x60u32 | header.format.code() as u32;
                if header.unsigned {
                    cmd |= 0x10;
                }
                let word = immediate | ((header.num as u32) << 16) | (cmd << 24);
                out.extend_from_slice(&word.to_le_bytes());
                out.extend_from_slice(data);
                let padded = data.len().div_ceil(4) * 4;
                out.resize(out.len() + (padded - data.len()), 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packets: Vec<VifPacket>) -> Vec<VifPacket> {
        let mut bytes = Vec::new();
        encode(&packets, &mut bytes);
        parse(Buffer::new(&bytes)).unwrap()
    }

    #[test]
    fn stcycl_strow_stmod_roundtrip() {
        let packets = vec![
            VifPacket::StCycl { cl: 1, wl: 1 },
            VifPacket::StRow {
                row: [1, 2, 3, 4],
            },
            VifPacket::StMod { mode: 1 },
            VifPacket::Nop,
        ];
        let decoded = roundtrip(packets);
        assert!(matches!(decoded[0], VifPacket::StCycl { cl: 1, wl: 1 }));
        assert!(matches!(decoded[1], VifPacket::StRow { row: [1, 2, 3, 4] }));
        assert!(matches!(decoded[2], VifPacket::StMod { mode: 1 }));
        assert!(matches!(decoded[3], VifPacket::Nop));
    }

    #[test]
    fn unpack_v4_16_roundtrip() {
        let header = UnpackHeader {
            format: UnpackFormat::V4_16,
            unsigned: true,
            add_row: true,
            num: 3,
            addr: 0x42,
        };
        let data: Vec<u8> = (0..header.format.element_size() as u8 * 3).collect();
        let packets = vec![VifPacket::Unpack {
            header,
            data: data.clone(),
        }];
        let decoded = roundtrip(packets);
        match &decoded[0] {
            VifPacket::Unpack { header: h, data: d } => {
                assert_eq!(h.format, UnpackFormat::V4_16);
                assert!(h.unsigned);
                assert!(h.add_row);
                assert_eq!(h.num, 3);
                assert_eq!(h.addr, 0x42);
                assert_eq!(d, &data);
            }
            _ => panic!("expected Unpack"),
        }
    }

    #[test]
    fn filter_returns_only_unpacks_in_order() {
        let header = UnpackHeader {
            format: UnpackFormat::V2_16,
            unsigned: false,
            add_row: false,
            num: 1,
            addr: 0,
        };
        let packets = vec![
            VifPacket::Nop,
            VifPacket::Unpack {
                header,
                data: vec![1, 2, 3, 4],
            },
            VifPacket::StMod { mode: 0 },
            VifPacket::Unpack {
                header,
                data: vec![5, 6, 7, 8],
            },
        ];
        let unpacks = filter_vif_unpacks(&packets);
        assert_eq!(unpacks.len(), 2);
        assert_eq!(unpacks[0].1, &[1, 2, 3, 4]);
        assert_eq!(unpacks[1].1, &[5, 6, 7, 8]);
    }

    #[test]
    fn truncated_payload_is_out_of_bounds() {
        let mut bytes = Vec::new();
        // UNPACK V4_32, num=2 (32 bytes) but only provide 8 bytes.
        let word = 0u32 | (2u32 << 16) | ((0x60 | 0xC) << 24);
        bytes.extend_from_slice(&word.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(parse(Buffer::new(&bytes)), Err(Error::OutOfBounds)));
    }
}
