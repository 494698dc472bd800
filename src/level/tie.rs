//! Tie (static prop) codec.
//!
//! Like tfrag but single-LOD, with per-packet AD-GIF material changes:
//! strips of up to 255 vertices, an end-of-packet flag that switches the
//! active texture for the next strip. Packing weaves a mesh's submeshes
//! into real triangle strips ([`crate::level::shrub::weave_strips`]) and
//! wraps each strip in a VIF/GIF packet, grounded on the AD-GIF-per-packet
//! shape `original_source/src/engine/shrub.cpp` documents explicitly and
//! the original's tie packet format (`level.h`'s tie tables referenced
//! from `wrenchbuild/level/level_core.cpp`).

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::gif::{self, AdData};
use crate::io::Buffer;
use crate::level::mesh::{Face, Material, Mesh, SubMesh, Vertex};
use crate::level::shrub::{dequantize_position, optimal_scale, quantize_position, weave_strips};
use crate::vif::{self, UnpackFormat, UnpackHeader, VifPacket};

/// Maximum vertices in a single tie strip.
pub const MAX_STRIP_VERTICES: usize = 255;

/// Fixed-point scale applied to UV coordinates in the wire format.
const UV_SCALE: f32 = 4096.0;

/// One packet: a strip of vertex positions/UVs, the material active for
/// it, and whether an AD-GIF material change follows.
#[derive(Debug, Clone)]
pub struct TiePacket {
    pub material: usize,
    pub positions: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    /// Set when this packet ends with an AD-GIF upload that changes the
    /// active texture for the packet that follows.
    pub material_change: bool,
}

/// A decoded/to-be-encoded tie instance: its packets, the quantization
/// scale their wire-format positions share, and the materials they
/// reference.
#[derive(Debug, Clone, Default)]
pub struct Tie {
    pub scale: f32,
    pub packets: Vec<TiePacket>,
    pub materials: Vec<Material>,
}

/// Per-packet metadata carried in the leading V4_32 unpack.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PacketHeader {
    vertex_count: u32,
    material: u32,
    texture_present: u32,
    pad: u32,
}

/// An AD-GIF texture upload, carrying the material index in `tex0.data`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TexturePrimitive {
    tex1: AdData,
    clamp: AdData,
    miptbp1: AdData,
    tex0: AdData,
}

/// First V4_16 vertex unpack: quantized position.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VertexPart1 {
    x: i16,
    y: i16,
    z: i16,
    pad: i16,
}

/// Second V4_16 vertex unpack: fixed-point ST.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VertexPart2 {
    s: i16,
    t: i16,
    pad0: i16,
    pad1: i16,
}

/// Class-level container wrapping every packet's VIF stream.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ClassHeader {
    scale: f32,
    packet_count: u32,
}

/// Offset/size of one packet's VIF stream within the class data block.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PacketEntry {
    offset: u32,
    size: u32,
}

impl Tie {
    /// Weave each submesh's faces into real triangle strips
    /// ([`weave_strips`]) and wrap each one in its own packet - tie has
    /// no multi-strip packing like shrub, since its strips already cap
    /// well under the hardware vertex-count limit.
    pub fn pack(mesh: &Mesh, materials: Vec<Material>) -> Result<Tie> {
        let positions: Vec<[f32; 3]> = mesh.vertices.iter().map(|v| v.position).collect();
        let scale = optimal_scale(&positions).max(f32::EPSILON);

        let mut packets = Vec::new();
        let submesh_count = mesh.submeshes.len();
        for (i, sub) in mesh.submeshes.iter().enumerate() {
            let strips = weave_strips(&sub.faces);
            let strip_count = strips.len();
            for (j, strip_indices) in strips.into_iter().enumerate() {
                let positions: Vec<[f32; 3]> = strip_indices
                    .iter()
                    .map(|&idx| mesh.vertices[idx as usize].position)
                    .collect();
                let uvs: Vec<[f32; 2]> = strip_indices
                    .iter()
                    .map(|&idx| mesh.vertices[idx as usize].uv)
                    .collect();
                let is_last = i + 1 == submesh_count && j + 1 == strip_count;
                packets.push(TiePacket {
                    material: sub.material,
                    positions,
                    uvs,
                    material_change: !is_last,
                });
            }
        }
        Ok(Tie { scale, packets, materials })
    }

    /// Reassemble packets into a renderer-agnostic mesh. Each packet's
    /// vertex run is treated as a triangle strip.
    pub fn to_mesh(&self) -> Mesh {
        let mut vertices = Vec::new();
        let mut submeshes = Vec::new();
        for packet in &self.packets {
            let base = vertices.len() as u32;
            for (pos, uv) in packet.positions.iter().zip(&packet.uvs) {
                let mut v = Vertex::new(*pos);
                v.uv = *uv;
                vertices.push(v);
            }
            let indices: Vec<u32> = (0..packet.positions.len() as u32).collect();
            let triangles = crate::level::tfrag::strip_to_triangles(
                &indices.iter().map(|&i| i as u8).collect::<Vec<_>>(),
            );
            submeshes.push(SubMesh {
                material: packet.material,
                faces: triangles
                    .into_iter()
                    .map(|t| Face::Tri([t[0] + base, t[1] + base, t[2] + base]))
                    .collect(),
            });
        }
        Mesh {
            vertices,
            submeshes,
            flags: Default::default(),
            joints: None,
        }
    }

    /// Validate the packet vertex-count budget tie shares with shrub.
    pub fn validate_budgets(&self) -> Result<()> {
        for (i, packet) in self.packets.iter().enumerate() {
            if packet.positions.len() > MAX_STRIP_VERTICES {
                return Err(Error::FileFormatError(format!(
                    "tie packet {i} has {} vertices, exceeds the {MAX_STRIP_VERTICES}-vertex strip limit",
                    packet.positions.len()
                )));
            }
        }
        Ok(())
    }

    /// Encode one packet as a real VIF command stream: a prologue, a
    /// V4_32 unpack carrying a [`PacketHeader`] (and, on a material
    /// change, a [`TexturePrimitive`]), then two V4_16 unpacks for
    /// position and fixed-point ST data. Shares its shape with
    /// [`crate::level::shrub::Shrub::pack_vif_list`] minus the
    /// normal-cluster/billboard machinery tie has no use for.
    pub fn pack_vif_list(packet: &TiePacket, scale: f32) -> Vec<u8> {
        let header = PacketHeader {
            vertex_count: packet.positions.len() as u32,
            material: packet.material as u32,
            texture_present: packet.material_change as u32,
            pad: 0,
        };
        let mut header_payload = Vec::new();
        header_payload.extend_from_slice(bytemuck::bytes_of(&header));
        if packet.material_change {
            let tex = TexturePrimitive {
                tex1: AdData { data: 0, addr: gif::reg::TEX1_1 as u64 },
                clamp: AdData { data: 0, addr: gif::reg::CLAMP_1 as u64 },
                miptbp1: AdData { data: 0, addr: gif::reg::MIPTBP1_1 as u64 },
                tex0: AdData { data: packet.material as u64, addr: gif::reg::TEX0_1 as u64 },
            };
            header_payload.extend_from_slice(bytemuck::bytes_of(&tex));
        }
        let header_num = header_payload.len() / UnpackFormat::V4_32.element_size();

        let part1: Vec<VertexPart1> = packet
            .positions
            .iter()
            .map(|p| {
                let q = quantize_position(*p, scale);
                VertexPart1 { x: q[0], y: q[1], z: q[2], pad: 0 }
            })
            .collect();
        let part2: Vec<VertexPart2> = packet
            .uvs
            .iter()
            .map(|uv| VertexPart2 {
                s: (uv[0] * UV_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16,
                t: (uv[1] * UV_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16,
                pad0: 0,
                pad1: 0,
            })
            .collect();
        let part1_bytes: Vec<u8> = part1.iter().flat_map(|p| bytemuck::bytes_of(p).to_vec()).collect();
        let part2_bytes: Vec<u8> = part2.iter().flat_map(|p| bytemuck::bytes_of(p).to_vec()).collect();
        let part2_addr = part1.len() as u16;

        let mut out = Vec::new();
        vif::encode(
            &[
                VifPacket::StCycl { cl: 4, wl: 4 },
                VifPacket::Nop,
                VifPacket::StMod { mode: 0 },
            ],
            &mut out,
        );
        vif::encode(
            &[VifPacket::Unpack {
                header: UnpackHeader {
                    format: UnpackFormat::V4_32,
                    unsigned: true,
                    add_row: false,
                    num: header_num as u16,
                    addr: 0,
                },
                data: header_payload,
            }],
            &mut out,
        );
        vif::encode(&[VifPacket::StMod { mode: 0 }], &mut out);
        vif::encode(
            &[VifPacket::Unpack {
                header: UnpackHeader {
                    format: UnpackFormat::V4_16,
                    unsigned: false,
                    add_row: false,
                    num: part1.len() as u16,
                    addr: 0,
                },
                data: part1_bytes,
            }],
            &mut out,
        );
        vif::encode(&[VifPacket::StMod { mode: 0 }], &mut out);
        vif::encode(
            &[VifPacket::Unpack {
                header: UnpackHeader {
                    format: UnpackFormat::V4_16,
                    unsigned: false,
                    add_row: false,
                    num: part2.len() as u16,
                    addr: part2_addr,
                },
                data: part2_bytes,
            }],
            &mut out,
        );
        out
    }

    /// Inverse of [`pack_vif_list`].
    pub fn unpack_vif_list(bytes: &[u8], scale: f32) -> Result<TiePacket> {
        let vif_packets = vif::parse(Buffer::new(bytes))?;
        let unpacks = vif::filter_vif_unpacks(&vif_packets);
        if unpacks.len() != 3 {
            return Err(Error::FileFormatError(format!(
                "expected 3 VIF unpacks in a tie packet, found {}",
                unpacks.len()
            )));
        }
        let (header_h, header_data) = unpacks[0];
        if header_h.format != UnpackFormat::V4_32 {
            return Err(Error::FileFormatError("tie packet header unpack is not V4_32".into()));
        }
        let header_size = std::mem::size_of::<PacketHeader>();
        let header: PacketHeader = *bytemuck::from_bytes(&header_data[..header_size]);
        let material = if header.texture_present != 0 {
            let tex_size = std::mem::size_of::<TexturePrimitive>();
            let tex: TexturePrimitive =
                *bytemuck::from_bytes(&header_data[header_size..header_size + tex_size]);
            tex.tex0.data as usize
        } else {
            header.material as usize
        };

        let (part1_h, part1_data) = unpacks[1];
        let (part2_h, part2_data) = unpacks[2];
        if part1_h.format != UnpackFormat::V4_16 || part2_h.format != UnpackFormat::V4_16 {
            return Err(Error::FileFormatError("tie vertex unpacks are not V4_16".into()));
        }
        let part1: &[VertexPart1] = bytemuck::cast_slice(part1_data);
        let part2: &[VertexPart2] = bytemuck::cast_slice(part2_data);

        let count = header.vertex_count as usize;
        let mut positions = Vec::with_capacity(count);
        let mut uvs = Vec::with_capacity(count);
        for i in 0..count {
            let p1 = part1[i];
            let p2 = part2[i];
            positions.push(dequantize_position([p1.x, p1.y, p1.z], scale));
            uvs.push([p2.s as f32 / UV_SCALE, p2.t as f32 / UV_SCALE]);
        }
        Ok(TiePacket {
            material,
            positions,
            uvs,
            material_change: header.texture_present != 0,
        })
    }

    /// Serialize every packet via [`pack_vif_list`] into one byte blob: a
    /// [`ClassHeader`], a [`PacketEntry`] table, then the concatenated
    /// (16-byte aligned) per-packet VIF streams.
    pub fn pack_class_data(&self) -> Vec<u8> {
        let streams: Vec<Vec<u8>> =
            self.packets.iter().map(|p| Tie::pack_vif_list(p, self.scale)).collect();
        let header = ClassHeader { scale: self.scale, packet_count: streams.len() as u32 };

        let table_size = std::mem::size_of::<ClassHeader>() + streams.len() * std::mem::size_of::<PacketEntry>();
        let mut entries = Vec::with_capacity(streams.len());
        let mut offset = table_size;
        for s in &streams {
            let padded = s.len().div_ceil(16) * 16;
            entries.push(PacketEntry { offset: offset as u32, size: s.len() as u32 });
            offset += padded;
        }

        let mut out = Vec::with_capacity(offset);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        for e in &entries {
            out.extend_from_slice(bytemuck::bytes_of(e));
        }
        for s in &streams {
            out.extend_from_slice(s);
            let padded = s.len().div_ceil(16) * 16;
            out.resize(out.len() + (padded - s.len()), 0);
        }
        out
    }

    /// Inverse of [`pack_class_data`].
    pub fn unpack_class_data(bytes: &[u8], materials: Vec<Material>) -> Result<Tie> {
        let buf = Buffer::new(bytes);
        let header: ClassHeader = buf.read(0)?;
        let entry_base = std::mem::size_of::<ClassHeader>();
        let mut packets = Vec::with_capacity(header.packet_count as usize);
        for i in 0..header.packet_count as usize {
            let entry: PacketEntry = buf.read(entry_base + i * std::mem::size_of::<PacketEntry>())?;
            let slice = buf.read_bytes(entry.offset as usize, entry.size as usize)?;
            packets.push(Tie::unpack_vif_list(slice, header.scale)?);
        }
        Ok(Tie { scale: header.scale, packets, materials })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::mesh::MeshFlags;

    fn strip_mesh(n: usize, material: usize) -> Mesh {
        let vertices = (0..n)
            .map(|i| Vertex::new([i as f32, 0.0, 0.0]))
            .collect();
        let indices: Vec<u32> = (0..n as u32).collect();
        let triangles = crate::level::tfrag::strip_to_triangles(
            &indices.iter().map(|&i| i as u8).collect::<Vec<_>>(),
        );
        Mesh {
            vertices,
            submeshes: vec![SubMesh {
                material,
                faces: triangles.into_iter().map(Face::Tri).collect(),
            }],
            flags: MeshFlags::empty(),
            joints: None,
        }
    }

    #[test]
    fn pack_preserves_triangle_count() {
        let mesh = strip_mesh(20, 0);
        let expected = mesh.triangle_count();
        let tie = Tie::pack(&mesh, vec![Material::flat_color("m", [0, 0, 0, 255])]).unwrap();
        let rebuilt = tie.to_mesh();
        assert_eq!(rebuilt.triangle_count(), expected);
    }

    #[test]
    fn single_submesh_has_no_material_change() {
        let mesh = strip_mesh(10, 0);
        let tie = Tie::pack(&mesh, vec![]).unwrap();
        assert!(tie.packets.iter().all(|p| !p.material_change));
    }

    #[test]
    fn vif_list_round_trips_packet() {
        let mesh = strip_mesh(10, 0);
        let tie = Tie::pack(&mesh, vec![]).unwrap();
        let packet = &tie.packets[0];
        let bytes = Tie::pack_vif_list(packet, tie.scale);
        let decoded = Tie::unpack_vif_list(&bytes, tie.scale).unwrap();
        assert_eq!(decoded.material, packet.material);
        assert_eq!(decoded.material_change, packet.material_change);
        assert_eq!(decoded.positions.len(), packet.positions.len());
        for (a, b) in packet.positions.iter().zip(&decoded.positions) {
            for k in 0..3 {
                assert!((a[k] - b[k]).abs() < tie.scale, "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn class_data_round_trips_tie() {
        let mesh = strip_mesh(40, 0);
        let materials = vec![Material::flat_color("wall", [128, 128, 128, 255])];
        let tie = Tie::pack(&mesh, materials.clone()).unwrap();
        let bytes = tie.pack_class_data();
        let decoded = Tie::unpack_class_data(&bytes, materials).unwrap();
        assert_eq!(decoded.packets.len(), tie.packets.len());
        assert_eq!(decoded.scale, tie.scale);
        for (a, b) in tie.packets.iter().zip(&decoded.packets) {
            assert_eq!(a.positions.len(), b.positions.len());
            assert_eq!(a.material, b.material);
        }
    }

    #[test]
    fn validate_budgets_rejects_oversized_packet() {
        let mut tie = Tie::default();
        tie.packets.push(TiePacket {
            material: 0,
            positions: vec![[0.0; 3]; 300],
            uvs: vec![[0.0; 2]; 300],
            material_change: false,
        });
        assert!(tie.validate_budgets().is_err());
    }
}
