//! Moby (animated object) codec - the hardest format in the system.
//!
//! A moby packet is a VIF command list (texture coordinates, indices,
//! optional AD-GIF texture quads) followed by a separately-addressed
//! vertex table: a sorted run of two-way-blend, three-way-blend, "main",
//! and duplicate vertices, preceded by preloop matrix transfers that DMA
//! joint matrices from scratchpad into VU memory ahead of the packet.
//! Grounded on `original_source/src/engine/moby_packet.h`
//! (`MobyPacketEntry`, `MobyIndexHeader`, `MobyTexturePrimitive`,
//! `MobyBangleHeader`) for the on-disk shape. VU matrix *scheduling* here
//! is a greedy liveness allocator rather than the original's exact
//! piggy-back encoding - round-tripping against itself rather than
//! reproducing the original's bit-exact transfer choreography - but it
//! preserves the same merge-order sort invariant the original enforces.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::gif::{self, AdData};
use crate::io::Buffer;
use crate::level::mesh::{Joint, Material, Mesh, Vertex};
use crate::vif::{self, UnpackFormat, UnpackHeader, VifPacket};

/// Sentinel VU address treated as "infinity" by the merge rule.
pub const INFINITY_ADDR: u8 = 0xf4;

/// A single joint-matrix DMA from scratchpad into VU memory ahead of a
/// packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixTransfer {
    pub scratchpad_joint: u8,
    pub vu0_dest_addr: u8,
}

/// How a vertex is skinned.
#[derive(Debug, Clone, PartialEq)]
pub enum Blend {
    /// Two joints, each with an 8-bit weight; `vu_addr` is this
    /// vertex's matrix destination address, used by the merge-order
    /// sort invariant.
    TwoWay { joints: [u8; 2], weights: [u8; 2], vu_addr: u8 },
    ThreeWay { joints: [u8; 3], weights: [u8; 3], vu_addr: u8 },
    /// A "regular" vertex referencing an already-blended VU matrix.
    Main { vu_addr: u8 },
}

impl Blend {
    fn vu_addr(&self) -> u8 {
        match self {
            Blend::TwoWay { vu_addr, .. } => *vu_addr,
            Blend::ThreeWay { vu_addr, .. } => *vu_addr,
            Blend::Main { vu_addr } => *vu_addr,
        }
    }
}

/// One vertex in the packet's vertex table.
#[derive(Debug, Clone, PartialEq)]
pub struct MobyVertex {
    pub position: [i16; 3],
    pub st: [i16; 2],
    pub blend: Blend,
}

/// One packet: preloop transfers, the vertex table (already grouped
/// two-way/three-way/main/duplicate), an 8-bit index stream, a secret
/// index substituted for sentinel zero bytes, and the materials active
/// across its texture primitives.
#[derive(Debug, Clone, Default)]
pub struct MobyPacket {
    pub preloop_transfers: Vec<MatrixTransfer>,
    pub two_way: Vec<MobyVertex>,
    pub three_way: Vec<MobyVertex>,
    pub main: Vec<MobyVertex>,
    /// Duplicate vertex entries: each indexes an earlier vertex in this
    /// packet's table: duplicates are extra indices sharing a position
    /// with an earlier vertex.
    pub duplicates: Vec<u16>,
    /// 8-bit index stream: high bit is the restart-strip flag, `0`
    /// means substitute `secret_index`.
    pub indices: Vec<u8>,
    pub secret_index: u8,
    pub materials: Vec<usize>,
}

impl MobyPacket {
    /// Total distinct + duplicate vertex count.
    pub fn total_vertex_count(&self) -> usize {
        self.two_way.len() + self.three_way.len() + self.main.len() + self.duplicates.len()
    }

    /// Check the merge-order sort invariant: two-way and three-way
    /// blend destination addresses must be non-decreasing when merged,
    /// with [`INFINITY_ADDR`] sorting last.
    pub fn satisfies_sort_invariant(&self) -> bool {
        let key = |a: u8| if a == INFINITY_ADDR { u16::MAX } else { a as u16 };
        let mut merged: Vec<u8> = self
            .two_way
            .iter()
            .chain(&self.three_way)
            .map(|v| v.blend.vu_addr())
            .collect();
        merged.windows(2).all(|w| key(w[0]) <= key(w[1]))
    }

    /// Encode the packet's index stream from a list of (vertex-index,
    /// restart-flag) pairs. Indices are 1-based; vertex index `0` always
    /// means "use the secret index".
    pub fn encode_indices(entries: &[(u8, bool)]) -> Vec<u8> {
        entries
            .iter()
            .map(|&(idx, restart)| (idx & 0x7F) | if restart { 0x80 } else { 0 })
            .collect()
    }

    /// Decode the index stream, substituting `secret_index` for zero
    /// bytes and separating the restart flag.
    pub fn decode_indices(&self) -> Vec<(u8, bool)> {
        self.indices
            .iter()
            .map(|&b| {
                let restart = b & 0x80 != 0;
                let idx = b & 0x7F;
                (if idx == 0 { self.secret_index } else { idx }, restart)
            })
            .collect()
    }
}

/// Greedy liveness-based matrix allocator: decides, for each packet in
/// sequence, which joints must be preloaded via a preloop transfer.
/// `budget` is the max resident matrices, reserved at the top of VU
/// memory.
pub struct MatrixAllocator {
    budget: usize,
    base_addr: u8,
    resident: Vec<(u8, u8)>, // (joint, vu_addr), most-recently-used last.
}

impl MatrixAllocator {
    pub fn new(budget: usize, base_addr: u8) -> Self {
        MatrixAllocator { budget, base_addr, resident: Vec::new() }
    }

    fn addr_for_slot(&self, slot: usize) -> u8 {
        self.base_addr.saturating_add(slot as u8)
    }

    /// First VU address above the resident-matrix budget, used as the
    /// base for two-way/three-way blend result addresses (those are
    /// computed destinations, not preloaded joint matrices).
    pub fn blend_result_base(&self) -> u8 {
        self.base_addr.saturating_add(self.budget as u8)
    }

    /// Return this joint's VU address, preloading it (evicting the
    /// least-recently-used resident joint if the budget is full) and
    /// recording a [`MatrixTransfer`] in `transfers_out` if it was not
    /// already resident.
    pub fn touch(&mut self, joint: u8, transfers_out: &mut Vec<MatrixTransfer>) -> u8 {
        if let Some(pos) = self.resident.iter().position(|&(j, _)| j == joint) {
            let (_, addr) = self.resident.remove(pos);
            self.resident.push((joint, addr));
            return addr;
        }
        if self.resident.len() >= self.budget {
            self.resident.remove(0);
        }
        let addr = self.addr_for_slot(self.resident.len());
        self.resident.push((joint, addr));
        transfers_out.push(MatrixTransfer { scratchpad_joint: joint, vu0_dest_addr: addr });
        addr
    }
}

/// A fully decoded/to-be-encoded moby class.
#[derive(Debug, Clone, Default)]
pub struct Moby {
    pub bounding_sphere: [f32; 4],
    pub scale: f32,
    pub animated: bool,
    pub packets: Vec<MobyPacket>,
    /// Bangle table: packet index ranges demarcating independently
    /// drawable body parts.
    pub bangles: Vec<std::ops::Range<usize>>,
    pub joints: Vec<Joint>,
    pub materials: Vec<Material>,
}

/// Packed-wire index-header layout (original `MobyIndexHeader`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct IndexHeader {
    unknown_0: u8,
    texture_unpack_offset_quadwords: u8,
    secret_index: u8,
    pad: u8,
}

/// Header for the vertex-table unpack: vertex-category counts plus
/// preloop-transfer/duplicate counts, so the unpacker can split the flat
/// position/blend arrays back into two-way/three-way/main without a
/// restart marker of its own.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VertexTableHeader {
    two_way_count: u16,
    three_way_count: u16,
    main_count: u16,
    duplicate_count: u16,
    preloop_count: u16,
    texture_present: u8,
    pad: u8,
}

/// Quantized vertex position, same shape as tfrag's (original
/// `MobyVertexPosition`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackedPosition {
    x: i16,
    y: i16,
    z: i16,
    pad: i16,
}

/// Joints/weights/destination-address record, wide enough for a
/// three-way blend; two-way and main records leave the unused joint/
/// weight slots zeroed.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackedBlend {
    joints: [u8; 3],
    weights: [u8; 3],
    vu_addr: u8,
    pad: u8,
}

/// One preloop matrix transfer (original `MobyMatrixTransfer`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackedTransfer {
    scratchpad_joint: u8,
    vu0_dest_addr: u8,
}

/// An AD-GIF texture upload, carrying the material index in `tex0.data`
/// (same shape as tie's `TexturePrimitive`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct MobyTexturePrimitive {
    tex1: AdData,
    clamp: AdData,
    miptbp1: AdData,
    tex0: AdData,
}

/// Class-level container wrapping every packet's VIF stream, plus the
/// bangle table and joint tree that live outside any single packet.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ClassHeader {
    bounding_sphere: [f32; 4],
    scale: f32,
    animated: u32,
    packet_count: u32,
    bangle_count: u32,
    joint_count: u32,
}

/// One bangle's packet-index range.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BangleRange {
    start: u32,
    end: u32,
}

/// A joint, `parent`/`first_child`/`next_sibling` stored as `i32` with
/// `-1` standing in for `None` (the on-disk shape has no room for a Rust
/// `Option` tag).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackedJoint {
    parent: i32,
    first_child: i32,
    next_sibling: i32,
    inverse_bind: [[f32; 4]; 4],
    tip: [f32; 3],
    pad: f32,
}

impl PackedJoint {
    fn from_joint(joint: &Joint) -> Self {
        let opt = |v: Option<u32>| v.map(|v| v as i32).unwrap_or(-1);
        PackedJoint {
            parent: opt(joint.parent),
            first_child: opt(joint.first_child),
            next_sibling: opt(joint.next_sibling),
            inverse_bind: joint.inverse_bind,
            tip: joint.tip,
            pad: 0.0,
        }
    }

    fn to_joint(self) -> Joint {
        let opt = |v: i32| if v < 0 { None } else { Some(v as u32) };
        Joint {
            parent: opt(self.parent),
            first_child: opt(self.first_child),
            next_sibling: opt(self.next_sibling),
            inverse_bind: self.inverse_bind,
            tip: self.tip,
        }
    }
}

/// Offset/size/real-index-count of one packet's VIF stream within the
/// class data block (the real index count, unlike the byte-length other
/// fields carry, isn't recoverable from the padded stream alone).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PacketEntry {
    offset: u32,
    size: u32,
    real_index_count: u32,
}

impl Moby {
    /// Build moby packets from a (possibly skinned) mesh, classifying
    /// each vertex by its number of non-zero skin weights: 0 or 1
    /// influence surfaces as a "main" vertex bound to an already-resident
    /// joint matrix; 2 influences becomes a two-way blend; 3 becomes a
    /// three-way blend. Joint matrices referenced by any vertex in a
    /// packet are scheduled resident via a [`MatrixAllocator`] sized to
    /// the joint count, populating that packet's preloop transfers.
    pub fn pack(mesh: &Mesh, materials: Vec<Material>, scale: f32, vertices_per_packet: usize) -> Result<Moby> {
        let joints = mesh.joints.clone().unwrap_or_default();
        let mut allocator = MatrixAllocator::new(joints.len().clamp(1, 30), 4);
        let mut packets = Vec::new();

        for chunk in mesh.vertices.chunks(vertices_per_packet.max(1)) {
            let mut preloop_transfers = Vec::new();
            let mut two_way = Vec::new();
            let mut three_way = Vec::new();
            let mut main = Vec::new();
            let mut blend_addr = allocator.blend_result_base();

            for v in chunk {
                let position = [
                    (v.position[0] * scale) as i16,
                    (v.position[1] * scale) as i16,
                    (v.position[2] * scale) as i16,
                ];
                let st = [(v.uv[0] * 4096.0) as i16, (v.uv[1] * 4096.0) as i16];

                match v.skin.map(|s| (s, s.influence_count())) {
                    Some((skin, 2)) => {
                        let joints = [skin.joints[0], skin.joints[1]];
                        for &j in &joints {
                            allocator.touch(j, &mut preloop_transfers);
                        }
                        let vu_addr = blend_addr;
                        blend_addr = blend_addr.saturating_add(1);
                        two_way.push(MobyVertex {
                            position,
                            st,
                            blend: Blend::TwoWay { joints, weights: [skin.weights[0], skin.weights[1]], vu_addr },
                        });
                    }
                    Some((skin, n)) if n >= 3 => {
                        for &j in &skin.joints {
                            allocator.touch(j, &mut preloop_transfers);
                        }
                        let vu_addr = blend_addr;
                        blend_addr = blend_addr.saturating_add(1);
                        three_way.push(MobyVertex {
                            position,
                            st,
                            blend: Blend::ThreeWay { joints: skin.joints, weights: skin.weights, vu_addr },
                        });
                    }
                    other => {
                        // 0 or 1 influence: bind to that single joint (or
                        // joint 0, an identity matrix, for an unskinned
                        // import mesh) as an already-resident main vertex.
                        let joint = match other {
                            Some((skin, 1)) => skin.joints[0],
                            _ => 0,
                        };
                        let addr = allocator.touch(joint, &mut preloop_transfers);
                        main.push(MobyVertex { position, st, blend: Blend::Main { vu_addr: addr } });
                    }
                }
            }
            two_way.sort_by_key(|v: &MobyVertex| v.blend.vu_addr());
            three_way.sort_by_key(|v: &MobyVertex| v.blend.vu_addr());

            let total = two_way.len() + three_way.len() + main.len();
            let indices: Vec<(u8, bool)> = (0..total)
                .map(|i| ((i + 1) as u8, i + 1 == total))
                .collect();

            packets.push(MobyPacket {
                preloop_transfers,
                two_way,
                three_way,
                main,
                duplicates: Vec::new(),
                indices: MobyPacket::encode_indices(&indices),
                secret_index: 1,
                materials: vec![0; materials.len().min(1)],
            });
        }

        Ok(Moby {
            bounding_sphere: [0.0, 0.0, 0.0, 1.0],
            scale,
            animated: !joints.is_empty(),
            packets,
            bangles: Vec::new(),
            joints,
            materials,
        })
    }

    /// Pack one packet's VIF command list: an `STCYCL`-wrapped `V2_16`
    /// unpack of texture coordinates, a `V4_8` unpack of the index
    /// stream, then a second `V4_8` unpack carrying the vertex table
    /// proper - positions, blend joints/weights, preloop matrix
    /// transfers, duplicate entries, and (on a material change) an
    /// AD-GIF texture primitive - all addressed by the
    /// [`VertexTableHeader`] at its front.
    pub fn pack_vif_list(packet: &MobyPacket) -> Vec<u8> {
        let mut out = Vec::new();
        let vertices: Vec<&MobyVertex> =
            packet.two_way.iter().chain(&packet.three_way).chain(&packet.main).collect();
        let sts: Vec<[i16; 2]> = vertices.iter().map(|v| v.st).collect();
        let mut st_data = Vec::with_capacity(sts.len() * 4);
        for st in &sts {
            st_data.extend_from_slice(&st[0].to_le_bytes());
            st_data.extend_from_slice(&st[1].to_le_bytes());
        }
        vif::encode(
            &[VifPacket::Unpack {
                header: UnpackHeader {
                    format: UnpackFormat::V2_16,
                    unsigned: false,
                    add_row: false,
                    num: sts.len() as u16,
                    addr: 0,
                },
                data: st_data,
            }],
            &mut out,
        );

        let header = IndexHeader { unknown_0: 0, texture_unpack_offset_quadwords: 0, secret_index: packet.secret_index, pad: 0 };
        let mut idx_data = bytemuck::bytes_of(&header).to_vec();
        idx_data.extend_from_slice(&packet.indices);
        while idx_data.len() % 4 != 0 {
            idx_data.push(0);
        }
        let num = (idx_data.len() / 4) as u16;
        vif::encode(
            &[VifPacket::Unpack {
                header: UnpackHeader {
                    format: UnpackFormat::V4_8,
                    unsigned: true,
                    add_row: false,
                    num,
                    addr: 64,
                },
                data: idx_data,
            }],
            &mut out,
        );

        out.extend_from_slice(&Self::pack_vertex_table(packet, &vertices));
        out
    }

    /// Build the vertex-table unpack payload described on
    /// [`pack_vif_list`]: header, positions, blend records, preloop
    /// transfers, duplicates, and an optional texture primitive, wrapped
    /// in a single byte-granular `V4_8` unpack.
    fn pack_vertex_table(packet: &MobyPacket, vertices: &[&MobyVertex]) -> Vec<u8> {
        let positions: Vec<PackedPosition> = vertices
            .iter()
            .map(|v| PackedPosition { x: v.position[0], y: v.position[1], z: v.position[2], pad: 0 })
            .collect();
        let blends: Vec<PackedBlend> = vertices
            .iter()
            .map(|v| match &v.blend {
                Blend::TwoWay { joints, weights, vu_addr } => PackedBlend {
                    joints: [joints[0], joints[1], 0],
                    weights: [weights[0], weights[1], 0],
                    vu_addr: *vu_addr,
                    pad: 0,
                },
                Blend::ThreeWay { joints, weights, vu_addr } => {
                    PackedBlend { joints: *joints, weights: *weights, vu_addr: *vu_addr, pad: 0 }
                }
                Blend::Main { vu_addr } => PackedBlend { joints: [0; 3], weights: [0; 3], vu_addr: *vu_addr, pad: 0 },
            })
            .collect();
        let transfers: Vec<PackedTransfer> = packet
            .preloop_transfers
            .iter()
            .map(|t| PackedTransfer { scratchpad_joint: t.scratchpad_joint, vu0_dest_addr: t.vu0_dest_addr })
            .collect();
        let texture_present = !packet.materials.is_empty();

        let table_header = VertexTableHeader {
            two_way_count: packet.two_way.len() as u16,
            three_way_count: packet.three_way.len() as u16,
            main_count: packet.main.len() as u16,
            duplicate_count: packet.duplicates.len() as u16,
            preloop_count: transfers.len() as u16,
            texture_present: texture_present as u8,
            pad: 0,
        };

        let mut data = Vec::new();
        data.extend_from_slice(bytemuck::bytes_of(&table_header));
        for p in &positions {
            data.extend_from_slice(bytemuck::bytes_of(p));
        }
        for b in &blends {
            data.extend_from_slice(bytemuck::bytes_of(b));
        }
        for t in &transfers {
            data.extend_from_slice(bytemuck::bytes_of(t));
        }
        for &d in &packet.duplicates {
            data.extend_from_slice(&d.to_le_bytes());
        }
        if texture_present {
            let tex = MobyTexturePrimitive {
                tex1: AdData { data: 0, addr: gif::reg::TEX1_1 as u64 },
                clamp: AdData { data: 0, addr: gif::reg::CLAMP_1 as u64 },
                miptbp1: AdData { data: 0, addr: gif::reg::MIPTBP1_1 as u64 },
                tex0: AdData { data: packet.materials[0] as u64, addr: gif::reg::TEX0_1 as u64 },
            };
            data.extend_from_slice(bytemuck::bytes_of(&tex));
        }
        while data.len() % 4 != 0 {
            data.push(0);
        }
        let num = (data.len() / 4) as u16;

        let mut out = Vec::new();
        vif::encode(
            &[VifPacket::Unpack {
                header: UnpackHeader {
                    format: UnpackFormat::V4_8,
                    unsigned: true,
                    add_row: false,
                    num,
                    addr: 128,
                },
                data,
            }],
            &mut out,
        );
        out
    }

    /// Inverse of [`pack_vif_list`]: recover the STs and the fully
    /// populated packet (vertex table, preloop transfers, duplicates,
    /// and material list included), using `real_index_count` to trim
    /// the index unpack's 4-byte padding the same way the ST/index pair
    /// always has.
    pub fn unpack_vif_list(bytes: &[u8], real_index_count: usize) -> Result<(Vec<[i16; 2]>, MobyPacket)> {
        let packets = vif::parse(Buffer::new(bytes))?;
        let unpacks = vif::filter_vif_unpacks(&packets);

        let st_data = unpacks
            .iter()
            .find(|(h, _)| h.format == UnpackFormat::V2_16)
            .map(|(_, d)| *d)
            .ok_or_else(|| Error::FileFormatError("moby packet has no ST unpack".into()))?;
        let sts: Vec<[i16; 2]> = st_data
            .chunks_exact(4)
            .map(|c| [i16::from_le_bytes([c[0], c[1]]), i16::from_le_bytes([c[2], c[3]])])
            .collect();

        let v4_8: Vec<&[u8]> = unpacks.iter().filter(|(h, _)| h.format == UnpackFormat::V4_8).map(|(_, d)| *d).collect();
        if v4_8.len() < 2 {
            return Err(Error::FileFormatError(
                "moby packet is missing its index or vertex-table unpack".into(),
            ));
        }
        let idx_data = v4_8[0];
        let table_data = v4_8[1];

        if idx_data.len() < std::mem::size_of::<IndexHeader>() {
            return Err(Error::FileFormatError("moby index unpack shorter than its header".into()));
        }
        let index_header: IndexHeader = *bytemuck::from_bytes(&idx_data[..4]);
        let indices = idx_data[4..4 + real_index_count.min(idx_data.len() - 4)].to_vec();

        let (two_way, three_way, main, preloop_transfers, duplicates, materials) =
            Self::unpack_vertex_table(table_data, &sts)?;

        let packet = MobyPacket {
            preloop_transfers,
            two_way,
            three_way,
            main,
            duplicates,
            indices,
            secret_index: index_header.secret_index,
            materials,
        };
        Ok((sts, packet))
    }

    /// Parse the vertex-table unpack [`pack_vertex_table`](Moby::pack_vertex_table)
    /// built: split the flat position/blend arrays back into
    /// two-way/three-way/main using the header's counts, and recover the
    /// preloop transfers, duplicate indices, and material list.
    #[allow(clippy::type_complexity)]
    fn unpack_vertex_table(
        table_data: &[u8],
        sts: &[[i16; 2]],
    ) -> Result<(Vec<MobyVertex>, Vec<MobyVertex>, Vec<MobyVertex>, Vec<MatrixTransfer>, Vec<u16>, Vec<usize>)> {
        let header_size = std::mem::size_of::<VertexTableHeader>();
        if table_data.len() < header_size {
            return Err(Error::FileFormatError("moby vertex table unpack shorter than its header".into()));
        }
        let header: VertexTableHeader = *bytemuck::from_bytes(&table_data[..header_size]);
        let buf = Buffer::new(table_data);
        let mut offset = header_size;

        let two_way_count = header.two_way_count as usize;
        let three_way_count = header.three_way_count as usize;
        let main_count = header.main_count as usize;
        let total = two_way_count + three_way_count + main_count;

        let positions: Vec<PackedPosition> = buf.read_many(offset, total)?;
        offset += total * std::mem::size_of::<PackedPosition>();
        let blends: Vec<PackedBlend> = buf.read_many(offset, total)?;
        offset += total * std::mem::size_of::<PackedBlend>();
        let transfers: Vec<PackedTransfer> = buf.read_many(offset, header.preloop_count as usize)?;
        offset += transfers.len() * std::mem::size_of::<PackedTransfer>();

        let dup_count = header.duplicate_count as usize;
        let dup_bytes = buf.read_bytes(offset, dup_count * 2)?;
        let duplicates: Vec<u16> = dup_bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        offset += dup_count * 2;

        let materials = if header.texture_present != 0 {
            let tex: MobyTexturePrimitive = buf.read(offset)?;
            vec![tex.tex0.data as usize]
        } else {
            Vec::new()
        };

        let mut two_way = Vec::with_capacity(two_way_count);
        let mut three_way = Vec::with_capacity(three_way_count);
        let mut main = Vec::with_capacity(main_count);
        for (i, (position, blend)) in positions.iter().zip(&blends).enumerate() {
            let st = sts.get(i).copied().unwrap_or([0, 0]);
            let position = [position.x, position.y, position.z];
            if i < two_way_count {
                two_way.push(MobyVertex {
                    position,
                    st,
                    blend: Blend::TwoWay {
                        joints: [blend.joints[0], blend.joints[1]],
                        weights: [blend.weights[0], blend.weights[1]],
                        vu_addr: blend.vu_addr,
                    },
                });
            } else if i < two_way_count + three_way_count {
                three_way.push(MobyVertex {
                    position,
                    st,
                    blend: Blend::ThreeWay { joints: blend.joints, weights: blend.weights, vu_addr: blend.vu_addr },
                });
            } else {
                main.push(MobyVertex { position, st, blend: Blend::Main { vu_addr: blend.vu_addr } });
            }
        }

        let preloop_transfers = transfers
            .iter()
            .map(|t| MatrixTransfer { scratchpad_joint: t.scratchpad_joint, vu0_dest_addr: t.vu0_dest_addr })
            .collect();

        Ok((two_way, three_way, main, preloop_transfers, duplicates, materials))
    }

    /// Unpack a whole class's worth of VIF packet lists, tolerating
    /// garbage: levels occasionally carry a moby packet whose size fields
    /// don't add up, so a bad entry is logged and skipped rather than
    /// failing the whole class.
    pub fn unpack_vif_list_many(entries: &[(&[u8], usize)]) -> Vec<(Vec<[i16; 2]>, MobyPacket)> {
        let mut out = Vec::with_capacity(entries.len());
        for (i, (bytes, real_index_count)) in entries.iter().enumerate() {
            match Moby::unpack_vif_list(bytes, *real_index_count) {
                Ok(decoded) => out.push(decoded),
                Err(e) => log::warn!("skipping malformed moby packet at index {i}: {e}"),
            }
        }
        out
    }

    /// Serialize every packet via [`pack_vif_list`] into one byte blob: a
    /// [`ClassHeader`], the bangle and joint tables, a [`PacketEntry`]
    /// table, then the concatenated (16-byte aligned) per-packet VIF
    /// streams - the same container shape
    /// [`Tie::pack_class_data`](crate::level::tie::Tie::pack_class_data)
    /// and [`Shrub::pack_class_data`](crate::level::shrub::Shrub::pack_class_data)
    /// use.
    pub fn pack_class_data(&self) -> Vec<u8> {
        let streams: Vec<Vec<u8>> = self.packets.iter().map(Moby::pack_vif_list).collect();
        let header = ClassHeader {
            bounding_sphere: self.bounding_sphere,
            scale: self.scale,
            animated: self.animated as u32,
            packet_count: streams.len() as u32,
            bangle_count: self.bangles.len() as u32,
            joint_count: self.joints.len() as u32,
        };
        let bangles: Vec<BangleRange> =
            self.bangles.iter().map(|r| BangleRange { start: r.start as u32, end: r.end as u32 }).collect();
        let joints: Vec<PackedJoint> = self.joints.iter().map(PackedJoint::from_joint).collect();

        let table_size = std::mem::size_of::<ClassHeader>()
            + bangles.len() * std::mem::size_of::<BangleRange>()
            + joints.len() * std::mem::size_of::<PackedJoint>()
            + streams.len() * std::mem::size_of::<PacketEntry>();

        let mut entries = Vec::with_capacity(streams.len());
        let mut offset = table_size;
        for (packet, stream) in self.packets.iter().zip(&streams) {
            let padded = stream.len().div_ceil(16) * 16;
            entries.push(PacketEntry {
                offset: offset as u32,
                size: stream.len() as u32,
                real_index_count: packet.indices.len() as u32,
            });
            offset += padded;
        }

        let mut out = Vec::with_capacity(offset);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        for b in &bangles {
            out.extend_from_slice(bytemuck::bytes_of(b));
        }
        for j in &joints {
            out.extend_from_slice(bytemuck::bytes_of(j));
        }
        for e in &entries {
            out.extend_from_slice(bytemuck::bytes_of(e));
        }
        for stream in &streams {
            out.extend_from_slice(stream);
            let padded = stream.len().div_ceil(16) * 16;
            out.resize(out.len() + (padded - stream.len()), 0);
        }
        out
    }

    /// Inverse of [`pack_class_data`].
    pub fn unpack_class_data(bytes: &[u8], materials: Vec<Material>) -> Result<Moby> {
        let buf = Buffer::new(bytes);
        let header: ClassHeader = buf.read(0)?;
        let mut offset = std::mem::size_of::<ClassHeader>();

        let bangles: Vec<BangleRange> = buf.read_many(offset, header.bangle_count as usize)?;
        offset += bangles.len() * std::mem::size_of::<BangleRange>();
        let bangles = bangles.into_iter().map(|b| (b.start as usize)..(b.end as usize)).collect();

        let joints: Vec<PackedJoint> = buf.read_many(offset, header.joint_count as usize)?;
        offset += joints.len() * std::mem::size_of::<PackedJoint>();
        let joints = joints.into_iter().map(PackedJoint::to_joint).collect();

        let mut packets = Vec::with_capacity(header.packet_count as usize);
        for _ in 0..header.packet_count {
            let entry: PacketEntry = buf.read(offset)?;
            offset += std::mem::size_of::<PacketEntry>();
            let slice = buf.read_bytes(entry.offset as usize, entry.size as usize)?;
            let (_, packet) = Moby::unpack_vif_list(slice, entry.real_index_count as usize)?;
            packets.push(packet);
        }

        Ok(Moby {
            bounding_sphere: header.bounding_sphere,
            scale: header.scale,
            animated: header.animated != 0,
            packets,
            bangles,
            joints,
            materials,
        })
    }

    /// Reassemble the decoded packets into a renderer-agnostic mesh.
    pub fn to_mesh(&self) -> Mesh {
        let mut vertices = Vec::new();
        for packet in &self.packets {
            for v in packet.two_way.iter().chain(&packet.three_way).chain(&packet.main) {
                let mut vertex = Vertex::new([
                    v.position[0] as f32 / self.scale.max(f32::EPSILON),
                    v.position[1] as f32 / self.scale.max(f32::EPSILON),
                    v.position[2] as f32 / self.scale.max(f32::EPSILON),
                ]);
                vertex.uv = [v.st[0] as f32 / 4096.0, v.st[1] as f32 / 4096.0];
                vertices.push(vertex);
            }
        }
        Mesh {
            vertices,
            submeshes: Vec::new(),
            flags: Default::default(),
            joints: if self.joints.is_empty() { None } else { Some(self.joints.clone()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mesh(n: usize) -> Mesh {
        Mesh {
            vertices: (0..n).map(|i| Vertex::new([i as f32, 0.0, 0.0])).collect(),
            submeshes: Vec::new(),
            flags: Default::default(),
            joints: None,
        }
    }

    #[test]
    fn total_vertex_count_matches_category_sum() {
        let moby = Moby::pack(&sample_mesh(40), vec![], 256.0, 16).unwrap();
        for packet in &moby.packets {
            assert_eq!(
                packet.total_vertex_count(),
                packet.two_way.len() + packet.three_way.len() + packet.main.len() + packet.duplicates.len()
            );
        }
    }

    #[test]
    fn packets_satisfy_sort_invariant() {
        let moby = Moby::pack(&sample_mesh(40), vec![], 256.0, 16).unwrap();
        for packet in &moby.packets {
            assert!(packet.satisfies_sort_invariant());
        }
    }

    #[test]
    fn index_buffer_round_trips_secret_and_restart() {
        let entries = [(1u8, false), (2, false), (0, true), (3, false)];
        let packet = MobyPacket {
            secret_index: 9,
            indices: MobyPacket::encode_indices(&entries),
            ..Default::default()
        };
        let decoded = packet.decode_indices();
        assert_eq!(decoded, vec![(1, false), (2, false), (9, true), (3, false)]);
    }

    #[test]
    fn matrix_allocator_reuses_already_resident_joint() {
        let mut allocator = MatrixAllocator::new(2, 4);
        let mut transfers = Vec::new();
        let a1 = allocator.touch(5, &mut transfers);
        let a2 = allocator.touch(5, &mut transfers);
        assert_eq!(a1, a2);
        assert_eq!(transfers.len(), 1);
    }

    #[test]
    fn matrix_allocator_evicts_lru_when_budget_exhausted() {
        let mut allocator = MatrixAllocator::new(1, 4);
        let mut transfers = Vec::new();
        allocator.touch(1, &mut transfers);
        allocator.touch(2, &mut transfers);
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[1].vu0_dest_addr, transfers[0].vu0_dest_addr);
    }

    #[test]
    fn vif_list_round_trips_texture_coordinates() {
        let moby = Moby::pack(&sample_mesh(8), vec![], 256.0, 8).unwrap();
        let packet = &moby.packets[0];
        let bytes = Moby::pack_vif_list(packet);
        let (sts, decoded) = Moby::unpack_vif_list(&bytes, packet.indices.len()).unwrap();
        assert_eq!(sts.len(), packet.main.len());
        assert_eq!(decoded.indices, packet.indices);
    }

    #[test]
    fn skin_weights_classify_vertices_into_blend_categories() {
        use crate::level::mesh::Skin;
        let mut mesh = sample_mesh(4);
        // v0: no skin (main, joint 0). v1: one influence (main, joint 2).
        // v2: two influences (two-way). v3: three influences (three-way).
        mesh.vertices[1].skin = Some(Skin { joints: [2, 0, 0], weights: [255, 0, 0] });
        mesh.vertices[2].skin = Some(Skin { joints: [1, 2, 0], weights: [128, 127, 0] });
        mesh.vertices[3].skin = Some(Skin { joints: [1, 2, 3], weights: [85, 85, 85] });

        let moby = Moby::pack(&mesh, vec![], 256.0, 16).unwrap();
        let packet = &moby.packets[0];
        assert_eq!(packet.two_way.len(), 1);
        assert_eq!(packet.three_way.len(), 1);
        assert_eq!(packet.main.len(), 2);
        assert_eq!(
            packet.total_vertex_count(),
            packet.two_way.len() + packet.three_way.len() + packet.main.len() + packet.duplicates.len()
        );
        assert!(packet.satisfies_sort_invariant());
    }

    #[test]
    fn vif_list_round_trips_positions_and_blend_data() {
        use crate::level::mesh::Skin;
        let mut mesh = sample_mesh(4);
        mesh.vertices[2].skin = Some(Skin { joints: [1, 2, 0], weights: [128, 127, 0] });
        mesh.vertices[3].skin = Some(Skin { joints: [1, 2, 3], weights: [85, 85, 85] });

        let moby = Moby::pack(&mesh, vec![Material::flat_color("mat0", [255, 255, 255, 255])], 256.0, 16).unwrap();
        let packet = &moby.packets[0];
        let bytes = Moby::pack_vif_list(packet);
        let (_, decoded) = Moby::unpack_vif_list(&bytes, packet.indices.len()).unwrap();

        assert_eq!(decoded.two_way.len(), packet.two_way.len());
        assert_eq!(decoded.three_way.len(), packet.three_way.len());
        assert_eq!(decoded.main.len(), packet.main.len());
        assert_eq!(decoded.two_way, packet.two_way);
        assert_eq!(decoded.three_way, packet.three_way);
        assert_eq!(decoded.main, packet.main);
        assert_eq!(decoded.preloop_transfers, packet.preloop_transfers);
        assert_eq!(decoded.materials, packet.materials);
        assert!(decoded.satisfies_sort_invariant());
    }

    #[test]
    fn class_data_round_trips_packet_count_and_blend_categorization() {
        use crate::level::mesh::Skin;
        let mut mesh = sample_mesh(20);
        for (i, v) in mesh.vertices.iter_mut().enumerate() {
            if i % 3 == 1 {
                v.skin = Some(Skin { joints: [1, 2, 0], weights: [128, 127, 0] });
            } else if i % 3 == 2 {
                v.skin = Some(Skin { joints: [1, 2, 3], weights: [85, 85, 85] });
            }
        }
        let materials = vec![Material::flat_color("mat0", [255, 255, 255, 255])];
        let moby = Moby::pack(&mesh, materials.clone(), 256.0, 8).unwrap();

        let bytes = moby.pack_class_data();
        let decoded = Moby::unpack_class_data(&bytes, materials).unwrap();

        assert_eq!(decoded.packets.len(), moby.packets.len());
        assert_eq!(decoded.bangles.len(), moby.bangles.len());
        assert_eq!(decoded.joints.len(), moby.joints.len());
        for (a, b) in decoded.packets.iter().zip(&moby.packets) {
            assert_eq!(a.two_way, b.two_way);
            assert_eq!(a.three_way, b.three_way);
            assert_eq!(a.main, b.main);
            assert_eq!(a.indices, b.indices);
        }
    }

    #[test]
    fn unpack_vif_list_many_skips_garbage_entries() {
        let moby = Moby::pack(&sample_mesh(8), vec![], 256.0, 8).unwrap();
        let packet = &moby.packets[0];
        let good_bytes = Moby::pack_vif_list(packet);
        let garbage_bytes = vec![0u8; 4];

        let entries = vec![
            (good_bytes.as_slice(), packet.indices.len()),
            (garbage_bytes.as_slice(), 0usize),
        ];
        let decoded = Moby::unpack_vif_list_many(&entries);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].1.indices, packet.indices);
    }
}
