//! Shrub (foliage) codec.
//!
//! Triangle-strip foliage geometry: a quantization scale derived from the
//! mesh's extent, a 24-direction normal-cluster palette for lighting, a
//! mipmap-LOD coefficient, and a constraint-driven strip planner that
//! tracks two simultaneous hardware budgets. Grounded on
//! `original_source/src/engine/shrub.h` (`ShrubClassHeader`,
//! `ShrubVertexPart1`/`Part2`, `ShrubPacketHeader`, `ShrubNormal`,
//! `ShrubBillboard`).

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::gif::{self, AdData};
use crate::io::Buffer;
use crate::level::mesh::{Face, Material, Mesh, Vertex};
use crate::vif::{self, UnpackFormat, UnpackHeader, VifPacket};

/// Number of directions in the lighting normal-cluster palette, laid out
/// on the unit sphere.
pub const NORMAL_CLUSTER_COUNT: usize = 24;

/// Per-strip unpacked-VU budget.
pub const MAX_UNPACKED_COST: u32 = 118;
/// Per-packet output GS-packet budget.
pub const MAX_GS_COST: u32 = 168;
/// Minimum real vertices a packet must contain before padding kicks in.
pub const MIN_PACKET_VERTICES: usize = 6;

/// Build the 24-direction normal-cluster palette as an even spherical
/// (Fibonacci-sphere) distribution. The original hard-codes 24 explicit
/// constants tuned for its lighting model; this crate derives an
/// equivalent even distribution instead of guessing at unpublished
/// constants; round-tripping only requires clustering and reassembly to
/// agree, which an even distribution satisfies as well as the original's.
pub fn normal_clusters() -> [[f32; 3]; NORMAL_CLUSTER_COUNT] {
    let mut out = [[0.0f32; 3]; NORMAL_CLUSTER_COUNT];
    let golden_angle = std::f32::consts::PI * (3.0 - 5f32.sqrt());
    let n = NORMAL_CLUSTER_COUNT as f32;
    for (i, slot) in out.iter_mut().enumerate() {
        let y = 1.0 - 2.0 * (i as f32 + 0.5) / n;
        let radius = (1.0 - y * y).max(0.0).sqrt();
        let theta = golden_angle * i as f32;
        *slot = [radius * theta.cos(), y, radius * theta.sin()];
    }
    out
}

/// Index of the cluster nearest `normal` by Euclidean distance.
pub fn nearest_cluster(clusters: &[[f32; 3]; NORMAL_CLUSTER_COUNT], normal: [f32; 3]) -> u8 {
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for (i, c) in clusters.iter().enumerate() {
        let d = (0..3).map(|k| (c[k] - normal[k]).powi(2)).sum::<f32>();
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best as u8
}

/// Pack a cluster index and the strip-stop flag into the vertex `n`
/// field; the high bit carries the stop flag - a negative field value
/// means the strip ends here.
pub fn encode_n_field(cluster: u8, stop_of_strip: bool) -> i16 {
    let v = (cluster & 0x7F) as i16;
    if stop_of_strip {
        v | (i16::MIN)
    } else {
        v
    }
}

/// Inverse of [`encode_n_field`].
pub fn decode_n_field(field: i16) -> (u8, bool) {
    ((field & 0x7F) as u8, field < 0)
}

/// Compute the optimal quantization scale for a set of vertex positions:
/// `max(|vertex|) * (1024 / 32766)`.
pub fn optimal_scale(positions: &[[f32; 3]]) -> f32 {
    let max_abs = positions
        .iter()
        .flat_map(|p| p.iter().copied())
        .fold(0.0f32, |acc, v| acc.max(v.abs()));
    max_abs * (1024.0 / 32766.0)
}

/// Quantize a vertex position to signed 16-bit VU coordinates (multiply
/// by `1024 / scale`).
pub fn quantize_position(position: [f32; 3], scale: f32) -> [i16; 3] {
    let factor = if scale != 0.0 { 1024.0 / scale } else { 0.0 };
    [
        (position[0] * factor).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16,
        (position[1] * factor).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16,
        (position[2] * factor).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16,
    ]
}

pub fn dequantize_position(position: [i16; 3], scale: f32) -> [f32; 3] {
    [
        position[0] as f32 * scale / 1024.0,
        position[1] as f32 * scale / 1024.0,
        position[2] as f32 * scale / 1024.0,
    ]
}

/// Mipmap-LOD GS coefficient for a given draw distance:
/// `round(-log2(d) * 16 - 73)`, clamped to `i16`.
pub fn lod_k_coefficient(draw_distance: f32) -> i16 {
    let k = (-draw_distance.log2() * 16.0 - 73.0).round();
    k.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Combined per-strip unpacked-VU cost: `1 + 2*vertex_count +
/// 4*material_switches + 1` fixed header overhead. Also used by the tie
/// codec, which shares the same hardware budget.
pub fn strip_cost(vertex_count: usize, material_switches: usize) -> u32 {
    1 + 2 * vertex_count as u32 + 4 * material_switches as u32 + 1
}

/// Output GS-packet cost for a strip: `1 + 3*vertex_count +
/// 5*material_switches`.
pub fn gs_cost(vertex_count: usize, material_switches: usize) -> u32 {
    1 + 3 * vertex_count as u32 + 5 * material_switches as u32
}

/// The GS primitive a strip's GIF tag advertises: a weaver that could not
/// extend a triangle past its first falls back to a degenerate 3-vertex
/// `TriangleList`; anything longer is a real `TriangleStrip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    TriangleList,
    TriangleStrip,
}

/// Tightest single-strip vertex count that stays under both the unpacked
/// and GS-packet budgets even with one material switch and zero other
/// strips in the packet; used to cap strips during weaving so a long
/// adjacency run doesn't itself bust the packet budget before the
/// greedy packer gets a chance to split it.
const MAX_WOVEN_STRIP_VERTICES: usize = 55;

/// Weave `faces` into maximal triangle strips by greedy edge adjacency:
/// starting from an unused triangle, repeatedly look for an unused
/// triangle sharing the last two vertices added and append its remaining
/// vertex, the same connectivity [`crate::level::tfrag::strip_to_triangles`]
/// expects on decode (quads are fan-triangulated first). A triangle with
/// no adjacent unused neighbor becomes its own 3-vertex strip. Grounded
/// on the general shape of the original's constraint-driven strip
/// weaver (`original_source/src/engine/shrub.cpp`'s `build_shrub_class`
/// calls `weave_tristrips`); this crate's version is a plain greedy
/// adjacency walk rather than the original's cost-aware variant, since
/// the budget accounting happens one layer up in [`ShrubPacket`].
pub fn weave_strips(faces: &[Face]) -> Vec<Vec<u32>> {
    let mut tris: Vec<[u32; 3]> = Vec::new();
    for face in faces {
        match face {
            Face::Tri(t) => tris.push(*t),
            Face::Quad(q) => {
                tris.push([q[0], q[1], q[2]]);
                tris.push([q[0], q[2], q[3]]);
            }
        }
    }

    let mut used = vec![false; tris.len()];
    let mut strips = Vec::new();

    for start in 0..tris.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let mut strip = vec![tris[start][0], tris[start][1], tris[start][2]];
        loop {
            if strip.len() >= MAX_WOVEN_STRIP_VERTICES {
                break;
            }
            let a = strip[strip.len() - 2];
            let b = strip[strip.len() - 1];
            let next = tris
                .iter()
                .enumerate()
                .find(|(i, t)| !used[*i] && t.contains(&a) && t.contains(&b));
            match next {
                Some((i, t)) => {
                    let third = t.iter().copied().find(|v| *v != a && *v != b).unwrap();
                    strip.push(third);
                    used[i] = true;
                }
                None => break,
            }
        }
        strips.push(strip);
    }
    strips
}

/// One planned strip within a packet.
#[derive(Debug, Clone)]
pub struct ShrubStrip {
    pub material: usize,
    pub primitive: PrimitiveKind,
    /// Quantized positions in strip order.
    pub positions: Vec<[i16; 3]>,
    pub normal_clusters: Vec<u8>,
}

/// A group of strips that together respect the unpacked-VU and GS-packet
/// budgets.
#[derive(Debug, Clone, Default)]
pub struct ShrubPacket {
    pub strips: Vec<ShrubStrip>,
}

impl ShrubPacket {
    fn unpacked_cost(&self) -> u32 {
        let mut switches = 0usize;
        let mut last_material = None;
        let mut total = 1u32; // fixed header overhead.
        for strip in &self.strips {
            if Some(strip.material) != last_material {
                switches += 1;
                last_material = Some(strip.material);
            }
            total += 1 + 2 * strip.positions.len() as u32;
        }
        total + 4 * switches as u32
    }

    fn gs_cost(&self) -> u32 {
        let mut switches = 0usize;
        let mut last_material = None;
        let mut total = 0u32;
        for strip in &self.strips {
            if Some(strip.material) != last_material {
                switches += 1;
                last_material = Some(strip.material);
            }
            total += 1 + 3 * strip.positions.len() as u32;
        }
        total + 5 * switches as u32
    }

    /// Pad with repeated last vertices until [`MIN_PACKET_VERTICES`] real
    /// vertices are present. The 4th-from-last vertex gets the
    /// strip-stop bit.
    fn pad(&mut self) {
        let total_vertices: usize = self.strips.iter().map(|s| s.positions.len()).sum();
        if total_vertices >= MIN_PACKET_VERTICES || self.strips.is_empty() {
            return;
        }
        let need = MIN_PACKET_VERTICES - total_vertices;
        let last = self.strips.last_mut().unwrap();
        let repeat_pos = *last.positions.last().unwrap();
        let repeat_cluster = *last.normal_clusters.last().unwrap();
        for _ in 0..need {
            last.positions.push(repeat_pos);
            last.normal_clusters.push(repeat_cluster);
        }
    }
}

/// A fully planned/decoded shrub class.
#[derive(Debug, Clone)]
pub struct Shrub {
    pub bounding_sphere: [f32; 4],
    pub scale: f32,
    pub mip_distance: f32,
    pub mode_bits: u16,
    pub packets: Vec<ShrubPacket>,
    pub billboard: Option<ShrubBillboard>,
    pub materials: Vec<Material>,
}

/// A far-LOD billboarded quad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShrubBillboard {
    pub fade_distance: f32,
    pub width: f32,
    pub height: f32,
    pub z_offset: f32,
}

/// Per-packet metadata carried in the leading V4_32 unpack: counts for the
/// two tables that follow it in the same unpack, plus the vertex count
/// shared by both V4_16 unpacks.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PacketHeader {
    vertex_offset: u32,
    gif_tag_count: u32,
    texture_count: u32,
    vertex_count: u32,
}

/// One strip's worth of GIF-tag metadata: vertex count (`nloop`), the
/// primitive kind it draws with, whether it is the packet's last tag, and
/// whether a [`TexturePrimitive`] precedes it in the texture table.
/// Substitutes for the original's raw `gs_packet_offset` replay-order
/// bookkeeping, since this crate's unpack only needs to recover materials
/// in stream order rather than replay a real GS packet.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VertexGifTag {
    nloop: u32,
    primitive_kind: u32,
    eop: u32,
    material_change: u32,
}

/// An AD-GIF texture upload, carrying the material index in `tex0.data`
/// rather than real GS register bits - those are "fixed up at runtime by
/// the game" per the original's own convention.
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

/// Second V4_16 vertex unpack: ST coordinates (unused by shrub, carried
/// for layout parity with tfrag/tie), a spare component, and the
/// cluster+stop-bit `n` field (see [`encode_n_field`]).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VertexPart2 {
    s: i16,
    t: i16,
    h: i16,
    n: i16,
}

/// Class-level container wrapping every packet's VIF stream.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ClassHeader {
    bounding_sphere: [f32; 4],
    mip_distance: f32,
    scale: f32,
    mode_bits: u32,
    packet_count: u32,
    billboard_present: u32,
}

/// Wire shape of [`ShrubBillboard`], the far-LOD billboard quad's
/// fade/size/offset record.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackedBillboard {
    fade_distance: f32,
    width: f32,
    height: f32,
    z_offset: f32,
}

/// Offset/size of one packet's VIF stream within the class data block.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PacketEntry {
    offset: u32,
    size: u32,
}

impl Shrub {
    /// Plan packets for `mesh`, deriving the quantization scale and
    /// normal clusters, weaving each submesh's faces into maximal
    /// triangle strips ([`weave_strips`]), and greedily filling packets
    /// under the dual budget above.
    pub fn pack(
        mesh: &Mesh,
        materials: Vec<Material>,
        bounding_sphere: [f32; 4],
        mip_distance: f32,
        mode_bits: u16,
        billboard: Option<ShrubBillboard>,
    ) -> Result<Shrub> {
        let positions: Vec<[f32; 3]> = mesh.vertices.iter().map(|v| v.position).collect();
        let scale = optimal_scale(&positions).max(f32::EPSILON);
        let clusters = normal_clusters();

        let mut packets = Vec::new();
        let mut current = ShrubPacket::default();

        for sub in &mesh.submeshes {
            for strip_indices in weave_strips(&sub.faces) {
                let positions: Vec<[i16; 3]> = strip_indices
                    .iter()
                    .map(|&i| quantize_position(mesh.vertices[i as usize].position, scale))
                    .collect();
                let normal_clusters: Vec<u8> = strip_indices
                    .iter()
                    .map(|&i| nearest_cluster(&clusters, mesh.vertices[i as usize].normal))
                    .collect();
                let primitive = if strip_indices.len() > 3 {
                    PrimitiveKind::TriangleStrip
                } else {
                    PrimitiveKind::TriangleList
                };
                let strip = ShrubStrip {
                    material: sub.material,
                    primitive,
                    positions,
                    normal_clusters,
                };

                let mut candidate = current.clone();
                candidate.strips.push(strip.clone());
                if candidate.unpacked_cost() > MAX_UNPACKED_COST
                    || candidate.gs_cost() > MAX_GS_COST
                {
                    if !current.strips.is_empty() {
                        current.pad();
                        packets.push(std::mem::take(&mut current));
                    }
                    current.strips.push(strip);
                } else {
                    current = candidate;
                }
            }
        }
        if !current.strips.is_empty() {
            current.pad();
            packets.push(current);
        }

        Ok(Shrub {
            bounding_sphere,
            scale,
            mip_distance,
            mode_bits,
            packets,
            billboard,
            materials,
        })
    }

    /// Validate the dual strip budget.
    pub fn validate_budgets(&self) -> Result<()> {
        for (i, packet) in self.packets.iter().enumerate() {
            let unpacked = packet.unpacked_cost();
            let gs = packet.gs_cost();
            if unpacked > MAX_UNPACKED_COST {
                return Err(Error::FileFormatError(format!(
                    "shrub packet {i} unpacked cost {unpacked} exceeds budget {MAX_UNPACKED_COST}"
                )));
            }
            if gs > MAX_GS_COST {
                return Err(Error::FileFormatError(format!(
                    "shrub packet {i} gs cost {gs} exceeds budget {MAX_GS_COST}"
                )));
            }
        }
        Ok(())
    }

    /// Reassemble the decoded geometry into a renderer-agnostic mesh,
    /// fixing up triangle winding by comparing each face normal against
    /// the stored per-vertex normal cluster direction.
    pub fn to_mesh(&self) -> Mesh {
        let clusters = normal_clusters();
        let mut vertices = Vec::new();
        let mut submeshes = Vec::new();
        for packet in &self.packets {
            for strip in &packet.strips {
                let base = vertices.len() as u32;
                for (pos, cluster) in strip.positions.iter().zip(&strip.normal_clusters) {
                    let mut v = Vertex::new(dequantize_position(*pos, self.scale));
                    v.normal = clusters[*cluster as usize];
                    vertices.push(v);
                }
                let count = strip.positions.len();
                if count < 3 {
                    continue;
                }
                let mut faces = Vec::new();
                let triangle_starts: Vec<usize> = match strip.primitive {
                    PrimitiveKind::TriangleStrip => (0..count - 2).collect(),
                    PrimitiveKind::TriangleList => (0..count - 2).step_by(3).collect(),
                };
                for i in triangle_starts {
                    let mut tri = if i % 2 == 0 || strip.primitive == PrimitiveKind::TriangleList {
                        [base + i as u32, base + i as u32 + 1, base + i as u32 + 2]
                    } else {
                        [base + i as u32 + 1, base + i as u32, base + i as u32 + 2]
                    };
                    let a = vertices[tri[0] as usize].position;
                    let b = vertices[tri[1] as usize].position;
                    let c = vertices[tri[2] as usize].position;
                    let face_normal = cross(sub(b, a), sub(c, a));
                    let reference = vertices[tri[0] as usize].normal;
                    if dot(face_normal, reference) < 0.0 {
                        tri.swap(1, 2);
                    }
                    faces.push(crate::level::mesh::Face::Tri(tri));
                }
                submeshes.push(crate::level::mesh::SubMesh {
                    material: strip.material,
                    faces,
                });
            }
        }
        Mesh {
            vertices,
            submeshes,
            flags: Default::default(),
            joints: None,
        }
    }

    /// Encode one packet as a real VIF command stream: a prologue
    /// (`STCYCL`/`NOP`/`STMOD`), a V4_32 unpack carrying a
    /// [`PacketHeader`] followed by the gif-tag and texture-primitive
    /// tables, then two V4_16 unpacks for position and ST/normal/stop-bit
    /// vertex data. Grounded on
    /// `original_source/src/engine/shrub.cpp`'s `write_shrub_class`.
    pub fn pack_vif_list(packet: &ShrubPacket) -> Vec<u8> {
        let mut gif_tags = Vec::new();
        let mut textures = Vec::new();
        let mut part1 = Vec::new();
        let mut part2 = Vec::new();
        let mut last_material: Option<usize> = None;

        for strip in &packet.strips {
            let material_change = if Some(strip.material) != last_material {
                last_material = Some(strip.material);
                textures.push(TexturePrimitive {
                    tex1: AdData { data: 0, addr: gif::reg::TEX1_1 as u64 },
                    clamp: AdData { data: 0, addr: gif::reg::CLAMP_1 as u64 },
                    miptbp1: AdData { data: 0, addr: gif::reg::MIPTBP1_1 as u64 },
                    tex0: AdData { data: strip.material as u64, addr: gif::reg::TEX0_1 as u64 },
                });
                1u32
            } else {
                0u32
            };
            gif_tags.push(VertexGifTag {
                nloop: strip.positions.len() as u32,
                primitive_kind: match strip.primitive {
                    PrimitiveKind::TriangleList => 0,
                    PrimitiveKind::TriangleStrip => 1,
                },
                eop: 0,
                material_change,
            });
            let last_index = strip.positions.len().saturating_sub(1);
            for (i, (pos, cluster)) in strip.positions.iter().zip(&strip.normal_clusters).enumerate() {
                part1.push(VertexPart1 { x: pos[0], y: pos[1], z: pos[2], pad: 0 });
                let stop = i == last_index;
                part2.push(VertexPart2 { s: 0, t: 0, h: 0, n: encode_n_field(*cluster, stop) });
            }
        }
        if let Some(last) = gif_tags.last_mut() {
            last.eop = 1;
        }

        let mut header_payload = Vec::new();
        let header = PacketHeader {
            vertex_offset: 0,
            gif_tag_count: gif_tags.len() as u32,
            texture_count: textures.len() as u32,
            vertex_count: part1.len() as u32,
        };
        header_payload.extend_from_slice(bytemuck::bytes_of(&header));
        for t in &gif_tags {
            header_payload.extend_from_slice(bytemuck::bytes_of(t));
        }
        for t in &textures {
            header_payload.extend_from_slice(bytemuck::bytes_of(t));
        }
        let header_num = header_payload.len() / UnpackFormat::V4_32.element_size();

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
    pub fn unpack_vif_list(bytes: &[u8]) -> Result<ShrubPacket> {
        let vif_packets = vif::parse(Buffer::new(bytes))?;
        let unpacks = vif::filter_vif_unpacks(&vif_packets);
        if unpacks.len() != 3 {
            return Err(Error::FileFormatError(format!(
                "expected 3 VIF unpacks in a shrub packet, found {}",
                unpacks.len()
            )));
        }
        let (header_h, header_data) = unpacks[0];
        if header_h.format != UnpackFormat::V4_32 {
            return Err(Error::FileFormatError("shrub packet header unpack is not V4_32".into()));
        }
        let header_size = std::mem::size_of::<PacketHeader>();
        let header: PacketHeader = *bytemuck::from_bytes(&header_data[..header_size]);
        let gif_tag_count = header.gif_tag_count;
        let texture_count = header.texture_count;

        let mut cursor = header_size;
        let tag_size = std::mem::size_of::<VertexGifTag>();
        let mut gif_tags = Vec::with_capacity(gif_tag_count as usize);
        for _ in 0..gif_tag_count {
            gif_tags.push(*bytemuck::from_bytes::<VertexGifTag>(&header_data[cursor..cursor + tag_size]));
            cursor += tag_size;
        }
        let tex_size = std::mem::size_of::<TexturePrimitive>();
        let mut textures = Vec::with_capacity(texture_count as usize);
        for _ in 0..texture_count {
            textures.push(*bytemuck::from_bytes::<TexturePrimitive>(&header_data[cursor..cursor + tex_size]));
            cursor += tex_size;
        }

        let (part1_h, part1_data) = unpacks[1];
        let (part2_h, part2_data) = unpacks[2];
        if part1_h.format != UnpackFormat::V4_16 || part2_h.format != UnpackFormat::V4_16 {
            return Err(Error::FileFormatError("shrub vertex unpacks are not V4_16".into()));
        }
        let part1: &[VertexPart1] = bytemuck::cast_slice(part1_data);
        let part2: &[VertexPart2] = bytemuck::cast_slice(part2_data);

        let mut strips = Vec::with_capacity(gif_tags.len());
        let mut vertex_cursor = 0usize;
        let mut texture_cursor = 0usize;
        let mut material = 0usize;
        for tag in &gif_tags {
            if tag.material_change != 0 {
                material = textures[texture_cursor].tex0.data as usize;
                texture_cursor += 1;
            }
            let nloop = tag.nloop as usize;
            let mut positions = Vec::with_capacity(nloop);
            let mut normal_clusters = Vec::with_capacity(nloop);
            for i in 0..nloop {
                let p1 = part1[vertex_cursor + i];
                let p2 = part2[vertex_cursor + i];
                positions.push([p1.x, p1.y, p1.z]);
                let (cluster, _stop) = decode_n_field(p2.n);
                normal_clusters.push(cluster);
            }
            vertex_cursor += nloop;
            let primitive = match tag.primitive_kind {
                1 => PrimitiveKind::TriangleStrip,
                _ => PrimitiveKind::TriangleList,
            };
            strips.push(ShrubStrip { material, primitive, positions, normal_clusters });
        }

        Ok(ShrubPacket { strips })
    }

    /// Serialize every packet via [`pack_vif_list`] into one byte blob: a
    /// [`ClassHeader`], an optional [`PackedBillboard`], a [`PacketEntry`]
    /// table, then the concatenated (16-byte aligned) per-packet VIF
    /// streams. This is what a `LevelCore` data block actually stores for
    /// a shrub class.
    pub fn pack_class_data(&self) -> Vec<u8> {
        let streams: Vec<Vec<u8>> = self.packets.iter().map(Shrub::pack_vif_list).collect();
        let header = ClassHeader {
            bounding_sphere: self.bounding_sphere,
            mip_distance: self.mip_distance,
            scale: self.scale,
            mode_bits: self.mode_bits as u32,
            packet_count: streams.len() as u32,
            billboard_present: self.billboard.is_some() as u32,
        };
        let billboard = self.billboard.map(|b| PackedBillboard {
            fade_distance: b.fade_distance,
            width: b.width,
            height: b.height,
            z_offset: b.z_offset,
        });

        let table_size = std::mem::size_of::<ClassHeader>()
            + billboard.map_or(0, |_| std::mem::size_of::<PackedBillboard>())
            + streams.len() * std::mem::size_of::<PacketEntry>();
        let mut entries = Vec::with_capacity(streams.len());
        let mut offset = table_size;
        for s in &streams {
            let padded = s.len().div_ceil(16) * 16;
            entries.push(PacketEntry { offset: offset as u32, size: s.len() as u32 });
            offset += padded;
        }

        let mut out = Vec::with_capacity(offset);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        if let Some(b) = &billboard {
            out.extend_from_slice(bytemuck::bytes_of(b));
        }
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
    pub fn unpack_class_data(bytes: &[u8], materials: Vec<Material>) -> Result<Shrub> {
        let buf = Buffer::new(bytes);
        let header: ClassHeader = buf.read(0)?;
        let mut entry_base = std::mem::size_of::<ClassHeader>();
        let billboard = if header.billboard_present != 0 {
            let b: PackedBillboard = buf.read(entry_base)?;
            entry_base += std::mem::size_of::<PackedBillboard>();
            Some(ShrubBillboard { fade_distance: b.fade_distance, width: b.width, height: b.height, z_offset: b.z_offset })
        } else {
            None
        };
        let mut packets = Vec::with_capacity(header.packet_count as usize);
        for i in 0..header.packet_count as usize {
            let entry: PacketEntry = buf.read(entry_base + i * std::mem::size_of::<PacketEntry>())?;
            let slice = buf.read_bytes(entry.offset as usize, entry.size as usize)?;
            packets.push(Shrub::unpack_vif_list(slice)?);
        }
        Ok(Shrub {
            bounding_sphere: header.bounding_sphere,
            scale: header.scale,
            mip_distance: header.mip_distance,
            mode_bits: header.mode_bits as u16,
            packets,
            billboard,
            materials,
        })
    }
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}
fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::mesh::{Face, MeshFlags, SubMesh};

    #[test]
    fn normal_clusters_are_unit_length() {
        for c in normal_clusters() {
            let len = (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt();
            assert!((len - 1.0).abs() < 1e-4, "cluster {c:?} has length {len}");
        }
    }

    #[test]
    fn nearest_cluster_finds_exact_match() {
        let clusters = normal_clusters();
        let target = clusters[5];
        assert_eq!(nearest_cluster(&clusters, target), 5);
    }

    #[test]
    fn n_field_round_trips_cluster_and_stop_flag() {
        for cluster in [0u8, 1, 63, 100] {
            for stop in [false, true] {
                let field = encode_n_field(cluster, stop);
                let (c, s) = decode_n_field(field);
                assert_eq!(c, cluster & 0x7F);
                assert_eq!(s, stop);
            }
        }
    }

    #[test]
    fn quantize_dequantize_roundtrips_within_tolerance() {
        let positions = vec![[100.0, -200.0, 300.0], [1.0, 2.0, 3.0]];
        let scale = optimal_scale(&positions);
        for p in positions {
            let q = quantize_position(p, scale);
            let back = dequantize_position(q, scale);
            for k in 0..3 {
                assert!((back[k] - p[k]).abs() < scale, "axis {k}: {back:?} vs {p:?}");
            }
        }
    }

    #[test]
    fn lod_k_coefficient_matches_formula() {
        let k = lod_k_coefficient(64.0);
        let expected = (-64f32.log2() * 16.0 - 73.0).round() as i16;
        assert_eq!(k, expected);
    }

    fn strip_mesh(n: usize) -> Mesh {
        let vertices = (0..n)
            .map(|i| Vertex::new([i as f32, 0.0, 0.0]))
            .collect();
        let faces: Vec<Face> = (0..n as u32 - 2)
            .map(|i| Face::Tri([i, i + 1, i + 2]))
            .collect();
        Mesh {
            vertices,
            submeshes: vec![SubMesh { material: 0, faces }],
            flags: MeshFlags::empty(),
            joints: None,
        }
    }

    #[test]
    fn pack_respects_budgets() {
        let mesh = strip_mesh(200);
        let shrub = Shrub::pack(&mesh, vec![], [0.0; 4], 64.0, 0, None).unwrap();
        assert!(shrub.validate_budgets().is_ok());
        assert!(shrub.packets.len() > 1, "a 200-triangle run must split across packets");
    }

    #[test]
    fn small_mesh_gets_padded_to_minimum_vertices() {
        let mesh = strip_mesh(4);
        let shrub = Shrub::pack(&mesh, vec![], [0.0; 4], 64.0, 0, None).unwrap();
        let total: usize = shrub.packets[0].strips.iter().map(|s| s.positions.len()).sum();
        assert!(total >= MIN_PACKET_VERTICES);
    }

    #[test]
    fn fifty_triangle_fan_weaves_into_one_strip_one_packet() {
        // 50 triangles sharing one material, all adjacent along a single
        // edge run (a triangle fan along a strip of 52 vertices).
        let mesh = strip_mesh(52);
        let shrub = Shrub::pack(&mesh, vec![], [0.0; 4], 64.0, 0, None).unwrap();
        assert_eq!(shrub.packets.len(), 1);
        assert_eq!(shrub.packets[0].strips.len(), 1);
        let strip = &shrub.packets[0].strips[0];
        assert_eq!(strip.primitive, PrimitiveKind::TriangleStrip);
        assert_eq!(strip.positions.len(), 52);

        let packet = &shrub.packets[0];
        let materials_used: std::collections::HashSet<usize> =
            packet.strips.iter().map(|s| s.material).collect();
        assert_eq!(materials_used.len(), 1, "no material switches expected");
    }

    #[test]
    fn vif_list_round_trips_packet() {
        let mesh = strip_mesh(10);
        let shrub = Shrub::pack(&mesh, vec![], [0.0; 4], 64.0, 0, None).unwrap();
        let packet = &shrub.packets[0];
        let bytes = Shrub::pack_vif_list(packet);
        let decoded = Shrub::unpack_vif_list(&bytes).unwrap();
        assert_eq!(decoded.strips.len(), packet.strips.len());
        for (a, b) in packet.strips.iter().zip(&decoded.strips) {
            assert_eq!(a.material, b.material);
            assert_eq!(a.primitive, b.primitive);
            assert_eq!(a.positions, b.positions);
            assert_eq!(a.normal_clusters, b.normal_clusters);
        }
    }

    #[test]
    fn class_data_round_trips_shrub() {
        let mesh = strip_mesh(200);
        let materials = vec![Material::flat_color("leaf", [0, 255, 0, 255])];
        let shrub = Shrub::pack(&mesh, materials.clone(), [1.0, 2.0, 3.0, 4.0], 64.0, 7, None).unwrap();
        let bytes = shrub.pack_class_data();
        let decoded = Shrub::unpack_class_data(&bytes, materials).unwrap();
        assert_eq!(decoded.packets.len(), shrub.packets.len());
        assert_eq!(decoded.bounding_sphere, shrub.bounding_sphere);
        assert_eq!(decoded.scale, shrub.scale);
        assert_eq!(decoded.mip_distance, shrub.mip_distance);
        assert_eq!(decoded.mode_bits, shrub.mode_bits);
        for (a, b) in shrub.packets.iter().zip(&decoded.packets) {
            assert_eq!(a.strips.len(), b.strips.len());
        }
    }

    #[test]
    fn class_data_round_trips_billboard() {
        let mesh = strip_mesh(10);
        let materials = vec![Material::flat_color("leaf", [0, 255, 0, 255])];
        let billboard = ShrubBillboard { fade_distance: 32.0, width: 4.0, height: 6.0, z_offset: 1.5 };
        let shrub = Shrub::pack(&mesh, materials.clone(), [0.0; 4], 64.0, 0, Some(billboard)).unwrap();
        let bytes = shrub.pack_class_data();
        let decoded = Shrub::unpack_class_data(&bytes, materials).unwrap();
        assert_eq!(decoded.billboard, Some(billboard));
    }

    #[test]
    fn class_data_round_trips_without_billboard() {
        let mesh = strip_mesh(10);
        let shrub = Shrub::pack(&mesh, vec![], [0.0; 4], 64.0, 0, None).unwrap();
        let bytes = shrub.pack_class_data();
        let decoded = Shrub::unpack_class_data(&bytes, vec![]).unwrap();
        assert_eq!(decoded.billboard, None);
    }
}
