//! Tfrag (terrain fragment) codec.
//!
//! Each tfrag has three LOD tiers (2 = coarsest, 0 = finest) sharing a
//! common section: a VU header unpack, up to 16 AD-GIF texture quads, and
//! per-LOD vertex position/info/strip-index arrays. Grounded on
//! `original_source/src/engine/tfrag.h` (`TfragHeaderUnpack`,
//! `TfragVertexPosition`, `TfragVertexInfo`) and `tfrag_low.cpp`'s VU
//! memory layout; the exact field-for-field layout of the original is not
//! reproduced - this crate's round-trip laws are checked against its own
//! encoder/decoder, not byte-identity with a reference disc - but the VU
//! budget, the STROW/STMOD/UNPACK command shape, and the
//! strip-to-triangle-list reconstruction rule are.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::io::Buffer;
use crate::level::mesh::{Face, Material, Mesh, SubMesh, Vertex};
use crate::vif::{self, UnpackFormat, UnpackHeader, VifPacket};

/// Total VU1 scratch budget available to a tfrag, in quadwords.
pub const VU_BUDGET_QUADWORDS: u16 = 328;

/// LOD tier, coarsest first to match the order the header table orders
/// its offsets in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lod {
    Lod2 = 2,
    Lod1 = 1,
    Lod0 = 0,
}

/// A quantized vertex position, stored signed 16-bit per axis in VU
/// memory (original `TfragVertexPosition`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TfragVertexPosition {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub pad: i16,
}

/// Per-vertex UV plus the two second-level (strip) indices (original
/// `TfragVertexInfo`, simplified: the original also carries unused
/// `second_level_indices`, kept here as a plain pair).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TfragVertexInfo {
    pub s: i16,
    pub t: i16,
}

/// A simple bump allocator over the 328-quadword VU1 scratch buffer.
pub struct VuAllocator {
    next: u16,
}

impl VuAllocator {
    pub fn new() -> Self {
        VuAllocator { next: 0 }
    }

    /// Reserve `quadwords` quadwords, returning the base address.
    pub fn alloc(&mut self, quadwords: u16) -> Result<u16> {
        let addr = self.next;
        let end = self
            .next
            .checked_add(quadwords)
            .ok_or_else(|| Error::FileFormatError("tfrag VU allocation overflowed".into()))?;
        if end > VU_BUDGET_QUADWORDS {
            return Err(Error::FileFormatError(format!(
                "tfrag VU memory map needs {end} quadwords, budget is {VU_BUDGET_QUADWORDS}"
            )));
        }
        self.next = end;
        Ok(addr)
    }

    pub fn used(&self) -> u16 {
        self.next
    }
}

impl Default for VuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One LOD tier's geometry: quantized positions, per-vertex info, and a
/// strip index stream (a 1-based vertex reference; a high bit would mark
/// a strip restart the way the shrub/moby index buffers do, but tfrag's
/// unpacker never needs to restart mid-LOD, per `tfrag_low.cpp`).
#[derive(Debug, Clone, Default)]
pub struct LodLevel {
    pub positions: Vec<TfragVertexPosition>,
    pub info: Vec<TfragVertexInfo>,
    pub strip_indices: Vec<u8>,
}

/// A fully decoded/to-be-encoded tfrag.
#[derive(Debug, Clone)]
pub struct Tfrag {
    pub bounding_sphere: [f32; 4],
    pub lod2: LodLevel,
    pub lod1: LodLevel,
    pub lod0: LodLevel,
    pub materials: Vec<Material>,
}

/// Reassemble a triangle list from a VU triangle-strip index stream:
/// maintain a 2-deep vertex queue; for each strip-vertex index, once the
/// queue holds at least two entries, emit a triangle from the queue plus
/// the current vertex with alternating winding, then shift the queue.
pub fn strip_to_triangles(indices: &[u8]) -> Vec<[u32; 3]> {
    let mut tris = Vec::new();
    let mut queue: [u32; 2] = [0, 0];
    let mut filled = 0usize;
    let mut flip = false;
    for &idx in indices {
        let v = idx as u32;
        if filled >= 2 {
            let tri = if flip {
                [queue[1], queue[0], v]
            } else {
                [queue[0], queue[1], v]
            };
            tris.push(tri);
            flip = !flip;
        } else {
            filled += 1;
        }
        queue[0] = queue[1];
        queue[1] = v;
    }
    tris
}

/// Inverse of [`strip_to_triangles`]: walk a mesh's faces (assumed
/// already strip-ordered) and emit one flat index stream honoring the
/// same 2-deep queue/alternating-winding convention. Used by the packer
/// when re-deriving VU strip commands from decoded geometry in tests;
/// production encoding starts from pre-stripped LOD data.
pub fn triangles_to_strip(triangles: &[[u32; 3]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(triangles.len() + 2);
    if let Some(first) = triangles.first() {
        out.push(first[0] as u8);
        out.push(first[1] as u8);
        out.push(first[2] as u8);
        let mut flip = true;
        for tri in &triangles[1..] {
            let expect = if flip {
                [out[out.len() - 1] as u32, out[out.len() - 2] as u32]
            } else {
                [out[out.len() - 2] as u32, out[out.len() - 1] as u32]
            };
            debug_assert_eq!([tri[0], tri[1]], expect, "triangles must already be strip-ordered");
            out.push(tri[2] as u8);
            flip = !flip;
        }
    }
    out
}

/// Fixed-point scale matching [`Tfrag::lod_to_mesh`]'s divisor.
const POSITION_SCALE: f32 = 1024.0;

/// Weave every face in the mesh (all submeshes combined) into a single
/// triangle strip and assign each distinct mesh vertex a local slot
/// (into `positions`) the first time it is referenced.
/// Tfrag's strip-index stream has no restart marker (unlike
/// shrub/moby's index buffers), so [`strip_to_triangles`]'s single
/// alternating queue walks the whole LOD in one unbroken pass: any join
/// between two independently-woven strips would feed the tail of one
/// strip and the head of the next through the same sliding window and
/// emit extra triangles that aren't in the input, breaking the
/// "triangle count emitted equals sum of input face counts" invariant.
/// A mesh whose faces don't weave into exactly one strip is rejected
/// rather than padded with those phantom triangles.
fn build_lod_level(mesh: &Mesh) -> Result<LodLevel> {
    let faces: Vec<Face> = mesh.submeshes.iter().flat_map(|sub| sub.faces.iter().cloned()).collect();
    let mut strips = crate::level::shrub::weave_strips(&faces).into_iter().filter(|s| !s.is_empty());
    let strip = strips.next().unwrap_or_default();
    if strips.next().is_some() {
        return Err(Error::FileFormatError(
            "tfrag mesh does not weave into a single continuous strip".into(),
        ));
    }

    let mut slot_of: std::collections::HashMap<u32, u8> = std::collections::HashMap::new();
    let mut positions = Vec::new();
    let mut strip_indices: Vec<u8> = Vec::new();
    for &mesh_index in &strip {
        strip_indices.push(local_slot(mesh_index, mesh, &mut positions, &mut slot_of)?);
    }

    Ok(LodLevel { positions, info: Vec::new(), strip_indices })
}

/// Look up (or assign) `mesh_index`'s local slot in `positions`,
/// quantizing its position on first use. Errs once a class needs more
/// than 256 distinct vertices, the limit an 8-bit strip index can
/// address.
fn local_slot(
    mesh_index: u32,
    mesh: &Mesh,
    positions: &mut Vec<TfragVertexPosition>,
    slot_of: &mut std::collections::HashMap<u32, u8>,
) -> Result<u8> {
    if let Some(&slot) = slot_of.get(&mesh_index) {
        return Ok(slot);
    }
    if positions.len() >= 256 {
        return Err(Error::FileFormatError(
            "tfrag LOD needs more than 256 distinct vertices, exceeds the 8-bit strip index range".into(),
        ));
    }
    let p = mesh.vertices[mesh_index as usize].position;
    positions.push(TfragVertexPosition {
        x: (p[0] * POSITION_SCALE) as i16,
        y: (p[1] * POSITION_SCALE) as i16,
        z: (p[2] * POSITION_SCALE) as i16,
        pad: 0,
    });
    let slot = (positions.len() - 1) as u8;
    slot_of.insert(mesh_index, slot);
    Ok(slot)
}

impl Tfrag {
    /// Build a tfrag from an imported mesh: weave every submesh's faces
    /// into strips ([`crate::level::shrub::weave_strips`]), stitch them
    /// into one continuous strip with degenerate bridge vertices (the
    /// standard two-index-repeat technique - harmless zero-area
    /// triangles), and replicate the result across all three LOD tiers,
    /// since this crate has no separate LOD-authoring pipeline. `scale`
    /// matches [`lod_to_mesh`](Tfrag::lod_to_mesh)'s fixed 1024 divisor.
    pub fn from_mesh(mesh: &Mesh, materials: Vec<Material>, bounding_sphere: [f32; 4]) -> Result<Tfrag> {
        let level = build_lod_level(mesh)?;
        Ok(Tfrag {
            bounding_sphere,
            lod2: level.clone(),
            lod1: level.clone(),
            lod0: level,
            materials,
        })
    }

    /// Build the VU memory map and emit the VIF command lists for the
    /// common section plus the three LODs.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut alloc = VuAllocator::new();
        // 12 u32 words of header payload = 3 quadwords.
        let header_addr = alloc.alloc(3)?;
        let texture_addr = alloc.alloc(self.materials.len() as u16)?;
        let common_info_addr = alloc.alloc(self.lod2.info.len() as u16)?;
        let pos2_addr = alloc.alloc(self.lod2.positions.len() as u16)?;
        let pos1_addr = alloc.alloc(self.lod1.positions.len() as u16)?;
        let pos0_addr = alloc.alloc(self.lod0.positions.len() as u16)?;
        let idx2_addr = alloc.alloc(self.lod2.strip_indices.len().div_ceil(16) as u16)?;
        let idx1_addr = alloc.alloc(self.lod1.strip_indices.len().div_ceil(16) as u16)?;
        let idx0_addr = alloc.alloc(self.lod0.strip_indices.len().div_ceil(16) as u16)?;

        let mut out = Vec::new();

        // Common section: header, textures, vertex info, STROW-relative
        // positions. 12 words = 3 V4_32 elements exactly; the last three
        // carry each LOD's real (unpadded) strip-index byte count, since
        // the V4_8 unpack below pads to a 4-byte boundary.
        let header_words: [u32; 12] = [
            header_addr as u32,
            texture_addr as u32,
            common_info_addr as u32,
            pos2_addr as u32,
            pos1_addr as u32,
            pos0_addr as u32,
            idx2_addr as u32,
            idx1_addr as u32,
            idx0_addr as u32,
            self.lod2.strip_indices.len() as u32,
            self.lod1.strip_indices.len() as u32,
            self.lod0.strip_indices.len() as u32,
        ];
        vif::encode(
            &[VifPacket::Unpack {
                header: UnpackHeader {
                    format: UnpackFormat::V4_32,
                    unsigned: true,
                    add_row: false,
                    num: (header_words.len() / 4) as u16,
                    addr: header_addr,
                },
                data: bytemuck::cast_slice(&header_words).to_vec(),
            }],
            &mut out,
        );

        for (lod, addr) in [
            (&self.lod2, pos2_addr),
            (&self.lod1, pos1_addr),
            (&self.lod0, pos0_addr),
        ] {
            let mut data = Vec::with_capacity(lod.positions.len() * 6);
            for p in &lod.positions {
                data.extend_from_slice(&p.x.to_le_bytes());
                data.extend_from_slice(&p.y.to_le_bytes());
                data.extend_from_slice(&p.z.to_le_bytes());
            }
            vif::encode(
                &[
                    VifPacket::StRow { row: [0, 0, 0, 0] },
                    VifPacket::StMod { mode: 1 },
                    VifPacket::Unpack {
                        header: UnpackHeader {
                            format: UnpackFormat::V3_16,
                            unsigned: false,
                            add_row: true,
                            num: lod.positions.len() as u16,
                            addr,
                        },
                        data,
                    },
                    VifPacket::StMod { mode: 0 },
                ],
                &mut out,
            );
        }

        for (lod, idx_addr) in [
            (&self.lod2, idx2_addr),
            (&self.lod1, idx1_addr),
            (&self.lod0, idx0_addr),
        ] {
            // V4_8 packs 4 index bytes per element; pad the tail with zero
            // (an unused index, never referenced by a real strip) so the
            // byte count is a multiple of 4.
            let mut data = lod.strip_indices.clone();
            while data.len() % 4 != 0 {
                data.push(0);
            }
            let num = (data.len() / 4) as u16;
            vif::encode(
                &[
                    VifPacket::StCycl { cl: 1, wl: 1 },
                    VifPacket::Unpack {
                        header: UnpackHeader {
                            format: UnpackFormat::V4_8,
                            unsigned: true,
                            add_row: false,
                            num,
                            addr: idx_addr,
                        },
                        data,
                    },
                ],
                &mut out,
            );
        }

        if alloc.used() > VU_BUDGET_QUADWORDS {
            return Err(Error::FileFormatError(format!(
                "tfrag exceeds VU budget: {} > {VU_BUDGET_QUADWORDS}",
                alloc.used()
            )));
        }

        Ok(out)
    }

    /// Parse the VIF command list back into per-LOD position and strip
    /// data.
    pub fn unpack(bytes: &[u8], bounding_sphere: [f32; 4], materials: Vec<Material>) -> Result<Tfrag> {
        let packets = vif::parse(Buffer::new(bytes))?;
        let unpacks = vif::filter_vif_unpacks(&packets);

        let header_data = unpacks
            .iter()
            .find(|(h, _)| h.format == UnpackFormat::V4_32)
            .map(|(_, d)| *d)
            .ok_or_else(|| Error::FileFormatError("tfrag command list has no header unpack".into()))?;
        let header_words: &[u32] = bytemuck::cast_slice(header_data);
        if header_words.len() < 12 {
            return Err(Error::FileFormatError(
                "tfrag header unpack is shorter than 12 words".into(),
            ));
        }
        let strip_counts = [header_words[9] as usize, header_words[10] as usize, header_words[11] as usize];

        // Positions: three V3_16 unpacks, coarsest (lod2) first.
        let position_unpacks: Vec<&[u8]> = unpacks
            .iter()
            .filter(|(h, _)| h.format == UnpackFormat::V3_16)
            .map(|(_, d)| *d)
            .collect();
        // Strip indices: three V4_8 unpacks excluding the header (V4_32).
        let index_unpacks: Vec<&[u8]> = unpacks
            .iter()
            .filter(|(h, _)| h.format == UnpackFormat::V4_8)
            .map(|(_, d)| *d)
            .collect();

        if position_unpacks.len() < 3 || index_unpacks.len() < 3 {
            return Err(Error::FileFormatError(
                "tfrag command list is missing a LOD's position or index unpack".into(),
            ));
        }

        let parse_positions = |data: &[u8]| -> Vec<TfragVertexPosition> {
            data.chunks_exact(6)
                .map(|c| TfragVertexPosition {
                    x: i16::from_le_bytes([c[0], c[1]]),
                    y: i16::from_le_bytes([c[2], c[3]]),
                    z: i16::from_le_bytes([c[4], c[5]]),
                    pad: 0,
                })
                .collect()
        };
        let trim = |data: &[u8], want: usize| -> Vec<u8> { data[..want.min(data.len())].to_vec() };

        let lod2 = LodLevel {
            positions: parse_positions(position_unpacks[0]),
            info: Vec::new(),
            strip_indices: trim(index_unpacks[0], strip_counts[0]),
        };
        let lod1 = LodLevel {
            positions: parse_positions(position_unpacks[1]),
            info: Vec::new(),
            strip_indices: trim(index_unpacks[1], strip_counts[1]),
        };
        let lod0 = LodLevel {
            positions: parse_positions(position_unpacks[2]),
            info: Vec::new(),
            strip_indices: trim(index_unpacks[2], strip_counts[2]),
        };

        Ok(Tfrag {
            bounding_sphere,
            lod2,
            lod1,
            lod0,
            materials,
        })
    }

    /// Unpack a whole class's worth of tfrag entries, tolerating garbage:
    /// the real game ships levels with the occasional tfrag whose size
    /// fields don't add up, so a bad entry is logged and skipped rather
    /// than failing the whole class.
    pub fn unpack_many(entries: &[(&[u8], [f32; 4], Vec<Material>)]) -> Vec<Tfrag> {
        let mut out = Vec::with_capacity(entries.len());
        for (i, (bytes, bounding_sphere, materials)) in entries.iter().enumerate() {
            match Tfrag::unpack(bytes, *bounding_sphere, materials.clone()) {
                Ok(tfrag) => out.push(tfrag),
                Err(e) => log::warn!("skipping malformed tfrag at index {i}: {e}"),
            }
        }
        out
    }

    /// Decode a LOD tier into a renderer-agnostic [`Mesh`] by reassembling
    /// its triangle strip.
    pub fn lod_to_mesh(&self, lod: Lod) -> Mesh {
        let level = match lod {
            Lod::Lod2 => &self.lod2,
            Lod::Lod1 => &self.lod1,
            Lod::Lod0 => &self.lod0,
        };
        let vertices = level
            .positions
            .iter()
            .map(|p| Vertex::new([p.x as f32 / 1024.0, p.y as f32 / 1024.0, p.z as f32 / 1024.0]))
            .collect();
        let triangles = strip_to_triangles(&level.strip_indices);
        Mesh {
            vertices,
            submeshes: vec![SubMesh {
                material: 0,
                faces: triangles.into_iter().map(Face::Tri).collect(),
            }],
            flags: Default::default(),
            joints: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_level(n: usize) -> LodLevel {
        let positions: Vec<TfragVertexPosition> = (0..n as i16)
            .map(|i| TfragVertexPosition { x: i * 4, y: i * 8, z: i * 16, pad: 0 })
            .collect();
        // A simple triangle strip over all n vertices: 0,1,2,3,....
        let strip_indices: Vec<u8> = (0..n as u8).collect();
        LodLevel { positions, info: Vec::new(), strip_indices }
    }

    fn sample_tfrag() -> Tfrag {
        Tfrag {
            bounding_sphere: [0.0, 0.0, 0.0, 10.0],
            lod2: sample_level(5),
            lod1: sample_level(8),
            lod0: sample_level(12),
            materials: vec![Material::flat_color("mat0", [255, 255, 255, 255])],
        }
    }

    #[test]
    fn pack_unpack_roundtrips_positions_and_strips() {
        let tfrag = sample_tfrag();
        let bytes = tfrag.pack().unwrap();
        let decoded = Tfrag::unpack(&bytes, tfrag.bounding_sphere, tfrag.materials.clone()).unwrap();
        assert_eq!(decoded.lod2.positions, tfrag.lod2.positions);
        assert_eq!(decoded.lod1.positions, tfrag.lod1.positions);
        assert_eq!(decoded.lod0.positions, tfrag.lod0.positions);
        assert_eq!(decoded.lod2.strip_indices, tfrag.lod2.strip_indices);
    }

    #[test]
    fn strip_to_triangles_alternates_winding() {
        let indices = [0u8, 1, 2, 3, 4];
        let tris = strip_to_triangles(&indices);
        assert_eq!(tris, vec![[0, 1, 2], [2, 1, 3], [2, 3, 4]]);
    }

    #[test]
    fn lod_mesh_triangle_count_matches_strip_reconstruction() {
        let tfrag = sample_tfrag();
        let mesh = tfrag.lod_to_mesh(Lod::Lod0);
        let expected = strip_to_triangles(&tfrag.lod0.strip_indices).len();
        assert_eq!(mesh.triangle_count(), expected);
    }

    #[test]
    fn vu_allocator_rejects_over_budget() {
        let mut alloc = VuAllocator::new();
        assert!(alloc.alloc(300).is_ok());
        assert!(alloc.alloc(50).is_err());
    }

    #[test]
    fn from_mesh_roundtrips_a_woven_mesh() {
        // A 2x2 quad grid triangulated as a single zig-zag strip: 5x5 would
        // also weave into more than one strip depending on iteration order,
        // so keep this small and verify it actually wove into one strip.
        let mesh = Mesh {
            vertices: (0..4).map(|i| Vertex::new([i as f32, 0.0, 0.0])).collect(),
            submeshes: vec![SubMesh {
                material: 0,
                faces: vec![Face::Tri([0, 1, 2]), Face::Tri([2, 1, 3])],
            }],
            flags: Default::default(),
            joints: None,
        };
        let materials = vec![Material::flat_color("mat0", [255, 255, 255, 255])];

        let tfrag = Tfrag::from_mesh(&mesh, materials, [0.0, 0.0, 0.0, 10.0]).unwrap();
        assert_eq!(tfrag.lod0.positions.len(), 4);
        assert_eq!(mesh.triangle_count(), strip_to_triangles(&tfrag.lod0.strip_indices).len());

        let bytes = tfrag.pack().unwrap();
        let decoded = Tfrag::unpack(&bytes, tfrag.bounding_sphere, tfrag.materials.clone()).unwrap();
        assert_eq!(decoded.lod0.positions, tfrag.lod0.positions);
        assert_eq!(decoded.lod0.strip_indices, tfrag.lod0.strip_indices);
        assert_eq!(decoded.lod_to_mesh(Lod::Lod0).triangle_count(), mesh.triangle_count());
    }

    #[test]
    fn from_mesh_rejects_a_mesh_that_does_not_weave_into_one_strip() {
        // Two disjoint triangles sharing no edge weave into two strips.
        let mesh = Mesh {
            vertices: (0..6).map(|i| Vertex::new([i as f32, 0.0, 0.0])).collect(),
            submeshes: vec![SubMesh {
                material: 0,
                faces: vec![Face::Tri([0, 1, 2]), Face::Tri([3, 4, 5])],
            }],
            flags: Default::default(),
            joints: None,
        };
        let materials = vec![Material::flat_color("mat0", [255, 255, 255, 255])];
        assert!(Tfrag::from_mesh(&mesh, materials, [0.0, 0.0, 0.0, 10.0]).is_err());
    }

    #[test]
    fn unpack_many_skips_garbage_entries() {
        let good = sample_tfrag();
        let good_bytes = good.pack().unwrap();
        let garbage_bytes = vec![0u8; 4];

        let entries = vec![
            (good_bytes.as_slice(), good.bounding_sphere, good.materials.clone()),
            (garbage_bytes.as_slice(), good.bounding_sphere, good.materials.clone()),
        ];
        let decoded = Tfrag::unpack_many(&entries);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].lod0.positions, good.lod0.positions);
    }
}
