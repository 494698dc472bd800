//! Shared mesh/material/joint model.
//!
//! A single `Mesh` feeds all four geometry codecs (tfrag has no joints;
//! moby is the only consumer of the joint tree). Grounded on the
//! original's shared import structures referenced by `tfrag.cpp`,
//! `shrub.cpp`, and `moby_packet.cpp` alike (`core/mesh.h` in
//! `original_source/`), which this crate mirrors with one Rust type
//! instead of duplicating a mesh type per codec.

/// Up to three joint influences on a single vertex, used by the moby
/// codec to classify a vertex as two-way-blend/three-way-blend/main.
/// Unused joint slots carry a `0` weight.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Skin {
    pub joints: [u8; 3],
    pub weights: [u8; 3],
}

impl Skin {
    /// Number of joints with a non-zero weight (0-3).
    pub fn influence_count(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0).count()
    }
}

/// A vertex position plus the optional per-vertex attributes a submesh's
/// flags advertise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub colour: [u8; 4],
    pub uv: [f32; 2],
    /// Skeletal blend weights; `None` for unskinned geometry (tfrag,
    /// tie, shrub, or a moby imported without an animation rig).
    pub skin: Option<Skin>,
}

impl Vertex {
    pub fn new(position: [f32; 3]) -> Self {
        Vertex {
            position,
            normal: [0.0, 0.0, 1.0],
            colour: [0xFF; 4],
            uv: [0.0, 0.0],
            skin: None,
        }
    }
}

/// A face: three indices for a triangle, four for a quad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Face {
    Tri([u32; 3]),
    Quad([u32; 4]),
}

impl Face {
    /// Number of triangles this face contributes once fan-triangulated.
    pub fn triangle_count(&self) -> usize {
        match self {
            Face::Tri(_) => 1,
            Face::Quad(_) => 2,
        }
    }

    pub fn indices(&self) -> &[u32] {
        match self {
            Face::Tri(i) => i,
            Face::Quad(i) => i,
        }
    }
}

/// One material-grouped run of faces within a [`Mesh`].
#[derive(Debug, Clone, Default)]
pub struct SubMesh {
    pub material: usize,
    pub faces: Vec<Face>,
}

impl SubMesh {
    /// Total triangle count, counting each quad as two triangles.
    pub fn triangle_count(&self) -> usize {
        self.faces.iter().map(Face::triangle_count).sum()
    }
}

/// Flag word recording which optional per-vertex attributes a mesh
/// carries: has-normals, has-vertex-colours, has-UVs, has-quads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshFlags(pub u32);

impl MeshFlags {
    pub const HAS_NORMALS: MeshFlags = MeshFlags(1 << 0);
    pub const HAS_VERTEX_COLOURS: MeshFlags = MeshFlags(1 << 1);
    pub const HAS_UVS: MeshFlags = MeshFlags(1 << 2);
    pub const HAS_QUADS: MeshFlags = MeshFlags(1 << 3);

    pub const fn empty() -> Self {
        MeshFlags(0)
    }

    pub fn contains(self, other: MeshFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MeshFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for MeshFlags {
    type Output = MeshFlags;
    fn bitor(self, rhs: MeshFlags) -> MeshFlags {
        MeshFlags(self.0 | rhs.0)
    }
}

/// A joint in a moby's skeleton. Forms a tree via parent/first-child/
/// sibling indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Joint {
    pub parent: Option<u32>,
    pub first_child: Option<u32>,
    pub next_sibling: Option<u32>,
    /// Inverse-bind matrix, row-major, no translation-only shortcut.
    pub inverse_bind: [[f32; 4]; 4],
    pub tip: [f32; 3],
}

/// The shared geometry-import representation: a vertex list, material-
/// grouped submeshes, a flag word, and an optional joint tree.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub submeshes: Vec<SubMesh>,
    pub flags: MeshFlags,
    pub joints: Option<Vec<Joint>>,
}

impl Mesh {
    pub fn new() -> Self {
        Mesh::default()
    }

    /// Total triangle count across all submeshes.
    pub fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(SubMesh::triangle_count).sum()
    }
}

/// A material's surface: either an index into the level's texture-entry
/// array, or a flat colour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Surface {
    Texture(usize),
    Color([u8; 4]),
}

/// Per-axis wrap/clamp mode, mirroring the GS `CLAMP` register's `wms`/
/// `wmt` fields (see [`crate::gif::Clamp`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WrapMode {
    pub s: u8,
    pub t: u8,
}

/// A named material: a cross-reference key used only by geometry
/// importers, a surface, and an optional wrap mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub surface: Surface,
    pub wrap: Option<WrapMode>,
}

impl Material {
    pub fn textured(name: impl Into<String>, texture_index: usize) -> Self {
        Material {
            name: name.into(),
            surface: Surface::Texture(texture_index),
            wrap: None,
        }
    }

    pub fn flat_color(name: impl Into<String>, rgba: [u8; 4]) -> Self {
        Material {
            name: name.into(),
            surface: Surface::Color(rgba),
            wrap: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_count_counts_quads_as_two() {
        let mesh = Mesh {
            vertices: vec![Vertex::new([0.0; 3]); 4],
            submeshes: vec![SubMesh {
                material: 0,
                faces: vec![Face::Tri([0, 1, 2]), Face::Quad([0, 1, 2, 3])],
            }],
            flags: MeshFlags::empty(),
            joints: None,
        };
        assert_eq!(mesh.triangle_count(), 3);
    }

    #[test]
    fn material_constructors_set_surface() {
        let tex = Material::textured("skin", 4);
        assert_eq!(tex.surface, Surface::Texture(4));
        let flat = Material::flat_color("debug", [255, 0, 0, 255]);
        assert_eq!(flat.surface, Surface::Color([255, 0, 0, 255]));
    }
}
