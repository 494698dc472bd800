//! Minimal end-to-end demo: assemble a tiny level in memory, pack it, then
//! decompress the result back out. Run with `cargo run --example unpack_minimal`.

use racpak::compression;
use racpak::game::Game;
use racpak::level::core::{Assembler, ClassAsset};
use racpak::level::mesh::{Face, Mesh, MeshFlags, SubMesh, Vertex};

fn triangle_strip_mesh() -> Mesh {
    let vertices = vec![
        Vertex::new([0.0, 0.0, 0.0]),
        Vertex::new([1.0, 0.0, 0.0]),
        Vertex::new([0.0, 1.0, 0.0]),
        Vertex::new([1.0, 1.0, 0.0]),
    ];
    Mesh {
        vertices,
        submeshes: vec![SubMesh {
            material: 0,
            faces: vec![Face::Tri([0, 1, 2]), Face::Tri([1, 3, 2])],
        }],
        flags: MeshFlags::empty(),
        joints: None,
    }
}

fn main() -> racpak::Result<()> {
    let mut assembler = Assembler::new();
    assembler.classes.push(ClassAsset::Tie {
        o_class: 100,
        mesh: triangle_strip_mesh(),
        materials: vec![],
    });

    let assembled = assembler.pack(Game::Uya)?;
    println!(
        "packed {} class(es), {} compressed bytes",
        1,
        assembled.data.len()
    );

    let file_bytes = assembled.into_bytes();
    let offset = std::mem::size_of::<racpak::level::core::LevelCoreHeader>() + assembled.index.len();
    let compressed = &file_bytes[offset..offset + assembled.data.len()];
    let restored = compression::decompress(compressed)?;
    assert_eq!(restored.len(), assembled.header.assets_decompressed_size as usize);
    println!("round-tripped {} decompressed bytes", restored.len());
    Ok(())
}
