//! Level-core assembler.
//!
//! Walks a level's class lists, drives the texture/tfrag/tie/shrub/moby
//! codecs, and emits the compressed index/data/gs-ram triple with a
//! fixed ~190-byte header whose offsets are only known once every block
//! has been written. Grounded on
//! `original_source/src/pakrac/level/level_core.h` (`LevelCoreHeader`,
//! `MobyClassEntry`, `TieClassEntry`, `ShrubClassEntry`).

use bytemuck::{Pod, Zeroable};

use crate::compression;
use crate::error::Result;
use crate::game::Game;
use crate::level::mesh::{Material, Mesh};
use crate::level::moby::Moby;
use crate::level::shrub::Shrub;
use crate::level::texalloc::{Allocator, GsRamEntry, TableKind, TextureEntry};
use crate::level::tfrag::Tfrag;
use crate::level::tie::Tie;

/// A `(count, offset)` pair into the assembled index block (original
/// `ArrayRange`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ArrayRange {
    pub count: u32,
    pub offset: u32,
}

/// Fixed-layout level-core header (original `LevelCoreHeader`, 0xbc =
/// 188 bytes). Game-variant union fields
/// (`ratchet_seqs_rac123`/`light_cuboids_offset_dl`, etc.) are collapsed
/// to their single most-used name per field, since this crate picks one
/// layout per `Game` rather than reading the union raw - round-tripping
/// against itself, not matching every game variant's byte layout
/// simultaneously.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LevelCoreHeader {
    pub gs_ram: ArrayRange,
    pub tfrags: i32,
    pub occlusion: i32,
    pub sky: i32,
    pub collision: i32,
    pub moby_classes: ArrayRange,
    pub tie_classes: ArrayRange,
    pub shrub_classes: ArrayRange,
    pub tfrag_textures: ArrayRange,
    pub moby_textures: ArrayRange,
    pub tie_textures: ArrayRange,
    pub shrub_textures: ArrayRange,
    pub part_textures: ArrayRange,
    pub fx_textures: ArrayRange,
    pub textures_base_offset: i32,
    pub part_bank_offset: i32,
    pub fx_bank_offset: i32,
    pub part_defs_offset: i32,
    pub sound_remap_offset: i32,
    pub unknown_74: i32,
    pub game_variant_field_78: i32,
    pub scene_view_size: i32,
    pub game_variant_field_80: i32,
    pub game_variant_field_84: i32,
    pub assets_compressed_size: i32,
    pub assets_decompressed_size: i32,
    pub chrome_map_texture: i32,
    pub chrome_map_palette: i32,
    pub glass_map_texture: i32,
    pub glass_map_palette: i32,
    pub unknown_a0: i32,
    pub heightmap_offset: i32,
    pub occlusion_oct_offset: i32,
    pub moby_gs_stash_list: i32,
    pub occlusion_rad_offset: i32,
    pub moby_sound_remap_offset: i32,
    pub occlusion_rad2_offset: i32,
}

/// A `(offset, o_class, 16 texture indices)` record (original
/// `MobyClassEntry`/`TieClassEntry`, which share this shape).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ClassEntry {
    pub offset_in_asset_wad: i32,
    pub o_class: i32,
    pub unknown_8: i32,
    pub unknown_c: i32,
    pub textures: [u8; 16],
}

/// Output destination for the assembler: [`RealSink`] appends bytes,
/// [`CountingSink`] only tallies how many bytes/assets would be written
/// so a dry-run pre-pass can report progress percentages for the real
/// pass.
pub trait Sink {
    fn write_data(&mut self, bytes: &[u8]);
    fn write_gs_ram(&mut self, bytes: &[u8]);
    fn finish_asset(&mut self);
    /// Bytes written to the data stream so far, used to stamp each
    /// [`ClassEntry::offset_in_asset_wad`] as `run_pass` goes.
    fn data_len(&self) -> usize;
}

/// The real, byte-accumulating sink.
#[derive(Debug, Default)]
pub struct RealSink {
    pub data: Vec<u8>,
    pub gs_ram: Vec<u8>,
    pub assets_written: usize,
}

impl Sink for RealSink {
    fn write_data(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
    fn write_gs_ram(&mut self, bytes: &[u8]) {
        self.gs_ram.extend_from_slice(bytes);
    }
    fn finish_asset(&mut self) {
        self.assets_written += 1;
    }
    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// A black-hole sink that only counts bytes and assets.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub data_bytes: usize,
    pub gs_ram_bytes: usize,
    pub assets_total: usize,
}

impl Sink for CountingSink {
    fn write_data(&mut self, bytes: &[u8]) {
        self.data_bytes += bytes.len();
    }
    fn write_gs_ram(&mut self, bytes: &[u8]) {
        self.gs_ram_bytes += bytes.len();
    }
    fn finish_asset(&mut self) {
        self.assets_total += 1;
    }
    fn data_len(&self) -> usize {
        self.data_bytes
    }
}

/// One class of level geometry queued for assembly.
pub enum ClassAsset {
    Tfrag { o_class: i32, tfrag: Tfrag },
    Tie { o_class: i32, mesh: Mesh, materials: Vec<Material> },
    Shrub { o_class: i32, mesh: Mesh, materials: Vec<Material> },
    Moby { o_class: i32, mesh: Mesh, materials: Vec<Material> },
}

/// Drives the texture allocator and geometry codecs over a level's
/// classes and produces the assembled index/data/gs-ram triple.
#[derive(Default)]
pub struct Assembler {
    pub classes: Vec<ClassAsset>,
    pub texture_allocator: Allocator,
}

/// The assembled, uncompressed output of a pack pass, before the header
/// is patched in.
pub struct Assembled {
    pub header: LevelCoreHeader,
    pub index: Vec<u8>,
    pub data: Vec<u8>,
    pub gs_ram: Vec<u8>,
}

impl Assembled {
    /// Concatenate header, index, compressed data and GS-RAM into one
    /// file-ready buffer: header first, everything else following.
    pub fn into_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            std::mem::size_of::<LevelCoreHeader>() + self.index.len() + self.data.len() + self.gs_ram.len(),
        );
        out.extend_from_slice(bytemuck::bytes_of(&self.header));
        out.extend_from_slice(&self.index);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.gs_ram);
        out
    }
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::default()
    }

    /// Run one assembly pass against `sink`, in a fixed emission order:
    /// tfrag geometry, then per-class data blocks for tie/shrub/moby
    /// (occlusion, sky, collision, particle/FX banks are out of scope
    /// for this crate's geometry codecs and are left as empty ranges).
    ///
    /// Each non-tfrag entry is tagged with its [`TableKind`] and a
    /// per-kind class index (the nth tie/shrub/moby class seen, in
    /// emission order) so `pack` can patch in the texture indices that
    /// `texture_allocator.finish` computes once every slot across every
    /// class has been submitted. Tfrag classes have no `ClassEntry` of
    /// their own in the original format - only the header's bare
    /// `tfrags` offset - so the first one's data offset is returned
    /// alongside instead.
    fn run_pass(
        &self,
        sink: &mut dyn Sink,
        _game: Game,
    ) -> Result<(Vec<(TableKind, usize, ClassEntry)>, Option<i32>)> {
        let mut entries = Vec::new();
        let mut next_index = [0usize; 4];
        let mut tfrag_offset = None;
        for class in &self.classes {
            let offset_in_asset_wad = sink.data_len() as i32;
            match class {
                ClassAsset::Tfrag { o_class: _, tfrag } => {
                    let bytes = tfrag.pack()?;
                    sink.write_data(&bytes);
                    tfrag_offset.get_or_insert(offset_in_asset_wad);
                }
                ClassAsset::Tie { o_class, mesh, materials } => {
                    let tie = Tie::pack(mesh, materials.clone())?;
                    tie.validate_budgets()?;
                    sink.write_data(&tie.pack_class_data());
                    let class_index = next_index[TableKind::Tie.index()];
                    next_index[TableKind::Tie.index()] += 1;
                    entries.push((
                        TableKind::Tie,
                        class_index,
                        ClassEntry {
                            offset_in_asset_wad,
                            o_class: *o_class,
                            unknown_8: 0,
                            unknown_c: 0,
                            textures: [TextureEntry::UNUSED_SLOT; 16],
                        },
                    ));
                }
                ClassAsset::Shrub { o_class, mesh, materials } => {
                    let shrub = Shrub::pack(mesh, materials.clone(), [0.0; 4], 64.0, 0, None)?;
                    shrub.validate_budgets()?;
                    sink.write_data(&shrub.pack_class_data());
                    let class_index = next_index[TableKind::Shrub.index()];
                    next_index[TableKind::Shrub.index()] += 1;
                    entries.push((
                        TableKind::Shrub,
                        class_index,
                        ClassEntry {
                            offset_in_asset_wad,
                            o_class: *o_class,
                            unknown_8: 0,
                            unknown_c: 0,
                            textures: [TextureEntry::UNUSED_SLOT; 16],
                        },
                    ));
                }
                ClassAsset::Moby { o_class, mesh, materials } => {
                    let moby = Moby::pack(mesh, materials.clone(), 1024.0, 16)?;
                    sink.write_data(&moby.pack_class_data());
                    let class_index = next_index[TableKind::Moby.index()];
                    next_index[TableKind::Moby.index()] += 1;
                    entries.push((
                        TableKind::Moby,
                        class_index,
                        ClassEntry {
                            offset_in_asset_wad,
                            o_class: *o_class,
                            unknown_8: 0,
                            unknown_c: 0,
                            textures: [TextureEntry::UNUSED_SLOT; 16],
                        },
                    ));
                }
            }
            sink.finish_asset();
        }
        Ok((entries, tfrag_offset))
    }

    /// Dry-run pre-pass: walk the same code paths with a
    /// [`CountingSink`] so the real pass can report progress as a
    /// percentage of `assets_total`.
    pub fn dry_run(&self, game: Game) -> Result<CountingSink> {
        let mut sink = CountingSink::default();
        self.run_pass(&mut sink, game)?;
        Ok(sink)
    }

    /// The real assembly pass: build the data block, dedupe and lay out
    /// every submitted texture, patch the resulting texture indices back
    /// into each class entry, compress the combined data block, then
    /// write the header last (every offset into the index and data
    /// blocks is only known once their sizes are final). Consumes the
    /// assembler since [`Allocator::finish`] consumes its allocator.
    #[cfg(feature = "compression")]
    pub fn pack(mut self, game: Game) -> Result<Assembled> {
        let mut sink = RealSink::default();
        let (tagged_entries, tfrag_offset) = self.run_pass(&mut sink, game)?;

        let texture_allocator = std::mem::take(&mut self.texture_allocator);
        let allocation = texture_allocator.finish(game)?;

        let mut moby_entries = Vec::new();
        let mut tie_entries = Vec::new();
        let mut shrub_entries = Vec::new();
        for (kind, class_index, mut entry) in tagged_entries {
            if let Some((_, textures)) = allocation
                .class_indices
                .iter()
                .find(|((k, c), _)| *k == kind && *c == class_index)
            {
                entry.textures = *textures;
            }
            match kind {
                TableKind::Moby => moby_entries.push(entry),
                TableKind::Tie => tie_entries.push(entry),
                TableKind::Shrub => shrub_entries.push(entry),
                TableKind::Tfrag => unreachable!("tfrag classes never produce a ClassEntry"),
            }
        }

        let data_base = sink.data.len() as i32;
        let gs_ram_base = sink.gs_ram.len() as i32;
        let [tfrag_table, moby_table, tie_table, shrub_table] = allocation.tables;
        let gs_ram_entries: Vec<GsRamEntry> = allocation
            .gs_ram_entries
            .into_iter()
            .map(|mut e| {
                e.offset_1 += gs_ram_base;
                e.offset_2 += gs_ram_base;
                e
            })
            .collect();

        let mut data = sink.data;
        data.extend_from_slice(&allocation.data);
        let mut gs_ram = sink.gs_ram;
        gs_ram.extend_from_slice(&allocation.gs_ram);

        let header_size = std::mem::size_of::<LevelCoreHeader>() as u32;
        let mut index = Vec::new();
        let moby_classes = write_records(&mut index, header_size, &moby_entries);
        let tie_classes = write_records(&mut index, header_size, &tie_entries);
        let shrub_classes = write_records(&mut index, header_size, &shrub_entries);
        let tfrag_textures = write_records(&mut index, header_size, &rebase_textures(tfrag_table, data_base));
        let moby_textures = write_records(&mut index, header_size, &rebase_textures(moby_table, data_base));
        let tie_textures = write_records(&mut index, header_size, &rebase_textures(tie_table, data_base));
        let shrub_textures = write_records(&mut index, header_size, &rebase_textures(shrub_table, data_base));
        let gs_ram_range = write_records(&mut index, header_size, &gs_ram_entries);

        let compressed = compression::compress(&data);
        let header = LevelCoreHeader {
            gs_ram: gs_ram_range,
            tfrags: tfrag_offset.unwrap_or(0),
            assets_decompressed_size: data.len() as i32,
            assets_compressed_size: compressed.len() as i32,
            moby_classes,
            tie_classes,
            shrub_classes,
            tfrag_textures,
            moby_textures,
            tie_textures,
            shrub_textures,
            ..Default::default()
        };

        Ok(Assembled { header, index, data: compressed, gs_ram })
    }
}

/// Shift every texture-entry's `data_offset` by `base`: entries are laid
/// out by [`Allocator::finish`] relative to the start of its own pixel
/// block, which `pack` appends after the geometry data block rather than
/// shipping separately.
fn rebase_textures(table: Vec<TextureEntry>, base: i32) -> Vec<TextureEntry> {
    table
        .into_iter()
        .map(|mut entry| {
            entry.data_offset += base;
            entry
        })
        .collect()
}

/// Append `records` to the index block and return the [`ArrayRange`]
/// pointing at them, with `offset` measured from the start of the file
/// (`header_size` plus however much of the index has been written so
/// far), matching how `offset_in_asset_wad` is measured from the start
/// of the data block.
fn write_records<T: Pod>(index: &mut Vec<u8>, header_size: u32, records: &[T]) -> ArrayRange {
    let offset = header_size + index.len() as u32;
    for record in records {
        index.extend_from_slice(bytemuck::bytes_of(record));
    }
    ArrayRange { count: records.len() as u32, offset }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::mesh::{Face, MeshFlags, SubMesh, Vertex};

    fn flat_mesh(n: usize) -> Mesh {
        let vertices = (0..n).map(|i| Vertex::new([i as f32, 0.0, 0.0])).collect();
        let faces: Vec<Face> = (0..n as u32 - 2).map(|i| Face::Tri([i, i + 1, i + 2])).collect();
        Mesh {
            vertices,
            submeshes: vec![SubMesh { material: 0, faces }],
            flags: MeshFlags::empty(),
            joints: None,
        }
    }

    #[test]
    fn dry_run_counts_match_real_asset_count() {
        let mut assembler = Assembler::new();
        assembler.classes.push(ClassAsset::Tie { o_class: 1, mesh: flat_mesh(10), materials: vec![] });
        assembler.classes.push(ClassAsset::Shrub { o_class: 2, mesh: flat_mesh(10), materials: vec![] });
        let dry = assembler.dry_run(Game::Uya).unwrap();
        assert_eq!(dry.assets_total, 2);
        assert!(dry.data_bytes > 0);
    }

    #[test]
    fn header_is_188_bytes() {
        assert_eq!(std::mem::size_of::<LevelCoreHeader>(), 0xbc);
    }

    #[test]
    fn class_entry_is_32_bytes() {
        assert_eq!(std::mem::size_of::<ClassEntry>(), 32);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn pack_produces_compressed_data_matching_dry_run_size() {
        let mut assembler = Assembler::new();
        assembler.classes.push(ClassAsset::Tie { o_class: 1, mesh: flat_mesh(10), materials: vec![] });
        let dry = assembler.dry_run(Game::Uya).unwrap();
        let assembled = assembler.pack(Game::Uya).unwrap();
        assert_eq!(assembled.header.assets_decompressed_size as usize, dry.data_bytes);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn into_bytes_places_index_right_after_the_header() {
        let mut assembler = Assembler::new();
        assembler.classes.push(ClassAsset::Tie { o_class: 1, mesh: flat_mesh(10), materials: vec![] });
        assembler.classes.push(ClassAsset::Shrub { o_class: 2, mesh: flat_mesh(10), materials: vec![] });
        let assembled = assembler.pack(Game::Uya).unwrap();
        let bytes = assembled.into_bytes();
        assert_eq!(bytes.len(), 0xbc + assembled.index.len() + assembled.data.len() + assembled.gs_ram.len());
        assert_eq!(&bytes[0xbc..0xbc + assembled.index.len()], assembled.index.as_slice());
    }

    #[test]
    fn class_entry_offsets_are_stamped_in_emission_order() {
        let mut sink = CountingSink::default();
        let mut assembler = Assembler::new();
        assembler.classes.push(ClassAsset::Tie { o_class: 1, mesh: flat_mesh(10), materials: vec![] });
        assembler.classes.push(ClassAsset::Shrub { o_class: 2, mesh: flat_mesh(10), materials: vec![] });
        let (entries, _) = assembler.run_pass(&mut sink, Game::Uya).unwrap();
        assert_eq!(entries[0].2.offset_in_asset_wad, 0);
        assert!(entries[1].2.offset_in_asset_wad > 0);
    }

    #[test]
    fn run_pass_assigns_per_kind_class_indices() {
        let mut sink = CountingSink::default();
        let mut assembler = Assembler::new();
        assembler.classes.push(ClassAsset::Tie { o_class: 1, mesh: flat_mesh(10), materials: vec![] });
        assembler.classes.push(ClassAsset::Shrub { o_class: 2, mesh: flat_mesh(10), materials: vec![] });
        assembler.classes.push(ClassAsset::Tie { o_class: 3, mesh: flat_mesh(10), materials: vec![] });
        let (entries, _) = assembler.run_pass(&mut sink, Game::Uya).unwrap();
        assert_eq!((entries[0].0, entries[0].1), (TableKind::Tie, 0));
        assert_eq!((entries[1].0, entries[1].1), (TableKind::Shrub, 0));
        assert_eq!((entries[2].0, entries[2].1), (TableKind::Tie, 1));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn pack_patches_class_entry_textures_from_the_allocator() {
        use crate::level::texalloc::SlotOrigin;
        use crate::texture::{PixelFormat, Texture};

        let mut assembler = Assembler::new();
        assembler.classes.push(ClassAsset::Tie { o_class: 1, mesh: flat_mesh(10), materials: vec![] });
        let pixels = vec![1, 2, 3, 255].repeat(8 * 8);
        let texture = Texture::new(8, 8, PixelFormat::Rgba8888, pixels, None).unwrap();
        assembler.texture_allocator.submit(
            SlotOrigin { table: TableKind::Tie, class: 0, slot: 2 },
            Some(texture),
        );
        let assembled = assembler.pack(Game::Uya).unwrap();
        assert_eq!(assembled.header.tie_classes.count, 1);
        assert_eq!(assembled.header.tie_textures.count, 1);

        let entry_bytes =
            &assembled.index[assembled.header.tie_classes.offset as usize - std::mem::size_of::<LevelCoreHeader>()..];
        let entry: ClassEntry = bytemuck::pod_read_unaligned(&entry_bytes[..std::mem::size_of::<ClassEntry>()]);
        assert_eq!(entry.textures[2], 0);
        assert_eq!(entry.textures[0], TextureEntry::UNUSED_SLOT);
    }
}
