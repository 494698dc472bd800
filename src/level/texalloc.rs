//! Shared-texture allocator.
//!
//! Deduplicates textures and palettes across a level and lays them out in
//! GPU RAM and the data block, producing four parallel texture-entry
//! tables keyed by consumer class. Grounded on
//! `original_source/src/wrenchbuild/level/level_textures.h`'s
//! `LevelTexture`/`TextureEntry`/`GsRamEntry` triple and
//! `deduplicate_level_textures`/`deduplicate_level_palettes`.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::io::OutBuffer;
use crate::texture::{PixelFormat, Texture};

/// Which of the four per-class texture-entry tables a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Tfrag,
    Moby,
    Tie,
    Shrub,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [TableKind::Tfrag, TableKind::Moby, TableKind::Tie, TableKind::Shrub];

    pub(crate) fn index(self) -> usize {
        match self {
            TableKind::Tfrag => 0,
            TableKind::Moby => 1,
            TableKind::Tie => 2,
            TableKind::Shrub => 3,
        }
    }
}

/// A texture-entry record: data offset, dimensions, palette/mipmap slots,
/// and a type discriminator (original `TextureEntry`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureEntry {
    pub data_offset: i32,
    pub width: i16,
    pub height: i16,
    pub kind: i16,
    pub palette: i16,
    pub mipmap: i16,
    pub pad: i16,
}

impl TextureEntry {
    pub const UNUSED_SLOT: u8 = 0xFF;
}

/// A staging record describing one upload to GPU memory (original
/// `GsRamEntry`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GsRamEntry {
    /// 0 = palette RGBA32, 1 = palette RGBA16, 0x13 = IDTEX8.
    pub kind: i32,
    pub width: i16,
    pub height: i16,
    pub offset_1: i32,
    /// Duplicate of `offset_1` in the original format; kept as a distinct
    /// field for byte-layout fidelity.
    pub offset_2: i32,
}

const GS_KIND_PALETTE_RGBA32: i32 = 0;
const GS_KIND_IDTEX8: i32 = 0x13;

/// Where a single slot's texture came from, before dedupe collapses
/// equal textures into one representative.
#[derive(Debug, Clone, Copy)]
pub struct SlotOrigin {
    pub table: TableKind,
    /// Which class (moby/tie/shrub index, or tfrag chunk index) the slot
    /// belongs to.
    pub class: usize,
    /// Which of the up to 16 texture slots within that class.
    pub slot: usize,
}

/// One texture submitted to the allocator, alongside the slot(s) that
/// reference it and the dedupe state computed by [`Allocator::finish`].
struct Entry {
    texture: Option<Texture>,
    origins: Vec<SlotOrigin>,
    /// Index of the representative texture this one dedupes to (itself if
    /// it is the representative).
    texture_out_edge: usize,
    /// Index of the representative *palette* this one dedupes to.
    palette_out_edge: usize,
    data_offset: i32,
    palette_offset: i32,
    mipmap_offset: i32,
    per_table_index: [Option<i32>; 4],
}

/// Finished allocation: the data block, the GS-RAM block, the four
/// texture-entry tables, and per-class 16-byte index arrays.
pub struct Allocation {
    pub data: Vec<u8>,
    pub gs_ram: Vec<u8>,
    pub gs_ram_entries: Vec<GsRamEntry>,
    pub tables: [Vec<TextureEntry>; 4],
    /// One 16-byte array per `(table, class)` pair that had any slots
    /// submitted.
    pub class_indices: Vec<((TableKind, usize), [u8; 16])>,
}

/// Collects textures from every consumer class, deduplicates them, and
/// lays out the resulting data block, GS-RAM block, and texture-entry
/// tables.
#[derive(Default)]
pub struct Allocator {
    entries: Vec<Entry>,
    max_mipmap_levels: u32,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator {
            entries: Vec::new(),
            max_mipmap_levels: 7,
        }
    }

    /// Submit one texture slot. `texture = None` represents a missing
    /// slot - it survives dedupe as an empty record rather than being
    /// dropped.
    pub fn submit(&mut self, origin: SlotOrigin, texture: Option<Texture>) -> usize {
        let index = self.entries.len();
        self.entries.push(Entry {
            texture,
            origins: vec![origin],
            texture_out_edge: index,
            palette_out_edge: index,
            data_offset: -1,
            palette_offset: -1,
            mipmap_offset: -1,
            per_table_index: [None; 4],
        });
        index
    }

    /// Run the full pack-direction algorithm: normalize, dedupe textures,
    /// dedupe palettes among representatives, emit pixels/palettes/
    /// mipmaps, and build the four texture-entry tables plus per-class
    /// index arrays.
    pub fn finish(mut self, game: crate::game::Game) -> Result<Allocation> {
        self.normalize(game)?;
        self.dedupe_textures();
        self.dedupe_palettes();

        let mut data = OutBuffer::new();
        let mut gs_ram = OutBuffer::new();
        let mut gs_ram_entries = Vec::new();

        for i in 0..self.entries.len() {
            if self.entries[i].texture_out_edge != i {
                continue; // not a representative
            }
            let Some(tex) = self.entries[i].texture.clone() else {
                continue;
            };

            if self.entries[i].palette_out_edge == i {
                if let Some(palette) = &tex.palette {
                    gs_ram.align(256);
                    let offset = gs_ram.len() as i32;
                    for colour in palette {
                        gs_ram.push_bytes(colour);
                    }
                    self.entries[i].palette_offset = offset;
                    gs_ram_entries.push(GsRamEntry {
                        kind: GS_KIND_PALETTE_RGBA32,
                        width: if tex.format == PixelFormat::Paletted4 {
                            16
                        } else {
                            256
                        },
                        height: 1,
                        offset_1: offset,
                        offset_2: offset,
                    });
                }
            } else {
                let rep = self.entries[i].palette_out_edge;
                self.entries[i].palette_offset = self.entries[rep].palette_offset;
            }

            let mipmaps = tex.mipmap_chain(self.max_mipmap_levels);
            if let Some(first) = mipmaps.first() {
                gs_ram.align(256);
                let offset = gs_ram.len() as i32;
                for level in &mipmaps {
                    gs_ram.push_bytes(&level.pixels);
                }
                self.entries[i].mipmap_offset = offset;
                gs_ram_entries.push(GsRamEntry {
                    kind: GS_KIND_IDTEX8,
                    width: first.width as i16,
                    height: first.height as i16,
                    offset_1: offset,
                    offset_2: offset,
                });
            }

            data.align(256);
            let offset = data.len() as i32;
            data.push_bytes(&tex.pixels);
            self.entries[i].data_offset = offset;
        }

        // A representative is "referenced from table T" if any entry that
        // dedupes to it (including itself) has an origin in T.
        let mut referenced_in: Vec<[bool; 4]> = vec![[false; 4]; self.entries.len()];
        for i in 0..self.entries.len() {
            let rep = self.entries[i].texture_out_edge;
            for origin in &self.entries[i].origins {
                referenced_in[rep][origin.table.index()] = true;
            }
        }

        let mut tables: [Vec<TextureEntry>; 4] = Default::default();
        for table_kind in TableKind::ALL {
            let t = table_kind.index();
            for i in 0..self.entries.len() {
                if self.entries[i].texture_out_edge != i || !referenced_in[i][t] {
                    continue;
                }
                let Some(tex) = &self.entries[i].texture else {
                    continue;
                };
                let local_index = tables[t].len() as i32;
                tables[t].push(TextureEntry {
                    data_offset: self.entries[i].data_offset,
                    width: tex.width as i16,
                    height: tex.height as i16,
                    kind: 0,
                    palette: (self.entries[i].palette_offset / 256).max(-1) as i16,
                    mipmap: (self.entries[i].mipmap_offset / 256).max(-1) as i16,
                    pad: -1,
                });
                self.entries[i].per_table_index[t] = Some(local_index);
            }
        }

        let mut class_indices: Vec<((TableKind, usize), [u8; 16])> = Vec::new();
        for i in 0..self.entries.len() {
            let rep = self.entries[i].texture_out_edge;
            for origin in self.entries[i].origins.clone() {
                if origin.slot >= 16 {
                    return Err(Error::FileFormatError(format!(
                        "texture slot {} exceeds the 16-slot class limit",
                        origin.slot
                    )));
                }
                let key = (origin.table, origin.class);
                let slot_array = match class_indices.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, arr)) => arr,
                    None => {
                        class_indices.push((key, [TextureEntry::UNUSED_SLOT; 16]));
                        &mut class_indices.last_mut().unwrap().1
                    }
                };
                let t = origin.table.index();
                if let Some(local) = self.entries[rep].per_table_index[t] {
                    slot_array[origin.slot] = local as u8;
                }
            }
        }

        Ok(Allocation {
            data: data.into_bytes(),
            gs_ram: gs_ram.into_bytes(),
            gs_ram_entries,
            tables,
            class_indices,
        })
    }

    /// Normalize every submitted texture to 8-bit paletted form, divide
    /// alphas, swizzle the palette, and (if the target game requires it)
    /// swizzle the pixels.
    fn normalize(&mut self, game: crate::game::Game) -> Result<()> {
        for entry in &mut self.entries {
            let Some(tex) = entry.texture.take() else {
                continue;
            };
            let mut tex = if tex.format == PixelFormat::Rgba8888 {
                let divided = tex.divide_alphas()?;
                match divided.to_8bit_paletted() {
                    Ok(p) => p,
                    Err(Error::Unimplemented(_)) => divided.to_grayscale()?,
                    Err(e) => return Err(e),
                }
            } else {
                tex
            };
            if let Some(palette) = tex.palette.take() {
                let swizzled = crate::texture::swizzle_palette(&palette);
                tex.palette = Some(swizzled);
            }
            if game.uses_texture_swizzle() && tex.format == PixelFormat::Paletted8 {
                tex.pixels = crate::texture::swizzle_texture_8bit(
                    &tex.pixels,
                    tex.width as usize,
                    tex.height as usize,
                )?;
            }
            entry.texture = Some(tex);
        }
        Ok(())
    }

    /// Sort indices by full texture equality; for every maximal run of
    /// equal textures, the lowest index becomes the representative.
    fn dedupe_textures(&mut self) {
        let mut order: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].texture.is_some())
            .collect();
        order.sort_by(|&a, &b| self.entries[a].texture.cmp(&self.entries[b].texture));

        let mut i = 0;
        while i < order.len() {
            let mut j = i + 1;
            while j < order.len() && self.entries[order[j]].texture == self.entries[order[i]].texture
            {
                j += 1;
            }
            let rep = *order[i..j].iter().min().unwrap();
            for &k in &order[i..j] {
                self.entries[k].texture_out_edge = rep;
            }
            i = j;
        }
    }

    /// Among representatives only, dedupe by palette equality.
    fn dedupe_palettes(&mut self) {
        let mut reps: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].texture_out_edge == i && self.entries[i].texture.is_some())
            .collect();
        reps.sort_by(|&a, &b| {
            let pa = self.entries[a].texture.as_ref().and_then(|t| t.palette.as_ref());
            let pb = self.entries[b].texture.as_ref().and_then(|t| t.palette.as_ref());
            pa.cmp(&pb)
        });

        let mut i = 0;
        while i < reps.len() {
            let mut j = i + 1;
            let pi = self.entries[reps[i]].texture.as_ref().and_then(|t| t.palette.as_ref());
            while j < reps.len() {
                let pj = self.entries[reps[j]].texture.as_ref().and_then(|t| t.palette.as_ref());
                if pi.is_some() && pi == pj {
                    j += 1;
                } else {
                    break;
                }
            }
            if pi.is_some() {
                let rep = *reps[i..j].iter().min().unwrap();
                for &k in &reps[i..j] {
                    self.entries[k].palette_out_edge = rep;
                }
            }
            i = j;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Game;

    fn rgba(colour: [u8; 4], w: u32, h: u32) -> Texture {
        let mut pixels = Vec::with_capacity((w * h * 4) as usize);
        for _ in 0..(w * h) {
            pixels.extend_from_slice(&colour);
        }
        Texture::new(w, h, PixelFormat::Rgba8888, pixels, None).unwrap()
    }

    #[test]
    fn identical_textures_collapse_to_one_representative() {
        let mut alloc = Allocator::new();
        alloc.submit(
            SlotOrigin { table: TableKind::Moby, class: 0, slot: 0 },
            Some(rgba([10, 20, 30, 255], 8, 8)),
        );
        alloc.submit(
            SlotOrigin { table: TableKind::Moby, class: 1, slot: 0 },
            Some(rgba([10, 20, 30, 255], 8, 8)),
        );
        let result = alloc.finish(Game::Uya).unwrap();
        assert_eq!(result.tables[TableKind::Moby.index()].len(), 2);
        let a = result.tables[TableKind::Moby.index()][0];
        let b = result.tables[TableKind::Moby.index()][1];
        assert_eq!(a.data_offset, b.data_offset);
    }

    #[test]
    fn distinct_textures_each_get_an_entry() {
        let mut alloc = Allocator::new();
        alloc.submit(
            SlotOrigin { table: TableKind::Tie, class: 0, slot: 0 },
            Some(rgba([1, 2, 3, 255], 8, 8)),
        );
        alloc.submit(
            SlotOrigin { table: TableKind::Tie, class: 1, slot: 0 },
            Some(rgba([4, 5, 6, 255], 8, 8)),
        );
        let result = alloc.finish(Game::Uya).unwrap();
        let tie = &result.tables[TableKind::Tie.index()];
        assert_eq!(tie.len(), 2);
        assert_ne!(tie[0].data_offset, tie[1].data_offset);
    }

    #[test]
    fn unused_slot_is_0xff() {
        let mut alloc = Allocator::new();
        alloc.submit(
            SlotOrigin { table: TableKind::Shrub, class: 0, slot: 3 },
            Some(rgba([9, 9, 9, 255], 8, 8)),
        );
        let result = alloc.finish(Game::Gc).unwrap();
        let (_, indices) = result
            .class_indices
            .iter()
            .find(|((t, c), _)| *t == TableKind::Shrub && *c == 0)
            .unwrap();
        assert_eq!(indices[0], TextureEntry::UNUSED_SLOT);
        assert_ne!(indices[3], TextureEntry::UNUSED_SLOT);
    }
}
