//! **racpak** - an asset packing/unpacking engine for a PS2 action-adventure
//! level format (Ratchet & Clank-series terrain, statics, foliage and
//! animated objects).
//!
//! # Layout
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`bank`]        | Schema-typed, precedence-layered asset tree and its on-disk text format |
//! | [`level`]       | Per-geometry-class codecs (tfrag/tie/shrub/moby) and the level-core assembler |
//! | [`texture`]     | Paletted/RGBA texture conversion and swizzle |
//! | [`vif`]         | VIF command stream encode/decode |
//! | [`gif`]         | GIF AD (address+data) GPU register packet encode/decode |
//! | [`compression`] | The level-core WAD container's LZ codec (feature `compression`) |
//! | [`io`]          | Shared binary reader/writer primitives |
//! | [`game`]        | The `Game`/`Region` hint threaded through every codec entry point |

pub mod bank;
pub mod compression;
pub mod error;
pub mod game;
pub mod gif;
pub mod io;
pub mod level;
pub mod texture;
pub mod vif;

pub use error::{Error, Result};
