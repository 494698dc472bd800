//! The asset-bank framework: a schema-typed, precedence layered tree of
//! game assets, backed by a simple on-disk text format.
//!
//! - [`schema`] declares asset types and their attributes.
//! - [`value`] is the typed attribute value union.
//! - [`node`] is the arena-based asset tree ([`node::AssetNode`], [`node::Tree`]).
//! - [`forest`] stacks trees into precedence-ordered [`forest::Bank`]s and
//!   resolves lookups across a [`forest::Forest`].
//! - [`text`] reads and writes the on-disk asset text format.

pub mod forest;
pub mod node;
pub mod schema;
pub mod text;
pub mod value;

pub use forest::{Bank, Forest};
pub use node::{AssetNode, NodeId, Tree};
pub use schema::{AttributeDef, Schema, TypeDef};
pub use value::{AttributeType, Value};
