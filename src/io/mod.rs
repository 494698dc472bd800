//! Typed byte I/O primitives over in-memory buffers.
//!
//! Two halves mirror the read/write split the rest of the crate relies on:
//!
//! * [`buffer::Buffer`] - a half-open, bounds-checked read window.
//! * [`outbuffer::OutBuffer`] - an append-only write buffer with
//!   allocate-then-patch discipline for headers whose contents aren't known
//!   until everything after them has been written.
//!
//! Every multi-byte integer in every format this crate parses is
//! little-endian; there is no per-call endianness parameter the way
//! `hakkit::utils` exposes one, because nothing in the PS2-era formats this
//! crate targets is big-endian.

pub mod buffer;
pub mod outbuffer;

pub use buffer::Buffer;
pub use outbuffer::{Label, OutBuffer};
