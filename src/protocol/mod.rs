//! Protocol module - framing for the proxy wire protocol.
//!
//! The DisService proxy protocol is a mixed text/binary stream: newline
//! terminated command and status lines interleaved with big-endian
//! integers and u32-length-prefixed blocks.

mod wire;

pub use wire::{FrameReader, FrameWriter};
