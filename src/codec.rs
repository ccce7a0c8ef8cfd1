//! # Coordinate Encoding
//!
//! Maps a global block coordinate onto the compact primary key and back:
//!
//! ```text
//! encode:  (x, y, z, world)  →  (x >> 4, z >> 4, world)  +  (x & 15, y, z & 15)
//! decode:  chunk_x * 16 + x_offset, y, chunk_z * 16 + z_offset
//! ```
//!
//! Division is floor division and the offset is floor modulo, so negative
//! coordinates land in `0..16` too: `x = -1` is chunk `-1`, offset `15`.
//! The vertical axis is not partitioned.
//!
//! `decode(encode(p)) == p` for every `i32` coordinate.

use crate::types::{BlockOffset, BlockPos, ChunkCoord};

/// Horizontal edge length of a chunk, in blocks.
pub const CHUNK_EDGE: i32 = 16;

/// Chunk index of a global horizontal coordinate (floor division by 16).
#[inline]
pub fn chunk_index(global: i32) -> i32 {
    global.div_euclid(CHUNK_EDGE)
}

/// Offset of a global horizontal coordinate inside its chunk (floor modulo 16).
#[inline]
pub fn chunk_offset(global: i32) -> u8 {
    // rem_euclid with a positive divisor is always in 0..16
    global.rem_euclid(CHUNK_EDGE) as u8
}

/// Splits a global coordinate into its chunk and in-chunk offset.
pub fn encode(pos: BlockPos) -> (ChunkCoord, BlockOffset) {
    let chunk = ChunkCoord::new(chunk_index(pos.x), chunk_index(pos.z), pos.world);
    let offset = BlockOffset {
        x: chunk_offset(pos.x),
        y: pos.y,
        z: chunk_offset(pos.z),
    };
    (chunk, offset)
}

/// Rebuilds the global coordinate from a chunk and an in-chunk offset.
///
/// Chunk coordinates read back from storage that no `encode` could have
/// produced wrap instead of panicking.
pub fn decode(chunk: ChunkCoord, offset: BlockOffset) -> BlockPos {
    BlockPos {
        world: chunk.world,
        x: chunk.x.wrapping_mul(CHUNK_EDGE).wrapping_add(i32::from(offset.x)),
        y: offset.y,
        z: chunk.z.wrapping_mul(CHUNK_EDGE).wrapping_add(i32::from(offset.z)),
    }
}

// =============================================================================
// Tests
// =============================================================================
