//! # Domain Types for the Reinforcement Store
//!
//! Newtypes keep ids from being mixed up: a [`WorldId`] can't be passed where a
//! [`TypeId`] is expected, even though both are stored as small integers.
//!
//! ## Coordinates
//!
//! ```text
//! BlockPos (world, x, y, z)          global block coordinate
//!     │ codec::encode
//!     ▼
//! ChunkCoord (chunk_x, chunk_z, world)  +  BlockOffset (x_offset, y, z_offset)
//! ```
//!
//! The pair `(ChunkCoord, BlockOffset)` is the primary key of a stored row.

use std::fmt;

use chrono::{DateTime, Utc};

// =============================================================================
// Identifiers
// =============================================================================

/// Stable numeric id of a world, assigned by the world registry.
///
/// Stored as `smallint unsigned` in the compact table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorldId(u16);

impl WorldId {
    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a reinforcement type in the external type catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u16);

impl TypeId {
    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Positions
// =============================================================================

/// A global block coordinate within a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPos {
    pub world: WorldId,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(world: WorldId, x: i32, y: i32, z: i32) -> Self {
        Self { world, x, y, z }
    }

    /// The chunk this block lies in.
    pub fn chunk(&self) -> ChunkCoord {
        crate::codec::encode(*self).0
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}) in world {}", self.x, self.y, self.z, self.world)
    }
}

/// Identifies a 16×16 column of blocks: `(floor(x/16), floor(z/16), world)`.
///
/// Used as the bulk-load key and as the leading part of every primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
    pub world: WorldId,
}

impl ChunkCoord {
    pub fn new(x: i32, z: i32, world: WorldId) -> Self {
        Self { x, z, world }
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk [{}, {}] in world {}", self.x, self.z, self.world)
    }
}

/// A block's position inside its chunk.
///
/// `x` and `z` are always in `0..16`; `y` is the untouched global height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockOffset {
    pub x: u8,
    pub y: i32,
    pub z: u8,
}

// =============================================================================
// Catalog Entries
// =============================================================================

/// Metadata the type catalog keeps for one reinforcement type.
///
/// Only the fields the store needs are modelled: the legacy material id and
/// item lore drive the legacy migration, the maturation time re-derives
/// creation timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct ReinforcementType {
    pub id: TypeId,
    pub name: String,
    /// Material id the pre-migration schema stored for this type.
    pub legacy_material_id: i32,
    /// How long a fresh reinforcement of this type takes to mature.
    pub maturation_time_ms: i64,
    /// Lore lines of the reinforcing item; `None` if the item has no lore.
    pub item_lore: Option<Vec<String>>,
}

impl ReinforcementType {
    pub fn new(id: TypeId, name: impl Into<String>, legacy_material_id: i32) -> Self {
        Self {
            id,
            name: name.into(),
            legacy_material_id,
            maturation_time_ms: 0,
            item_lore: None,
        }
    }

    pub fn with_maturation_time_ms(mut self, ms: i64) -> Self {
        self.maturation_time_ms = ms;
        self
    }

    pub fn with_lore<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.item_lore = Some(lines.into_iter().map(Into::into).collect());
        self
    }

    pub fn has_lore(&self) -> bool {
        self.item_lore.is_some()
    }

    /// First lore line of the reinforcing item, if any.
    pub fn first_lore_line(&self) -> Option<&str> {
        self.item_lore
            .as_ref()
            .and_then(|lines| lines.first())
            .map(String::as_str)
    }
}

/// A world as the registry knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldRef {
    pub id: WorldId,
    pub name: String,
}

// =============================================================================
// Reinforcement
// =============================================================================

/// A durable protection record on one block.
///
/// The store never mutates a `Reinforcement`; it reads one to bind statement
/// parameters and builds fresh ones when loading rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Reinforcement {
    pub location: BlockPos,
    pub type_id: TypeId,
    pub group_id: i32,
    pub creation_time: DateTime<Utc>,
    pub health: f32,
    pub insecure: bool,
}

impl Reinforcement {
    pub fn new(
        location: BlockPos,
        type_id: TypeId,
        group_id: i32,
        creation_time: DateTime<Utc>,
        health: f32,
    ) -> Self {
        Self {
            location,
            type_id,
            group_id,
            creation_time,
            health,
            insecure: false,
        }
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Creation time as stored: whole milliseconds since the Unix epoch.
    pub fn creation_time_ms(&self) -> i64 {
        self.creation_time.timestamp_millis()
    }
}

/// Converts stored epoch milliseconds back to an instant.
///
/// Out-of-range values clamp to the epoch rather than failing the row.
pub fn instant_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
