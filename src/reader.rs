//! # Reinforcement Reader
//!
//! Read paths against `ctdl_reinforcements`. Every function takes a borrowed
//! connection; the store hands in a read-only one and drops it afterwards.
//!
//! ## Type Resolution
//!
//! Rows store only a numeric type id. Each read resolves it through the
//! [`TypeCatalog`]; a type that was removed from the catalog is treated
//! differently per path:
//!
//! | Path | Unknown type id |
//! |------|-----------------|
//! | [`get_for_location`] | `Err(UnknownType)`, never a half-built record |
//! | [`load_chunk`] | Row skipped and logged, the rest of the chunk loads |
//!
//! Reads go straight to SQL and do not see mutations still waiting in the
//! batch queues.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, error, warn};

use crate::catalog::{TypeCatalog, WorldRegistry};
use crate::codec;
use crate::error::{Error, Result};
use crate::types::{
    instant_from_millis, BlockOffset, BlockPos, ChunkCoord, Reinforcement, TypeId, WorldId,
};

// =============================================================================
// SQL Statements
// =============================================================================

const SELECT_REINFORCEMENT: &str = r#"
SELECT type_id, group_id, creation_time, health, insecure
FROM ctdl_reinforcements
WHERE chunk_x = ?1 AND chunk_z = ?2 AND world_id = ?3
  AND x_offset = ?4 AND y = ?5 AND z_offset = ?6
"#;

const SELECT_CHUNK_REINFORCEMENTS: &str = r#"
SELECT x_offset, y, z_offset, type_id, group_id, creation_time, health, insecure
FROM ctdl_reinforcements
WHERE chunk_x = ?1 AND chunk_z = ?2 AND world_id = ?3
"#;

const SELECT_ALL_DATA_CHUNKS: &str = r#"
SELECT chunk_x, chunk_z, world_id
FROM ctdl_reinforcements
GROUP BY chunk_x, chunk_z, world_id
"#;

// =============================================================================
// Row Mapping
// =============================================================================

/// Columns shared by both reinforcement selects, starting at `first`.
struct StoredFields {
    type_id: TypeId,
    group_id: i32,
    creation_time_ms: i64,
    health: f32,
    insecure: bool,
}

impl StoredFields {
    fn from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Self> {
        let health: f64 = row.get(first + 3)?;
        Ok(Self {
            type_id: TypeId::from_raw(row.get(first)?),
            group_id: row.get(first + 1)?,
            creation_time_ms: row.get(first + 2)?,
            health: health as f32,
            insecure: row.get(first + 4)?,
        })
    }

    fn into_reinforcement(self, location: BlockPos) -> Reinforcement {
        Reinforcement::new(
            location,
            self.type_id,
            self.group_id,
            instant_from_millis(self.creation_time_ms),
            self.health,
        )
        .with_insecure(self.insecure)
    }
}

// =============================================================================
// Read Functions
// =============================================================================

/// Loads the reinforcement stored at one block, if any.
///
/// # Errors
///
/// - `UnknownWorldId` if the registry no longer knows `pos.world`
/// - `UnknownType` if the stored type id no longer resolves
/// - `Sqlite` on any database failure
pub fn get_for_location(
    conn: &Connection,
    catalog: &dyn TypeCatalog,
    registry: &dyn WorldRegistry,
    pos: BlockPos,
) -> Result<Option<Reinforcement>> {
    if registry.world_for_internal_id(pos.world).is_none() {
        error!(world_id = %pos.world, "no world registered for id");
        return Err(Error::UnknownWorldId {
            world_id: pos.world,
        });
    }

    let (chunk, offset) = codec::encode(pos);
    let fields = conn
        .query_row(
            SELECT_REINFORCEMENT,
            params![
                chunk.x,
                chunk.z,
                chunk.world.as_raw(),
                offset.x,
                offset.y,
                offset.z
            ],
            |row| StoredFields::from_row(row, 0),
        )
        .optional()?;

    let Some(fields) = fields else {
        return Ok(None);
    };

    if catalog.resolve_type(fields.type_id).is_none() {
        error!(type_id = %fields.type_id, location = %pos, "failed to load reinforcement with unknown type");
        return Err(Error::UnknownType {
            type_id: fields.type_id,
        });
    }

    Ok(Some(fields.into_reinforcement(pos)))
}

/// Loads every reinforcement stored in one chunk.
///
/// Rows whose type no longer resolves are skipped and logged. A chunk in a
/// world the registry does not know yields nothing.
pub fn load_chunk(
    conn: &Connection,
    catalog: &dyn TypeCatalog,
    registry: &dyn WorldRegistry,
    chunk: ChunkCoord,
) -> Result<Vec<Reinforcement>> {
    if registry.world_for_internal_id(chunk.world).is_none() {
        warn!(%chunk, "skipping chunk in unregistered world");
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare_cached(SELECT_CHUNK_REINFORCEMENTS)?;
    let rows = stmt.query_map(params![chunk.x, chunk.z, chunk.world.as_raw()], |row| {
        let offset = BlockOffset {
            x: row.get(0)?,
            y: row.get(1)?,
            z: row.get(2)?,
        };
        Ok((offset, StoredFields::from_row(row, 3)?))
    })?;

    let mut loaded = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        let (offset, fields) = row?;
        let location = codec::decode(chunk, offset);
        if catalog.resolve_type(fields.type_id).is_none() {
            error!(type_id = %fields.type_id, %location, "failed to load reinforcement with unknown type");
            skipped += 1;
            continue;
        }
        loaded.push(fields.into_reinforcement(location));
    }

    debug!(%chunk, loaded = loaded.len(), skipped, "chunk loaded");
    Ok(loaded)
}

/// Every chunk with at least one stored reinforcement.
pub fn all_data_chunks(conn: &Connection) -> Result<BTreeSet<ChunkCoord>> {
    let mut stmt = conn.prepare_cached(SELECT_ALL_DATA_CHUNKS)?;
    let chunks = stmt
        .query_map([], |row| {
            Ok(ChunkCoord::new(
                row.get(0)?,
                row.get(1)?,
                WorldId::from_raw(row.get(2)?),
            ))
        })?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(chunks)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{StaticTypeCatalog, StaticWorldRegistry};
    use crate::error::BatchOp;
    use crate::queue::{BatchQueue, PendingMutation};
    use crate::schema::{Datasource, CREATE_REINFORCEMENTS, CREATE_REINFORCEMENTS_CHUNK_INDEX};
    use crate::types::ReinforcementType;
    use crate::writer::BatchFlusher;

    fn world() -> WorldId {
        WorldId::from_raw(3)
    }

    fn setup() -> (Datasource, StaticTypeCatalog, StaticWorldRegistry) {
        let source = Datasource::open_in_memory().unwrap();
        let conn = source.acquire().unwrap();
        conn.execute_batch(CREATE_REINFORCEMENTS).unwrap();
        conn.execute_batch(CREATE_REINFORCEMENTS_CHUNK_INDEX).unwrap();

        let catalog = StaticTypeCatalog::new()
            .with_type(ReinforcementType::new(TypeId::from_raw(7), "Stone", 1));
        let registry = StaticWorldRegistry::new().with_world("world", world());
        (source, catalog, registry)
    }

    fn store(conn: &Connection, reins: Vec<Reinforcement>) {
        let mut queue = BatchQueue::new();
        for rein in reins {
            let chunk = rein.location.chunk();
            queue.push(PendingMutation::new(rein, chunk));
        }
        BatchFlusher::new(conn)
            .flush_immediate(BatchOp::Insert, &mut queue, &mut Vec::new())
            .unwrap();
    }

    fn rein(x: i32, y: i32, z: i32, type_id: u16) -> Reinforcement {
        Reinforcement::new(
            BlockPos::new(world(), x, y, z),
            TypeId::from_raw(type_id),
            1,
            instant_from_millis(1_650_000_000_123),
            100.0,
        )
    }

    #[test]
    fn test_get_for_location_found_and_missing() {
        let (source, catalog, registry) = setup();
        let conn = source.acquire().unwrap();
        store(&conn, vec![rein(-3, 12, 40, 7).with_insecure(true)]);

        let ro = source.acquire_read_only().unwrap();
        let found = get_for_location(&ro, &catalog, &registry, BlockPos::new(world(), -3, 12, 40))
            .unwrap()
            .expect("should find reinforcement");
        assert_eq!(found, rein(-3, 12, 40, 7).with_insecure(true));

        let missing =
            get_for_location(&ro, &catalog, &registry, BlockPos::new(world(), -3, 13, 40)).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_get_for_location_unknown_type_is_error() {
        let (source, catalog, registry) = setup();
        let conn = source.acquire().unwrap();
        store(&conn, vec![rein(0, 0, 0, 99)]);

        let err = get_for_location(&conn, &catalog, &registry, BlockPos::new(world(), 0, 0, 0))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownType { type_id } if type_id.as_raw() == 99));
        assert!(err.is_integrity());
    }

    #[test]
    fn test_get_for_location_unknown_world_is_error() {
        let (source, catalog, registry) = setup();
        let conn = source.acquire().unwrap();

        let err = get_for_location(
            &conn,
            &catalog,
            &registry,
            BlockPos::new(WorldId::from_raw(8), 0, 0, 0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownWorldId { .. }));
    }

    #[test]
    fn test_load_chunk_decodes_and_skips_unknown_types() {
        let (source, catalog, registry) = setup();
        let conn = source.acquire().unwrap();
        store(
            &conn,
            vec![
                rein(-1, 5, -1, 7),
                rein(-16, 6, -16, 7),
                rein(-2, 7, -3, 42),
                // neighbouring chunk
                rein(0, 5, 0, 7),
            ],
        );

        let chunk = ChunkCoord::new(-1, -1, world());
        let mut loaded = load_chunk(&conn, &catalog, &registry, chunk).unwrap();
        loaded.sort_by_key(|r| r.location.x);

        let locations: Vec<(i32, i32, i32)> = loaded
            .iter()
            .map(|r| (r.location.x, r.location.y, r.location.z))
            .collect();
        assert_eq!(locations, vec![(-16, 6, -16), (-1, 5, -1)]);
    }

    #[test]
    fn test_all_data_chunks_is_distinct() {
        let (source, _, _) = setup();
        let conn = source.acquire().unwrap();
        store(
            &conn,
            vec![rein(20, 64, 5, 7), rein(21, 64, 5, 7), rein(-20, 64, 5, 7)],
        );

        let chunks = all_data_chunks(&conn).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.contains(&ChunkCoord::new(1, 0, world())));
        assert!(chunks.contains(&ChunkCoord::new(-2, 0, world())));
    }
}
