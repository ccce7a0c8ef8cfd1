#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use citadel_store::types::instant_from_millis;
use citadel_store::{
    BlockPos, ReinforcementStore, Reinforcement, ReinforcementType, StaticTypeCatalog,
    StaticWorldRegistry, StoreConfig, TypeCatalog, TypeId, WorldId, WorldRegistry,
};
use rusqlite::{params, Connection};

pub const HOUR_MS: i64 = 3_600_000;

/// Stone (material 1, no lore), Alpha Stone (material 1, lore "Alpha"),
/// and Iron (material 42) as types 1, 2, 7.
pub fn test_catalog() -> Arc<dyn TypeCatalog> {
    Arc::new(
        StaticTypeCatalog::new()
            .with_type(
                ReinforcementType::new(TypeId::from_raw(1), "Stone", 1).with_maturation_time_ms(HOUR_MS),
            )
            .with_type(
                ReinforcementType::new(TypeId::from_raw(2), "Alpha Stone", 1)
                    .with_maturation_time_ms(2 * HOUR_MS)
                    .with_lore(["Alpha"]),
            )
            .with_type(ReinforcementType::new(TypeId::from_raw(7), "Iron", 42)),
    )
}

/// "world" → 0, "world_nether" → 1, "world_the_end" → 3.
pub fn test_registry() -> Arc<dyn WorldRegistry> {
    Arc::new(
        StaticWorldRegistry::new()
            .with_world("world", WorldId::from_raw(0))
            .with_world("world_nether", WorldId::from_raw(1))
            .with_world("world_the_end", WorldId::from_raw(3)),
    )
}

pub fn open_store(config: StoreConfig) -> ReinforcementStore {
    ReinforcementStore::open_in_memory(test_catalog(), test_registry(), config)
        .expect("open in-memory store")
}

pub fn rein(world: u16, x: i32, y: i32, z: i32, type_id: u16, health: f32) -> Reinforcement {
    Reinforcement::new(
        BlockPos::new(WorldId::from_raw(world), x, y, z),
        TypeId::from_raw(type_id),
        1,
        instant_from_millis(1_700_000_000_000),
        health,
    )
}

pub fn create_temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn open_read_write(path: &std::path::Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

/// A row for the legacy `reinforcement` table.
pub struct Legacy<'a> {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub world: &'a str,
    pub material_id: i32,
    pub durability: &'a str,
    pub lore: Option<&'a str>,
    pub maturation_time: i64,
}

impl<'a> Legacy<'a> {
    pub fn at(x: i32, y: i32, z: i32) -> Self {
        Self {
            x,
            y,
            z,
            world: "world",
            material_id: 42,
            durability: "50",
            lore: None,
            maturation_time: 28_000_000,
        }
    }

    pub fn insert(&self, conn: &Connection) {
        conn.execute(
            "INSERT INTO reinforcement
                (x, y, z, chunk_x, chunk_z, world, material_id, durability, insecure,
                 group_id, maturation_time, rein_type_id, lore, acid_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 9, ?9, 0, ?10, 0)",
            params![
                self.x,
                self.y,
                self.z,
                self.x.div_euclid(16),
                self.z.div_euclid(16),
                self.world,
                self.material_id,
                self.durability,
                self.maturation_time,
                self.lore,
            ],
        )
        .expect("insert legacy row");
    }
}

/// Every compact row, ordered by primary key.
pub type CompactRow = (i32, i32, i64, i64, i32, i64, i64, f64, i32, bool, i64);

pub fn dump_compact(conn: &Connection) -> Vec<CompactRow> {
    let mut stmt = conn
        .prepare(
            "SELECT chunk_x, chunk_z, world_id, x_offset, y, z_offset,
                    type_id, health, group_id, insecure, creation_time
             FROM ctdl_reinforcements
             ORDER BY chunk_x, chunk_z, world_id, x_offset, y, z_offset",
        )
        .expect("prepare dump");
    stmt.query_map([], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
        ))
    })
    .expect("query dump")
    .collect::<Result<Vec<_>, _>>()
    .expect("read dump")
}

pub fn schema_version(conn: &Connection) -> u32 {
    citadel_store::schema::schema_version(conn).expect("read schema version")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
