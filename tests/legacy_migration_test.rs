mod common;

use std::sync::Arc;

use citadel_store::migration::{migrate_legacy_table, DEFAULT_MIGRATION_BATCH_SIZE};
use citadel_store::schema::{CREATE_LEGACY_REINFORCEMENTS, CREATE_REINFORCEMENTS};
use citadel_store::{
    BlockPos, Error, LegacyTransform, ReinforcementStore, StaticWorldRegistry, StoreConfig, TypeId,
    WorldId,
};
use common::{
    create_temp_db_path, dump_compact, open_read_write, schema_version, test_catalog,
    test_registry, Legacy, HOUR_MS,
};

fn seed_legacy(conn: &rusqlite::Connection) {
    conn.execute_batch(CREATE_LEGACY_REINFORCEMENTS).unwrap();
    Legacy::at(20, 64, 5).insert(conn);
    Legacy {
        world: "world_nether",
        durability: "87.5",
        ..Legacy::at(-1, 12, -17)
    }
    .insert(conn);
    Legacy {
        material_id: 1,
        lore: Some("Alpha"),
        ..Legacy::at(100, 70, 100)
    }
    .insert(conn);
    Legacy {
        material_id: 1,
        ..Legacy::at(101, 70, 100)
    }
    .insert(conn);
}

#[test]
fn migrates_legacy_rows_on_open() {
    let (_dir, path) = create_temp_db_path("legacy.db");
    seed_legacy(&open_read_write(&path));

    let store =
        ReinforcementStore::open(&path, test_catalog(), test_registry(), StoreConfig::default())
            .unwrap();

    let conn = open_read_write(&path);
    assert_eq!(schema_version(&conn), 2);
    assert_eq!(dump_compact(&conn).len(), 4);

    let plain = store
        .get_for_location(BlockPos::new(WorldId::from_raw(0), 20, 64, 5))
        .unwrap()
        .expect("migrated row");
    assert_eq!(plain.type_id, TypeId::from_raw(7));
    assert_eq!(plain.health, 50.0);
    assert_eq!(plain.group_id, 9);
    assert!(!plain.insecure);
    // Iron has no maturation time: creation is the legacy minute itself
    assert_eq!(plain.creation_time_ms(), 28_000_000 * 60_000);

    let nether = store
        .get_for_location(BlockPos::new(WorldId::from_raw(1), -1, 12, -17))
        .unwrap()
        .expect("migrated nether row");
    assert_eq!(nether.health, 87.5);

    let lored = store
        .get_for_location(BlockPos::new(WorldId::from_raw(0), 100, 70, 100))
        .unwrap()
        .unwrap();
    assert_eq!(lored.type_id, TypeId::from_raw(2));
    assert_eq!(lored.creation_time_ms(), (28_000_000 - 2 * HOUR_MS / 60_000) * 60_000);

    let unlored = store
        .get_for_location(BlockPos::new(WorldId::from_raw(0), 101, 70, 100))
        .unwrap()
        .unwrap();
    assert_eq!(unlored.type_id, TypeId::from_raw(1));
    assert_eq!(unlored.creation_time_ms(), (28_000_000 - 60) * 60_000);
}

#[test]
fn aborted_migration_restarts_to_same_result_as_clean_run() {
    // Clean run for reference
    let (_clean_dir, clean_path) = create_temp_db_path("clean.db");
    seed_legacy(&open_read_write(&clean_path));
    ReinforcementStore::open(&clean_path, test_catalog(), test_registry(), StoreConfig::default())
        .unwrap();
    let expected = dump_compact(&open_read_write(&clean_path));

    // First attempt: the nether world is missing from the registry
    let (_dir, path) = create_temp_db_path("retry.db");
    seed_legacy(&open_read_write(&path));
    let partial_registry = Arc::new(StaticWorldRegistry::new().with_world("world", WorldId::from_raw(0)));

    let err = ReinforcementStore::open(
        &path,
        test_catalog(),
        partial_registry,
        StoreConfig::default().with_migration_batch_size(1),
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnknownWorld { ref name } if name == "world_nether"));

    let conn = open_read_write(&path);
    assert_eq!(schema_version(&conn), 1);
    // The first row was flushed before the abort but rolled back with it
    assert!(dump_compact(&conn).is_empty());

    // Leftovers from some earlier non-transactional attempt must not survive
    conn.execute(
        "INSERT INTO ctdl_reinforcements
            (chunk_x, chunk_z, world_id, x_offset, y, z_offset, type_id, health, group_id, insecure, creation_time)
         VALUES (500, 500, 0, 1, 1, 1, 7, 1.0, 1, 0, 60000)",
        [],
    )
    .unwrap();
    drop(conn);

    // Second attempt with the full registry
    ReinforcementStore::open(&path, test_catalog(), test_registry(), StoreConfig::default()).unwrap();

    let conn = open_read_write(&path);
    assert_eq!(schema_version(&conn), 2);
    assert_eq!(dump_compact(&conn), expected);
}

#[test]
fn unmatched_lore_aborts_migration() {
    let (_dir, path) = create_temp_db_path("beta.db");
    let conn = open_read_write(&path);
    seed_legacy(&conn);
    Legacy {
        material_id: 1,
        lore: Some("Beta"),
        ..Legacy::at(0, 0, 0)
    }
    .insert(&conn);
    drop(conn);

    let err = ReinforcementStore::open(&path, test_catalog(), test_registry(), StoreConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::AmbiguousLegacyType { material_id: 1, lore: Some(ref l) } if l == "Beta"
    ));
    assert!(dump_compact(&open_read_write(&path)).is_empty());
}

#[test]
fn migrated_store_does_not_migrate_again() {
    let (_dir, path) = create_temp_db_path("twice.db");
    seed_legacy(&open_read_write(&path));

    {
        let mut store =
            ReinforcementStore::open(&path, test_catalog(), test_registry(), StoreConfig::default())
                .unwrap();
        let doomed = store
            .get_for_location(BlockPos::new(WorldId::from_raw(0), 20, 64, 5))
            .unwrap()
            .unwrap();
        store.delete(doomed.clone(), doomed.location.chunk()).unwrap();
    }

    ReinforcementStore::open(&path, test_catalog(), test_registry(), StoreConfig::default()).unwrap();
    // The legacy table is not read again, so the deleted row stays deleted
    assert_eq!(dump_compact(&open_read_write(&path)).len(), 3);
}

#[test]
fn batches_are_flushed_every_batch_size_rows() {
    let (_dir, path) = create_temp_db_path("batches.db");
    let conn = open_read_write(&path);
    conn.execute_batch(CREATE_LEGACY_REINFORCEMENTS).unwrap();
    conn.execute_batch(CREATE_REINFORCEMENTS).unwrap();
    for x in 0..5 {
        Legacy::at(x, 64, 0).insert(&conn);
    }

    let transform = LegacyTransform::new(test_catalog().as_ref(), test_registry());
    let report = migrate_legacy_table(&conn, &transform, 2).unwrap();
    assert_eq!(report.rows_migrated, 5);
    assert_eq!(report.batches_flushed, 3);
    assert_eq!(report.rows_cleared, 0);

    let report = migrate_legacy_table(&conn, &transform, DEFAULT_MIGRATION_BATCH_SIZE).unwrap();
    assert_eq!(report.rows_cleared, 5);
    assert_eq!(report.rows_migrated, 5);
    assert_eq!(report.batches_flushed, 1);
    assert!(conn.is_autocommit());
}
