//! # Legacy Table Migration
//!
//! Reshapes the wide-row `reinforcement` table into `ctdl_reinforcements`.
//!
//! ## Per-Row Transform
//!
//! ```text
//! LegacyRow                                  Reinforcement
//! ─────────                                  ─────────────
//! world name ──── WorldRegistry ───────────► location.world
//! x, y, z ────────────────────────────────► location (encoded on insert)
//! durability "87.5" ── parse ─────────────► health
//! material_id + lore ── disambiguate ─────► type_id
//! maturation_time (min) ── invert ────────► creation_time
//! group_id, insecure ─────────────────────► unchanged
//! ```
//!
//! [`LegacyTransform::transform`] is pure: it needs the type list and the
//! world registry, never a connection.
//!
//! ## Type Disambiguation
//!
//! Several current types can share one legacy material id. With one
//! candidate it is used as-is. With more, the row's lore decides:
//!
//! - row without lore: the first candidate whose item has no lore
//! - row with lore: the first candidate whose item has lore and whose first
//!   lore line equals the row's lore
//!
//! No match aborts the migration.
//!
//! ## Creation Time
//!
//! The legacy column held the minute at which a reinforcement *matures*.
//! The creation instant is recovered by subtracting the type's maturation
//! time, clamped to at least one minute after the epoch:
//!
//! ```text
//! creation_ms = max(1, maturation_min - maturation_time_ms / 60_000) * 60_000
//! ```
//!
//! ## Abort Semantics
//!
//! [`migrate_legacy_table`] clears the destination and repopulates it inside
//! one transaction. Any unresolved world, type or durability rolls the whole
//! transaction back, so the destination is exactly as it was before the step
//! and a retry starts clean.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rusqlite::{Connection, Row};
use tracing::{error, info, warn};

use crate::catalog::{TypeCatalog, WorldRegistry};
use crate::error::{BatchOp, Error, Result};
use crate::queue::PendingMutation;
use crate::schema::{
    MigrationRunner, MigrationStep, CREATE_LEGACY_REINFORCEMENTS, CREATE_REINFORCEMENTS,
    CREATE_REINFORCEMENTS_CHUNK_INDEX,
};
use crate::types::{instant_from_millis, BlockPos, Reinforcement, ReinforcementType};
use crate::writer::BatchFlusher;

/// Rows inserted per statement batch during the reshape.
pub const DEFAULT_MIGRATION_BATCH_SIZE: usize = 10_000;

const MILLIS_PER_MINUTE: i64 = 60_000;

const SELECT_LEGACY_ROWS: &str = r#"
SELECT rein_id, x, y, z, chunk_x, chunk_z, world, material_id, durability,
       insecure, group_id, maturation_time, lore
FROM reinforcement
ORDER BY rein_id
"#;

// =============================================================================
// Legacy Row
// =============================================================================

/// One row of the legacy `reinforcement` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRow {
    pub rein_id: i64,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub chunk_x: i32,
    pub chunk_z: i32,
    pub world: String,
    pub material_id: i32,
    pub durability: String,
    pub insecure: bool,
    pub group_id: i32,
    /// Minutes since the Unix epoch at which the reinforcement matures.
    pub maturation_time: i64,
    pub lore: Option<String>,
}

impl LegacyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rein_id: row.get(0)?,
            x: row.get(1)?,
            y: row.get(2)?,
            z: row.get(3)?,
            chunk_x: row.get(4)?,
            chunk_z: row.get(5)?,
            world: row.get(6)?,
            material_id: row.get(7)?,
            durability: row.get(8)?,
            insecure: row.get(9)?,
            group_id: row.get(10)?,
            maturation_time: row.get(11)?,
            lore: row.get(12)?,
        })
    }
}

// =============================================================================
// Transform
// =============================================================================

/// Maps legacy rows onto current reinforcements.
pub struct LegacyTransform {
    by_material: BTreeMap<i32, Vec<ReinforcementType>>,
    registry: Arc<dyn WorldRegistry>,
}

impl LegacyTransform {
    /// Snapshots the catalog's types, grouped by legacy material id.
    pub fn new(catalog: &dyn TypeCatalog, registry: Arc<dyn WorldRegistry>) -> Self {
        let mut by_material: BTreeMap<i32, Vec<ReinforcementType>> = BTreeMap::new();
        for rein_type in catalog.all_types() {
            by_material
                .entry(rein_type.legacy_material_id)
                .or_default()
                .push(rein_type.clone());
        }
        Self {
            by_material,
            registry,
        }
    }

    /// Converts one legacy row.
    ///
    /// # Errors
    ///
    /// - `UnknownWorld` if the world name has no id
    /// - `MalformedDurability` if the durability text is not a float
    /// - `UnmappedMaterial` / `AmbiguousLegacyType` if no single type fits
    pub fn transform(&self, row: &LegacyRow) -> Result<Reinforcement> {
        let world = self
            .registry
            .internal_id_for_name(&row.world)
            .ok_or_else(|| Error::UnknownWorld {
                name: row.world.clone(),
            })?;

        let health: f32 =
            row.durability
                .trim()
                .parse()
                .map_err(|source| Error::MalformedDurability {
                    value: row.durability.clone(),
                    source,
                })?;

        let rein_type = self.resolve_type(row.material_id, row.lore.as_deref())?;

        let location = BlockPos::new(world, row.x, row.y, row.z);
        Ok(Reinforcement::new(
            location,
            rein_type.id,
            row.group_id,
            instant_from_millis(creation_millis(row.maturation_time, rein_type)),
            health,
        )
        .with_insecure(row.insecure))
    }

    fn resolve_type(&self, material_id: i32, lore: Option<&str>) -> Result<&ReinforcementType> {
        let candidates = self
            .by_material
            .get(&material_id)
            .filter(|c| !c.is_empty())
            .ok_or(Error::UnmappedMaterial { material_id })?;

        if let [only] = candidates.as_slice() {
            return Ok(only);
        }

        candidates
            .iter()
            .find(|t| match lore {
                None => !t.has_lore(),
                Some(line) => t.has_lore() && t.first_lore_line() == Some(line),
            })
            .ok_or_else(|| Error::AmbiguousLegacyType {
                material_id,
                lore: lore.map(str::to_string),
            })
    }
}

/// Recovers the creation instant from a legacy maturation minute.
fn creation_millis(maturation_minutes: i64, rein_type: &ReinforcementType) -> i64 {
    let maturation_duration_min = rein_type.maturation_time_ms / MILLIS_PER_MINUTE;
    maturation_minutes
        .saturating_sub(maturation_duration_min)
        .max(1)
        .saturating_mul(MILLIS_PER_MINUTE)
}

// =============================================================================
// Table Reshape
// =============================================================================

/// Counters from one reshape run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Destination rows removed before repopulating.
    pub rows_cleared: usize,
    pub rows_migrated: usize,
    pub batches_flushed: usize,
}

/// Replaces the contents of `ctdl_reinforcements` with the transformed
/// legacy table, in one transaction.
///
/// Rows are streamed in `rein_id` order and inserted every `batch_size`
/// rows, plus once for the remainder.
pub fn migrate_legacy_table(
    conn: &Connection,
    transform: &LegacyTransform,
    batch_size: usize,
) -> Result<MigrationReport> {
    let start = Instant::now();
    conn.execute("BEGIN IMMEDIATE", [])?;

    let report = match reshape(conn, transform, batch_size.max(1)) {
        Ok(report) => report,
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            error!(error = %e, "legacy migration aborted, destination left unchanged");
            return Err(e);
        }
    };

    if let Err(e) = conn.execute("COMMIT", []) {
        let _ = conn.execute("ROLLBACK", []);
        return Err(e.into());
    }

    info!(
        rows = report.rows_migrated,
        batches = report.batches_flushed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "legacy reinforcements migrated"
    );
    Ok(report)
}

fn reshape(conn: &Connection, transform: &LegacyTransform, batch_size: usize) -> Result<MigrationReport> {
    let mut report = MigrationReport {
        rows_cleared: conn.execute("DELETE FROM ctdl_reinforcements", [])?,
        ..MigrationReport::default()
    };
    if report.rows_cleared > 0 {
        warn!(rows = report.rows_cleared, "removed rows left by an earlier migration attempt");
    }

    let flusher = BatchFlusher::new(conn);
    let mut select = conn.prepare(SELECT_LEGACY_ROWS)?;
    let mut rows = select.query([])?;
    let mut batch: Vec<PendingMutation> = Vec::with_capacity(batch_size.min(DEFAULT_MIGRATION_BATCH_SIZE));

    while let Some(row) = rows.next()? {
        let legacy = LegacyRow::from_row(row)?;
        let rein = transform.transform(&legacy)?;

        let chunk = rein.location.chunk();
        if (chunk.x, chunk.z) != (legacy.chunk_x, legacy.chunk_z) {
            warn!(
                rein_id = legacy.rein_id,
                stored_chunk_x = legacy.chunk_x,
                stored_chunk_z = legacy.chunk_z,
                %chunk,
                "legacy chunk columns disagree with coordinates; using coordinates"
            );
        }
        batch.push(PendingMutation::new(rein, chunk));

        if batch.len() >= batch_size {
            report.rows_migrated += flusher.execute_strict(BatchOp::Insert, &batch)?;
            report.batches_flushed += 1;
            batch.clear();
            info!(rows = report.rows_migrated, "legacy migration progress");
        }
    }

    if !batch.is_empty() {
        report.rows_migrated += flusher.execute_strict(BatchOp::Insert, &batch)?;
        report.batches_flushed += 1;
    }

    Ok(report)
}

// =============================================================================
// Step Registration
// =============================================================================

/// Registers this store's schema steps with a runner.
///
/// 1. the legacy `reinforcement` table, so older databases and fresh ones
///    share one history
/// 2. the compact table, its chunk index, and the legacy reshape
///
/// The transform is built when step 2 runs, from the catalog as it is then.
pub fn register_migrations(
    runner: &mut MigrationRunner,
    catalog: Arc<dyn TypeCatalog>,
    registry: Arc<dyn WorldRegistry>,
    batch_size: usize,
) -> Result<()> {
    runner.register(
        MigrationStep::new(1, "legacy reinforcement table").statement(CREATE_LEGACY_REINFORCEMENTS),
    )?;

    runner.register(
        MigrationStep::new(2, "chunk-relative reinforcement table")
            .statement(CREATE_REINFORCEMENTS)
            .statement(CREATE_REINFORCEMENTS_CHUNK_INDEX)
            .post_migration(move |conn| {
                let transform = LegacyTransform::new(catalog.as_ref(), Arc::clone(&registry));
                migrate_legacy_table(conn, &transform, batch_size).map(|_| ())
            }),
    )?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
