//! # SQLite Schema and Connection Source
//!
//! This module owns the DDL, the [`Datasource`] that hands out connections, and
//! the [`MigrationRunner`] that brings a database up to the current schema.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  reinforcement (legacy, read-only)     ctdl_reinforcements (compact)    │
//! │  ┌──────────────────────┐              ┌──────────────────────────────┐ │
//! │  │ rein_id (PK, autoinc)│   migrate    │ chunk_x  ┐                   │ │
//! │  │ x, y, z              │ ───────────► │ chunk_z  │                   │ │
//! │  │ chunk_x, chunk_z     │              │ world_id │ PRIMARY KEY       │ │
//! │  │ world (name)         │              │ x_offset │                   │ │
//! │  │ material_id          │              │ y        │                   │ │
//! │  │ durability (text)    │              │ z_offset ┘                   │ │
//! │  │ maturation_time (min)│              │ type_id, health, group_id    │ │
//! │  │ lore                 │              │ insecure, creation_time (ms) │ │
//! │  └──────────────────────┘              └──────────────────────────────┘ │
//! │                                                                         │
//! │  ctdl_metadata: key/value, holds the applied schema version             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## One Connection per Unit of Work
//!
//! A [`Datasource`] does not hold a pool. Every read, immediate flush, full
//! flush and migration opens its own `Connection` and drops it when done, so
//! the connection is released on every exit path including `?` returns.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::{Error, Result};

// =============================================================================
// DDL Statements
// =============================================================================

/// Key/value metadata; `schema_version` records the last applied migration step.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS ctdl_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// The pre-migration wide-row table, keyed by insertion order.
///
/// # Columns
///
/// - `world`: world *name*, resolved to an id only during migration
/// - `durability`: health as decimal text
/// - `maturation_time`: minutes since the Unix epoch at which the
///   reinforcement matures (not when it was created)
/// - `lore`: first lore line of the reinforcing item, disambiguates types
///   sharing a `material_id`
pub const CREATE_LEGACY_REINFORCEMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS reinforcement (
    rein_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    x               INTEGER NOT NULL,
    y               INTEGER NOT NULL,
    z               INTEGER NOT NULL,
    chunk_x         INTEGER NOT NULL,
    chunk_z         INTEGER NOT NULL,
    world           TEXT NOT NULL,
    material_id     INTEGER NOT NULL,
    durability      TEXT NOT NULL,
    insecure        INTEGER NOT NULL,
    group_id        INTEGER NOT NULL,
    maturation_time INTEGER NOT NULL,
    rein_type_id    INTEGER NOT NULL,
    lore            TEXT DEFAULT NULL,
    acid_time       INTEGER NOT NULL
)
"#;

/// The compact chunk-relative table.
///
/// # Invariants
///
/// - At most one row per block: the primary key is the full encoded position
/// - `x_offset` and `z_offset` are floor-modulo 16 of the global coordinate
/// - `creation_time` is whole milliseconds since the Unix epoch
pub const CREATE_REINFORCEMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS ctdl_reinforcements (
    chunk_x       INTEGER NOT NULL,
    chunk_z       INTEGER NOT NULL,
    world_id      INTEGER NOT NULL CHECK (world_id BETWEEN 0 AND 65535),
    x_offset      INTEGER NOT NULL CHECK (x_offset BETWEEN 0 AND 15),
    y             INTEGER NOT NULL,
    z_offset      INTEGER NOT NULL CHECK (z_offset BETWEEN 0 AND 15),
    type_id       INTEGER NOT NULL CHECK (type_id BETWEEN 0 AND 65535),
    health        REAL NOT NULL,
    group_id      INTEGER NOT NULL,
    insecure      INTEGER NOT NULL DEFAULT 0,
    creation_time INTEGER NOT NULL,
    PRIMARY KEY (chunk_x, chunk_z, world_id, x_offset, y, z_offset)
)
"#;

/// Supports the chunk-scoped bulk load.
pub const CREATE_REINFORCEMENTS_CHUNK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS rein_chunk_lookup
ON ctdl_reinforcements(chunk_x, chunk_z, world_id)
"#;

/// How long a connection waits on a locked file database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Datasource
// =============================================================================

/// Where connections point.
#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    /// Shared-cache in-memory database, addressed by URI.
    Memory(String),
}

/// Hands out connections to one SQLite database.
///
/// # Ownership
///
/// For in-memory databases the datasource keeps one connection open for its
/// whole lifetime: SQLite drops a shared in-memory database when its last
/// connection closes.
#[derive(Debug)]
pub struct Datasource {
    target: Target,
    _keep_alive: Option<Connection>,
}

impl Datasource {
    /// Opens (creating if needed) a database file and prepares it for use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let source = Self {
            target: Target::File(path.as_ref().to_path_buf()),
            _keep_alive: None,
        };
        let conn = source.acquire()?;
        // WAL is persistent per file; set it once
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(CREATE_METADATA)?;
        Ok(source)
    }

    /// Creates a fresh, private in-memory database.
    ///
    /// Each call gets its own database, so tests do not see each other's rows.
    pub fn open_in_memory() -> Result<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let uri = format!(
            "file:citadel-mem-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            id
        );

        let keep_alive = Connection::open(&uri)?;
        keep_alive.execute_batch(CREATE_METADATA)?;

        Ok(Self {
            target: Target::Memory(uri),
            _keep_alive: Some(keep_alive),
        })
    }

    /// Opens a new read-write connection.
    pub fn acquire(&self) -> Result<Connection> {
        let conn = match &self.target {
            Target::File(path) => {
                let conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch("PRAGMA synchronous = NORMAL")?;
                conn
            }
            Target::Memory(uri) => Connection::open(uri)?,
        };
        Ok(conn)
    }

    /// Opens a new connection that refuses writes.
    pub fn acquire_read_only(&self) -> Result<Connection> {
        let conn = self.acquire()?;
        conn.execute_batch("PRAGMA query_only = ON")?;
        Ok(conn)
    }

    /// The database file, if this is not an in-memory database.
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File(path) => Some(path),
            Target::Memory(_) => None,
        }
    }
}

// =============================================================================
// Schema Version
// =============================================================================

/// Reads the last applied migration version, `0` for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM ctdl_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Schema(format!("unreadable schema version '{v}'"))),
    }
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO ctdl_metadata (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [version.to_string()],
    )?;
    Ok(())
}

// =============================================================================
// Migration Runner
// =============================================================================

/// Work a step runs after its SQL statements.
pub type PostMigration = Box<dyn Fn(&mut Connection) -> Result<()> + Send + Sync>;

/// One versioned schema change.
pub struct MigrationStep {
    pub version: u32,
    pub description: &'static str,
    statements: Vec<&'static str>,
    post: Option<PostMigration>,
}

impl MigrationStep {
    pub fn new(version: u32, description: &'static str) -> Self {
        Self {
            version,
            description,
            statements: Vec::new(),
            post: None,
        }
    }

    /// Adds a statement; statements run in the order added.
    pub fn statement(mut self, sql: &'static str) -> Self {
        self.statements.push(sql);
        self
    }

    /// Sets the transform that runs once every statement has succeeded.
    pub fn post_migration(
        mut self,
        post: impl Fn(&mut Connection) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.post = Some(Box::new(post));
        self
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("statements", &self.statements.len())
            .field("post", &self.post.is_some())
            .finish()
    }
}

/// Applies registered steps in version order, each at most once.
///
/// # Retry Semantics
///
/// A step's version is recorded only after its statements and its
/// post-migration both succeed. A failed step leaves the recorded version
/// where it was, so the next [`run`](Self::run) retries it from the start.
/// Statements must therefore be idempotent (`IF NOT EXISTS`), and
/// post-migrations must clean up after a partial earlier attempt.
#[derive(Debug, Default)]
pub struct MigrationRunner {
    steps: BTreeMap<u32, MigrationStep>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step.
    ///
    /// # Errors
    ///
    /// `Error::Schema` if a step with the same version is already registered,
    /// or the version is 0 (reserved for "nothing applied").
    pub fn register(&mut self, step: MigrationStep) -> Result<()> {
        if step.version == 0 {
            return Err(Error::Schema("migration version 0 is reserved".to_string()));
        }
        if self.steps.contains_key(&step.version) {
            return Err(Error::Schema(format!(
                "migration version {} registered twice",
                step.version
            )));
        }
        self.steps.insert(step.version, step);
        Ok(())
    }

    /// Highest registered version.
    pub fn latest_version(&self) -> u32 {
        self.steps.keys().next_back().copied().unwrap_or(0)
    }

    /// Applies every step newer than the recorded version.
    ///
    /// Returns the version the database is at afterwards.
    pub fn run(&self, conn: &mut Connection) -> Result<u32> {
        conn.execute_batch(CREATE_METADATA)?;
        let mut current = schema_version(conn)?;

        if current > self.latest_version() {
            return Err(Error::Schema(format!(
                "database is at schema version {current}, newer than the latest known version {}",
                self.latest_version()
            )));
        }

        for step in self.steps.range((Bound::Excluded(current), Bound::Unbounded)).map(|(_, step)| step) {
            info!(version = step.version, description = step.description, "applying migration step");

            for sql in &step.statements {
                conn.execute_batch(sql)?;
            }
            if let Some(post) = &step.post {
                post(conn)?;
            }

            set_schema_version(conn, step.version)?;
            current = step.version;
            debug!(version = current, "migration step recorded");
        }

        Ok(current)
    }

    /// Moves the recorded version back so later steps run again.
    pub fn reset_version(conn: &Connection, version: u32) -> Result<()> {
        set_schema_version(conn, version)
    }
}

// =============================================================================
// Tests
// =============================================================================
