//! # Reinforcement Store
//!
//! The public entry point. A [`ReinforcementStore`] owns a [`Datasource`],
//! the three pending mutation queues and the batch-mode flag.
//!
//! ## Control Flow
//!
//! ```text
//! insert / update / delete
//!         │
//!         ▼
//!   queue.push(...)
//!         │
//!   batch mode? ── no ──► flush that queue now (autocommit),
//!         │               report the caller's own item only
//!         │
//!        yes
//!         │
//!         ▼
//!   process_batches()  ◄── caller or flush scheduler
//!   deletes → inserts → updates, one transaction
//! ```
//!
//! Reads (`get_for_location`, `fill`, `get_all_data_chunks`) never touch the
//! queues; in batch mode they return what has been flushed so far.
//!
//! ## Rejected Mutations
//!
//! A mutation the database refuses on integrity grounds (say, an insert whose
//! key is already taken) leaves its queue and is kept in a rejected list, so it
//! neither fails later calls nor blocks `process_batches`. Callers inspect it
//! with [`ReinforcementStore::rejected`] and take it back with
//! [`ReinforcementStore::drain_rejected`].
//!
//! ## Threading
//!
//! All methods expect one caller at a time. The store is `Send` but not
//! `Sync`; share it as `Arc<Mutex<ReinforcementStore>>` when a
//! [`flush scheduler`](crate::scheduler) runs alongside the owning thread.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::catalog::{TypeCatalog, WorldRegistry};
use crate::error::{BatchOp, Error, Result};
use crate::migration::{register_migrations, DEFAULT_MIGRATION_BATCH_SIZE};
use crate::queue::{BatchQueues, PendingCounts, PendingMutation, RejectedMutation};
use crate::reader;
use crate::schema::{Datasource, MigrationRunner};
use crate::types::{BlockPos, ChunkCoord, Reinforcement};
use crate::writer::{BatchFlusher, FlushReport};

// =============================================================================
// Configuration
// =============================================================================

/// Settings for opening a [`ReinforcementStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Start in batch mode (mutations wait for `process_batches`).
    pub batch_mode: bool,

    /// Rows per insert batch during the legacy migration.
    pub migration_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_mode: false,
            migration_batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn with_batch_mode(mut self, batch_mode: bool) -> Self {
        self.batch_mode = batch_mode;
        self
    }

    pub fn with_migration_batch_size(mut self, rows: usize) -> Self {
        self.migration_batch_size = rows;
        self
    }
}

// =============================================================================
// Store
// =============================================================================

/// Chunk-indexed, batched persistence for reinforcements.
pub struct ReinforcementStore {
    source: Datasource,
    catalog: Arc<dyn TypeCatalog>,
    registry: Arc<dyn WorldRegistry>,
    queues: BatchQueues,
    rejected: Vec<RejectedMutation>,
    batch_mode: bool,
}

impl ReinforcementStore {
    /// Opens a database file, migrating it to the current schema.
    pub fn open(
        path: impl AsRef<Path>,
        catalog: Arc<dyn TypeCatalog>,
        registry: Arc<dyn WorldRegistry>,
        config: StoreConfig,
    ) -> Result<Self> {
        Self::with_datasource(Datasource::open(path)?, catalog, registry, config)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(
        catalog: Arc<dyn TypeCatalog>,
        registry: Arc<dyn WorldRegistry>,
        config: StoreConfig,
    ) -> Result<Self> {
        Self::with_datasource(Datasource::open_in_memory()?, catalog, registry, config)
    }

    /// Wraps an existing datasource, migrating it to the current schema.
    ///
    /// # Errors
    ///
    /// Fails if any migration step fails. A failed legacy reshape leaves the
    /// compact table untouched and is retried on the next open.
    pub fn with_datasource(
        source: Datasource,
        catalog: Arc<dyn TypeCatalog>,
        registry: Arc<dyn WorldRegistry>,
        config: StoreConfig,
    ) -> Result<Self> {
        let mut runner = MigrationRunner::new();
        register_migrations(
            &mut runner,
            Arc::clone(&catalog),
            Arc::clone(&registry),
            config.migration_batch_size,
        )?;

        let version = {
            let mut conn = source.acquire()?;
            runner.run(&mut conn).map_err(|e| {
                error!(error = %e, "reinforcement schema migration failed");
                e
            })?
        };
        info!(schema_version = version, batch_mode = config.batch_mode, "reinforcement store opened");

        Ok(Self {
            source,
            catalog,
            registry,
            queues: BatchQueues::new(),
            rejected: Vec::new(),
            batch_mode: config.batch_mode,
        })
    }

    pub fn datasource(&self) -> &Datasource {
        &self.source
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Loads the reinforcement at one block.
    ///
    /// `Ok(None)` means nothing is stored there. Mutations still queued in
    /// batch mode are not visible.
    pub fn get_for_location(&self, pos: BlockPos) -> Result<Option<Reinforcement>> {
        let conn = self.source.acquire_read_only()?;
        reader::get_for_location(&conn, self.catalog.as_ref(), self.registry.as_ref(), pos)
            .map_err(|e| {
                error!(location = %pos, error = %e, "failed to load reinforcement");
                e
            })
    }

    /// Loads a whole chunk and hands each reinforcement to `consumer`.
    ///
    /// The consumer runs only after the connection has been released, so it
    /// may call back into the store. Returns the number of reinforcements
    /// delivered.
    pub fn fill<F>(&self, chunk: ChunkCoord, mut consumer: F) -> Result<usize>
    where
        F: FnMut(Reinforcement),
    {
        let loaded = {
            let conn = self.source.acquire_read_only()?;
            reader::load_chunk(&conn, self.catalog.as_ref(), self.registry.as_ref(), chunk)
                .map_err(|e| {
                    error!(%chunk, error = %e, "failed to load chunk");
                    e
                })?
        };

        let count = loaded.len();
        for rein in loaded {
            consumer(rein);
        }
        Ok(count)
    }

    /// Every chunk that has at least one stored reinforcement.
    pub fn get_all_data_chunks(&self) -> Result<BTreeSet<ChunkCoord>> {
        let conn = self.source.acquire_read_only()?;
        reader::all_data_chunks(&conn).map_err(|e| {
            error!(error = %e, "failed to select populated chunks");
            e
        })
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Queues a new reinforcement; written now unless in batch mode.
    pub fn insert(&mut self, rein: Reinforcement, chunk: ChunkCoord) -> Result<()> {
        self.enqueue(BatchOp::Insert, rein, chunk)
    }

    /// Queues a replacement for a stored reinforcement; written now unless in
    /// batch mode.
    pub fn update(&mut self, rein: Reinforcement, chunk: ChunkCoord) -> Result<()> {
        self.enqueue(BatchOp::Update, rein, chunk)
    }

    /// Queues removal of a stored reinforcement; written now unless in batch
    /// mode.
    pub fn delete(&mut self, rein: Reinforcement, chunk: ChunkCoord) -> Result<()> {
        self.enqueue(BatchOp::Delete, rein, chunk)
    }

    /// In immediate mode the whole queue is flushed, but only the outcome of
    /// the item queued by this call is returned. Earlier items that fail
    /// again are logged and requeued or rejected.
    fn enqueue(&mut self, op: BatchOp, rein: Reinforcement, chunk: ChunkCoord) -> Result<()> {
        let queue = self.queues.queue_mut(op);
        queue.push(PendingMutation::new(rein, chunk));
        if self.batch_mode {
            return Ok(());
        }
        let own_index = queue.len() - 1;

        // Queued first: if the connection can't be had, the item waits for
        // the next flush instead of being dropped
        let conn = self.source.acquire()?;
        let flushed =
            BatchFlusher::new(&conn).flush_immediate(op, self.queues.queue_mut(op), &mut self.rejected);

        match flushed {
            Ok(_) => Ok(()),
            Err(Error::BatchFailed { failures, .. }) => {
                let (own, earlier): (Vec<_>, Vec<_>) =
                    failures.into_iter().partition(|f| f.index == own_index);
                if !earlier.is_empty() {
                    warn!(%op, failed = earlier.len(), "earlier queued mutations failed again");
                }
                if own.is_empty() {
                    return Ok(());
                }
                let failures = own
                    .into_iter()
                    .map(|mut failure| {
                        failure.index = 0;
                        failure
                    })
                    .collect();
                Err(Error::BatchFailed {
                    attempted: 1,
                    failures,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Flushes all queues in one transaction: deletes, inserts, updates.
    ///
    /// # Errors
    ///
    /// On failure nothing is committed. Items rejected on integrity grounds
    /// move to [`rejected`](Self::rejected); every other pending mutation
    /// stays queued in its original order, so the next call can commit it.
    pub fn process_batches(&mut self) -> Result<FlushReport> {
        if self.queues.is_empty() {
            return Ok(FlushReport::default());
        }
        let conn = self.source.acquire()?;
        BatchFlusher::new(&conn).flush_all(&mut self.queues, &mut self.rejected)
    }

    // -------------------------------------------------------------------------
    // Batch Mode and Queue State
    // -------------------------------------------------------------------------

    /// Switches deferred flushing on or off.
    ///
    /// Turning it off does not flush what is already queued; call
    /// [`process_batches`](Self::process_batches) for that.
    pub fn set_batch_mode(&mut self, batch_mode: bool) {
        debug!(batch_mode, pending = self.queues.counts().total(), "batch mode changed");
        self.batch_mode = batch_mode;
    }

    pub fn is_batch_mode(&self) -> bool {
        self.batch_mode
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.queues.counts()
    }

    /// Removes and returns everything waiting in one queue.
    ///
    /// Lets a caller give up on items that keep failing transiently, or
    /// rework a batch before it is flushed.
    pub fn drain_pending(&mut self, op: BatchOp) -> Vec<PendingMutation> {
        self.queues.queue_mut(op).take()
    }

    /// Mutations the database refused on integrity grounds, oldest first.
    pub fn rejected(&self) -> &[RejectedMutation] {
        &self.rejected
    }

    /// Removes and returns every rejected mutation.
    pub fn drain_rejected(&mut self) -> Vec<RejectedMutation> {
        std::mem::take(&mut self.rejected)
    }
}

impl std::fmt::Debug for ReinforcementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReinforcementStore")
            .field("source", &self.source)
            .field("pending", &self.queues.counts())
            .field("rejected", &self.rejected.len())
            .field("batch_mode", &self.batch_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
