//! # Citadel Store - Chunk-Indexed Reinforcement Persistence
//!
//! Citadel Store persists block reinforcements (durable protection records
//! keyed by world coordinate) in SQLite. It provides:
//!
//! - **Compact keys**: global coordinates encoded as chunk + in-chunk offset
//! - **Write-behind batching**: inserts, updates and deletes queue in memory
//!   and flush in one ordered transaction
//! - **Chunk bulk loads**: every reinforcement of a chunk in one query
//! - **Legacy migration**: a one-shot reshape of the old wide-row table
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ReinforcementStore                          │
//! │     get_for_location · fill · insert · update · delete          │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │ reads                        │ writes
//!                ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────────┐
//! │ reader                   │   │ BatchQueues (delete/insert/update)│
//! │ (read-only connection)   │   │           │                      │
//! └──────────────┬───────────┘   │           ▼                      │
//!                │               │ BatchFlusher                     │
//!                │               │ (immediate, or one transaction)  │
//!                │               └───────────┬──────────────────────┘
//!                ▼                           ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              SQLite: ctdl_reinforcements (+ legacy table)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One row per block**: the primary key is the full encoded position
//! 2. **Lossless keys**: `decode(encode(p)) == p`, offsets always in `0..16`
//! 3. **Flush order**: deletes, then inserts, then updates
//! 4. **No silent loss**: a queued mutation leaves its queue only once it is
//!    durable or rejected by the database; failed flushes put transient
//!    failures back, keep rejected ones on the store, and return an error
//! 5. **Safe migration retry**: an aborted legacy reshape leaves the compact
//!    table as it was
//!
//! ## Module Organization
//!
//! - [`error`]: Error type and batch failure detail
//! - [`types`]: Domain types (BlockPos, ChunkCoord, Reinforcement, ...)
//! - [`codec`]: Coordinate encoding
//! - [`catalog`]: Type catalog and world registry seams
//! - [`schema`]: DDL, connection source and migration runner
//! - [`queue`]: Pending mutation queues
//! - [`writer`]: Batch flusher
//! - [`reader`]: Single-block and chunk reads
//! - [`migration`]: Legacy table reshape
//! - [`store`]: The store (main entry point)
//! - [`scheduler`]: Periodic background flush

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for store operations.
///
/// A single error enum covers transport, statement, reference and data
/// failures, so reads can tell "not found" from "failed".
pub mod error;

/// Domain types.
///
/// Newtypes for world and type ids, block and chunk coordinates, and the
/// reinforcement record itself.
pub mod types;

/// Global coordinate ↔ chunk + offset encoding.
pub mod codec;

/// External collaborators: the reinforcement type catalog and world registry.
pub mod catalog;

/// SQLite schema definitions, connection source and migration runner.
pub mod schema;

/// Pending delete / insert / update queues.
pub mod queue;

/// Batch flusher.
///
/// Executes queued mutations either one queue at a time in autocommit mode,
/// or all three queues in one transaction. Every item's result is inspected;
/// items that did not reach storage are requeued, or set aside when the
/// database rejected them on integrity grounds.
pub mod writer;

/// Read operations: single block, whole chunk, populated chunks.
pub mod reader;

/// One-shot migration from the legacy wide-row table.
pub mod migration;

/// The reinforcement store.
///
/// The main entry point is [`ReinforcementStore`](store::ReinforcementStore).
pub mod store;

/// Background thread that calls `process_batches` on an interval.
pub mod scheduler;

// =============================================================================
// Re-exports
// =============================================================================

pub use catalog::{StaticTypeCatalog, StaticWorldRegistry, TypeCatalog, WorldRegistry};
pub use error::{BatchOp, Error, FailedItem, FailureKind, Result};
pub use migration::{LegacyRow, LegacyTransform, MigrationReport};
pub use queue::{PendingCounts, PendingMutation, RejectedMutation};
pub use scheduler::{spawn_flush_scheduler, FlushSchedulerHandle, SchedulerConfig, SharedStore};
pub use schema::{Datasource, MigrationRunner, MigrationStep};
pub use store::{ReinforcementStore, StoreConfig};
pub use types::{
    BlockOffset, BlockPos, ChunkCoord, Reinforcement, ReinforcementType, TypeId, WorldId, WorldRef,
};
pub use writer::FlushReport;
