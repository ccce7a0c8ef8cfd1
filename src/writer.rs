//! # Batch Flusher
//!
//! Drains the pending mutation queues into `ctdl_reinforcements`.
//!
//! ## Two Flush Modes
//!
//! ```text
//! Immediate (one queue, autocommit):     Full (all queues, one transaction):
//! ┌──────────────────────────────┐       ┌──────────────────────────────┐
//! │ item 1 → own implicit commit │       │ BEGIN IMMEDIATE              │
//! │ item 2 → own implicit commit │       │   deletes  (every item)      │
//! │ ...                          │       │   inserts  (every item)      │
//! │ failed items requeued        │       │   updates  (every item)      │
//! └──────────────────────────────┘       │ COMMIT, or ROLLBACK + requeue│
//!                                        └──────────────────────────────┘
//! ```
//!
//! Deletes run first so a key deleted and re-inserted within one cycle never
//! collides with its stale row.
//!
//! ## Per-Item Results
//!
//! Every queued item is executed and inspected on its own:
//!
//! - statement error: the item failed, recorded as a [`FailedItem`]
//! - UPDATE/DELETE touching zero rows: a miss, counted and logged, not a failure
//!
//! A queue snapshot is only dropped once its items are known to be durable.
//! Anything else goes back to the front of its queue, except items whose
//! failure is [`FailureKind::Integrity`]: those can never succeed unchanged,
//! so they move to the caller's rejected list instead of blocking every
//! later flush.
//!
//! ## Key Binding
//!
//! Key columns always come from `codec::encode(reinforcement.location)`.
//! The chunk a caller filed the mutation under is only checked, never bound.

use std::collections::HashMap;
use std::time::Instant;

use rusqlite::{params, Connection};
use tracing::{debug, error, warn};

use crate::codec;
use crate::error::{BatchOp, Error, FailedItem, FailureKind, Result};
use crate::queue::{BatchQueue, BatchQueues, PendingMutation, RejectedMutation};

// =============================================================================
// SQL Statements
// =============================================================================

/// Key parameters are `?1..?6` in every statement, so one binding fits all.
pub const DELETE_REINFORCEMENT: &str = r#"
DELETE FROM ctdl_reinforcements
WHERE chunk_x = ?1 AND chunk_z = ?2 AND world_id = ?3
  AND x_offset = ?4 AND y = ?5 AND z_offset = ?6
"#;

pub const INSERT_REINFORCEMENT: &str = r#"
INSERT INTO ctdl_reinforcements
    (chunk_x, chunk_z, world_id, x_offset, y, z_offset,
     type_id, health, group_id, insecure, creation_time)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
"#;

pub const UPDATE_REINFORCEMENT: &str = r#"
UPDATE ctdl_reinforcements
SET type_id = ?7, health = ?8, group_id = ?9, insecure = ?10, creation_time = ?11
WHERE chunk_x = ?1 AND chunk_z = ?2 AND world_id = ?3
  AND x_offset = ?4 AND y = ?5 AND z_offset = ?6
"#;

fn statement_for(op: BatchOp) -> &'static str {
    match op {
        BatchOp::Delete => DELETE_REINFORCEMENT,
        BatchOp::Insert => INSERT_REINFORCEMENT,
        BatchOp::Update => UPDATE_REINFORCEMENT,
    }
}

// =============================================================================
// Flush Report
// =============================================================================

/// What a successful flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub deleted: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Updates and deletes whose key matched no row.
    pub misses: usize,
}

impl FlushReport {
    /// Items executed, including misses.
    pub fn total(&self) -> usize {
        self.deleted + self.inserted + self.updated + self.misses
    }

    fn record(&mut self, op: BatchOp, outcome: &OpOutcome) {
        match op {
            BatchOp::Delete => self.deleted += outcome.applied,
            BatchOp::Insert => self.inserted += outcome.applied,
            BatchOp::Update => self.updated += outcome.applied,
        }
        self.misses += outcome.misses;
    }
}

/// Per-item results of executing one queue snapshot.
#[derive(Debug, Default)]
struct OpOutcome {
    applied: usize,
    misses: usize,
    failures: Vec<FailedItem>,
}

// =============================================================================
// Batch Flusher
// =============================================================================

/// Executes queue snapshots against one connection.
///
/// Borrowing the connection keeps it scoped to the caller's unit of work.
pub struct BatchFlusher<'c> {
    conn: &'c Connection,
}

impl<'c> BatchFlusher<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Flushes a single queue without a transaction wrapper.
    ///
    /// Each item commits on its own. Items that succeeded stay written even if
    /// others fail. Transient failures return to the queue; integrity
    /// failures are appended to `rejected`.
    pub fn flush_immediate(
        &self,
        op: BatchOp,
        queue: &mut BatchQueue,
        rejected: &mut Vec<RejectedMutation>,
    ) -> Result<FlushReport> {
        let pending = queue.take();
        if pending.is_empty() {
            return Ok(FlushReport::default());
        }

        let start = Instant::now();
        let outcome = match self.execute_items(op, &pending) {
            Ok(outcome) => outcome,
            Err(e) => {
                queue.restore(pending);
                error!(%op, error = %e, "immediate flush failed before execution");
                return Err(e);
            }
        };

        debug!(
            %op,
            items = pending.len(),
            applied = outcome.applied,
            misses = outcome.misses,
            failed = outcome.failures.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "immediate flush"
        );

        let mut report = FlushReport::default();
        report.record(op, &outcome);

        if outcome.failures.is_empty() {
            return Ok(report);
        }

        let attempted = pending.len();
        let unflushed = set_aside_rejected(op, pending, &outcome.failures, false, rejected);
        queue.restore(unflushed);

        let err = Error::BatchFailed {
            attempted,
            failures: outcome.failures,
        };
        error!(%op, error = %err, "immediate flush left items queued");
        Err(err)
    }

    /// Flushes all three queues in one transaction: deletes, inserts, updates.
    ///
    /// On any failure the transaction is rolled back and every snapshot goes
    /// back to the front of its queue, minus the items that failed on
    /// integrity grounds, which are appended to `rejected`. The connection's
    /// `read_uncommitted` setting and autocommit state are restored on every
    /// path.
    pub fn flush_all(
        &self,
        queues: &mut BatchQueues,
        rejected: &mut Vec<RejectedMutation>,
    ) -> Result<FlushReport> {
        if queues.is_empty() {
            return Ok(FlushReport::default());
        }

        // Capture before taking anything, so an early failure leaves the queues untouched
        let read_uncommitted: i64 = self
            .conn
            .query_row("PRAGMA read_uncommitted", [], |row| row.get(0))?;
        let was_autocommit = self.conn.is_autocommit();
        self.conn.execute_batch("PRAGMA read_uncommitted = 0")?;

        let snapshots = [
            (BatchOp::Delete, queues.queue_mut(BatchOp::Delete).take()),
            (BatchOp::Insert, queues.queue_mut(BatchOp::Insert).take()),
            (BatchOp::Update, queues.queue_mut(BatchOp::Update).take()),
        ];

        let start = Instant::now();
        let result = self.execute_transaction(&snapshots);

        if was_autocommit && !self.conn.is_autocommit() {
            let _ = self.conn.execute("ROLLBACK", []);
        }
        if let Err(e) = self
            .conn
            .execute_batch(&format!("PRAGMA read_uncommitted = {read_uncommitted}"))
        {
            warn!(error = %e, "could not restore connection isolation after flush");
        }

        match result {
            Ok(report) => {
                debug!(
                    deleted = report.deleted,
                    inserted = report.inserted,
                    updated = report.updated,
                    misses = report.misses,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "all batch processing"
                );
                Ok(report)
            }
            Err(e) => {
                let failures: &[FailedItem] = match &e {
                    Error::BatchFailed { failures, .. } => failures,
                    _ => &[],
                };
                let already_rejected = rejected.len();
                for (op, snapshot) in snapshots {
                    let unflushed = set_aside_rejected(op, snapshot, failures, true, rejected);
                    queues.queue_mut(op).restore(unflushed);
                }
                error!(
                    error = %e,
                    rejected = rejected.len() - already_rejected,
                    "batch flush rolled back, mutations requeued"
                );
                Err(e)
            }
        }
    }

    /// Executes `items` with one statement and fails on the first rejected item.
    ///
    /// For callers that manage their own transaction and treat any item
    /// failure as fatal. Returns the number of rows written.
    pub(crate) fn execute_strict(&self, op: BatchOp, items: &[PendingMutation]) -> Result<usize> {
        let outcome = self.execute_items(op, items)?;
        if outcome.failures.is_empty() {
            Ok(outcome.applied)
        } else {
            Err(Error::BatchFailed {
                attempted: items.len(),
                failures: outcome.failures,
            })
        }
    }

    /// Runs the three snapshots inside `BEGIN IMMEDIATE ... COMMIT`.
    ///
    /// Uses raw SQL for the transaction so the flusher only needs `&Connection`.
    fn execute_transaction(
        &self,
        snapshots: &[(BatchOp, Vec<PendingMutation>); 3],
    ) -> Result<FlushReport> {
        self.conn.execute("BEGIN IMMEDIATE", [])?;

        let mut report = FlushReport::default();
        let mut failures = Vec::new();
        let mut attempted = 0;

        for (op, items) in snapshots {
            let step_start = Instant::now();
            let outcome = match self.execute_items(*op, items) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = self.conn.execute("ROLLBACK", []);
                    return Err(e);
                }
            };
            debug!(
                %op,
                items = items.len(),
                elapsed_ms = step_start.elapsed().as_millis() as u64,
                "batch step"
            );

            attempted += items.len();
            report.record(*op, &outcome);
            failures.extend(outcome.failures);
        }

        if !failures.is_empty() {
            let _ = self.conn.execute("ROLLBACK", []);
            return Err(Error::BatchFailed {
                attempted,
                failures,
            });
        }

        match self.conn.execute("COMMIT", []) {
            Ok(_) => Ok(report),
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e.into())
            }
        }
    }

    /// Executes one statement per item and inspects each result.
    ///
    /// Only a failure to prepare the statement is returned as `Err`; item
    /// failures are collected in the outcome.
    fn execute_items(&self, op: BatchOp, items: &[PendingMutation]) -> Result<OpOutcome> {
        let mut outcome = OpOutcome::default();
        if items.is_empty() {
            return Ok(outcome);
        }

        let mut stmt = self.conn.prepare_cached(statement_for(op))?;

        for (index, item) in items.iter().enumerate() {
            let rein = &item.reinforcement;
            let (chunk, offset) = codec::encode(rein.location);
            if chunk != item.chunk {
                warn!(
                    %op,
                    location = %rein.location,
                    queued_under = %item.chunk,
                    "queued chunk disagrees with location; binding the encoded key"
                );
            }

            let executed = match op {
                BatchOp::Delete => stmt.execute(params![
                    chunk.x,
                    chunk.z,
                    chunk.world.as_raw(),
                    offset.x,
                    offset.y,
                    offset.z,
                ]),
                BatchOp::Insert | BatchOp::Update => stmt.execute(params![
                    chunk.x,
                    chunk.z,
                    chunk.world.as_raw(),
                    offset.x,
                    offset.y,
                    offset.z,
                    rein.type_id.as_raw(),
                    f64::from(rein.health),
                    rein.group_id,
                    rein.insecure,
                    rein.creation_time_ms(),
                ]),
            };

            match executed {
                Ok(0) if op != BatchOp::Insert => {
                    warn!(%op, location = %rein.location, "no stored reinforcement at key");
                    outcome.misses += 1;
                }
                Ok(_) => outcome.applied += 1,
                Err(e) => outcome.failures.push(FailedItem {
                    op,
                    index,
                    location: rein.location,
                    kind: FailureKind::of(&e),
                    message: e.to_string(),
                }),
            }
        }

        Ok(outcome)
    }
}

/// Splits a snapshot of `op` items after a failed flush.
///
/// Items with an integrity failure go to `rejected`; items with a transient
/// failure are returned for requeueing, in order. Items without a failure are
/// returned too when `keep_unfailed` is set (their transaction was rolled
/// back) and dropped otherwise (they are durable).
fn set_aside_rejected(
    op: BatchOp,
    snapshot: Vec<PendingMutation>,
    failures: &[FailedItem],
    keep_unfailed: bool,
    rejected: &mut Vec<RejectedMutation>,
) -> Vec<PendingMutation> {
    let by_index: HashMap<usize, &FailedItem> = failures
        .iter()
        .filter(|f| f.op == op)
        .map(|f| (f.index, f))
        .collect();

    let mut unflushed = Vec::new();
    for (index, item) in snapshot.into_iter().enumerate() {
        match by_index.get(&index) {
            Some(failure) if failure.kind == FailureKind::Integrity => {
                warn!(%op, location = %item.reinforcement.location, "mutation rejected, moved out of the queue");
                rejected.push(RejectedMutation {
                    mutation: item,
                    failure: (*failure).clone(),
                });
            }
            Some(_) => unflushed.push(item),
            None if keep_unfailed => unflushed.push(item),
            None => {}
        }
    }
    unflushed
}

// =============================================================================
// Tests
// =============================================================================
