//! # Error Handling for the Reinforcement Store
//!
//! A single error enum ([`Error`]) covers every failure mode of the store. Reads
//! and writes both return [`Result`], so a caller can always tell "not found"
//! (`Ok(None)` / empty) apart from "failed" (`Err`).
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Transport | `Sqlite` | Log and retry later; queued writes are kept |
//! | Statement | `BatchFailed` | Inspect the failed items (see [`FailureKind`]) |
//! | Unresolved reference | `UnknownType`, `UnknownWorldId`, `UnknownWorld`, `UnmappedMaterial`, `AmbiguousLegacyType` | Fix the catalog / registry |
//! | Malformed data | `MalformedDurability` | Repair the legacy row |
//! | Schema | `Schema` | Investigate the migration state |

use std::fmt;
use std::num::ParseFloatError;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::types::{BlockPos, TypeId, WorldId};

// =============================================================================
// Batch Failure Detail
// =============================================================================

/// Which statement a pending mutation was flushed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOp {
    Delete,
    Insert,
    Update,
}

impl fmt::Display for BatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchOp::Delete => "delete",
            BatchOp::Insert => "insert",
            BatchOp::Update => "update",
        };
        f.write_str(name)
    }
}

/// Whether a rejected item can succeed if flushed again unchanged.
///
/// Transient failures stay queued for the next flush. Integrity failures
/// (constraint violations, type mismatches) never will, so the flusher sets
/// those items aside as rejected mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Transient,
    Integrity,
}

impl FailureKind {
    /// Classifies a statement error by its SQLite result code.
    pub fn of(err: &rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig) => {
                FailureKind::Integrity
            }
            _ => FailureKind::Transient,
        }
    }
}

/// One item of a flushed batch that the database rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    /// The statement the item was bound to.
    pub op: BatchOp,
    /// Position of the item within its batch.
    pub index: usize,
    /// Location of the reinforcement the item carried.
    pub location: BlockPos,
    pub kind: FailureKind,
    /// The database's error message.
    pub message: String,
}

impl fmt::Display for FailedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} at {}: {}", self.op, self.index, self.location, self.message)
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in reinforcement store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite operation failed (connection, I/O, locking, syntax).
    ///
    /// The `#[from]` attribute lets `?` convert `rusqlite::Error` directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or a migration step reported failure.
    #[error("schema error: {0}")]
    Schema(String),

    /// A stored type id no longer resolves through the type catalog.
    #[error("unknown reinforcement type id {type_id}")]
    UnknownType { type_id: TypeId },

    /// A stored world id no longer resolves through the world registry.
    #[error("unknown world id {world_id}")]
    UnknownWorldId { world_id: WorldId },

    /// A legacy world name has no internal world id.
    #[error("no world id for world named '{name}'")]
    UnknownWorld { name: String },

    /// A legacy material id maps to no current reinforcement type.
    #[error("no reinforcement type for legacy material id {material_id}")]
    UnmappedMaterial { material_id: i32 },

    /// A legacy material id maps to several types and the lore picked none.
    #[error("no reinforcement type for legacy material id {material_id} with lore {lore:?}")]
    AmbiguousLegacyType {
        material_id: i32,
        lore: Option<String>,
    },

    /// The legacy durability column did not parse as a float.
    #[error("malformed durability '{value}': {source}")]
    MalformedDurability {
        value: String,
        #[source]
        source: ParseFloatError,
    },

    /// One or more items of a flushed batch failed.
    ///
    /// Transient failures (and, for a transactional flush, every other item of
    /// the rolled-back transaction) are back in their queues when this is
    /// returned; integrity failures have been set aside as rejected.
    #[error("{} of {attempted} batch item(s) failed; first: {}", .failures.len(), first_failure(.failures))]
    BatchFailed {
        attempted: usize,
        failures: Vec<FailedItem>,
    },
}

fn first_failure(failures: &[FailedItem]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl Error {
    /// True for failures that may succeed if retried unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Sqlite(e) => FailureKind::of(e) == FailureKind::Transient,
            Error::BatchFailed { failures, .. } => {
                failures.iter().all(|f| f.kind == FailureKind::Transient)
            }
            _ => false,
        }
    }

    /// True for failures caused by data the store can never accept as is:
    /// rows that no longer match the catalog or registry, or batch items the
    /// database rejected on a constraint.
    pub fn is_integrity(&self) -> bool {
        if let Error::BatchFailed { failures, .. } = self {
            return failures.iter().any(|f| f.kind == FailureKind::Integrity);
        }
        matches!(
            self,
            Error::UnknownType { .. }
                | Error::UnknownWorldId { .. }
                | Error::UnknownWorld { .. }
                | Error::UnmappedMaterial { .. }
                | Error::AmbiguousLegacyType { .. }
                | Error::MalformedDurability { .. }
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
