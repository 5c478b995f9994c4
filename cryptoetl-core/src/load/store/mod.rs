//! Target store abstraction.
//!
//! The loader only ever touches the relational store through this trait, so
//! the same state machine runs against Postgres in production and against
//! the in-process store in tests and offline runs.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use crate::domain::{CanonicalRow, NaturalKey, SeriesKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("row {0} already exists; transaction aborted")]
    Conflict(NaturalKey),

    #[error("row {row} does not belong to series {expected}")]
    ForeignRow { expected: SeriesKey, row: NaturalKey },

    #[error("stored row is unreadable: {0}")]
    Corrupt(String),

    /// The commit may or may not have been applied (e.g. connection lost
    /// during COMMIT).
    #[error("outcome unknown: {0}")]
    Indeterminate(String),
}

impl StoreError {
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, StoreError::Indeterminate(_))
    }
}

/// Operations the loader and backup manager need from the target store.
pub trait TargetStore: Send + Sync {
    /// Human-readable name of this store.
    fn name(&self) -> &str;

    /// Create the target table and its natural-key constraint if missing.
    fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Every stored row for `key`, ascending by timestamp.
    fn read_rows(&self, key: SeriesKey) -> Result<Vec<CanonicalRow>, StoreError>;

    /// Insert all of `rows` in one transaction, or none of them. A row whose
    /// natural key already exists aborts the transaction with `Conflict`.
    /// Returns the number of rows inserted.
    fn insert_new(&self, key: SeriesKey, rows: &[CanonicalRow]) -> Result<usize, StoreError>;

    /// Atomically make `rows` the complete stored set for `key`.
    fn replace_rows(&self, key: SeriesKey, rows: &[CanonicalRow]) -> Result<(), StoreError>;
}

fn ensure_belongs(key: SeriesKey, rows: &[CanonicalRow]) -> Result<(), StoreError> {
    match rows.iter().find(|r| r.series() != key) {
        Some(row) => Err(StoreError::ForeignRow {
            expected: key,
            row: row.key(),
        }),
        None => Ok(()),
    }
}
