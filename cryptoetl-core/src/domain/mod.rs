//! Domain types for cryptoetl

pub mod batch;
pub mod row;
pub mod series;

pub use batch::{
    BatchMeta, BatchRecord, ExtractionWindow, FieldError, InvalidWindow, LoadBatch, BATCH_COLUMNS,
};
pub use row::{CanonicalRow, NaturalKey};
pub use series::{Asset, IntervalKind, ParseKeyError, SeriesKey};
