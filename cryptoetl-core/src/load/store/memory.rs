//! Process-local target store.

use super::{ensure_belongs, StoreError, TargetStore};
use crate::domain::{CanonicalRow, SeriesKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Series = BTreeMap<DateTime<Utc>, CanonicalRow>;

/// Rows held in memory, keyed by series then timestamp. Every operation takes
/// the single lock, so each is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: Mutex<HashMap<SeriesKey, Series>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with rows of any series.
    pub fn with_rows(rows: impl IntoIterator<Item = CanonicalRow>) -> Self {
        let store = Self::new();
        {
            let mut series = store.lock();
            for row in rows {
                series.entry(row.series()).or_default().insert(row.timestamp, row);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SeriesKey, Series>> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn row_count(&self, key: SeriesKey) -> usize {
        self.lock().get(&key).map_or(0, BTreeMap::len)
    }
}

impl TargetStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn read_rows(&self, key: SeriesKey) -> Result<Vec<CanonicalRow>, StoreError> {
        Ok(self
            .lock()
            .get(&key)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    fn insert_new(&self, key: SeriesKey, rows: &[CanonicalRow]) -> Result<usize, StoreError> {
        ensure_belongs(key, rows)?;
        let mut all = self.lock();
        let series = all.entry(key).or_default();

        // Check every key before touching anything.
        let mut seen = std::collections::HashSet::with_capacity(rows.len());
        for row in rows {
            if series.contains_key(&row.timestamp) || !seen.insert(row.timestamp) {
                return Err(StoreError::Conflict(row.key()));
            }
        }
        for row in rows {
            series.insert(row.timestamp, row.clone());
        }
        Ok(rows.len())
    }

    fn replace_rows(&self, key: SeriesKey, rows: &[CanonicalRow]) -> Result<(), StoreError> {
        ensure_belongs(key, rows)?;
        let replacement: Series = rows.iter().map(|r| (r.timestamp, r.clone())).collect();
        self.lock().insert(key, replacement);
        Ok(())
    }
}
