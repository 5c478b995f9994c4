//! Postgres target store.
//!
//! One table (`market_rows` by default) holds every series, partitioned by
//! the `asset_symbol` / `interval_kind` columns, with the natural key enforced
//! by a UNIQUE constraint. Mutations run at SERIALIZABLE isolation behind a
//! transaction-scoped advisory lock derived from the series key.

use super::{ensure_belongs, StoreError, TargetStore};
use crate::domain::{CanonicalRow, SeriesKey};
use chrono::{DateTime, Utc};
use postgres::{IsolationLevel, NoTls, Transaction};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use rust_decimal::Decimal;

pub const DEFAULT_TABLE: &str = "market_rows";

type Manager = PostgresConnectionManager<NoTls>;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Manager>,
    table: String,
}

impl PostgresStore {
    pub fn connect(db_url: &str, pool_max_size: u32) -> Result<Self, StoreError> {
        Self::with_table(db_url, pool_max_size, DEFAULT_TABLE)
    }

    pub fn with_table(db_url: &str, pool_max_size: u32, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let config = db_url
            .parse::<postgres::Config>()
            .map_err(|err| StoreError::Unavailable(format!("invalid postgres db url: {err}")))?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_max_size.max(1))
            .build(manager)
            .map_err(|err| StoreError::Unavailable(format!("failed to build postgres pool: {err}")))?;

        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn conn(&self) -> Result<PooledConnection<Manager>, StoreError> {
        self.pool.get().map_err(|err| {
            tracing::error!(error = %err, "failed to checkout postgres connection");
            StoreError::Unavailable(format!("failed to checkout postgres connection: {err}"))
        })
    }

    fn insert_sql(&self, on_conflict: &str) -> String {
        format!(
            "INSERT INTO {} (asset_symbol, interval_kind, ts, open, high, low, close, volume_quote) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) {on_conflict}",
            self.table
        )
    }
}

impl TargetStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut client = self.conn()?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                asset_symbol  TEXT        NOT NULL,
                interval_kind TEXT        NOT NULL,
                ts            TIMESTAMPTZ NOT NULL,
                open          NUMERIC     NOT NULL CHECK (open > 0),
                high          NUMERIC     NOT NULL CHECK (high > 0),
                low           NUMERIC     NOT NULL CHECK (low > 0),
                close         NUMERIC     NOT NULL CHECK (close > 0),
                volume_quote  NUMERIC     NOT NULL CHECK (volume_quote >= 0),
                loaded_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT {table}_natural_key UNIQUE (asset_symbol, interval_kind, ts)
            )",
            table = self.table
        );
        client
            .batch_execute(&sql)
            .map_err(|err| StoreError::Query(format!("failed to apply schema: {err}")))?;
        tracing::info!(table = %self.table, "schema ready");
        Ok(())
    }

    fn read_rows(&self, key: SeriesKey) -> Result<Vec<CanonicalRow>, StoreError> {
        let span = tracing::info_span!("store.postgres.read_rows", table = %self.table, key = %key);
        let _enter = span.enter();

        let mut client = self.conn()?;
        let sql = format!(
            "SELECT ts, open, high, low, close, volume_quote FROM {} \
             WHERE asset_symbol = $1 AND interval_kind = $2 ORDER BY ts ASC",
            self.table
        );
        let rows = client
            .query(&sql, &[&key.asset.symbol(), &key.interval.as_str()])
            .map_err(|err| StoreError::Query(format!("failed to read rows: {err}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let corrupt = |err: postgres::Error| StoreError::Corrupt(err.to_string());
            let timestamp: DateTime<Utc> = row.try_get(0).map_err(corrupt)?;
            let open: Decimal = row.try_get(1).map_err(corrupt)?;
            let high: Decimal = row.try_get(2).map_err(corrupt)?;
            let low: Decimal = row.try_get(3).map_err(corrupt)?;
            let close: Decimal = row.try_get(4).map_err(corrupt)?;
            let volume_quote: Decimal = row.try_get(5).map_err(corrupt)?;
            out.push(CanonicalRow {
                asset_symbol: key.asset,
                interval_kind: key.interval,
                timestamp,
                open,
                high,
                low,
                close,
                volume_quote,
            });
        }
        tracing::debug!(rows = out.len(), "read rows");
        Ok(out)
    }

    fn insert_new(&self, key: SeriesKey, rows: &[CanonicalRow]) -> Result<usize, StoreError> {
        ensure_belongs(key, rows)?;
        let span = tracing::info_span!(
            "store.postgres.insert_new",
            table = %self.table,
            key = %key,
            rows = rows.len()
        );
        let _enter = span.enter();

        let mut client = self.conn()?;
        let mut tx = begin_locked(&mut client, key)?;
        let statement = tx
            .prepare(&self.insert_sql("ON CONFLICT (asset_symbol, interval_kind, ts) DO NOTHING"))
            .map_err(|err| StoreError::Query(format!("failed to prepare insert: {err}")))?;

        let mut inserted = 0usize;
        for row in rows {
            let affected = execute_row(&mut tx, &statement, row)?;
            if affected == 0 {
                // Dropping `tx` rolls back everything inserted so far.
                tracing::warn!(row = %row.key(), "row appeared concurrently; aborting");
                return Err(StoreError::Conflict(row.key()));
            }
            inserted += affected as usize;
        }

        commit(tx)?;
        Ok(inserted)
    }

    fn replace_rows(&self, key: SeriesKey, rows: &[CanonicalRow]) -> Result<(), StoreError> {
        ensure_belongs(key, rows)?;
        let span = tracing::info_span!(
            "store.postgres.replace_rows",
            table = %self.table,
            key = %key,
            rows = rows.len()
        );
        let _enter = span.enter();

        let mut client = self.conn()?;
        let mut tx = begin_locked(&mut client, key)?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE asset_symbol = $1 AND interval_kind = $2",
                self.table
            ),
            &[&key.asset.symbol(), &key.interval.as_str()],
        )
        .map_err(|err| StoreError::Query(format!("failed to clear series: {err}")))?;

        let statement = tx
            .prepare(&self.insert_sql(""))
            .map_err(|err| StoreError::Query(format!("failed to prepare insert: {err}")))?;
        for row in rows {
            execute_row(&mut tx, &statement, row)?;
        }

        commit(tx)
    }
}

fn begin_locked<'a>(
    client: &'a mut PooledConnection<Manager>,
    key: SeriesKey,
) -> Result<Transaction<'a>, StoreError> {
    let mut tx = client
        .build_transaction()
        .isolation_level(IsolationLevel::Serializable)
        .start()
        .map_err(|err| StoreError::Unavailable(format!("failed to start transaction: {err}")))?;
    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&key.lock_id()])
        .map_err(|err| StoreError::Query(format!("failed to take advisory lock: {err}")))?;
    Ok(tx)
}

fn execute_row(
    tx: &mut Transaction<'_>,
    statement: &postgres::Statement,
    row: &CanonicalRow,
) -> Result<u64, StoreError> {
    tx.execute(
        statement,
        &[
            &row.asset_symbol.symbol(),
            &row.interval_kind.as_str(),
            &row.timestamp,
            &row.open,
            &row.high,
            &row.low,
            &row.close,
            &row.volume_quote,
        ],
    )
    .map_err(|err| StoreError::Query(format!("insert failed for {}: {err}", row.key())))
}

/// A COMMIT the server answered with an error code was rolled back; one that
/// never got an answer may or may not have applied.
fn commit(tx: Transaction<'_>) -> Result<(), StoreError> {
    tx.commit().map_err(|err| {
        if err.code().is_some() {
            StoreError::Query(format!("commit rejected: {err}"))
        } else {
            StoreError::Indeterminate(format!("commit outcome unknown: {err}"))
        }
    })
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Unavailable(format!(
            "invalid table name '{table}': use [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}
