//! Analysis frame: committed rows plus percentage-change columns, as consumed
//! by the downstream notebooks. Never fed back into the loader.

use crate::domain::CanonicalRow;
use crate::fsio;
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("polars: {0}")]
    Polars(#[from] PolarsError),

    #[error("write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Build the analysis frame. Rows are sorted by timestamp first; the first
/// row's percentage changes are null.
pub fn analysis_frame(rows: &[CanonicalRow]) -> Result<DataFrame, AnalysisError> {
    let mut sorted: Vec<&CanonicalRow> = rows.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);

    let f = |pick: fn(&CanonicalRow) -> rust_decimal::Decimal| -> Vec<Option<f64>> {
        sorted.iter().map(|r| pick(r).to_f64()).collect()
    };

    let timestamps: Vec<i64> = sorted.iter().map(|r| r.timestamp.timestamp_millis()).collect();

    let df = DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?,
        Column::new("open".into(), f(|r| r.open)),
        Column::new("high".into(), f(|r| r.high)),
        Column::new("low".into(), f(|r| r.low)),
        Column::new("close".into(), f(|r| r.close)),
        Column::new("volume_quote".into(), f(|r| r.volume_quote)),
    ])?;

    let frame = df
        .lazy()
        .with_columns([
            (col("close") / col("close").shift(lit(1)) - lit(1.0)).alias("pct_change_close"),
            (col("volume_quote") / col("volume_quote").shift(lit(1)) - lit(1.0))
                .alias("pct_change_volume"),
        ])
        .collect()?;

    Ok(frame)
}

/// Write the frame as Parquet, atomically.
pub fn write_analysis_parquet(path: &Path, frame: &mut DataFrame) -> Result<(), AnalysisError> {
    let mut bytes = Vec::new();
    ParquetWriter::new(&mut bytes).finish(frame)?;
    fsio::write_atomic(path, &bytes).map_err(|source| AnalysisError::Io {
        path: path.display().to_string(),
        source,
    })?;
    tracing::info!(path = %path.display(), rows = frame.height(), "wrote analysis frame");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Asset, IntervalKind};
    use chrono::{TimeZone, Utc};

    fn row(d: u32, close: &str, volume: &str) -> CanonicalRow {
        CanonicalRow {
            asset_symbol: Asset::Sol,
            interval_kind: IntervalKind::Daily,
            timestamp: Utc.with_ymd_and_hms(2020, 4, d, 0, 0, 0).unwrap(),
            open: "1".parse().unwrap(),
            high: "5".parse().unwrap(),
            low: "0.5".parse().unwrap(),
            close: close.parse().unwrap(),
            volume_quote: volume.parse().unwrap(),
        }
    }

    #[test]
    fn pct_change_columns() {
        // Deliberately unsorted input.
        let rows = vec![row(21, "2.2", "150"), row(20, "2", "100"), row(22, "1.1", "300")];
        let df = analysis_frame(&rows).unwrap();
        assert_eq!(df.height(), 3);

        let close = df.column("pct_change_close").unwrap().f64().unwrap();
        assert_eq!(close.get(0), None);
        assert!((close.get(1).unwrap() - 0.1).abs() < 1e-9);
        assert!((close.get(2).unwrap() + 0.5).abs() < 1e-9);

        let volume = df.column("pct_change_volume").unwrap().f64().unwrap();
        assert_eq!(volume.get(0), None);
        assert!((volume.get(1).unwrap() - 0.5).abs() < 1e-9);
        assert!((volume.get(2).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn writes_parquet_that_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc_daily.parquet");
        let mut df = analysis_frame(&[row(20, "2", "100"), row(21, "3", "100")]).unwrap();
        write_analysis_parquet(&path, &mut df).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let back = ParquetReader::new(file).finish().unwrap();
        assert_eq!(back.height(), 2);
        assert!(back.column("pct_change_volume").is_ok());
    }

    #[test]
    fn empty_input_gives_empty_frame() {
        let df = analysis_frame(&[]).unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.width(), 8);
    }
}
