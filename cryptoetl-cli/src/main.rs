//! cryptoetl CLI: extract, load, run, backup, export and migrate commands.
//!
//! Commands:
//! - `extract`: fetch candles and stage them as batch files
//! - `load`: load staged batches (or one file) into the target store
//! - `run`: extract then load every selected key
//! - `backup list` / `backup restore`: inspect and restore snapshots
//! - `export`: write committed rows with percentage changes to Parquet
//! - `migrate`: create the target table if it does not exist
//!
//! Exit codes: 0 on success, 1 when any key fails, 2 on configuration or
//! usage errors.

mod obs;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use cryptoetl_core::domain::{Asset, IntervalKind, SeriesKey};
use cryptoetl_core::load::{BackupManager, BackupSnapshot};
use cryptoetl_runner::{
    build_store, results_table, snapshots_table, summary_table, ConfigError, Pipeline,
    PipelineConfig, PipelineError, Requirements, RunSettings, DEFAULT_CONFIG_PATH,
};
use obs::LogFormat;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cryptoetl", about = "Crypto OHLCV extract and load pipeline")]
struct Cli {
    /// Pipeline configuration file.
    #[arg(long, global = true, env = "CRYPTOETL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter (e.g. info, debug, cryptoetl_core=trace). CRYPTOETL_LOG overrides.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch market data and stage one batch file per key.
    Extract {
        #[command(flatten)]
        keys: KeySelection,
    },
    /// Load the newest staged batch per key, or a single batch file.
    Load {
        #[command(flatten)]
        keys: KeySelection,

        /// Load this staged batch file instead of the newest per key.
        #[arg(long, conflicts_with_all = ["all", "asset", "interval"])]
        file: Option<PathBuf>,

        /// Validate and preview without writing (same as DRY_RUN=true).
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Extract then load every selected key.
    Run {
        #[command(flatten)]
        keys: KeySelection,

        /// Validate and preview without writing (same as DRY_RUN=true).
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Backup snapshot commands.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Write committed rows with percentage-change columns to Parquet.
    Export {
        #[command(flatten)]
        series: SeriesArgs,

        /// Output Parquet file.
        #[arg(long)]
        out: PathBuf,
    },
    /// Create the target table if it does not exist.
    Migrate,
}

#[derive(Subcommand)]
enum BackupAction {
    /// List snapshots for one series, newest first.
    List {
        #[command(flatten)]
        series: SeriesArgs,
    },
    /// Replace a series' stored rows with a snapshot.
    Restore {
        #[command(flatten)]
        series: SeriesArgs,

        /// Snapshot CSV to restore. Defaults to the newest for the series.
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Actually restore (without this flag, only previews the snapshot).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

/// Which configured keys a command applies to.
#[derive(Args, Debug)]
struct KeySelection {
    /// Every configured asset and interval.
    #[arg(long, default_value_t = false, conflicts_with_all = ["asset", "interval"])]
    all: bool,

    /// Asset symbol: BTC, ETH or SOL.
    #[arg(long)]
    asset: Option<Asset>,

    /// Interval: DAILY or HOURLY.
    #[arg(long)]
    interval: Option<IntervalKind>,
}

impl KeySelection {
    /// An asset alone selects it at every configured interval, an interval
    /// alone selects every configured asset at it.
    fn resolve(&self, configured: &[SeriesKey]) -> Result<Vec<SeriesKey>, UsageError> {
        if self.all {
            return Ok(configured.to_vec());
        }
        match (self.asset, self.interval) {
            (Some(asset), Some(interval)) => Ok(vec![SeriesKey::new(asset, interval)]),
            (None, None) => Err(UsageError(
                "select keys with --all, --asset or --interval".into(),
            )),
            (asset, interval) => {
                let keys: Vec<SeriesKey> = configured
                    .iter()
                    .copied()
                    .filter(|k| asset.map_or(true, |a| k.asset == a))
                    .filter(|k| interval.map_or(true, |i| k.interval == i))
                    .collect();
                if keys.is_empty() {
                    Err(UsageError("no configured key matches the selection".into()))
                } else {
                    Ok(keys)
                }
            }
        }
    }
}

#[derive(Args, Debug)]
struct SeriesArgs {
    /// Asset symbol: BTC, ETH or SOL.
    #[arg(long)]
    asset: Asset,

    /// Interval: DAILY or HOURLY.
    #[arg(long)]
    interval: IntervalKind,
}

impl SeriesArgs {
    fn key(&self) -> SeriesKey {
        SeriesKey::new(self.asset, self.interval)
    }
}

#[derive(Debug)]
struct UsageError(String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = obs::init_tracing(&cli.log_level, cli.log_format) {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let config = &cli.config;
    match cli.command {
        Commands::Extract { keys } => run_extract(config, &keys),
        Commands::Load {
            keys,
            file,
            dry_run,
        } => run_load(config, &keys, file.as_deref(), dry_run),
        Commands::Run { keys, dry_run } => run_pipeline(config, &keys, dry_run),
        Commands::Backup { action } => match action {
            BackupAction::List { series } => run_backup_list(config, series.key()),
            BackupAction::Restore {
                series,
                snapshot,
                confirm,
            } => run_backup_restore(config, series.key(), snapshot.as_deref(), confirm),
        },
        Commands::Export { series, out } => run_export(config, series.key(), &out),
        Commands::Migrate => run_migrate(config),
    }
}

/// 2 for configuration and usage errors, 1 for everything else.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let is_config = err.chain().any(|cause| {
        cause.is::<ConfigError>()
            || cause.is::<UsageError>()
            || matches!(
                cause.downcast_ref::<PipelineError>(),
                Some(PipelineError::Config(_))
            )
    });
    if is_config {
        2
    } else {
        1
    }
}

fn settings(config_path: &Path, needs: Requirements) -> Result<RunSettings> {
    let config = PipelineConfig::from_path(config_path)?;
    let settings = config
        .resolve(needs)
        .with_context(|| format!("resolving {}", config_path.display()))?;
    Ok(settings)
}

fn selected_settings(
    config_path: &Path,
    needs: Requirements,
    keys: &KeySelection,
) -> Result<RunSettings> {
    let settings = settings(config_path, needs)?;
    let selected = keys.resolve(&settings.keys)?;
    Ok(settings.with_keys(selected))
}

fn run_extract(config_path: &Path, keys: &KeySelection) -> Result<i32> {
    let settings = selected_settings(config_path, Requirements::EXTRACT, keys)?;
    let pipeline = Pipeline::from_settings(settings, Requirements::EXTRACT)?;

    let staged = pipeline.extract_all(Utc::now());

    println!("{:<12} {:>8}  {}", "Key", "Rows", "Staged");
    let mut failed = 0;
    for (key, result) in &staged {
        match result {
            Ok(batch) => println!(
                "{:<12} {:>8}  {}",
                key.to_string(),
                batch.meta.row_count,
                batch.path.display()
            ),
            Err(e) => {
                failed += 1;
                println!("{:<12} {:>8}  error: {e}", key.to_string(), "-");
            }
        }
    }

    Ok(if failed == 0 { 0 } else { 1 })
}

fn run_load(
    config_path: &Path,
    keys: &KeySelection,
    file: Option<&Path>,
    dry_run: bool,
) -> Result<i32> {
    let settings = settings(config_path, Requirements::LOAD)?.with_dry_run(dry_run);

    if let Some(file) = file {
        let pipeline = Pipeline::from_settings(settings, Requirements::LOAD)?;
        let result = pipeline
            .load_file(file)
            .with_context(|| format!("reading {}", file.display()))?;
        print!("{}", results_table(std::slice::from_ref(&result)));
        return Ok(if result.is_success() { 0 } else { 1 });
    }

    let selected = keys.resolve(&settings.keys)?;
    let pipeline = Pipeline::from_settings(settings.with_keys(selected), Requirements::LOAD)?;
    let summary = pipeline.load_all_latest();
    print!("{}", summary_table(&summary));
    Ok(summary.exit_code())
}

fn run_pipeline(config_path: &Path, keys: &KeySelection, dry_run: bool) -> Result<i32> {
    let settings = selected_settings(config_path, Requirements::ALL, keys)?.with_dry_run(dry_run);
    let pipeline = Pipeline::from_settings(settings, Requirements::ALL)?;

    let summary = pipeline.run_all(Utc::now());
    print!("{}", summary_table(&summary));
    Ok(summary.exit_code())
}

fn run_backup_list(config_path: &Path, key: SeriesKey) -> Result<i32> {
    let settings = settings(config_path, Requirements::NONE)?;
    let backups = BackupManager::new(&settings.backup_dir);

    let snapshots = backups.list(key)?;
    if snapshots.is_empty() {
        println!("No snapshots for {key} in {}", backups.dir().display());
        return Ok(0);
    }
    print!("{}", snapshots_table(&snapshots));
    Ok(0)
}

fn run_backup_restore(
    config_path: &Path,
    key: SeriesKey,
    snapshot: Option<&Path>,
    confirm: bool,
) -> Result<i32> {
    let settings = settings(config_path, Requirements::LOAD)?;
    let backups = BackupManager::new(&settings.backup_dir);

    let snapshot: BackupSnapshot = match snapshot {
        Some(path) => backups.open(path)?,
        None => match backups.list(key)?.into_iter().next() {
            Some(snapshot) => snapshot,
            None => {
                eprintln!("No snapshots for {key} in {}", backups.dir().display());
                return Ok(1);
            }
        },
    };
    if snapshot.key != key {
        return Err(UsageError(format!(
            "snapshot {} holds {}, expected {key}",
            snapshot.path.display(),
            snapshot.key
        ))
        .into());
    }

    print!("{}", snapshots_table(std::slice::from_ref(&snapshot)));
    if !confirm {
        println!("\nDry run: pass --confirm to replace the stored rows of {key}.");
        return Ok(0);
    }

    let pipeline = Pipeline::from_settings(settings, Requirements::LOAD)?;
    let restored = pipeline.loader().restore(&snapshot)?;
    println!("\nRestored {restored} row(s) for {key}.");
    Ok(0)
}

fn run_export(config_path: &Path, key: SeriesKey, out: &Path) -> Result<i32> {
    let settings = settings(config_path, Requirements::LOAD)?;
    let pipeline = Pipeline::from_settings(settings, Requirements::LOAD)?;

    let rows = pipeline.export_analysis(key, out)?;
    println!("Wrote {rows} row(s) for {key} to {}", out.display());
    Ok(0)
}

fn run_migrate(config_path: &Path) -> Result<i32> {
    let settings = settings(config_path, Requirements::LOAD)?;
    let store = build_store(&settings.store)?;
    store.ensure_schema()?;
    println!("Target store ready ({})", store.name());
    Ok(0)
}
