//! Entry point for the VAT Engine binary.
//!
//! Reads a JSON array of spreadsheet rows (one object per row, keyed by
//! column header), computes the VAT report and prints it as JSON on
//! stdout.  Progress and dropped-row warnings are logged to stderr.
//!
//! The rows file is the first argument or `VAT_ROWS_FILE`.  Other
//! settings come from the environment:
//!
//! * `VAT_CONFIG_FILE`: classification config JSON (defaults to the
//!   South African VAT201 preset)
//! * `VAT_COLUMNS_FILE`: column header mapping JSON
//! * `VAT_CHUNK_SIZE`, `VAT_WORKERS` (`disabled`, `auto` or a count),
//!   `VAT_PARALLEL_THRESHOLD`, `VAT_SAMPLE_LIMIT`

use anyhow::{Context, Result};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;
use vat_engine::normalize::ColumnMap;
use vat_engine::tax::{load_config_from_file, ClassificationConfig};
use vat_engine::{CancelToken, RawRow, RunOptions, VatEngine};

#[tokio::main]
async fn main() {
    vat_engine::logging::init_tracing();
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let rows_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VAT_ROWS_FILE").ok())
        .map(PathBuf::from)
        .context("usage: vat_engine <rows.json> (or set VAT_ROWS_FILE)")?;

    let config = match std::env::var("VAT_CONFIG_FILE") {
        Ok(path) => load_config_from_file(Path::new(&path))?,
        Err(_) => ClassificationConfig::south_african(),
    };
    let columns = match std::env::var("VAT_COLUMNS_FILE") {
        Ok(path) => read_json::<ColumnMap>(Path::new(&path))?,
        Err(_) => ColumnMap::default(),
    };
    let options = options_from_env()?;
    let rows: Vec<RawRow> = read_json(&rows_path)?;

    let engine = VatEngine::new(config, columns, options)?;
    let run = engine
        .compute_async(
            &rows,
            |event| info!(percent = event.percent_complete, "{}", event.message),
            &CancelToken::new(),
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn options_from_env() -> Result<RunOptions> {
    let defaults = RunOptions::default();
    Ok(RunOptions {
        chunk_size: env_or("VAT_CHUNK_SIZE", defaults.chunk_size)?,
        workers: env_or("VAT_WORKERS", defaults.workers)?,
        parallel_threshold: env_or("VAT_PARALLEL_THRESHOLD", defaults.parallel_threshold)?,
        sample_limit: env_or("VAT_SAMPLE_LIMIT", defaults.sample_limit)?,
    })
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("{name}={raw:?}: {err}")),
        Err(_) => Ok(default),
    }
}
